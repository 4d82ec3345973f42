//! Run budgets, trial records and their lifecycle.

use am_types::{Configuration, TrialId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// What to do when a trial fails or times out.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum FailurePolicy {
    /// Stop dispatching, cancel in-flight trials, surface the failure.
    Raise,
    /// Record the failure and keep going. The failed trial still counts
    /// against `max_trials`.
    #[default]
    Continue,
}

/// What to do with in-flight trials once the run stops dispatching.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum StragglerPolicy {
    /// Let every in-flight trial reach its own terminal outcome.
    #[default]
    WaitForAll,
    /// Keep outcomes that already arrived and cancel the rest.
    CutAndReturn,
}

/// Resource and trial budget for one optimization run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunBudget {
    /// Upper bound on dispatched trials.
    pub max_trials: usize,

    /// No new trial is dispatched once this much time has elapsed.
    pub max_wall_clock: Duration,

    /// How many trials run at once.
    pub worker_count: usize,

    /// Per-trial wall-clock limit. `None` means the run's wall clock.
    pub per_trial_time_limit: Option<Duration>,

    /// Per-trial resident memory limit in bytes. Enforced only for
    /// process-isolated trials.
    pub per_trial_memory_limit: Option<u64>,

    pub on_failure: FailurePolicy,

    pub straggler_policy: StragglerPolicy,
}

impl RunBudget {
    pub fn new(max_trials: usize, max_wall_clock: Duration) -> Self {
        Self {
            max_trials,
            max_wall_clock,
            worker_count: 1,
            per_trial_time_limit: None,
            per_trial_memory_limit: None,
            on_failure: FailurePolicy::Continue,
            straggler_policy: StragglerPolicy::WaitForAll,
        }
    }

    pub fn with_workers(mut self, n: usize) -> Self {
        self.worker_count = n;
        self
    }

    pub fn with_trial_time_limit(mut self, limit: Duration) -> Self {
        self.per_trial_time_limit = Some(limit);
        self
    }

    pub fn with_trial_memory_limit(mut self, bytes: u64) -> Self {
        self.per_trial_memory_limit = Some(bytes);
        self
    }

    pub fn with_failure_policy(mut self, policy: FailurePolicy) -> Self {
        self.on_failure = policy;
        self
    }

    pub fn with_straggler_policy(mut self, policy: StragglerPolicy) -> Self {
        self.straggler_policy = policy;
        self
    }

    /// The limit each trial actually runs under.
    pub fn effective_trial_time_limit(&self) -> Duration {
        self.per_trial_time_limit.unwrap_or(self.max_wall_clock)
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.worker_count == 0 {
            return Err("worker_count must be at least 1".to_string());
        }
        if self.max_wall_clock.is_zero() {
            return Err("max_wall_clock must be positive".to_string());
        }
        if matches!(self.per_trial_time_limit, Some(limit) if limit.is_zero()) {
            return Err("per_trial_time_limit must be positive".to_string());
        }
        if self.per_trial_memory_limit == Some(0) {
            return Err("per_trial_memory_limit must be positive".to_string());
        }
        Ok(())
    }
}

/// Lifecycle state for an optimization run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RunState {
    NotStarted,
    Running,
    Completed,
    TimedOutGlobally,
    Aborted,
}

/// Why the scheduler stopped dispatching.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StopReason {
    MaxTrials,
    WallClock,
    SpaceExhausted,
    TrialRaised,
    CallerAbort,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TrialStatus {
    Pending,
    Running,
    Completed,
    Failed,
    TimedOut,
    Cancelled,
}

impl TrialStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Completed | Self::Failed | Self::TimedOut | Self::Cancelled
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::TimedOut => "timed_out",
            Self::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for TrialStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FailureKind {
    /// The trial returned an error.
    Error,
    /// The execution unit died: panic, crash, signal or memory kill.
    WorkerDeath,
    /// The execution unit was stopped at its time limit.
    Timeout,
}

impl FailureKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Error => "error",
            Self::WorkerDeath => "worker_death",
            Self::Timeout => "timeout",
        }
    }
}

/// Why a trial did not complete.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailureDetail {
    pub kind: FailureKind,
    pub message: String,
}

impl FailureDetail {
    pub fn error(message: impl Into<String>) -> Self {
        Self {
            kind: FailureKind::Error,
            message: message.into(),
        }
    }

    pub fn worker_death(message: impl Into<String>) -> Self {
        Self {
            kind: FailureKind::WorkerDeath,
            message: message.into(),
        }
    }
}

impl fmt::Display for FailureDetail {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind.as_str(), self.message)
    }
}

/// Scores of one completed trial.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Evaluation {
    pub score: f64,
    pub fold_scores: Vec<f64>,
    /// Mean score of the fitted models on the held-out test split.
    pub test_score: Option<f64>,
}

/// What an execution unit reports for one trial.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    Completed(Evaluation),
    Failed(FailureDetail),
    TimedOut,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("trial {id}: cannot move from {from} to {to}")]
pub struct TransitionError {
    pub id: TrialId,
    pub from: TrialStatus,
    pub to: TrialStatus,
}

/// One trial: its configuration, lifecycle and outcome.
///
/// Status only moves forward: pending, running, then exactly one terminal
/// state. Timestamps are set on the transitions that define them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrialRecord {
    pub id: TrialId,
    pub configuration: Configuration,
    pub status: TrialStatus,
    pub score: Option<f64>,
    pub fold_scores: Vec<f64>,
    pub test_score: Option<f64>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub duration: Option<Duration>,
    pub worker_id: Option<String>,
    /// Present exactly when the trial failed or timed out.
    pub failure: Option<FailureDetail>,
    pub cancel_reason: Option<String>,
}

impl TrialRecord {
    pub fn new(configuration: Configuration) -> Self {
        Self {
            id: configuration.trial_id,
            configuration,
            status: TrialStatus::Pending,
            score: None,
            fold_scores: Vec::new(),
            test_score: None,
            started_at: None,
            finished_at: None,
            duration: None,
            worker_id: None,
            failure: None,
            cancel_reason: None,
        }
    }

    pub fn mark_running(&mut self, worker_id: impl Into<String>) -> Result<(), TransitionError> {
        self.check(TrialStatus::Pending, TrialStatus::Running)?;
        self.status = TrialStatus::Running;
        self.started_at = Some(Utc::now());
        self.worker_id = Some(worker_id.into());
        Ok(())
    }

    /// Apply the unit's outcome.
    pub fn finish(&mut self, outcome: Outcome) -> Result<(), TransitionError> {
        let target = match &outcome {
            Outcome::Completed(_) => TrialStatus::Completed,
            Outcome::Failed(_) => TrialStatus::Failed,
            Outcome::TimedOut => TrialStatus::TimedOut,
        };
        self.check(TrialStatus::Running, target)?;
        match outcome {
            Outcome::Completed(evaluation) => {
                self.score = Some(evaluation.score);
                self.fold_scores = evaluation.fold_scores;
                self.test_score = evaluation.test_score;
            }
            Outcome::Failed(detail) => self.failure = Some(detail),
            Outcome::TimedOut => {
                self.failure = Some(FailureDetail {
                    kind: FailureKind::Timeout,
                    message: "per-trial time limit exceeded".to_string(),
                });
            }
        }
        self.status = target;
        self.stamp_finish();
        Ok(())
    }

    /// Cancel a pending or running trial.
    pub fn cancel(&mut self, reason: impl Into<String>) -> Result<(), TransitionError> {
        if self.status.is_terminal() {
            return Err(TransitionError {
                id: self.id,
                from: self.status,
                to: TrialStatus::Cancelled,
            });
        }
        self.status = TrialStatus::Cancelled;
        self.cancel_reason = Some(reason.into());
        self.stamp_finish();
        Ok(())
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    fn check(&self, from: TrialStatus, to: TrialStatus) -> Result<(), TransitionError> {
        if self.status == from {
            Ok(())
        } else {
            Err(TransitionError {
                id: self.id,
                from: self.status,
                to,
            })
        }
    }

    fn stamp_finish(&mut self) {
        let now = Utc::now();
        self.finished_at = Some(now);
        self.duration = self
            .started_at
            .and_then(|started| (now - started).to_std().ok());
    }
}
