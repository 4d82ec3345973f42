//! The scheduler: dispatches sampled configurations to the worker pool under
//! a run budget and collects outcomes into the history.

use am_types::{MetricDefinition, Pipeline, SpaceError, TrialData, TrialId};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};

use crate::error::OptimizeError;
use crate::evaluator::{EvaluationPlan, TrialEvaluator};
use crate::executor::{Completion, Isolation, WorkerPool};
use crate::history::History;
use crate::sampler::{RandomSampler, Sampler, SamplerOptions};
use crate::trial::{
    FailureDetail, FailurePolicy, RunBudget, RunState, StopReason, StragglerPolicy, TrialRecord,
    TrialStatus,
};

/// Cloneable flag that asks a running optimization to stop.
#[derive(Debug, Clone, Default)]
pub struct AbortHandle(Arc<AtomicBool>);

impl AbortHandle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn trigger(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_triggered(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Configures and runs optimizations of one pipeline on one dataset.
pub struct Optimizer {
    pipeline: Arc<dyn Pipeline>,
    metric: MetricDefinition,
    data: Arc<TrialData>,
    plan: Option<EvaluationPlan>,
    isolation: Isolation,
    abort: AbortHandle,
    sampler_options: SamplerOptions,
}

impl Optimizer {
    pub fn new(pipeline: Arc<dyn Pipeline>, metric: MetricDefinition, data: Arc<TrialData>) -> Self {
        Self {
            pipeline,
            metric,
            data,
            plan: None,
            isolation: Isolation::Thread,
            abort: AbortHandle::new(),
            sampler_options: SamplerOptions::default(),
        }
    }

    /// Defaults to holdout when the data has a validation split, otherwise
    /// 5-fold cross-validation seeded with the run seed.
    pub fn with_plan(mut self, plan: EvaluationPlan) -> Self {
        self.plan = Some(plan);
        self
    }

    pub fn with_isolation(mut self, isolation: Isolation) -> Self {
        self.isolation = isolation;
        self
    }

    pub fn with_abort_handle(mut self, abort: AbortHandle) -> Self {
        self.abort = abort;
        self
    }

    pub fn with_sampler_options(mut self, options: SamplerOptions) -> Self {
        self.sampler_options = options;
        self
    }

    pub fn abort_handle(&self) -> AbortHandle {
        self.abort.clone()
    }

    /// Run trials until the budget is spent and return their history.
    ///
    /// Under [`FailurePolicy::Raise`] the first failed or timed-out trial
    /// ends the run with [`OptimizeError::TrialRaised`], which carries the
    /// partial history.
    pub fn optimize(&self, budget: RunBudget, seed: u64) -> Result<History, OptimizeError> {
        budget.validate().map_err(OptimizeError::InvalidBudget)?;
        let space = self.pipeline.search_space();
        let sampler = RandomSampler::with_options(space.clone(), seed, self.sampler_options)?;

        let plan = self
            .plan
            .clone()
            .unwrap_or_else(|| EvaluationPlan::default_for(&self.data, seed));
        let evaluator = Arc::new(TrialEvaluator::new(
            Arc::clone(&self.pipeline),
            self.metric.clone(),
            Arc::clone(&self.data),
            plan,
        )?);

        let mut history = History::new(
            self.pipeline.name(),
            self.metric.clone(),
            budget.clone(),
            seed,
            space,
        );
        history.mark_running();
        // The wall clock covers pool setup too.
        let started = Instant::now();
        info!(
            run_id = %history.run_id,
            pipeline = %history.pipeline,
            metric = %self.metric.name(),
            max_trials = budget.max_trials,
            workers = budget.worker_count,
            wall_clock_s = budget.max_wall_clock.as_secs_f64(),
            seed,
            "Starting optimization"
        );

        if budget.max_trials == 0 {
            history.mark_finished(RunState::Completed, StopReason::MaxTrials);
            return Ok(history);
        }

        let pool = WorkerPool::acquire(
            self.isolation.clone(),
            evaluator,
            budget.worker_count,
            budget.effective_trial_time_limit(),
            budget.per_trial_memory_limit,
        )?;

        let run = Run {
            deadline: started + budget.max_wall_clock,
            budget,
            history,
            pool,
            sampler: Box::new(sampler),
            abort: self.abort.clone(),
            dispatched: 0,
        };
        let history = run.execute()?;

        info!(
            run_id = %history.run_id,
            state = ?history.state,
            reason = ?history.stop_reason,
            trials = history.len(),
            completed = history.count(TrialStatus::Completed),
            failed = history.count(TrialStatus::Failed),
            timed_out = history.count(TrialStatus::TimedOut),
            best = ?history.best().and_then(|r| r.score),
            detached = history.detached_units,
            elapsed_s = started.elapsed().as_secs_f64(),
            "Optimization finished"
        );
        Ok(history)
    }
}

/// Run an optimization with default settings: thread isolation and the
/// default evaluation plan for `data`.
pub fn optimize(
    pipeline: Arc<dyn Pipeline>,
    metric: MetricDefinition,
    data: Arc<TrialData>,
    budget: RunBudget,
    seed: u64,
) -> Result<History, OptimizeError> {
    Optimizer::new(pipeline, metric, data).optimize(budget, seed)
}

/// A raised trial failure, carried until the run unwinds.
struct Raised {
    trial: TrialId,
    failure: FailureDetail,
}

/// State of one optimization run. Owns the pool, so every exit path tears
/// the pool down.
struct Run {
    budget: RunBudget,
    deadline: Instant,
    history: History,
    pool: WorkerPool,
    sampler: Box<dyn Sampler>,
    abort: AbortHandle,
    dispatched: usize,
}

impl Run {
    fn execute(mut self) -> Result<History, OptimizeError> {
        let reason = loop {
            if self.abort.is_triggered() {
                break StopReason::CallerAbort;
            }
            if self.dispatched >= self.budget.max_trials {
                break StopReason::MaxTrials;
            }
            if Instant::now() >= self.deadline {
                break StopReason::WallClock;
            }

            if self.pool.has_free_slot() {
                match self.sampler.next_configuration() {
                    Ok(configuration) => {
                        self.pool.dispatch(TrialRecord::new(configuration))?;
                        self.dispatched += 1;
                        continue;
                    }
                    Err(SpaceError::Exhausted { attempts }) => {
                        warn!(attempts, "Search space exhausted");
                        break StopReason::SpaceExhausted;
                    }
                    Err(e) => return Err(e.into()),
                }
            }

            let wake = self.deadline.min(Instant::now() + self.pool.tick());
            let completions = self.pool.wait(wake);
            if let Some(raised) = self.record(completions)? {
                return Err(self.raise(raised));
            }
        };

        debug!(reason = ?reason, in_flight = self.pool.in_flight(), "Dispatch stopped");
        self.stop(reason)
    }

    fn stop(mut self, reason: StopReason) -> Result<History, OptimizeError> {
        if reason == StopReason::CallerAbort {
            let completions = self.pool.poll_ready();
            self.record_without_raising(completions)?;
            self.cancel_in_flight("run aborted by caller")?;
            self.finish_run(RunState::Aborted, reason);
            return Ok(self.history);
        }

        match self.budget.straggler_policy {
            StragglerPolicy::WaitForAll => {
                while self.pool.in_flight() > 0 {
                    if self.abort.is_triggered() {
                        let completions = self.pool.poll_ready();
                        self.record_without_raising(completions)?;
                        self.cancel_in_flight("run aborted by caller")?;
                        self.finish_run(RunState::Aborted, StopReason::CallerAbort);
                        return Ok(self.history);
                    }
                    let completions = self.pool.wait(Instant::now() + self.pool.tick());
                    if let Some(raised) = self.record(completions)? {
                        return Err(self.raise(raised));
                    }
                }
            }
            StragglerPolicy::CutAndReturn => {
                let completions = self.pool.poll_ready();
                if let Some(raised) = self.record(completions)? {
                    return Err(self.raise(raised));
                }
                self.cancel_in_flight("cut at global stop")?;
            }
        }

        let state = if reason == StopReason::WallClock {
            RunState::TimedOutGlobally
        } else {
            RunState::Completed
        };
        self.finish_run(state, reason);
        Ok(self.history)
    }

    /// Apply outcomes and append them. Returns the first failure that must
    /// abort the run under the raise policy; later completions in the same
    /// batch are still recorded.
    fn record(&mut self, completions: Vec<Completion>) -> Result<Option<Raised>, OptimizeError> {
        let mut raised = None;
        for completion in completions {
            let record = self.finish(completion)?;
            let failed = matches!(record.status, TrialStatus::Failed | TrialStatus::TimedOut);
            if failed && self.budget.on_failure == FailurePolicy::Raise && raised.is_none() {
                raised = record.failure.clone().map(|failure| Raised {
                    trial: record.id,
                    failure,
                });
            }
            self.history.append(record)?;
        }
        Ok(raised)
    }

    fn record_without_raising(&mut self, completions: Vec<Completion>) -> Result<(), OptimizeError> {
        for completion in completions {
            let record = self.finish(completion)?;
            self.history.append(record)?;
        }
        Ok(())
    }

    fn finish(&self, completion: Completion) -> Result<TrialRecord, OptimizeError> {
        let Completion { mut record, outcome } = completion;
        record.finish(outcome)?;
        match record.status {
            TrialStatus::Completed => debug!(
                trial = %record.id,
                score = record.score.unwrap_or(f64::NAN),
                "Trial completed"
            ),
            _ => warn!(
                trial = %record.id,
                status = %record.status,
                failure = %record.failure.as_ref().map(|f| f.to_string()).unwrap_or_default(),
                "Trial did not complete"
            ),
        }
        Ok(record)
    }

    fn finish_run(&mut self, state: RunState, reason: StopReason) {
        let detached = self.pool.detached();
        if detached > 0 {
            warn!(detached, "Stopped trial threads are still running");
        }
        self.history.detached_units = detached;
        self.history.mark_finished(state, reason);
    }

    fn cancel_in_flight(&mut self, reason: &str) -> Result<(), OptimizeError> {
        for mut record in self.pool.cancel_all() {
            record.cancel(reason)?;
            debug!(trial = %record.id, reason, "Trial cancelled");
            self.history.append(record)?;
        }
        Ok(())
    }

    fn raise(mut self, raised: Raised) -> OptimizeError {
        warn!(trial = %raised.trial, failure = %raised.failure, "Aborting run on trial failure");
        let completions = self.pool.poll_ready();
        if let Err(e) = self.record_without_raising(completions) {
            return e;
        }
        if let Err(e) = self.cancel_in_flight("run aborted") {
            return e;
        }
        self.finish_run(RunState::Aborted, StopReason::TrialRaised);
        OptimizeError::TrialRaised {
            trial: raised.trial,
            failure: raised.failure,
            history: Box::new(self.history),
        }
    }
}
