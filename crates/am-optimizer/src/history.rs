//! Append-only record of every trial in one optimization run.

use am_types::{
    AmError, ColumnData, ColumnKind, Configuration, MetricDefinition, ResultsTable, SearchSpace,
    TrialId,
};
use chrono::{DateTime, Utc};
use std::collections::HashSet;
use thiserror::Error;
use uuid::Uuid;

use crate::trial::{RunBudget, RunState, StopReason, TrialRecord, TrialStatus};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HistoryError {
    #[error("trial {id} is still {status}; only terminal records can be appended")]
    NotTerminal { id: TrialId, status: TrialStatus },

    #[error("trial {id} is already recorded")]
    DuplicateTrial { id: TrialId },

    #[error("history already holds max_trials = {max} records")]
    CapacityExceeded { max: usize },
}

/// Trial outcomes of one run, in completion order, plus the run's context.
///
/// `append` takes `&mut self`: a history has a single writer, the scheduler
/// thread that owns it, so it carries no locking of its own.
#[derive(Debug, Clone)]
pub struct History {
    pub run_id: Uuid,
    pub pipeline: String,
    pub metric: MetricDefinition,
    pub budget: RunBudget,
    pub seed: u64,
    pub space: SearchSpace,
    pub state: RunState,
    pub stop_reason: Option<StopReason>,
    pub started_at: Option<DateTime<Utc>>,
    /// `started_at` plus the budget's wall clock. The scheduler stops
    /// dispatching at this instant.
    pub deadline_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    /// Trial threads stopped past their deadline that were still running
    /// when the run returned. Always zero for process-isolated runs.
    pub detached_units: usize,
    records: Vec<TrialRecord>,
    ids: HashSet<TrialId>,
    best: Option<usize>,
}

impl History {
    pub fn new(
        pipeline: impl Into<String>,
        metric: MetricDefinition,
        budget: RunBudget,
        seed: u64,
        space: SearchSpace,
    ) -> Self {
        Self {
            run_id: Uuid::new_v4(),
            pipeline: pipeline.into(),
            metric,
            budget,
            seed,
            space,
            state: RunState::NotStarted,
            stop_reason: None,
            started_at: None,
            deadline_at: None,
            finished_at: None,
            detached_units: 0,
            records: Vec::new(),
            ids: HashSet::new(),
            best: None,
        }
    }

    pub fn mark_running(&mut self) {
        let now = Utc::now();
        self.state = RunState::Running;
        self.started_at = Some(now);
        self.deadline_at = chrono::Duration::from_std(self.budget.max_wall_clock)
            .ok()
            .and_then(|wall| now.checked_add_signed(wall));
    }

    pub fn mark_finished(&mut self, state: RunState, reason: StopReason) {
        self.state = state;
        self.stop_reason = Some(reason);
        self.finished_at = Some(Utc::now());
    }

    /// Record one terminal trial and update the best trial.
    pub fn append(&mut self, record: TrialRecord) -> Result<(), HistoryError> {
        if !record.is_terminal() {
            return Err(HistoryError::NotTerminal {
                id: record.id,
                status: record.status,
            });
        }
        if self.ids.contains(&record.id) {
            return Err(HistoryError::DuplicateTrial { id: record.id });
        }
        if self.records.len() >= self.budget.max_trials {
            return Err(HistoryError::CapacityExceeded {
                max: self.budget.max_trials,
            });
        }

        self.ids.insert(record.id);
        self.records.push(record);
        self.update_best(self.records.len() - 1);
        Ok(())
    }

    fn update_best(&mut self, idx: usize) {
        let candidate = &self.records[idx];
        let Some(score) = candidate.score.filter(|_| candidate.status == TrialStatus::Completed)
        else {
            return;
        };
        let replace = match self.best.map(|b| &self.records[b]) {
            None => true,
            Some(current) => {
                let best_score = current.score.unwrap_or(f64::NAN);
                self.metric.is_better(score, best_score)
                    || (score == best_score && candidate.id < current.id)
            }
        };
        if replace {
            self.best = Some(idx);
        }
    }

    /// Records in completion order.
    pub fn all(&self) -> &[TrialRecord] {
        &self.records
    }

    /// Best completed trial; ties go to the lower trial id.
    pub fn best(&self) -> Option<&TrialRecord> {
        self.best.map(|idx| &self.records[idx])
    }

    pub fn get(&self, id: TrialId) -> Option<&TrialRecord> {
        self.records.iter().find(|r| r.id == id)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn count(&self, status: TrialStatus) -> usize {
        self.records.iter().filter(|r| r.status == status).count()
    }

    pub fn completed(&self) -> impl Iterator<Item = &TrialRecord> {
        self.records
            .iter()
            .filter(|r| r.status == TrialStatus::Completed)
    }

    pub fn sorted_by_id(&self) -> Vec<&TrialRecord> {
        let mut sorted: Vec<&TrialRecord> = self.records.iter().collect();
        sorted.sort_by_key(|r| r.id);
        sorted
    }

    /// Configurations ordered by trial id, which is dispatch order.
    pub fn configurations_in_dispatch_order(&self) -> Vec<&Configuration> {
        self.sorted_by_id()
            .into_iter()
            .map(|r| &r.configuration)
            .collect()
    }

    /// One row per trial in completion order.
    ///
    /// Fails when two parameters of the search space flatten to the same
    /// column name.
    pub fn to_table(&self) -> Result<ResultsTable, AmError> {
        let rows = &self.records;
        let mut columns: Vec<(String, ColumnData)> = Vec::new();

        columns.push((
            "trial_id".to_string(),
            ColumnData::Int(rows.iter().map(|r| Some(r.id.0 as i64)).collect()),
        ));

        for (key, kind) in self.space.flattened() {
            let cells = rows.iter().map(|r| r.configuration.get(&key));
            let data = match kind {
                ColumnKind::Int => {
                    ColumnData::Int(cells.map(|v| v.and_then(|v| v.as_i64())).collect())
                }
                ColumnKind::Float => {
                    ColumnData::Float(cells.map(|v| v.and_then(|v| v.as_f64())).collect())
                }
                ColumnKind::Text => {
                    ColumnData::Text(cells.map(|v| v.map(|v| v.to_string())).collect())
                }
            };
            columns.push((format!("config:{key}"), data));
        }

        columns.push((
            "status".to_string(),
            ColumnData::Text(rows.iter().map(|r| Some(r.status.to_string())).collect()),
        ));
        columns.push((
            "score".to_string(),
            ColumnData::Float(rows.iter().map(|r| r.score).collect()),
        ));
        columns.push((
            "cost".to_string(),
            ColumnData::Float(
                rows.iter()
                    .map(|r| r.score.map(|s| self.metric.cost(s)))
                    .collect(),
            ),
        ));
        columns.push((
            "fold_scores".to_string(),
            ColumnData::Text(
                rows.iter()
                    .map(|r| {
                        (!r.fold_scores.is_empty()).then(|| {
                            r.fold_scores
                                .iter()
                                .map(|s| s.to_string())
                                .collect::<Vec<_>>()
                                .join(";")
                        })
                    })
                    .collect(),
            ),
        ));
        columns.push((
            "test_score".to_string(),
            ColumnData::Float(rows.iter().map(|r| r.test_score).collect()),
        ));
        columns.push((
            "time:start".to_string(),
            ColumnData::Text(rows.iter().map(|r| r.started_at.map(|t| t.to_rfc3339())).collect()),
        ));
        columns.push((
            "time:end".to_string(),
            ColumnData::Text(rows.iter().map(|r| r.finished_at.map(|t| t.to_rfc3339())).collect()),
        ));
        columns.push((
            "time:duration_s".to_string(),
            ColumnData::Float(rows.iter().map(|r| r.duration.map(|d| d.as_secs_f64())).collect()),
        ));
        columns.push((
            "worker".to_string(),
            ColumnData::Text(rows.iter().map(|r| r.worker_id.clone()).collect()),
        ));
        columns.push((
            "failure:kind".to_string(),
            ColumnData::Text(
                rows.iter()
                    .map(|r| r.failure.as_ref().map(|f| f.kind.as_str().to_string()))
                    .collect(),
            ),
        ));
        columns.push((
            "failure:detail".to_string(),
            ColumnData::Text(
                rows.iter()
                    .map(|r| {
                        r.failure
                            .as_ref()
                            .map(|f| f.message.clone())
                            .or_else(|| r.cancel_reason.clone())
                    })
                    .collect(),
            ),
        ));

        let mut table = ResultsTable::new();
        for (name, data) in columns {
            table.push_column(name, data)?;
        }
        Ok(table)
    }
}
