//! # am-optimizer
//!
//! Trial scheduling and fault-tolerant cross-validated evaluation for
//! Sweepline.
//!
//! Provides a seeded configuration sampler, a cross-validating trial
//! evaluator, resource-bounded execution units (threads or worker processes),
//! the scheduler that drives them under a run budget, and the append-only
//! history of trial outcomes.

mod error;
mod evaluator;
pub mod executor;
mod history;
mod sampler;
mod scheduler;
mod trial;
pub mod worker;

pub use error::OptimizeError;
pub use evaluator::{EvaluationPlan, TrialEvaluator};
pub use executor::{Executor, Isolation};
pub use history::{History, HistoryError};
pub use sampler::{RandomSampler, Sampler, SamplerOptions};
pub use scheduler::{optimize, AbortHandle, Optimizer};
pub use trial::{
    Evaluation, FailureDetail, FailureKind, FailurePolicy, Outcome, RunBudget, RunState,
    StopReason, StragglerPolicy, TransitionError, TrialRecord, TrialStatus,
};
pub use worker::{CheckReply, WorkerCommand, WorkerMessage, WorkerReply, WorkerRequest};
