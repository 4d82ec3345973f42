use am_types::{SpaceError, TrialError, TrialId};
use thiserror::Error;

use crate::history::{History, HistoryError};
use crate::trial::{FailureDetail, TransitionError};

/// Errors returned by an optimization run.
#[derive(Error, Debug)]
pub enum OptimizeError {
    #[error("Search space error: {0}")]
    Space(#[from] SpaceError),

    #[error("Invalid run budget: {0}")]
    InvalidBudget(String),

    #[error("Invalid evaluation setup: {0}")]
    InvalidSetup(#[from] TrialError),

    /// A trial failed under the raise policy. The history holds every record
    /// up to the abort, with in-flight trials cancelled.
    #[error("Trial {trial} failed and aborted the run: {failure}")]
    TrialRaised {
        trial: TrialId,
        failure: FailureDetail,
        history: Box<History>,
    },

    #[error("Worker error: {0}")]
    Worker(String),

    #[error("History error: {0}")]
    History(#[from] HistoryError),

    #[error("Trial state error: {0}")]
    Transition(#[from] TransitionError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl OptimizeError {
    /// The partial history carried by a raised trial failure.
    pub fn history(&self) -> Option<&History> {
        match self {
            Self::TrialRaised { history, .. } => Some(history),
            _ => None,
        }
    }

    pub fn into_history(self) -> Option<History> {
        match self {
            Self::TrialRaised { history, .. } => Some(*history),
            _ => None,
        }
    }
}
