//! Trials on dedicated OS threads.

use am_types::{TrialError, TrialId};
use crossbeam_channel::Sender;
use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::thread::{self, JoinHandle};
use tracing::debug;

use super::{UnitEvent, UnitEventKind};
use crate::trial::{Evaluation, FailureDetail, Outcome};

/// Work executed by one thread unit.
pub(crate) type TrialJob = Box<dyn FnOnce() -> Result<Evaluation, TrialError> + Send + 'static>;

/// One named thread running one trial.
///
/// A panic inside the job is caught and reported as worker death. Threads
/// cannot be killed: a unit past its deadline is detached, and the pool keeps
/// its slot until the thread reports.
pub(crate) struct ThreadUnit {
    handle: Option<JoinHandle<()>>,
    trial_id: TrialId,
}

impl ThreadUnit {
    pub(crate) fn launch(
        slot: usize,
        trial_id: TrialId,
        job: TrialJob,
        events: Sender<UnitEvent>,
    ) -> std::io::Result<Self> {
        let handle = thread::Builder::new()
            .name(format!("trial-{trial_id}"))
            .spawn(move || {
                let outcome = match panic::catch_unwind(AssertUnwindSafe(job)) {
                    Ok(Ok(evaluation)) => Outcome::Completed(evaluation),
                    Ok(Err(e)) => Outcome::Failed(FailureDetail::error(e.to_string())),
                    Err(payload) => Outcome::Failed(FailureDetail::worker_death(format!(
                        "worker panicked: {}",
                        panic_message(payload.as_ref())
                    ))),
                };
                // The receiver is gone once the pool is dropped.
                let _ = events.send(UnitEvent {
                    slot,
                    trial_id,
                    kind: UnitEventKind::Finished(outcome),
                });
            })?;
        Ok(Self {
            handle: Some(handle),
            trial_id,
        })
    }

    /// Wait for a thread that has already reported.
    pub(crate) fn join(mut self) {
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }

    pub(crate) fn trial_id(&self) -> TrialId {
        self.trial_id
    }

    /// Stop waiting on the thread. It keeps running until its job returns.
    pub(crate) fn detach(&self) {
        debug!(trial = %self.trial_id, "Detaching trial thread past its deadline");
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
