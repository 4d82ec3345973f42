//! Trials in child processes.

use am_types::{TrialError, TrialId};
use crossbeam_channel::Sender;
use std::io::{self, Read, Write};
use std::process::{Child, ExitStatus, Stdio};
use std::thread;
use std::time::Duration;
use tracing::debug;

use super::{memory, UnitEvent, UnitEventKind};
use crate::error::OptimizeError;
use crate::trial::{FailureDetail, Outcome};
use crate::worker::{CheckReply, WorkerCommand, WorkerMessage, WorkerReply, WorkerRequest};

/// One worker process running one trial.
///
/// A reader thread collects the child's stdout and reports when it closes;
/// the pool then reaps the child and parses the reply. Dropping a unit kills
/// a child that is still running.
pub(crate) struct ProcessUnit {
    child: Child,
    trial_id: TrialId,
}

impl ProcessUnit {
    pub(crate) fn launch(
        command: &WorkerCommand,
        request: &WorkerRequest,
        slot: usize,
        events: Sender<UnitEvent>,
    ) -> Result<Self, OptimizeError> {
        let trial_id = request.trial_id;
        let mut child = spawn(command)?;
        // A child that exits before reading is reported through its exit
        // status once stdout closes.
        if let Err(e) = send(&mut child, &WorkerMessage::Trial(request.clone())) {
            debug!(trial = %trial_id, error = %e, "Worker did not accept request");
        }

        let mut unit = Self { child, trial_id };
        let Some(mut stdout) = unit.child.stdout.take() else {
            unit.terminate();
            return Err(OptimizeError::Worker("worker stdout was not captured".into()));
        };

        let reader = thread::Builder::new()
            .name(format!("trial-{trial_id}-reader"))
            .spawn(move || {
                let mut buf = String::new();
                if let Err(e) = stdout.read_to_string(&mut buf) {
                    debug!(trial = %trial_id, error = %e, "Worker stdout read failed");
                }
                let _ = events.send(UnitEvent {
                    slot,
                    trial_id,
                    kind: UnitEventKind::Closed { stdout: buf },
                });
            });
        if let Err(e) = reader {
            unit.terminate();
            return Err(e.into());
        }

        debug!(trial = %trial_id, pid = unit.pid(), "Worker process started");
        Ok(unit)
    }

    pub(crate) fn pid(&self) -> u32 {
        self.child.id()
    }

    pub(crate) fn resident_bytes(&self) -> Option<u64> {
        memory::resident_bytes(self.pid())
    }

    /// Reap the child after its stdout closed and turn its reply into an
    /// outcome.
    pub(crate) fn collect(mut self, stdout: &str) -> Outcome {
        let status = self.child.wait();
        let reply = stdout
            .lines()
            .rev()
            .find_map(|line| serde_json::from_str::<WorkerReply>(line.trim()).ok());

        match reply {
            Some(reply) if reply.trial_id == self.trial_id => reply.into_outcome(),
            Some(reply) => Outcome::Failed(FailureDetail::worker_death(format!(
                "worker answered for trial {} instead of {}",
                reply.trial_id, self.trial_id
            ))),
            None => Outcome::Failed(FailureDetail::worker_death(format!(
                "worker died without a reply ({})",
                describe_exit(status)
            ))),
        }
    }

    pub(crate) fn terminate(&mut self) {
        if let Ok(None) = self.child.try_wait() {
            if let Err(e) = self.child.kill() {
                debug!(trial = %self.trial_id, error = %e, "Worker kill failed");
            }
            let _ = self.child.wait();
        }
    }
}

impl Drop for ProcessUnit {
    fn drop(&mut self) {
        self.terminate();
    }
}

fn spawn(command: &WorkerCommand) -> io::Result<Child> {
    command
        .command()
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::inherit())
        .spawn()
}

/// Write one message line and close the child's stdin.
fn send(child: &mut Child, message: &WorkerMessage) -> io::Result<()> {
    let mut payload = serde_json::to_vec(message)?;
    payload.push(b'\n');
    match child.stdin.take() {
        Some(mut stdin) => stdin.write_all(&payload),
        None => Ok(()),
    }
}

/// Start one worker and ask whether it resolves `pipeline` and `metric`.
///
/// Names it does not know make the run's setup invalid. A worker that dies or
/// does not answer within `limit` is a worker error.
pub(crate) fn check_worker(
    command: &WorkerCommand,
    pipeline: &str,
    metric: &str,
    limit: Duration,
) -> Result<(), OptimizeError> {
    let message = WorkerMessage::Check {
        pipeline: pipeline.to_string(),
        metric: metric.to_string(),
    };
    let mut child = spawn(command)?;
    if let Err(e) = send(&mut child, &message) {
        debug!(error = %e, "Worker did not accept setup check");
    }

    let (tx, rx) = crossbeam_channel::bounded(1);
    let reader = child.stdout.take().map(|mut stdout| {
        thread::Builder::new()
            .name("worker-check-reader".to_string())
            .spawn(move || {
                let mut buf = String::new();
                if let Err(e) = stdout.read_to_string(&mut buf) {
                    debug!(error = %e, "Worker stdout read failed");
                }
                let _ = tx.send(buf);
            })
    });
    let stdout = match reader {
        Some(Ok(_)) => rx.recv_timeout(limit).ok(),
        Some(Err(e)) => {
            debug!(error = %e, "Could not start worker stdout reader");
            None
        }
        None => None,
    };

    let Some(stdout) = stdout else {
        let _ = child.kill();
        let status = child.wait();
        return Err(OptimizeError::Worker(format!(
            "worker did not answer the setup check within {limit:?} ({})",
            describe_exit(status)
        )));
    };
    let status = child.wait();
    let reply = stdout
        .lines()
        .rev()
        .find_map(|line| serde_json::from_str::<CheckReply>(line.trim()).ok());
    match reply {
        Some(CheckReply { result: Ok(()) }) => {
            debug!(pipeline, metric, "Worker passed setup check");
            Ok(())
        }
        Some(CheckReply {
            result: Err(message),
        }) => Err(OptimizeError::InvalidSetup(TrialError::Other(message))),
        None => Err(OptimizeError::Worker(format!(
            "worker failed the setup check ({})",
            describe_exit(status)
        ))),
    }
}

fn describe_exit(status: io::Result<ExitStatus>) -> String {
    let status = match status {
        Ok(status) => status,
        Err(e) => return format!("wait failed: {e}"),
    };
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return format!("killed by signal {signal}");
        }
    }
    match status.code() {
        Some(code) => format!("exit code {code}"),
        None => "no exit code".to_string(),
    }
}
