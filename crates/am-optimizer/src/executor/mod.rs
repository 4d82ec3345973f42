//! Resource-bounded execution units and the worker pool that owns them.

pub mod memory;
mod process;
mod thread;

use am_types::{Configuration, TrialData, TrialError, TrialId};
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use std::io::{BufWriter, Write};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tempfile::NamedTempFile;
use tracing::{debug, warn};

use crate::error::OptimizeError;
use crate::evaluator::TrialEvaluator;
use crate::trial::{Evaluation, FailureDetail, Outcome, TrialRecord};
use crate::worker::{WorkerCommand, WorkerRequest};

use process::ProcessUnit;
use thread::{ThreadUnit, TrialJob};

const TICK: Duration = Duration::from_millis(100);
const MEMORY_POLL_TICK: Duration = Duration::from_millis(50);
const SETUP_CHECK_LIMIT: Duration = Duration::from_secs(30);

/// Where trials run.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum Isolation {
    /// A dedicated OS thread per trial. Panics are contained and memory
    /// limits are not enforced. A thread past its deadline cannot be killed:
    /// the trial is recorded as timed out, but its slot stays occupied until
    /// the thread returns.
    #[default]
    Thread,
    /// A child process per trial, killed on timeout or when over the memory
    /// limit.
    Process(WorkerCommand),
}

pub(crate) struct UnitEvent {
    pub(crate) slot: usize,
    pub(crate) trial_id: TrialId,
    pub(crate) kind: UnitEventKind,
}

pub(crate) enum UnitEventKind {
    /// A thread unit's outcome.
    Finished(Outcome),
    /// A process unit's stdout reached EOF.
    Closed { stdout: String },
}

enum Unit {
    Thread(ThreadUnit),
    Process(ProcessUnit),
}

impl Unit {
    /// Stop the unit and return what is left of its slot.
    fn stop(self) -> Slot {
        match self {
            Unit::Thread(unit) => {
                unit.detach();
                Slot::Detached(unit)
            }
            Unit::Process(mut unit) => {
                unit.terminate();
                Slot::Free
            }
        }
    }
}

struct InFlight {
    record: TrialRecord,
    unit: Unit,
    deadline: Instant,
}

enum Slot {
    Free,
    Busy(InFlight),
    /// A stopped thread that has not returned yet. Its trial is already
    /// settled; the slot frees when the thread reports.
    Detached(ThreadUnit),
}

/// A trial whose unit has reported, with the outcome still to be applied.
pub(crate) struct Completion {
    pub(crate) record: TrialRecord,
    pub(crate) outcome: Outcome,
}

/// Fixed set of execution slots for one optimization run.
///
/// Dropping the pool kills every worker process still running. Threads still
/// running are left detached; their results are discarded.
pub(crate) struct WorkerPool {
    isolation: Isolation,
    evaluator: Arc<TrialEvaluator>,
    slots: Vec<Slot>,
    ready: Vec<Completion>,
    events_tx: Sender<UnitEvent>,
    events_rx: Receiver<UnitEvent>,
    time_limit: Duration,
    memory_limit: Option<u64>,
    tick: Duration,
    // Deleted when the pool drops.
    data_file: Option<NamedTempFile>,
}

impl WorkerPool {
    pub(crate) fn acquire(
        isolation: Isolation,
        evaluator: Arc<TrialEvaluator>,
        worker_count: usize,
        time_limit: Duration,
        memory_limit: Option<u64>,
    ) -> Result<Self, OptimizeError> {
        let mut tick = TICK;
        let data_file = match &isolation {
            Isolation::Thread => {
                if memory_limit.is_some() {
                    warn!("Per-trial memory limit is not enforced for thread-isolated trials");
                }
                None
            }
            Isolation::Process(command) => {
                if memory_limit.is_some() {
                    if memory::supported() {
                        tick = MEMORY_POLL_TICK;
                    } else {
                        warn!("Per-trial memory limit is not observable on this platform");
                    }
                }
                debug!(program = %command.program.display(), "Using process-isolated trials");
                process::check_worker(
                    command,
                    evaluator.pipeline().name(),
                    evaluator.metric().name(),
                    SETUP_CHECK_LIMIT,
                )?;
                Some(write_trial_data(evaluator.data())?)
            }
        };

        let (events_tx, events_rx) = crossbeam_channel::unbounded();
        Ok(Self {
            isolation,
            evaluator,
            slots: (0..worker_count.max(1)).map(|_| Slot::Free).collect(),
            ready: Vec::new(),
            events_tx,
            events_rx,
            time_limit,
            memory_limit,
            tick,
            data_file,
        })
    }

    pub(crate) fn tick(&self) -> Duration {
        self.tick
    }

    pub(crate) fn in_flight(&self) -> usize {
        self.slots
            .iter()
            .filter(|s| matches!(s, Slot::Busy(_)))
            .count()
    }

    pub(crate) fn has_free_slot(&self) -> bool {
        self.slots.iter().any(|s| matches!(s, Slot::Free))
    }

    /// Stopped threads that are still running.
    pub(crate) fn detached(&mut self) -> usize {
        let mut done = Vec::new();
        while let Ok(event) = self.events_rx.try_recv() {
            self.handle(event, &mut done);
        }
        self.ready.extend(done);
        self.slots
            .iter()
            .filter(|s| matches!(s, Slot::Detached(_)))
            .count()
    }

    /// Start `record` on a free slot.
    ///
    /// A unit that cannot be started is reported as worker death through the
    /// next [`WorkerPool::wait`].
    pub(crate) fn dispatch(&mut self, mut record: TrialRecord) -> Result<(), OptimizeError> {
        let slot = self
            .slots
            .iter()
            .position(|s| matches!(s, Slot::Free))
            .ok_or_else(|| OptimizeError::Worker("no free worker slot".into()))?;
        record.mark_running(format!("worker-{slot}"))?;
        let deadline = Instant::now() + self.time_limit;

        match self.launch(slot, &record.configuration) {
            Ok(unit) => {
                debug!(trial = %record.id, slot, "Trial dispatched");
                self.slots[slot] = Slot::Busy(InFlight {
                    record,
                    unit,
                    deadline,
                });
            }
            Err(e) => {
                warn!(trial = %record.id, error = %e, "Failed to start trial");
                self.ready.push(Completion {
                    record,
                    outcome: Outcome::Failed(FailureDetail::worker_death(format!(
                        "failed to start worker: {e}"
                    ))),
                });
            }
        }
        Ok(())
    }

    fn launch(&self, slot: usize, configuration: &Configuration) -> Result<Unit, OptimizeError> {
        let trial_id = configuration.trial_id;
        match &self.isolation {
            Isolation::Thread => {
                let evaluator = Arc::clone(&self.evaluator);
                let configuration = configuration.clone();
                let job: TrialJob = Box::new(move || evaluator.evaluate(&configuration));
                let unit = ThreadUnit::launch(slot, trial_id, job, self.events_tx.clone())?;
                Ok(Unit::Thread(unit))
            }
            Isolation::Process(command) => {
                let data_path = self
                    .data_file
                    .as_ref()
                    .map(|f| f.path().to_path_buf())
                    .ok_or_else(|| OptimizeError::Worker("trial data file missing".into()))?;
                let request = WorkerRequest {
                    trial_id,
                    pipeline: self.evaluator.pipeline().name().to_string(),
                    metric: self.evaluator.metric().info(),
                    configuration: configuration.clone(),
                    plan: self.evaluator.plan().clone(),
                    data_path,
                };
                let unit = ProcessUnit::launch(command, &request, slot, self.events_tx.clone())?;
                Ok(Unit::Process(unit))
            }
        }
    }

    /// Block until at least one trial finishes, a slot frees up, or `until`
    /// passes.
    ///
    /// Per-trial deadlines and memory limits are enforced while waiting;
    /// trials stopped by them are returned like any other completion.
    pub(crate) fn wait(&mut self, until: Instant) -> Vec<Completion> {
        let mut done = std::mem::take(&mut self.ready);
        loop {
            self.enforce_limits(&mut done);
            let mut freed = false;
            while let Ok(event) = self.events_rx.try_recv() {
                freed |= self.handle(event, &mut done);
            }
            let now = Instant::now();
            if !done.is_empty() || freed || now >= until {
                return done;
            }

            let mut wake = until.min(now + self.tick);
            if let Some(deadline) = self.next_deadline() {
                wake = wake.min(deadline);
            }
            match self.events_rx.recv_deadline(wake) {
                Ok(event) => {
                    if self.handle(event, &mut done) {
                        return done;
                    }
                }
                Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => {}
            }
        }
    }

    /// Completions that are already available, without blocking.
    pub(crate) fn poll_ready(&mut self) -> Vec<Completion> {
        self.wait(Instant::now())
    }

    /// Stop every running unit and hand back their records, still running,
    /// for the caller to cancel.
    pub(crate) fn cancel_all(&mut self) -> Vec<TrialRecord> {
        let mut records: Vec<TrialRecord> = self.ready.drain(..).map(|c| c.record).collect();
        for slot in &mut self.slots {
            if !matches!(slot, Slot::Busy(_)) {
                continue;
            }
            if let Slot::Busy(in_flight) = std::mem::replace(slot, Slot::Free) {
                *slot = in_flight.unit.stop();
                records.push(in_flight.record);
            }
        }
        records
    }

    fn next_deadline(&self) -> Option<Instant> {
        self.slots
            .iter()
            .filter_map(|s| match s {
                Slot::Busy(in_flight) => Some(in_flight.deadline),
                _ => None,
            })
            .min()
    }

    fn enforce_limits(&mut self, done: &mut Vec<Completion>) {
        let now = Instant::now();
        for slot in &mut self.slots {
            let Slot::Busy(in_flight) = &*slot else {
                continue;
            };
            let over_memory = match (&in_flight.unit, self.memory_limit) {
                (Unit::Process(unit), Some(limit)) => {
                    unit.resident_bytes().filter(|&rss| rss > limit)
                }
                _ => None,
            };
            let timed_out = now >= in_flight.deadline;
            if over_memory.is_none() && !timed_out {
                continue;
            }

            let Slot::Busy(in_flight) = std::mem::replace(slot, Slot::Free) else {
                continue;
            };
            *slot = in_flight.unit.stop();
            let outcome = match over_memory {
                Some(rss) => {
                    warn!(trial = %in_flight.record.id, rss, "Trial exceeded memory limit");
                    Outcome::Failed(FailureDetail::worker_death(format!(
                        "memory limit exceeded: {rss} bytes resident, limit {}",
                        self.memory_limit.unwrap_or_default()
                    )))
                }
                None => {
                    warn!(trial = %in_flight.record.id, "Trial exceeded time limit");
                    Outcome::TimedOut
                }
            };
            done.push(Completion {
                record: in_flight.record,
                outcome,
            });
        }
    }

    /// Apply one unit event. Returns true when it freed a slot.
    fn handle(&mut self, event: UnitEvent, done: &mut Vec<Completion>) -> bool {
        let Some(slot) = self.slots.get_mut(event.slot) else {
            return false;
        };
        let ours = matches!(&*slot, Slot::Busy(f) if f.record.id == event.trial_id);
        let returned = matches!(&*slot, Slot::Detached(u) if u.trial_id() == event.trial_id);
        if returned {
            if let Slot::Detached(unit) = std::mem::replace(slot, Slot::Free) {
                debug!(trial = %event.trial_id, "Stopped trial thread returned");
                unit.join();
            }
            return true;
        }
        if !ours {
            debug!(trial = %event.trial_id, "Discarding result of a stopped trial");
            return false;
        }
        let Slot::Busy(in_flight) = std::mem::replace(slot, Slot::Free) else {
            return false;
        };

        let outcome = match (in_flight.unit, event.kind) {
            (Unit::Thread(unit), UnitEventKind::Finished(outcome)) => {
                unit.join();
                outcome
            }
            (Unit::Process(unit), UnitEventKind::Closed { stdout }) => unit.collect(&stdout),
            (unit, _) => {
                *slot = unit.stop();
                Outcome::Failed(FailureDetail::worker_death("unit reported an unexpected event"))
            }
        };
        done.push(Completion {
            record: in_flight.record,
            outcome,
        });
        true
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        let running = self.cancel_all();
        if !running.is_empty() {
            debug!(count = running.len(), "Terminated running trials on pool teardown");
        }
    }
}

fn write_trial_data(data: &TrialData) -> Result<NamedTempFile, OptimizeError> {
    let file = tempfile::Builder::new()
        .prefix("am-trial-data-")
        .suffix(".json")
        .tempfile()?;
    let mut writer = BufWriter::new(file.as_file());
    serde_json::to_writer(&mut writer, data)?;
    writer.flush()?;
    drop(writer);
    Ok(file)
}

/// Single bounded evaluations without a scheduler.
pub struct Executor;

impl Executor {
    /// Run `trial_fn` on its own thread, bounded by `time_limit`.
    ///
    /// A panic becomes worker death. On timeout the thread is detached and
    /// left to finish on its own.
    /// Threads share the process's memory, so `memory_limit` is not enforced
    /// here; use [`Executor::run_isolated`] with a worker process for that.
    pub fn run<F>(trial_fn: F, time_limit: Duration, memory_limit: Option<u64>) -> Outcome
    where
        F: FnOnce() -> Result<Evaluation, TrialError> + Send + 'static,
    {
        if memory_limit.is_some() {
            warn!("Memory limit is not enforced for thread-isolated trials");
        }
        let (tx, rx) = crossbeam_channel::bounded(1);
        let unit = match ThreadUnit::launch(0, TrialId(0), Box::new(trial_fn), tx) {
            Ok(unit) => unit,
            Err(e) => {
                return Outcome::Failed(FailureDetail::worker_death(format!(
                    "failed to start worker: {e}"
                )))
            }
        };
        match rx.recv_timeout(time_limit) {
            Ok(UnitEvent {
                kind: UnitEventKind::Finished(outcome),
                ..
            }) => {
                unit.join();
                outcome
            }
            Ok(_) => {
                unit.detach();
                Outcome::Failed(FailureDetail::worker_death("unit reported an unexpected event"))
            }
            Err(RecvTimeoutError::Timeout) => {
                unit.detach();
                Outcome::TimedOut
            }
            Err(RecvTimeoutError::Disconnected) => {
                unit.join();
                Outcome::Failed(FailureDetail::worker_death("worker exited without a result"))
            }
        }
    }

    /// Evaluate one configuration under `isolation` with both limits.
    pub fn run_isolated(
        evaluator: Arc<TrialEvaluator>,
        configuration: Configuration,
        isolation: Isolation,
        time_limit: Duration,
        memory_limit: Option<u64>,
    ) -> Result<Outcome, OptimizeError> {
        let mut pool = WorkerPool::acquire(isolation, evaluator, 1, time_limit, memory_limit)?;
        pool.dispatch(TrialRecord::new(configuration))?;
        loop {
            let tick = pool.tick();
            if let Some(completion) = pool.wait(Instant::now() + tick).pop() {
                return Ok(completion.outcome);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn evaluation(score: f64) -> Evaluation {
        Evaluation {
            score,
            fold_scores: vec![score],
            test_score: None,
        }
    }

    #[test]
    fn run_returns_completed_evaluation() {
        let outcome = Executor::run(|| Ok(evaluation(0.9)), Duration::from_secs(5), None);
        assert_eq!(outcome, Outcome::Completed(evaluation(0.9)));
    }

    #[test]
    fn run_reports_trial_errors_as_failures() {
        let outcome = Executor::run(
            || Err(TrialError::FitFailed {
                message: "singular matrix".into(),
            }),
            Duration::from_secs(5),
            None,
        );
        match outcome {
            Outcome::Failed(detail) => {
                assert_eq!(detail.kind, crate::trial::FailureKind::Error);
                assert!(detail.message.contains("singular matrix"));
            }
            other => panic!("expected failure, got {other:?}"),
        }
    }

    #[test]
    fn run_contains_panics_as_worker_death() {
        let outcome = Executor::run(
            || panic!("estimator blew up"),
            Duration::from_secs(5),
            None,
        );
        match outcome {
            Outcome::Failed(detail) => {
                assert_eq!(detail.kind, crate::trial::FailureKind::WorkerDeath);
                assert!(detail.message.contains("estimator blew up"));
            }
            other => panic!("expected worker death, got {other:?}"),
        }
    }

    #[test]
    fn run_times_out_slow_trials() {
        let started = Instant::now();
        let outcome = Executor::run(
            || {
                std::thread::sleep(Duration::from_secs(2));
                Ok(evaluation(1.0))
            },
            Duration::from_millis(100),
            None,
        );
        assert_eq!(outcome, Outcome::TimedOut);
        assert!(started.elapsed() < Duration::from_secs(1));
    }
}
