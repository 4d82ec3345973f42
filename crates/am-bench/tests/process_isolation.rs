//! Process-isolated trials, served by the `am-bench` binary in worker mode.

use am_data::{make_classification, OuterFolds, SyntheticSpec};
use am_optimizer::{
    EvaluationPlan, FailureKind, FailurePolicy, Isolation, OptimizeError, Optimizer, RunBudget,
    TrialStatus, WorkerCommand,
};
use am_pipeline::{ClassifierPipeline, Fault, FaultPipeline};
use am_types::{Aggregation, MetricDefinition, ObjectiveDirection, Pipeline, TrialData};
use std::sync::Arc;
use std::time::{Duration, Instant};

fn worker() -> Isolation {
    Isolation::Process(WorkerCommand::new(env!("CARGO_BIN_EXE_am-bench")))
}

fn data() -> Arc<TrialData> {
    let dataset = make_classification(&SyntheticSpec {
        n_samples: 120,
        seed: 11,
        missing_rate: 0.05,
        ..SyntheticSpec::default()
    })
    .unwrap();
    let folds = OuterFolds::new(&dataset, 4, 0).unwrap();
    let outer = folds.split(&dataset, 0).unwrap();
    Arc::new(TrialData::new(outer.train, dataset.n_classes()).with_test(outer.test))
}

fn optimizer(pipeline: Arc<dyn Pipeline>) -> Optimizer {
    scored_by(pipeline, MetricDefinition::accuracy())
}

fn scored_by(pipeline: Arc<dyn Pipeline>, metric: MetricDefinition) -> Optimizer {
    Optimizer::new(pipeline, metric, data())
        .with_plan(EvaluationPlan::CrossValidation { folds: 3, seed: 5 })
        .with_isolation(worker())
}

#[test]
fn classifier_trials_complete_in_worker_processes() {
    let budget = RunBudget::new(4, Duration::from_secs(120)).with_workers(2);
    let history = optimizer(Arc::new(ClassifierPipeline::new()))
        .optimize(budget, 42)
        .unwrap();

    assert_eq!(history.len(), 4);
    for record in history.all() {
        assert_eq!(record.status, TrialStatus::Completed, "{:?}", record.failure);
        let score = record.score.unwrap();
        assert!((0.0..=1.0).contains(&score));
        assert_eq!(record.fold_scores.len(), 3);
        assert!(record.test_score.is_some());
    }
    assert!(history.best().is_some());
}

#[test]
fn process_results_match_thread_results() {
    let budget = RunBudget::new(3, Duration::from_secs(120));
    let in_process = optimizer(Arc::new(ClassifierPipeline::new()))
        .optimize(budget.clone(), 9)
        .unwrap();
    let in_thread = optimizer(Arc::new(ClassifierPipeline::new()))
        .with_isolation(Isolation::Thread)
        .optimize(budget, 9)
        .unwrap();

    let scores = |h: &am_optimizer::History| {
        h.sorted_by_id()
            .iter()
            .map(|r| r.score)
            .collect::<Vec<_>>()
    };
    assert_eq!(scores(&in_process), scores(&in_thread));
}

#[test]
fn median_aggregation_is_applied_in_worker_processes() {
    let metric = MetricDefinition::accuracy().with_aggregation(Aggregation::Median);
    let budget = RunBudget::new(3, Duration::from_secs(120));
    let in_process = scored_by(Arc::new(ClassifierPipeline::new()), metric.clone())
        .optimize(budget.clone(), 9)
        .unwrap();
    let in_thread = scored_by(Arc::new(ClassifierPipeline::new()), metric)
        .with_isolation(Isolation::Thread)
        .optimize(budget, 9)
        .unwrap();

    assert!(in_process.completed().count() > 0);
    for record in in_process.completed() {
        let mut folds = record.fold_scores.clone();
        folds.sort_by(f64::total_cmp);
        assert_eq!(record.score, Some(folds[1]));
    }
    let scores = |h: &am_optimizer::History| {
        h.sorted_by_id()
            .iter()
            .map(|r| r.score)
            .collect::<Vec<_>>()
    };
    assert_eq!(scores(&in_process), scores(&in_thread));
}

#[test]
fn unknown_metric_is_rejected_before_any_trial() {
    let metric = MetricDefinition::new(
        "custom_auc",
        ObjectiveDirection::Maximize,
        (0.0, 1.0),
        am_types::metric::accuracy,
    );
    let budget = RunBudget::new(3, Duration::from_secs(60));
    let err = scored_by(Arc::new(ClassifierPipeline::new()), metric)
        .optimize(budget, 0)
        .unwrap_err();

    match err {
        OptimizeError::InvalidSetup(e) => {
            assert!(e.to_string().contains("unknown metric custom_auc"), "{e}")
        }
        other => panic!("expected invalid setup, got {other:?}"),
    }
}

#[test]
fn raised_error_is_reported_from_the_worker() {
    let budget = RunBudget::new(2, Duration::from_secs(60));
    let history = optimizer(Arc::new(FaultPipeline::new(Fault::Fail)))
        .optimize(budget, 0)
        .unwrap();

    assert_eq!(history.count(TrialStatus::Failed), 2);
    for record in history.all() {
        let failure = record.failure.as_ref().unwrap();
        assert_eq!(failure.kind, FailureKind::Error);
        assert!(failure.message.contains("injected failure"));
    }
}

#[test]
fn aborted_worker_is_worker_death() {
    let budget = RunBudget::new(2, Duration::from_secs(60)).with_workers(2);
    let history = optimizer(Arc::new(FaultPipeline::new(Fault::Abort)))
        .optimize(budget, 0)
        .unwrap();

    assert_eq!(history.len(), 2);
    for record in history.all() {
        assert_eq!(record.status, TrialStatus::Failed);
        assert_eq!(
            record.failure.as_ref().map(|f| f.kind),
            Some(FailureKind::WorkerDeath)
        );
    }
}

#[test]
fn panicking_worker_does_not_stop_the_run() {
    let budget = RunBudget::new(3, Duration::from_secs(60));
    let history = optimizer(Arc::new(FaultPipeline::new(Fault::Panic)))
        .optimize(budget, 0)
        .unwrap();
    assert_eq!(history.count(TrialStatus::Failed), 3);
}

#[test]
fn slow_worker_is_killed_at_the_trial_limit() {
    let budget = RunBudget::new(1, Duration::from_secs(60))
        .with_trial_time_limit(Duration::from_millis(500));
    let started = Instant::now();
    let history = optimizer(Arc::new(FaultPipeline::new(Fault::Sleep { millis: 20_000 })))
        .optimize(budget, 0)
        .unwrap();

    assert!(started.elapsed() < Duration::from_secs(10));
    assert_eq!(history.count(TrialStatus::TimedOut), 1);
    let record = &history.all()[0];
    assert_eq!(record.failure.as_ref().map(|f| f.kind), Some(FailureKind::Timeout));
}

#[test]
fn raise_policy_surfaces_worker_failures() {
    let budget = RunBudget::new(3, Duration::from_secs(60)).with_failure_policy(FailurePolicy::Raise);
    let err = optimizer(Arc::new(FaultPipeline::new(Fault::Abort)))
        .optimize(budget, 0)
        .unwrap_err();
    let history = err.history().unwrap();
    assert!(history.count(TrialStatus::Failed) >= 1);
}

#[cfg(target_os = "linux")]
#[test]
fn memory_hog_is_killed_over_the_limit() {
    let budget = RunBudget::new(1, Duration::from_secs(60))
        .with_trial_time_limit(Duration::from_secs(25))
        .with_trial_memory_limit(64 * 1024 * 1024);
    let started = Instant::now();
    let history = optimizer(Arc::new(FaultPipeline::new(Fault::Hog { megabytes: 256 })))
        .optimize(budget, 0)
        .unwrap();

    assert!(started.elapsed() < Duration::from_secs(20));
    let record = &history.all()[0];
    assert_eq!(record.status, TrialStatus::Failed);
    let failure = record.failure.as_ref().unwrap();
    assert_eq!(failure.kind, FailureKind::WorkerDeath);
    assert!(failure.message.contains("memory limit exceeded"));
}
