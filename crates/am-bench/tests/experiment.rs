//! The experiment loop, through the library and through the binary.

use am_bench::{ExperimentConfig, IsolationMode, RunContext, RunOutcome};
use am_data::{DatasetSource, FeatureMethod, ResultStore, SyntheticSpec};
use am_optimizer::{FailurePolicy, Isolation, RunState, StragglerPolicy};
use parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder;
use std::path::Path;
use std::process::Command;

fn config(working_dir: &Path) -> ExperimentConfig {
    ExperimentConfig {
        datasets: vec![DatasetSource::Synthetic {
            name: "blobs".to_string(),
            spec: SyntheticSpec {
                n_samples: 90,
                seed: 4,
                ..SyntheticSpec::default()
            },
        }],
        working_dir: working_dir.to_path_buf(),
        outer_splits: 3,
        folds: 2,
        inner_folds: 2,
        max_trials: 3,
        max_time_s: 60.0,
        workers: 2,
        metric: "accuracy".to_string(),
        straggler_policy: StragglerPolicy::WaitForAll,
        isolation: IsolationMode::Thread,
        ..ExperimentConfig::default()
    }
}

fn parquet_rows(path: &Path) -> usize {
    let file = std::fs::File::open(path).unwrap();
    ParquetRecordBatchReaderBuilder::try_new(file)
        .unwrap()
        .build()
        .unwrap()
        .map(|batch| batch.unwrap().num_rows())
        .sum()
}

#[test]
fn every_fold_is_optimized_and_persisted() {
    let dir = tempfile::tempdir().unwrap();
    let summaries = RunContext::new(config(dir.path())).unwrap().run().unwrap();

    assert_eq!(summaries.len(), 2);
    for (fold, summary) in summaries.iter().enumerate() {
        assert_eq!(summary.fold, fold);
        assert_eq!(summary.method, FeatureMethod::Original);
        match &summary.outcome {
            RunOutcome::Finished {
                path,
                state,
                trials,
                completed,
                best_score,
            } => {
                assert_eq!(*state, RunState::Completed);
                assert_eq!(*trials, 3);
                assert_eq!(*completed, 3);
                assert!(best_score.is_some());
                assert_eq!(parquet_rows(path), 3);
            }
            other => panic!("fold {fold} was not run: {other:?}"),
        }
    }
    let store = ResultStore::new(dir.path()).unwrap();
    assert!(store.exists("blobs", FeatureMethod::Original, 1));
}

#[test]
fn existing_results_are_skipped_without_rerun() {
    let dir = tempfile::tempdir().unwrap();
    RunContext::new(config(dir.path())).unwrap().run().unwrap();

    let mut again = config(dir.path());
    again.rerun = false;
    let summaries = RunContext::new(again).unwrap().run().unwrap();
    assert_eq!(summaries.len(), 2);
    assert!(summaries
        .iter()
        .all(|s| matches!(s.outcome, RunOutcome::Skipped { .. })));
}

#[test]
fn raised_failure_saves_the_partial_history() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = config(dir.path());
    config.pipeline = "fault:fail".to_string();
    config.on_failure = FailurePolicy::Raise;

    let err = RunContext::new(config).unwrap().run().unwrap_err();
    assert!(err.to_string().contains("injected failure"), "{err}");
    let store = ResultStore::new(dir.path()).unwrap();
    assert!(store.exists("blobs", FeatureMethod::Original, 0));
    assert!(!store.exists("blobs", FeatureMethod::Original, 1));
}

#[test]
fn abort_before_start_runs_nothing() {
    let dir = tempfile::tempdir().unwrap();
    let context = RunContext::new(config(dir.path()))
        .unwrap()
        .with_isolation(Isolation::Thread);
    context.abort_handle().trigger();
    let summaries = context.run().unwrap();
    assert!(summaries.is_empty());
}

#[test]
fn binary_runs_a_config_file_with_worker_processes() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = config(&dir.path().join("results"));
    config.isolation = IsolationMode::Process;
    config.save_csv = true;
    let config_path = dir.path().join("experiment.json");
    std::fs::write(&config_path, serde_json::to_string_pretty(&config).unwrap()).unwrap();

    let output = Command::new(env!("CARGO_BIN_EXE_am-bench"))
        .arg(&config_path)
        .env("RUST_LOG", "warn")
        .output()
        .unwrap();
    assert!(
        output.status.success(),
        "am-bench failed: {}",
        String::from_utf8_lossy(&output.stderr)
    );

    let store = ResultStore::new(dir.path().join("results")).unwrap();
    for fold in 0..2 {
        let path = store.artifact_path("blobs", FeatureMethod::Original, fold);
        assert_eq!(parquet_rows(&path), 3);
        assert!(path.with_extension("csv").is_file());
    }
}
