//! The experiment loop: outer folds × datasets × feature methods, one
//! optimization each, results persisted per run.

use am_data::{provider_for, Dataset, FeatureMethod, OuterFolds, ResultStore};
use am_optimizer::{
    AbortHandle, EvaluationPlan, History, Isolation, OptimizeError, Optimizer, RunState,
    TrialStatus, WorkerCommand,
};
use am_types::{AmError, MetricDefinition, Pipeline, TrialData};
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;
use tracing::{info, warn};

use crate::config::{ExperimentConfig, IsolationMode};

#[derive(Error, Debug)]
pub enum BenchError {
    #[error(transparent)]
    Am(#[from] AmError),

    #[error(transparent)]
    Optimize(#[from] OptimizeError),

    #[error("Unknown pipeline: {0}")]
    UnknownPipeline(String),

    #[error("Unknown metric: {0}")]
    UnknownMetric(String),
}

/// What happened to one (fold, dataset, method) combination.
#[derive(Debug, Clone, PartialEq)]
pub enum RunOutcome {
    /// The artifact already existed and `rerun` was off.
    Skipped { path: PathBuf },
    Finished {
        path: PathBuf,
        state: RunState,
        trials: usize,
        completed: usize,
        best_score: Option<f64>,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub struct RunSummary {
    pub dataset: String,
    pub method: FeatureMethod,
    pub fold: usize,
    pub outcome: RunOutcome,
}

/// State of one experiment invocation. Owns everything the loop needs, so
/// separate experiments never share results or abort flags.
pub struct RunContext {
    config: ExperimentConfig,
    store: ResultStore,
    pipeline: Arc<dyn Pipeline>,
    metric: MetricDefinition,
    isolation: Isolation,
    abort: AbortHandle,
    summaries: Vec<RunSummary>,
}

impl RunContext {
    /// Validate `config` and prepare the result directory. Process isolation
    /// re-invokes the running executable as the worker.
    pub fn new(config: ExperimentConfig) -> Result<Self, BenchError> {
        config.validate()?;
        let pipeline = am_pipeline::lookup(&config.pipeline)
            .ok_or_else(|| BenchError::UnknownPipeline(config.pipeline.clone()))?;
        let metric = MetricDefinition::builtin(&config.metric)
            .ok_or_else(|| BenchError::UnknownMetric(config.metric.clone()))?;
        let isolation = match config.isolation {
            IsolationMode::Thread => Isolation::Thread,
            IsolationMode::Process => {
                Isolation::Process(WorkerCommand::current_exe().map_err(AmError::from)?)
            }
        };
        let store = ResultStore::new(&config.working_dir)?;

        Ok(Self {
            config,
            store,
            pipeline,
            metric,
            isolation,
            abort: AbortHandle::new(),
            summaries: Vec::new(),
        })
    }

    pub fn with_isolation(mut self, isolation: Isolation) -> Self {
        self.isolation = isolation;
        self
    }

    pub fn abort_handle(&self) -> AbortHandle {
        self.abort.clone()
    }

    pub fn config(&self) -> &ExperimentConfig {
        &self.config
    }

    /// Run every configured combination and return their summaries.
    ///
    /// A raised trial failure stops the experiment after its partial history
    /// is saved. An abort stops it after the aborted run is saved.
    pub fn run(mut self) -> Result<Vec<RunSummary>, BenchError> {
        let mut datasets = Vec::with_capacity(self.config.datasets.len());
        for source in &self.config.datasets {
            let dataset = source.load()?;
            let folds = OuterFolds::new(&dataset, self.config.outer_splits, self.config.split_seed)?;
            info!(
                dataset = %dataset.name,
                rows = dataset.n_rows(),
                columns = dataset.features.n_cols(),
                classes = dataset.n_classes(),
                "Dataset ready"
            );
            datasets.push((dataset, folds));
        }

        'folds: for fold in 0..self.config.folds {
            let seed = self.config.inner_fold_seed(fold);
            info!(fold, seed, "Starting outer fold");
            for (dataset, folds) in &datasets {
                for method in self.config.methods.clone() {
                    if self.abort.is_triggered() {
                        warn!("Experiment aborted");
                        break 'folds;
                    }
                    let outcome = self.run_one(dataset, folds, method, fold, seed)?;
                    self.summaries.push(RunSummary {
                        dataset: dataset.name.clone(),
                        method,
                        fold,
                        outcome,
                    });
                }
            }
        }
        Ok(self.summaries)
    }

    fn run_one(
        &self,
        dataset: &Dataset,
        folds: &OuterFolds,
        method: FeatureMethod,
        fold: usize,
        seed: u64,
    ) -> Result<RunOutcome, BenchError> {
        if !self.config.rerun && self.store.exists(&dataset.name, method, fold) {
            let path = self.store.artifact_path(&dataset.name, method, fold);
            info!(dataset = %dataset.name, %method, fold, path = %path.display(), "Results exist, skipping");
            return Ok(RunOutcome::Skipped { path });
        }

        let outer = folds.split(dataset, fold)?;
        let provider = provider_for(method, self.config.provider_command.as_deref())?;
        let (train, test) = provider.transform(&outer.train, &outer.test, seed)?;
        let data = TrialData::new(train, dataset.n_classes()).with_test(test);

        let optimizer = Optimizer::new(Arc::clone(&self.pipeline), self.metric.clone(), Arc::new(data))
            .with_plan(EvaluationPlan::CrossValidation {
                folds: self.config.inner_folds,
                seed,
            })
            .with_isolation(self.isolation.clone())
            .with_abort_handle(self.abort.clone());

        info!(dataset = %dataset.name, %method, fold, seed, "Optimizing");
        match optimizer.optimize(self.config.budget(), seed) {
            Ok(history) => self.persist(&history, &dataset.name, method, fold),
            Err(error) => {
                if let Some(history) = error.history() {
                    self.persist(history, &dataset.name, method, fold)?;
                }
                Err(error.into())
            }
        }
    }

    fn persist(
        &self,
        history: &History,
        dataset: &str,
        method: FeatureMethod,
        fold: usize,
    ) -> Result<RunOutcome, BenchError> {
        let table = history.to_table()?;
        let path = self.store.save(&table, dataset, method, fold)?;
        if self.config.save_csv {
            self.store.save_csv(&table, dataset, method, fold)?;
        }
        let best_score = history.best().and_then(|r| r.score);
        info!(
            dataset,
            %method,
            fold,
            trials = history.len(),
            best = ?best_score,
            "Run persisted"
        );
        Ok(RunOutcome::Finished {
            path,
            state: history.state,
            trials: history.len(),
            completed: history.count(TrialStatus::Completed),
            best_score,
        })
    }
}
