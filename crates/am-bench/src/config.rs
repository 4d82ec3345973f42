use am_data::{DatasetSource, FeatureMethod, SyntheticSpec};
use am_optimizer::{FailurePolicy, RunBudget, StragglerPolicy};
use am_types::{config_error, AmResult, MetricDefinition};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Where trials of an experiment run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum IsolationMode {
    Thread,
    /// Each trial in a re-invocation of the running binary.
    #[default]
    Process,
}

/// Configuration of a benchmark experiment: which datasets, folds and
/// feature methods to run, and the budget of every optimization.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExperimentConfig {
    pub datasets: Vec<DatasetSource>,
    pub methods: Vec<FeatureMethod>,
    /// External command for every method except `original`.
    pub provider_command: Option<PathBuf>,
    pub pipeline: String,
    pub metric: String,
    pub working_dir: PathBuf,

    pub random_seed: u64,
    /// Seed of the outer fold assignment, shared by all methods.
    pub split_seed: u64,
    /// Number of outer folds the data is split into.
    pub outer_splits: usize,
    /// How many of those folds to run, starting at fold 0.
    pub folds: usize,
    /// Cross-validation folds inside each optimization.
    pub inner_folds: usize,
    /// Re-run and overwrite folds whose result artifact already exists.
    pub rerun: bool,
    pub save_csv: bool,

    pub max_trials: usize,
    pub max_time_s: f64,
    pub workers: usize,
    pub per_trial_time_limit_s: Option<f64>,
    pub per_trial_memory_limit_mb: Option<u64>,
    pub on_failure: FailurePolicy,
    pub straggler_policy: StragglerPolicy,
    pub isolation: IsolationMode,
}

impl Default for ExperimentConfig {
    fn default() -> Self {
        Self {
            datasets: vec![DatasetSource::Synthetic {
                name: "synthetic".to_string(),
                spec: SyntheticSpec::default(),
            }],
            methods: vec![FeatureMethod::Original],
            provider_command: None,
            pipeline: am_pipeline::CLASSIFIER_PIPELINE.to_string(),
            metric: "roc_auc_ovo".to_string(),
            working_dir: PathBuf::from("results"),
            random_seed: 42,
            split_seed: 0,
            outer_splits: 10,
            folds: 10,
            inner_folds: 5,
            rerun: true,
            save_csv: false,
            max_trials: 100_000,
            max_time_s: 3600.0,
            workers: 4,
            per_trial_time_limit_s: None,
            per_trial_memory_limit_mb: None,
            on_failure: FailurePolicy::Continue,
            straggler_policy: StragglerPolicy::CutAndReturn,
            isolation: IsolationMode::Process,
        }
    }
}

impl ExperimentConfig {
    /// Settings for checking that an experiment runs at all: one trial per
    /// fold and trial failures surface immediately.
    pub fn debugging() -> Self {
        Self {
            max_trials: 1,
            max_time_s: 600.0,
            workers: 20,
            on_failure: FailurePolicy::Raise,
            ..Self::default()
        }
    }

    /// Read a JSON config; missing fields take their defaults.
    pub fn from_file(path: impl AsRef<Path>) -> AmResult<Self> {
        let text = std::fs::read_to_string(path.as_ref())?;
        let config: Self = serde_json::from_str(&text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> AmResult<()> {
        if self.datasets.is_empty() {
            return Err(config_error!("no datasets configured"));
        }
        if self.methods.is_empty() {
            return Err(config_error!("no feature methods configured"));
        }
        if self.outer_splits < 2 {
            return Err(config_error!("outer_splits must be at least 2"));
        }
        if self.folds > self.outer_splits {
            return Err(config_error!(
                "cannot run {} folds of a {}-fold split",
                self.folds,
                self.outer_splits
            ));
        }
        if self.inner_folds < 2 {
            return Err(config_error!("inner_folds must be at least 2"));
        }
        if am_pipeline::lookup(&self.pipeline).is_none() {
            return Err(config_error!(
                "unknown pipeline {} (known: {}, or a fault:* pipeline)",
                self.pipeline,
                am_pipeline::names().join(", ")
            ));
        }
        if MetricDefinition::builtin(&self.metric).is_none() {
            return Err(config_error!("unknown metric {}", self.metric));
        }
        if let Some(method) = self
            .methods
            .iter()
            .find(|m| **m != FeatureMethod::Original && self.provider_command.is_none())
        {
            return Err(config_error!("feature method {method} requires provider_command"));
        }
        if !(self.max_time_s.is_finite() && self.max_time_s > 0.0) {
            return Err(config_error!("max_time_s must be positive, got {}", self.max_time_s));
        }
        if let Some(limit) = self.per_trial_time_limit_s {
            if !(limit.is_finite() && limit > 0.0) {
                return Err(config_error!("per_trial_time_limit_s must be positive, got {limit}"));
            }
        }
        self.budget().validate().map_err(|e| config_error!("{e}"))
    }

    pub fn budget(&self) -> RunBudget {
        let mut budget = RunBudget::new(self.max_trials, Duration::from_secs_f64(self.max_time_s))
            .with_workers(self.workers)
            .with_failure_policy(self.on_failure)
            .with_straggler_policy(self.straggler_policy);
        if let Some(limit) = self.per_trial_time_limit_s {
            budget = budget.with_trial_time_limit(Duration::from_secs_f64(limit));
        }
        if let Some(mb) = self.per_trial_memory_limit_mb {
            budget = budget.with_trial_memory_limit(mb * 1024 * 1024);
        }
        budget
    }

    /// Seed of every optimization on outer fold `fold`.
    pub fn inner_fold_seed(&self, fold: usize) -> u64 {
        self.random_seed + fold as u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_mirror_the_benchmark_setup() {
        let config = ExperimentConfig::default();
        config.validate().unwrap();
        assert_eq!(config.random_seed, 42);
        assert_eq!(config.folds, 10);
        assert_eq!(config.workers, 4);
        assert_eq!(config.inner_fold_seed(3), 45);
        let budget = config.budget();
        assert_eq!(budget.max_trials, 100_000);
        assert_eq!(budget.max_wall_clock, Duration::from_secs(3600));
        assert_eq!(budget.on_failure, FailurePolicy::Continue);
    }

    #[test]
    fn debugging_preset_raises() {
        let config = ExperimentConfig::debugging();
        config.validate().unwrap();
        assert_eq!(config.max_trials, 1);
        assert_eq!(config.workers, 20);
        assert_eq!(config.on_failure, FailurePolicy::Raise);
        assert_eq!(config.straggler_policy, StragglerPolicy::CutAndReturn);
    }

    #[test]
    fn partial_json_takes_defaults() {
        let json = r#"{
            "datasets": [{"source": "synthetic", "name": "tiny", "n_samples": 60, "seed": 3}],
            "max_trials": 7,
            "on_failure": "raise",
            "isolation": "thread"
        }"#;
        let config: ExperimentConfig = serde_json::from_str(json).unwrap();
        config.validate().unwrap();
        assert_eq!(config.max_trials, 7);
        assert_eq!(config.isolation, IsolationMode::Thread);
        assert_eq!(config.metric, "roc_auc_ovo");
        match &config.datasets[0] {
            DatasetSource::Synthetic { name, spec } => {
                assert_eq!(name, "tiny");
                assert_eq!(spec.n_samples, 60);
                assert_eq!(spec.n_classes, 2);
            }
            other => panic!("unexpected source {other:?}"),
        }
    }

    #[test]
    fn invalid_settings_are_rejected() {
        let mut config = ExperimentConfig::default();
        config.metric = "f1_macro".into();
        assert!(config.validate().is_err());

        let mut config = ExperimentConfig::default();
        config.methods = vec![FeatureMethod::OpenFE];
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("provider_command"));

        let mut config = ExperimentConfig::default();
        config.folds = 11;
        assert!(config.validate().is_err());

        let mut config = ExperimentConfig::default();
        config.workers = 0;
        assert!(config.validate().is_err());
    }
}
