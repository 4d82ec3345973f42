//! Fit/predict contracts consumed by the trial evaluator.

use crate::data::{FeatureMatrix, Predictions};
use crate::errors::TrialError;
use crate::space::{Configuration, SearchSpace};

/// A fittable model built from one configuration.
///
/// Implementations must not mutate the matrices they are given; any
/// preprocessing works on a private copy.
pub trait Estimator: Send {
    /// Fit on `labels` in `0..n_classes`. A training fold may not contain
    /// every class, so `n_classes` fixes the prediction width.
    fn fit(
        &mut self,
        features: &FeatureMatrix,
        labels: &[usize],
        n_classes: usize,
    ) -> Result<(), TrialError>;

    /// Class probabilities, `n_classes` columns per row.
    fn predict_proba(&self, features: &FeatureMatrix) -> Result<Predictions, TrialError>;
}

/// A parameterized pipeline: declares its search space and builds concrete
/// estimators from sampled configurations.
pub trait Pipeline: Send + Sync {
    /// Stable name, used by worker processes to look the pipeline up.
    fn name(&self) -> &str;

    fn search_space(&self) -> SearchSpace;

    fn build(&self, configuration: &Configuration) -> Result<Box<dyn Estimator>, TrialError>;
}
