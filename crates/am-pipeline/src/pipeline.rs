//! The tunable classification pipeline: imputation and categorical encoding
//! followed by one of several classifiers.

use am_types::{
    Configuration, Estimator, FeatureMatrix, Pipeline, Predictions, SearchSpace, TrialError,
};
use serde_json::json;
use tracing::debug;

use crate::classifiers::{Classifier, GaussianNB, KNearestNeighbors, LogisticRegression, NeighborWeights};
use crate::preprocessing::{CategoricalEncoding, ImputeStrategy, Preprocessor};

pub const CLASSIFIER_PIPELINE: &str = "classifier";

/// Preprocessing plus classifier, with a search space over both.
#[derive(Debug, Clone, Default)]
pub struct ClassifierPipeline;

impl ClassifierPipeline {
    pub fn new() -> Self {
        Self
    }
}

impl Pipeline for ClassifierPipeline {
    fn name(&self) -> &str {
        CLASSIFIER_PIPELINE
    }

    fn search_space(&self) -> SearchSpace {
        SearchSpace::new()
            .add_choice("impute_strategy", vec![json!("mean"), json!("median")])
            .add_nested(
                "one_hot",
                vec![
                    ("passthrough", SearchSpace::new()),
                    ("one_hot", SearchSpace::new().add_int("max_categories", 2, 20)),
                ],
            )
            .add_nested(
                "classifier",
                vec![
                    (
                        "logistic",
                        SearchSpace::new()
                            .add_log_uniform("learning_rate", 1e-3, 1.0)
                            .add_int("epochs", 20, 200)
                            .add_log_uniform("l2", 1e-6, 1e-1),
                    ),
                    (
                        "knn",
                        SearchSpace::new()
                            .add_int("k", 1, 25)
                            .add_choice("weights", vec![json!("uniform"), json!("distance")]),
                    ),
                    (
                        "gaussian_nb",
                        SearchSpace::new().add_log_uniform("var_smoothing", 1e-12, 1e-3),
                    ),
                ],
            )
    }

    fn build(&self, configuration: &Configuration) -> Result<Box<dyn Estimator>, TrialError> {
        let strategy_name = configuration.str("impute_strategy")?;
        let strategy = ImputeStrategy::parse(strategy_name).ok_or_else(|| {
            TrialError::InvalidParameter {
                name: "impute_strategy".into(),
                message: format!("unknown strategy '{strategy_name}'"),
            }
        })?;

        let encoding = match configuration.str("one_hot")? {
            "passthrough" => CategoricalEncoding::Passthrough,
            "one_hot" => CategoricalEncoding::OneHot {
                max_categories: positive(configuration, "one_hot:one_hot:max_categories")?,
            },
            other => return Err(unknown_option("one_hot", other)),
        };

        let classifier: Box<dyn Classifier> = match configuration.str("classifier")? {
            "logistic" => Box::new(
                LogisticRegression::new()
                    .with_learning_rate(configuration.f64("classifier:logistic:learning_rate")?)
                    .with_epochs(positive(configuration, "classifier:logistic:epochs")?)
                    .with_l2(configuration.f64("classifier:logistic:l2")?),
            ),
            "knn" => {
                let weights_name = configuration.str("classifier:knn:weights")?;
                let weights = NeighborWeights::parse(weights_name)
                    .ok_or_else(|| unknown_option("classifier:knn:weights", weights_name))?;
                Box::new(
                    KNearestNeighbors::new(positive(configuration, "classifier:knn:k")?)
                        .with_weights(weights),
                )
            }
            "gaussian_nb" => Box::new(
                GaussianNB::new()
                    .with_var_smoothing(configuration.f64("classifier:gaussian_nb:var_smoothing")?),
            ),
            other => return Err(unknown_option("classifier", other)),
        };

        debug!(
            trial = %configuration.trial_id,
            strategy = ?strategy,
            encoding = ?encoding,
            "Built classifier pipeline"
        );
        Ok(Box::new(ClassifierEstimator {
            preprocessor: Preprocessor::new(strategy, encoding),
            classifier,
            n_classes: 0,
        }))
    }
}

fn positive(configuration: &Configuration, name: &str) -> Result<usize, TrialError> {
    let value = configuration.i64(name)?;
    usize::try_from(value)
        .ok()
        .filter(|v| *v > 0)
        .ok_or_else(|| TrialError::InvalidParameter {
            name: name.to_string(),
            message: format!("expected a positive integer, got {value}"),
        })
}

fn unknown_option(name: &str, option: &str) -> TrialError {
    TrialError::InvalidParameter {
        name: name.to_string(),
        message: format!("unknown option '{option}'"),
    }
}

struct ClassifierEstimator {
    preprocessor: Preprocessor,
    classifier: Box<dyn Classifier>,
    n_classes: usize,
}

impl Estimator for ClassifierEstimator {
    fn fit(
        &mut self,
        features: &FeatureMatrix,
        labels: &[usize],
        n_classes: usize,
    ) -> Result<(), TrialError> {
        let rows = self.preprocessor.fit_transform(features)?;
        self.classifier.fit(&rows, labels, n_classes)?;
        self.n_classes = n_classes;
        Ok(())
    }

    fn predict_proba(&self, features: &FeatureMatrix) -> Result<Predictions, TrialError> {
        let rows = self.preprocessor.transform(features)?;
        let probabilities = self.classifier.predict_proba(&rows)?;
        if probabilities.iter().any(|p| p.len() != self.n_classes) {
            return Err(TrialError::PredictFailed {
                message: format!("classifier did not return {} columns", self.n_classes),
            });
        }
        Ok(Predictions::new(probabilities))
    }
}
