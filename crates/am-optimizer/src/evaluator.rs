//! Scores one configuration by fitting and predicting on the trial data.

use am_types::{
    stratified_folds, Configuration, Estimator, LabeledSplit, MetricDefinition, Pipeline,
    TrialData, TrialError,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::trial::Evaluation;

/// How a configuration is scored.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum EvaluationPlan {
    /// Fit on train, score on the validation split.
    Holdout,
    /// Stratified k-fold over the training split.
    CrossValidation { folds: usize, seed: u64 },
}

impl EvaluationPlan {
    /// Holdout when the data carries a validation split, otherwise 5-fold CV.
    pub fn default_for(data: &TrialData, seed: u64) -> Self {
        if data.validation.is_some() {
            Self::Holdout
        } else {
            Self::CrossValidation { folds: 5, seed }
        }
    }
}

fn fit(
    pipeline: &dyn Pipeline,
    configuration: &Configuration,
    train: &LabeledSplit,
    n_classes: usize,
) -> Result<Box<dyn Estimator>, TrialError> {
    let mut estimator = pipeline.build(configuration)?;
    estimator.fit(&train.features, &train.labels, n_classes)?;
    Ok(estimator)
}

fn score(
    estimator: &dyn Estimator,
    split: &LabeledSplit,
    metric: &MetricDefinition,
) -> Result<f64, TrialError> {
    let predictions = estimator.predict_proba(&split.features)?;
    if predictions.len() != split.len() {
        return Err(TrialError::ShapeMismatch {
            message: format!(
                "{} predictions for {} rows",
                predictions.len(),
                split.len()
            ),
        });
    }
    Ok(metric.score(&split.labels, &predictions))
}

/// Evaluates configurations of one pipeline against one dataset.
///
/// Cross-validation folds are fixed at construction, so every trial of a run
/// sees the same splits.
pub struct TrialEvaluator {
    pipeline: Arc<dyn Pipeline>,
    metric: MetricDefinition,
    data: Arc<TrialData>,
    plan: EvaluationPlan,
    folds: Vec<Vec<usize>>,
}

impl std::fmt::Debug for TrialEvaluator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TrialEvaluator")
            .field("pipeline", &self.pipeline.name())
            .field("metric", &self.metric.name())
            .field("plan", &self.plan)
            .finish()
    }
}

impl TrialEvaluator {
    pub fn new(
        pipeline: Arc<dyn Pipeline>,
        metric: MetricDefinition,
        data: Arc<TrialData>,
        plan: EvaluationPlan,
    ) -> Result<Self, TrialError> {
        data.validate()?;
        let folds = match &plan {
            EvaluationPlan::Holdout => {
                if data.validation.is_none() {
                    return Err(TrialError::InvalidData {
                        message: "holdout evaluation needs a validation split".to_string(),
                    });
                }
                Vec::new()
            }
            EvaluationPlan::CrossValidation { folds, seed } => {
                if *folds < 2 || *folds > data.train.len() {
                    return Err(TrialError::InvalidData {
                        message: format!(
                            "cannot make {folds} folds from {} training rows",
                            data.train.len()
                        ),
                    });
                }
                stratified_folds(&data.train.labels, *folds, *seed)
            }
        };
        Ok(Self {
            pipeline,
            metric,
            data,
            plan,
            folds,
        })
    }

    pub fn pipeline(&self) -> &Arc<dyn Pipeline> {
        &self.pipeline
    }

    pub fn metric(&self) -> &MetricDefinition {
        &self.metric
    }

    pub fn data(&self) -> &Arc<TrialData> {
        &self.data
    }

    pub fn plan(&self) -> &EvaluationPlan {
        &self.plan
    }

    /// Fit, predict and score one configuration.
    pub fn evaluate(&self, configuration: &Configuration) -> Result<Evaluation, TrialError> {
        let data = self.data.as_ref();
        let mut fold_scores = Vec::new();
        let mut test_scores = Vec::new();

        match &self.plan {
            EvaluationPlan::Holdout => {
                let validation = data.validation.as_ref().ok_or_else(|| {
                    TrialError::InvalidData {
                        message: "holdout evaluation needs a validation split".to_string(),
                    }
                })?;
                let estimator = fit(
                    self.pipeline.as_ref(),
                    configuration,
                    &data.train,
                    data.n_classes,
                )?;
                fold_scores.push(score(estimator.as_ref(), validation, &self.metric)?);
                if let Some(test) = &data.test {
                    test_scores.push(score(estimator.as_ref(), test, &self.metric)?);
                }
            }
            EvaluationPlan::CrossValidation { .. } => {
                for (k, held_out) in self.folds.iter().enumerate() {
                    let train_idx: Vec<usize> = self
                        .folds
                        .iter()
                        .enumerate()
                        .filter(|(j, _)| *j != k)
                        .flat_map(|(_, fold)| fold.iter().copied())
                        .collect();
                    let train = data.train.subset(&train_idx);
                    let validation = data.train.subset(held_out);

                    let estimator =
                        fit(self.pipeline.as_ref(), configuration, &train, data.n_classes)?;
                    fold_scores.push(score(estimator.as_ref(), &validation, &self.metric)?);
                    if let Some(test) = &data.test {
                        test_scores.push(score(estimator.as_ref(), test, &self.metric)?);
                    }
                }
            }
        }

        let score = self.metric.aggregate(&fold_scores);
        if !score.is_finite() || fold_scores.iter().any(|s| !s.is_finite()) {
            return Err(TrialError::NonFiniteScore {
                metric: self.metric.name().to_string(),
            });
        }
        let test_score = if test_scores.is_empty() {
            None
        } else {
            Some(test_scores.iter().sum::<f64>() / test_scores.len() as f64)
        }
        .filter(|s| s.is_finite());

        Ok(Evaluation {
            score,
            fold_scores,
            test_score,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use am_types::{FeatureMatrix, ObjectiveDirection, Predictions, SearchSpace, TrialId};
    use std::collections::BTreeMap;

    /// Predicts the training majority class with full confidence.
    struct Majority {
        class: usize,
        n_classes: usize,
    }

    impl Estimator for Majority {
        fn fit(
            &mut self,
            _features: &FeatureMatrix,
            labels: &[usize],
            n_classes: usize,
        ) -> Result<(), TrialError> {
            let mut counts = vec![0usize; n_classes];
            for &y in labels {
                counts[y] += 1;
            }
            self.class = (0..n_classes)
                .max_by_key(|&c| (counts[c], usize::MAX - c))
                .unwrap_or(0);
            self.n_classes = n_classes;
            Ok(())
        }

        fn predict_proba(&self, features: &FeatureMatrix) -> Result<Predictions, TrialError> {
            let row: Vec<f64> = (0..self.n_classes)
                .map(|c| if c == self.class { 1.0 } else { 0.0 })
                .collect();
            Ok(Predictions::new(vec![row; features.n_rows()]))
        }
    }

    struct MajorityPipeline;

    impl Pipeline for MajorityPipeline {
        fn name(&self) -> &str {
            "majority"
        }

        fn search_space(&self) -> SearchSpace {
            SearchSpace::new()
        }

        fn build(&self, _configuration: &Configuration) -> Result<Box<dyn Estimator>, TrialError> {
            Ok(Box::new(Majority {
                class: 0,
                n_classes: 0,
            }))
        }
    }

    fn split(labels: Vec<usize>) -> LabeledSplit {
        let rows = labels.iter().map(|&y| vec![y as f64]).collect();
        LabeledSplit::new(FeatureMatrix::numeric(rows).unwrap(), labels).unwrap()
    }

    fn config() -> Configuration {
        Configuration::new(TrialId(0), BTreeMap::new(), 0, 0)
    }

    #[test]
    fn holdout_scores_validation_split() {
        let data = TrialData::new(split(vec![0, 0, 0, 1]), 2)
            .with_validation(split(vec![0, 0, 1, 1]))
            .with_test(split(vec![0, 0, 0, 0]));
        let evaluator = TrialEvaluator::new(
            Arc::new(MajorityPipeline),
            MetricDefinition::accuracy(),
            Arc::new(data),
            EvaluationPlan::Holdout,
        )
        .unwrap();

        let evaluation = evaluator.evaluate(&config()).unwrap();
        assert_eq!(evaluation.score, 0.5);
        assert_eq!(evaluation.fold_scores, vec![0.5]);
        assert_eq!(evaluation.test_score, Some(1.0));
    }

    #[test]
    fn cross_validation_reports_one_score_per_fold() {
        let labels = vec![0, 0, 0, 0, 0, 0, 1, 1, 1, 1];
        let data = TrialData::new(split(labels), 2);
        let evaluator = TrialEvaluator::new(
            Arc::new(MajorityPipeline),
            MetricDefinition::accuracy(),
            Arc::new(data),
            EvaluationPlan::CrossValidation { folds: 2, seed: 3 },
        )
        .unwrap();

        let evaluation = evaluator.evaluate(&config()).unwrap();
        assert_eq!(evaluation.fold_scores.len(), 2);
        // Stratified folds keep the 60/40 balance, so majority always scores 0.6.
        for s in &evaluation.fold_scores {
            assert!((s - 0.6).abs() < 1e-12);
        }
        assert!((evaluation.score - 0.6).abs() < 1e-12);
        assert!(evaluation.test_score.is_none());
    }

    #[test]
    fn non_finite_score_is_a_failure() {
        let metric = MetricDefinition::new(
            "always_nan",
            ObjectiveDirection::Maximize,
            (0.0, 1.0),
            |_, _| f64::NAN,
        );
        let data = TrialData::new(split(vec![0, 1, 0, 1]), 2).with_validation(split(vec![0, 1]));
        let evaluator = TrialEvaluator::new(
            Arc::new(MajorityPipeline),
            metric,
            Arc::new(data),
            EvaluationPlan::Holdout,
        )
        .unwrap();
        assert!(matches!(
            evaluator.evaluate(&config()),
            Err(TrialError::NonFiniteScore { .. })
        ));
    }

    #[test]
    fn invalid_plans_are_rejected() {
        let data = Arc::new(TrialData::new(split(vec![0, 1, 0]), 2));
        assert!(TrialEvaluator::new(
            Arc::new(MajorityPipeline),
            MetricDefinition::accuracy(),
            data.clone(),
            EvaluationPlan::Holdout,
        )
        .is_err());
        assert!(TrialEvaluator::new(
            Arc::new(MajorityPipeline),
            MetricDefinition::accuracy(),
            data,
            EvaluationPlan::CrossValidation { folds: 4, seed: 0 },
        )
        .is_err());
    }
}
