//! Dense-row classifiers used at the end of a pipeline.
//!
//! Inputs are already imputed and scaled, so every value is finite.

use am_types::TrialError;
use serde::{Deserialize, Serialize};

/// Classifier over preprocessed rows.
pub trait Classifier: Send {
    fn fit(&mut self, rows: &[Vec<f64>], labels: &[usize], n_classes: usize) -> Result<(), TrialError>;

    fn predict_proba(&self, rows: &[Vec<f64>]) -> Result<Vec<Vec<f64>>, TrialError>;
}

fn check_fit_input(rows: &[Vec<f64>], labels: &[usize], n_classes: usize) -> Result<(), TrialError> {
    if rows.is_empty() {
        return Err(TrialError::FitFailed {
            message: "no training rows".into(),
        });
    }
    if rows.len() != labels.len() {
        return Err(TrialError::ShapeMismatch {
            message: format!("{} rows but {} labels", rows.len(), labels.len()),
        });
    }
    if let Some(&bad) = labels.iter().find(|&&l| l >= n_classes) {
        return Err(TrialError::FitFailed {
            message: format!("label {bad} outside 0..{n_classes}"),
        });
    }
    Ok(())
}

fn check_width(rows: &[Vec<f64>], expected: usize) -> Result<(), TrialError> {
    match rows.iter().find(|r| r.len() != expected) {
        Some(row) => Err(TrialError::ShapeMismatch {
            message: format!("expected {expected} features, got {}", row.len()),
        }),
        None => Ok(()),
    }
}

/// Numerically stable softmax in place.
fn softmax(logits: &mut [f64]) {
    let max = logits.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
    let mut sum = 0.0;
    for z in logits.iter_mut() {
        *z = (*z - max).exp();
        sum += *z;
    }
    for z in logits.iter_mut() {
        *z /= sum;
    }
}

/// Multinomial logistic regression trained with full-batch gradient descent.
#[derive(Debug, Clone)]
pub struct LogisticRegression {
    learning_rate: f64,
    epochs: usize,
    l2: f64,
    /// One weight row per class, bias last.
    weights: Option<Vec<Vec<f64>>>,
}

impl LogisticRegression {
    pub fn new() -> Self {
        Self {
            learning_rate: 0.1,
            epochs: 100,
            l2: 1e-4,
            weights: None,
        }
    }

    pub fn with_learning_rate(mut self, learning_rate: f64) -> Self {
        self.learning_rate = learning_rate;
        self
    }

    pub fn with_epochs(mut self, epochs: usize) -> Self {
        self.epochs = epochs;
        self
    }

    pub fn with_l2(mut self, l2: f64) -> Self {
        self.l2 = l2;
        self
    }

    fn logits(weights: &[Vec<f64>], row: &[f64]) -> Vec<f64> {
        weights
            .iter()
            .map(|w| match w.split_last() {
                Some((bias, coef)) => bias + coef.iter().zip(row).map(|(a, x)| a * x).sum::<f64>(),
                None => 0.0,
            })
            .collect()
    }
}

impl Default for LogisticRegression {
    fn default() -> Self {
        Self::new()
    }
}

impl Classifier for LogisticRegression {
    fn fit(&mut self, rows: &[Vec<f64>], labels: &[usize], n_classes: usize) -> Result<(), TrialError> {
        check_fit_input(rows, labels, n_classes)?;
        let width = rows[0].len();
        check_width(rows, width)?;

        let n = rows.len() as f64;
        let mut weights = vec![vec![0.0; width + 1]; n_classes];
        for _ in 0..self.epochs {
            let mut grad = vec![vec![0.0; width + 1]; n_classes];
            for (row, &label) in rows.iter().zip(labels) {
                let mut p = Self::logits(&weights, row);
                softmax(&mut p);
                for (k, g) in grad.iter_mut().enumerate() {
                    let err = p[k] - if k == label { 1.0 } else { 0.0 };
                    for (gj, x) in g.iter_mut().zip(row) {
                        *gj += err * x;
                    }
                    g[width] += err;
                }
            }
            for (w, g) in weights.iter_mut().zip(&grad) {
                for j in 0..=width {
                    let penalty = if j < width { self.l2 * w[j] } else { 0.0 };
                    w[j] -= self.learning_rate * (g[j] / n + penalty);
                }
            }
        }

        if weights.iter().flatten().any(|w| !w.is_finite()) {
            return Err(TrialError::FitFailed {
                message: "logistic regression diverged".into(),
            });
        }
        self.weights = Some(weights);
        Ok(())
    }

    fn predict_proba(&self, rows: &[Vec<f64>]) -> Result<Vec<Vec<f64>>, TrialError> {
        let weights = self.weights.as_ref().ok_or(TrialError::NotFitted)?;
        let width = weights.first().map(|w| w.len() - 1).unwrap_or(0);
        check_width(rows, width)?;
        Ok(rows
            .iter()
            .map(|row| {
                let mut p = Self::logits(weights, row);
                softmax(&mut p);
                p
            })
            .collect())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NeighborWeights {
    Uniform,
    Distance,
}

impl NeighborWeights {
    pub fn parse(name: &str) -> Option<Self> {
        match name {
            "uniform" => Some(Self::Uniform),
            "distance" => Some(Self::Distance),
            _ => None,
        }
    }
}

/// k-nearest neighbors with Euclidean distance.
#[derive(Debug, Clone)]
pub struct KNearestNeighbors {
    k: usize,
    weights: NeighborWeights,
    train: Option<(Vec<Vec<f64>>, Vec<usize>, usize)>,
}

impl KNearestNeighbors {
    pub fn new(k: usize) -> Self {
        Self {
            k: k.max(1),
            weights: NeighborWeights::Uniform,
            train: None,
        }
    }

    pub fn with_weights(mut self, weights: NeighborWeights) -> Self {
        self.weights = weights;
        self
    }
}

impl Classifier for KNearestNeighbors {
    fn fit(&mut self, rows: &[Vec<f64>], labels: &[usize], n_classes: usize) -> Result<(), TrialError> {
        check_fit_input(rows, labels, n_classes)?;
        check_width(rows, rows[0].len())?;
        self.train = Some((rows.to_vec(), labels.to_vec(), n_classes));
        Ok(())
    }

    fn predict_proba(&self, rows: &[Vec<f64>]) -> Result<Vec<Vec<f64>>, TrialError> {
        let (train, labels, n_classes) = self.train.as_ref().ok_or(TrialError::NotFitted)?;
        check_width(rows, train[0].len())?;
        // k never exceeds the training set.
        let k = self.k.min(train.len());

        Ok(rows
            .iter()
            .map(|row| {
                let mut distances: Vec<(f64, usize)> = train
                    .iter()
                    .zip(labels)
                    .map(|(t, &label)| {
                        let d2: f64 = t.iter().zip(row).map(|(a, b)| (a - b).powi(2)).sum();
                        (d2.sqrt(), label)
                    })
                    .collect();
                distances.sort_by(|a, b| a.0.total_cmp(&b.0));

                let mut votes = vec![0.0; *n_classes];
                for &(distance, label) in &distances[..k] {
                    votes[label] += match self.weights {
                        NeighborWeights::Uniform => 1.0,
                        NeighborWeights::Distance => 1.0 / distance.max(1e-10),
                    };
                }
                let total: f64 = votes.iter().sum();
                votes.iter_mut().for_each(|v| *v /= total);
                votes
            })
            .collect())
    }
}

/// Gaussian naive Bayes.
#[derive(Debug, Clone)]
pub struct GaussianNB {
    var_smoothing: f64,
    model: Option<NbModel>,
}

#[derive(Debug, Clone)]
struct NbModel {
    /// `None` for classes absent from the training fold.
    classes: Vec<Option<NbClass>>,
}

#[derive(Debug, Clone)]
struct NbClass {
    log_prior: f64,
    means: Vec<f64>,
    variances: Vec<f64>,
}

impl GaussianNB {
    pub fn new() -> Self {
        Self {
            var_smoothing: 1e-9,
            model: None,
        }
    }

    pub fn with_var_smoothing(mut self, var_smoothing: f64) -> Self {
        self.var_smoothing = var_smoothing;
        self
    }
}

impl Default for GaussianNB {
    fn default() -> Self {
        Self::new()
    }
}

impl Classifier for GaussianNB {
    fn fit(&mut self, rows: &[Vec<f64>], labels: &[usize], n_classes: usize) -> Result<(), TrialError> {
        check_fit_input(rows, labels, n_classes)?;
        let width = rows[0].len();
        check_width(rows, width)?;

        let n = rows.len() as f64;
        let max_variance = (0..width)
            .map(|j| {
                let mean = rows.iter().map(|r| r[j]).sum::<f64>() / n;
                rows.iter().map(|r| (r[j] - mean).powi(2)).sum::<f64>() / n
            })
            .fold(0.0, f64::max);
        let epsilon = (self.var_smoothing * max_variance).max(1e-12);

        let classes = (0..n_classes)
            .map(|class| {
                let members: Vec<&Vec<f64>> = rows
                    .iter()
                    .zip(labels)
                    .filter(|(_, &l)| l == class)
                    .map(|(r, _)| r)
                    .collect();
                if members.is_empty() {
                    return None;
                }
                let count = members.len() as f64;
                let means: Vec<f64> = (0..width)
                    .map(|j| members.iter().map(|r| r[j]).sum::<f64>() / count)
                    .collect();
                let variances = (0..width)
                    .map(|j| {
                        members.iter().map(|r| (r[j] - means[j]).powi(2)).sum::<f64>() / count
                            + epsilon
                    })
                    .collect();
                Some(NbClass {
                    log_prior: (count / n).ln(),
                    means,
                    variances,
                })
            })
            .collect();

        self.model = Some(NbModel { classes });
        Ok(())
    }

    fn predict_proba(&self, rows: &[Vec<f64>]) -> Result<Vec<Vec<f64>>, TrialError> {
        let model = self.model.as_ref().ok_or(TrialError::NotFitted)?;
        let width = model
            .classes
            .iter()
            .flatten()
            .next()
            .map(|c| c.means.len())
            .unwrap_or(0);
        check_width(rows, width)?;

        Ok(rows
            .iter()
            .map(|row| {
                let log_joint: Vec<f64> = model
                    .classes
                    .iter()
                    .map(|class| match class {
                        Some(c) => {
                            c.log_prior
                                + row
                                    .iter()
                                    .zip(c.means.iter().zip(&c.variances))
                                    .map(|(x, (m, v))| {
                                        -0.5 * ((2.0 * std::f64::consts::PI * v).ln()
                                            + (x - m).powi(2) / v)
                                    })
                                    .sum::<f64>()
                        }
                        None => f64::NEG_INFINITY,
                    })
                    .collect();
                // Log-sum-exp; absent classes get exactly zero.
                let mut p = log_joint;
                softmax(&mut p);
                p
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn blobs() -> (Vec<Vec<f64>>, Vec<usize>) {
        let rows = vec![
            vec![-2.0, -2.1],
            vec![-1.8, -2.0],
            vec![-2.2, -1.9],
            vec![2.0, 2.1],
            vec![1.9, 2.0],
            vec![2.1, 1.8],
        ];
        (rows, vec![0, 0, 0, 1, 1, 1])
    }

    fn argmax(row: &[f64]) -> usize {
        row.iter()
            .enumerate()
            .max_by(|a, b| a.1.total_cmp(b.1))
            .map(|(i, _)| i)
            .unwrap()
    }

    fn assert_separates(model: &mut dyn Classifier) {
        let (rows, labels) = blobs();
        model.fit(&rows, &labels, 2).unwrap();
        let probs = model.predict_proba(&[vec![-2.0, -2.0], vec![2.0, 2.0]]).unwrap();
        assert_eq!(argmax(&probs[0]), 0);
        assert_eq!(argmax(&probs[1]), 1);
        for row in probs {
            assert!((row.iter().sum::<f64>() - 1.0).abs() < 1e-9);
        }
    }

    #[test]
    fn logistic_regression_separates_blobs() {
        assert_separates(&mut LogisticRegression::new().with_learning_rate(0.5).with_epochs(50));
    }

    #[test]
    fn knn_separates_blobs() {
        assert_separates(&mut KNearestNeighbors::new(3));
        assert_separates(&mut KNearestNeighbors::new(3).with_weights(NeighborWeights::Distance));
    }

    #[test]
    fn gaussian_nb_separates_blobs() {
        assert_separates(&mut GaussianNB::new());
    }

    #[test]
    fn knn_clamps_k_to_training_size() {
        let mut knn = KNearestNeighbors::new(25);
        knn.fit(&[vec![0.0], vec![1.0]], &[0, 1], 2).unwrap();
        let probs = knn.predict_proba(&[vec![0.0]]).unwrap();
        assert_eq!(probs[0], vec![0.5, 0.5]);
    }

    #[test]
    fn absent_class_gets_zero_probability() {
        let mut nb = GaussianNB::new();
        nb.fit(&[vec![0.0], vec![0.1], vec![5.0]], &[0, 0, 2], 3).unwrap();
        let probs = nb.predict_proba(&[vec![0.05]]).unwrap();
        assert_eq!(probs[0].len(), 3);
        assert_eq!(probs[0][1], 0.0);
    }

    #[test]
    fn predict_before_fit_is_an_error() {
        let rows = [vec![0.0]];
        assert!(matches!(
            LogisticRegression::new().predict_proba(&rows),
            Err(TrialError::NotFitted)
        ));
        assert!(matches!(
            KNearestNeighbors::new(1).predict_proba(&rows),
            Err(TrialError::NotFitted)
        ));
        assert!(matches!(GaussianNB::new().predict_proba(&rows), Err(TrialError::NotFitted)));
    }

    #[test]
    fn fit_rejects_out_of_range_labels() {
        let mut lr = LogisticRegression::new();
        assert!(matches!(
            lr.fit(&[vec![0.0]], &[3], 2),
            Err(TrialError::FitFailed { .. })
        ));
    }
}
