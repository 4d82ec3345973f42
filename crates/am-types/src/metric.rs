//! Metric definitions and the built-in classification scorers.

use serde::{Deserialize, Serialize};

use crate::data::Predictions;

/// Whether we are maximizing or minimizing the objective.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ObjectiveDirection {
    Maximize,
    Minimize,
}

impl Default for ObjectiveDirection {
    fn default() -> Self {
        Self::Maximize
    }
}

/// How per-fold scores collapse into one trial score.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum Aggregation {
    #[default]
    Mean,
    Median,
}

impl Aggregation {
    pub fn apply(&self, scores: &[f64]) -> f64 {
        if scores.is_empty() {
            return f64::NAN;
        }
        match self {
            Self::Mean => scores.iter().sum::<f64>() / scores.len() as f64,
            Self::Median => {
                let mut sorted = scores.to_vec();
                sorted.sort_by(|a, b| a.total_cmp(b));
                let mid = sorted.len() / 2;
                if sorted.len() % 2 == 0 {
                    (sorted[mid - 1] + sorted[mid]) / 2.0
                } else {
                    sorted[mid]
                }
            }
        }
    }
}

/// Scoring function: `(y_true, predictions) -> score`.
pub type ScoreFn = fn(&[usize], &Predictions) -> f64;

/// Name, direction, bounds and scoring function of the objective.
/// Immutable and shared read-only by all trials of a run.
#[derive(Clone)]
pub struct MetricDefinition {
    name: String,
    direction: ObjectiveDirection,
    bounds: (f64, f64),
    aggregation: Aggregation,
    score_fn: ScoreFn,
}

impl std::fmt::Debug for MetricDefinition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MetricDefinition")
            .field("name", &self.name)
            .field("direction", &self.direction)
            .field("bounds", &self.bounds)
            .field("aggregation", &self.aggregation)
            .finish()
    }
}

impl MetricDefinition {
    pub fn new(
        name: impl Into<String>,
        direction: ObjectiveDirection,
        bounds: (f64, f64),
        score_fn: ScoreFn,
    ) -> Self {
        Self {
            name: name.into(),
            direction,
            bounds,
            aggregation: Aggregation::Mean,
            score_fn,
        }
    }

    pub fn with_aggregation(mut self, aggregation: Aggregation) -> Self {
        self.aggregation = aggregation;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn direction(&self) -> ObjectiveDirection {
        self.direction
    }

    pub fn bounds(&self) -> (f64, f64) {
        self.bounds
    }

    pub fn aggregation(&self) -> Aggregation {
        self.aggregation
    }

    pub fn score(&self, y_true: &[usize], predictions: &Predictions) -> f64 {
        (self.score_fn)(y_true, predictions)
    }

    pub fn aggregate(&self, fold_scores: &[f64]) -> f64 {
        self.aggregation.apply(fold_scores)
    }

    /// Strictly better according to the direction.
    pub fn is_better(&self, candidate: f64, incumbent: f64) -> bool {
        match self.direction {
            ObjectiveDirection::Maximize => candidate > incumbent,
            ObjectiveDirection::Minimize => candidate < incumbent,
        }
    }

    /// Distance from the optimal bound, scaled by the bound width when it is
    /// finite. Zero is optimal.
    pub fn cost(&self, score: f64) -> f64 {
        let (low, high) = self.bounds;
        let raw = match self.direction {
            ObjectiveDirection::Maximize => high - score,
            ObjectiveDirection::Minimize => score - low,
        };
        let width = high - low;
        if width.is_finite() && width > 0.0 {
            raw / width
        } else {
            raw
        }
    }

    /// Everything but the scoring function, for sending across a process
    /// boundary.
    pub fn info(&self) -> MetricInfo {
        let (low, high) = self.bounds;
        MetricInfo {
            name: self.name.clone(),
            direction: self.direction,
            low: low.is_finite().then_some(low),
            high: high.is_finite().then_some(high),
            aggregation: self.aggregation,
        }
    }

    /// Look up a built-in metric by name.
    pub fn builtin(name: &str) -> Option<Self> {
        match name {
            "accuracy" => Some(Self::accuracy()),
            "balanced_accuracy" => Some(Self::balanced_accuracy()),
            "roc_auc_ovo" | "roc_auc" => Some(Self::roc_auc_ovo()),
            "log_loss" => Some(Self::log_loss()),
            _ => None,
        }
    }

    pub fn accuracy() -> Self {
        Self::new("accuracy", ObjectiveDirection::Maximize, (0.0, 1.0), accuracy)
    }

    pub fn balanced_accuracy() -> Self {
        Self::new(
            "balanced_accuracy",
            ObjectiveDirection::Maximize,
            (0.0, 1.0),
            balanced_accuracy,
        )
    }

    pub fn roc_auc_ovo() -> Self {
        Self::new("roc_auc_ovo", ObjectiveDirection::Maximize, (0.0, 1.0), roc_auc_ovo)
    }

    pub fn log_loss() -> Self {
        Self::new("log_loss", ObjectiveDirection::Minimize, (0.0, f64::INFINITY), log_loss)
    }
}

/// Settings of a metric without its scoring function.
///
/// A worker process looks the scorer up by `name` and rebuilds the caller's
/// definition with [`MetricInfo::with_scorer`], so direction, bounds and
/// aggregation match the parent's even for non-default settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricInfo {
    pub name: String,
    pub direction: ObjectiveDirection,
    /// `None` for an unbounded end; JSON has no infinities.
    pub low: Option<f64>,
    pub high: Option<f64>,
    pub aggregation: Aggregation,
}

impl MetricInfo {
    pub fn bounds(&self) -> (f64, f64) {
        (
            self.low.unwrap_or(f64::NEG_INFINITY),
            self.high.unwrap_or(f64::INFINITY),
        )
    }

    /// A definition with these settings and the scoring function of `scorer`.
    pub fn with_scorer(&self, scorer: &MetricDefinition) -> MetricDefinition {
        MetricDefinition::new(
            self.name.clone(),
            self.direction,
            self.bounds(),
            scorer.score_fn,
        )
        .with_aggregation(self.aggregation)
    }
}

pub fn accuracy(y_true: &[usize], predictions: &Predictions) -> f64 {
    if y_true.is_empty() || y_true.len() != predictions.len() {
        return f64::NAN;
    }
    let hits = y_true
        .iter()
        .zip(predictions.labels())
        .filter(|(y, p)| **y == *p)
        .count();
    hits as f64 / y_true.len() as f64
}

/// Mean per-class recall over the classes present in `y_true`.
pub fn balanced_accuracy(y_true: &[usize], predictions: &Predictions) -> f64 {
    if y_true.is_empty() || y_true.len() != predictions.len() {
        return f64::NAN;
    }
    let predicted = predictions.labels();
    let n_classes = y_true.iter().max().map(|m| m + 1).unwrap_or(0);
    let mut support = vec![0usize; n_classes];
    let mut correct = vec![0usize; n_classes];
    for (&y, &p) in y_true.iter().zip(&predicted) {
        support[y] += 1;
        if y == p {
            correct[y] += 1;
        }
    }
    let recalls: Vec<f64> = support
        .iter()
        .zip(&correct)
        .filter(|(s, _)| **s > 0)
        .map(|(s, c)| *c as f64 / *s as f64)
        .collect();
    recalls.iter().sum::<f64>() / recalls.len() as f64
}

/// One-vs-one macro ROC AUC (Hand & Till). For two classes this equals the
/// ordinary binary AUC. Undefined (`NaN`) when fewer than two classes occur.
pub fn roc_auc_ovo(y_true: &[usize], predictions: &Predictions) -> f64 {
    if y_true.len() != predictions.len() {
        return f64::NAN;
    }
    let width = predictions.n_classes();
    let mut present: Vec<usize> = y_true.iter().copied().filter(|&y| y < width).collect();
    present.sort_unstable();
    present.dedup();
    if present.len() < 2 {
        return f64::NAN;
    }

    let mut pair_scores = Vec::new();
    for (i, &a) in present.iter().enumerate() {
        for &b in &present[i + 1..] {
            let members: Vec<usize> = (0..y_true.len())
                .filter(|&s| y_true[s] == a || y_true[s] == b)
                .collect();
            let positives_a: Vec<bool> = members.iter().map(|&s| y_true[s] == a).collect();
            let scores_a: Vec<f64> = members
                .iter()
                .map(|&s| predictions.probabilities[s][a])
                .collect();
            let positives_b: Vec<bool> = positives_a.iter().map(|p| !p).collect();
            let scores_b: Vec<f64> = members
                .iter()
                .map(|&s| predictions.probabilities[s][b])
                .collect();
            pair_scores.push((binary_auc(&positives_a, &scores_a) + binary_auc(&positives_b, &scores_b)) / 2.0);
        }
    }
    pair_scores.iter().sum::<f64>() / pair_scores.len() as f64
}

/// Mann-Whitney AUC with average ranks for tied scores.
fn binary_auc(positive: &[bool], scores: &[f64]) -> f64 {
    let n_pos = positive.iter().filter(|p| **p).count();
    let n_neg = positive.len() - n_pos;
    if n_pos == 0 || n_neg == 0 {
        return f64::NAN;
    }

    let mut order: Vec<usize> = (0..scores.len()).collect();
    order.sort_by(|&i, &j| scores[i].total_cmp(&scores[j]));

    let mut ranks = vec![0.0; scores.len()];
    let mut start = 0;
    while start < order.len() {
        let mut end = start + 1;
        while end < order.len() && scores[order[end]] == scores[order[start]] {
            end += 1;
        }
        // ranks are 1-based
        let average = (start + end + 1) as f64 / 2.0;
        for &idx in &order[start..end] {
            ranks[idx] = average;
        }
        start = end;
    }

    let rank_sum: f64 = positive
        .iter()
        .zip(&ranks)
        .filter(|(p, _)| **p)
        .map(|(_, r)| r)
        .sum();
    let n_pos = n_pos as f64;
    (rank_sum - n_pos * (n_pos + 1.0) / 2.0) / (n_pos * n_neg as f64)
}

/// Mean negative log-likelihood of the true class, probabilities clipped to
/// `[1e-15, 1]`.
pub fn log_loss(y_true: &[usize], predictions: &Predictions) -> f64 {
    if y_true.is_empty() || y_true.len() != predictions.len() {
        return f64::NAN;
    }
    let total: f64 = y_true
        .iter()
        .zip(&predictions.probabilities)
        .map(|(&y, row)| {
            let p = row.get(y).copied().unwrap_or(0.0);
            -p.clamp(1e-15, 1.0).ln()
        })
        .sum();
    total / y_true.len() as f64
}

#[cfg(test)]
mod tests {
    use super::*;

    fn preds(rows: &[[f64; 2]]) -> Predictions {
        Predictions::new(rows.iter().map(|r| r.to_vec()).collect())
    }

    #[test]
    fn accuracy_counts_argmax_hits() {
        let p = preds(&[[0.9, 0.1], [0.2, 0.8], [0.6, 0.4], [0.3, 0.7]]);
        assert_eq!(accuracy(&[0, 1, 1, 1], &p), 0.75);
    }

    #[test]
    fn auc_perfect_and_inverted() {
        let p = preds(&[[0.9, 0.1], [0.8, 0.2], [0.3, 0.7], [0.1, 0.9]]);
        assert!((roc_auc_ovo(&[0, 0, 1, 1], &p) - 1.0).abs() < 1e-12);
        assert!((roc_auc_ovo(&[1, 1, 0, 0], &p) - 0.0).abs() < 1e-12);
    }

    #[test]
    fn auc_handles_ties() {
        let p = preds(&[[0.5, 0.5], [0.5, 0.5], [0.5, 0.5], [0.5, 0.5]]);
        assert!((roc_auc_ovo(&[0, 1, 0, 1], &p) - 0.5).abs() < 1e-12);
    }

    #[test]
    fn auc_multiclass_perfect() {
        let p = Predictions::new(vec![
            vec![0.8, 0.1, 0.1],
            vec![0.1, 0.8, 0.1],
            vec![0.1, 0.1, 0.8],
            vec![0.7, 0.2, 0.1],
        ]);
        assert!((roc_auc_ovo(&[0, 1, 2, 0], &p) - 1.0).abs() < 1e-12);
    }

    #[test]
    fn auc_single_class_is_undefined() {
        let p = preds(&[[0.9, 0.1], [0.2, 0.8]]);
        assert!(roc_auc_ovo(&[1, 1], &p).is_nan());
    }

    #[test]
    fn log_loss_is_zero_for_certain_predictions() {
        let p = preds(&[[1.0, 0.0], [0.0, 1.0]]);
        assert!(log_loss(&[0, 1], &p).abs() < 1e-12);
        let q = preds(&[[0.5, 0.5]]);
        assert!((log_loss(&[0], &q) - std::f64::consts::LN_2).abs() < 1e-12);
    }

    #[test]
    fn balanced_accuracy_averages_recalls() {
        let p = preds(&[[0.9, 0.1], [0.9, 0.1], [0.9, 0.1], [0.1, 0.9]]);
        // class 0 recall 1.0, class 1 recall 0.5
        assert!((balanced_accuracy(&[0, 0, 1, 1], &p) - 0.75).abs() < 1e-12);
    }

    #[test]
    fn direction_and_cost() {
        let auc = MetricDefinition::roc_auc_ovo();
        assert!(auc.is_better(0.9, 0.8));
        assert!(!auc.is_better(0.8, 0.8));
        assert!((auc.cost(0.75) - 0.25).abs() < 1e-12);

        let loss = MetricDefinition::log_loss();
        assert!(loss.is_better(0.1, 0.2));
        assert!((loss.cost(0.3) - 0.3).abs() < 1e-12);
    }

    #[test]
    fn aggregation_mean_and_median() {
        assert_eq!(Aggregation::Mean.apply(&[1.0, 2.0, 6.0]), 3.0);
        assert_eq!(Aggregation::Median.apply(&[1.0, 2.0, 6.0]), 2.0);
        assert_eq!(Aggregation::Median.apply(&[1.0, 2.0, 3.0, 6.0]), 2.5);
        assert!(Aggregation::Mean.apply(&[]).is_nan());
    }

    #[test]
    fn builtin_lookup() {
        assert_eq!(MetricDefinition::builtin("roc_auc_ovo").unwrap().name(), "roc_auc_ovo");
        assert_eq!(
            MetricDefinition::builtin("log_loss").unwrap().direction(),
            ObjectiveDirection::Minimize
        );
        assert!(MetricDefinition::builtin("f7").is_none());
    }

    #[test]
    fn info_carries_settings_through_json() {
        let metric = MetricDefinition::log_loss().with_aggregation(Aggregation::Median);
        let json = serde_json::to_string(&metric.info()).unwrap();
        let info: MetricInfo = serde_json::from_str(&json).unwrap();
        assert_eq!(info.low, Some(0.0));
        assert_eq!(info.high, None);

        let rebuilt = info.with_scorer(&MetricDefinition::log_loss());
        assert_eq!(rebuilt.bounds(), (0.0, f64::INFINITY));
        assert_eq!(rebuilt.aggregation(), Aggregation::Median);
        assert_eq!(rebuilt.direction(), ObjectiveDirection::Minimize);
        assert_eq!(rebuilt.aggregate(&[0.1, 0.2, 0.9]), 0.2);
    }
}
