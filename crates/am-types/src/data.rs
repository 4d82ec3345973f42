//! Materialized feature matrices, labeled splits and fold assignment.

use rand::seq::SliceRandom;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::errors::{DataError, TrialError};

/// Whether a feature column holds measurements or category codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FeatureKind {
    Numeric,
    /// Category codes stored as non-negative integral floats.
    Categorical,
}

/// Dense row-major feature matrix. Missing cells are `NaN`.
///
/// Serializes non-finite cells as JSON `null` and reads them back as `NaN`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(into = "RawMatrix", try_from = "RawMatrix")]
pub struct FeatureMatrix {
    columns: Vec<String>,
    kinds: Vec<FeatureKind>,
    rows: Vec<Vec<f64>>,
}

#[derive(Serialize, Deserialize)]
struct RawMatrix {
    columns: Vec<String>,
    kinds: Vec<FeatureKind>,
    rows: Vec<Vec<Option<f64>>>,
}

impl From<FeatureMatrix> for RawMatrix {
    fn from(m: FeatureMatrix) -> Self {
        let rows = m
            .rows
            .into_iter()
            .map(|row| row.into_iter().map(|v| v.is_finite().then_some(v)).collect())
            .collect();
        Self {
            columns: m.columns,
            kinds: m.kinds,
            rows,
        }
    }
}

impl TryFrom<RawMatrix> for FeatureMatrix {
    type Error = DataError;

    fn try_from(raw: RawMatrix) -> Result<Self, Self::Error> {
        let rows = raw
            .rows
            .into_iter()
            .map(|row| row.into_iter().map(|v| v.unwrap_or(f64::NAN)).collect())
            .collect();
        FeatureMatrix::new(raw.columns, raw.kinds, rows)
    }
}

impl FeatureMatrix {
    pub fn new(
        columns: Vec<String>,
        kinds: Vec<FeatureKind>,
        rows: Vec<Vec<f64>>,
    ) -> Result<Self, DataError> {
        if columns.len() != kinds.len() {
            return Err(DataError::InvalidFormat {
                message: format!(
                    "{} column names but {} column kinds",
                    columns.len(),
                    kinds.len()
                ),
            });
        }
        if let Some((i, row)) = rows.iter().enumerate().find(|(_, r)| r.len() != columns.len()) {
            return Err(DataError::InvalidFormat {
                message: format!("row {i} has {} cells, expected {}", row.len(), columns.len()),
            });
        }
        Ok(Self {
            columns,
            kinds,
            rows,
        })
    }

    /// All-numeric matrix with generated column names `x0, x1, ...`.
    pub fn numeric(rows: Vec<Vec<f64>>) -> Result<Self, DataError> {
        let width = rows.first().map(|r| r.len()).unwrap_or(0);
        let columns = (0..width).map(|j| format!("x{j}")).collect();
        Self::new(columns, vec![FeatureKind::Numeric; width], rows)
    }

    pub fn n_rows(&self) -> usize {
        self.rows.len()
    }

    pub fn n_cols(&self) -> usize {
        self.columns.len()
    }

    pub fn column_names(&self) -> &[String] {
        &self.columns
    }

    pub fn kinds(&self) -> &[FeatureKind] {
        &self.kinds
    }

    pub fn rows(&self) -> &[Vec<f64>] {
        &self.rows
    }

    pub fn row(&self, i: usize) -> &[f64] {
        &self.rows[i]
    }

    pub fn column_values(&self, j: usize) -> impl Iterator<Item = f64> + '_ {
        self.rows.iter().map(move |row| row[j])
    }

    /// Copy of the selected rows, in the given order.
    pub fn select_rows(&self, indices: &[usize]) -> Self {
        Self {
            columns: self.columns.clone(),
            kinds: self.kinds.clone(),
            rows: indices.iter().map(|&i| self.rows[i].clone()).collect(),
        }
    }
}

/// Features plus class labels (`0..n_classes`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LabeledSplit {
    pub features: FeatureMatrix,
    pub labels: Vec<usize>,
}

impl LabeledSplit {
    pub fn new(features: FeatureMatrix, labels: Vec<usize>) -> Result<Self, DataError> {
        if features.n_rows() != labels.len() {
            return Err(DataError::InvalidFormat {
                message: format!(
                    "{} feature rows but {} labels",
                    features.n_rows(),
                    labels.len()
                ),
            });
        }
        Ok(Self { features, labels })
    }

    pub fn len(&self) -> usize {
        self.labels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }

    pub fn subset(&self, indices: &[usize]) -> Self {
        Self {
            features: self.features.select_rows(indices),
            labels: indices.iter().map(|&i| self.labels[i]).collect(),
        }
    }
}

/// Read-only inputs shared by every trial of one optimization run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrialData {
    pub train: LabeledSplit,
    pub validation: Option<LabeledSplit>,
    pub test: Option<LabeledSplit>,
    pub n_classes: usize,
}

impl TrialData {
    pub fn new(train: LabeledSplit, n_classes: usize) -> Self {
        Self {
            train,
            validation: None,
            test: None,
            n_classes,
        }
    }

    pub fn with_validation(mut self, validation: LabeledSplit) -> Self {
        self.validation = Some(validation);
        self
    }

    pub fn with_test(mut self, test: LabeledSplit) -> Self {
        self.test = Some(test);
        self
    }

    /// Check that all splits share a schema and labels fit `n_classes`.
    pub fn validate(&self) -> Result<(), TrialError> {
        if self.n_classes < 2 {
            return Err(TrialError::InvalidData {
                message: format!("need at least 2 classes, got {}", self.n_classes),
            });
        }
        if self.train.is_empty() {
            return Err(TrialError::InvalidData {
                message: "training split is empty".to_string(),
            });
        }
        let width = self.train.features.n_cols();
        for (name, split) in [
            ("train", Some(&self.train)),
            ("validation", self.validation.as_ref()),
            ("test", self.test.as_ref()),
        ] {
            let Some(split) = split else { continue };
            if split.features.n_cols() != width {
                return Err(TrialError::InvalidData {
                    message: format!(
                        "{name} split has {} columns, train has {width}",
                        split.features.n_cols()
                    ),
                });
            }
            if let Some(bad) = split.labels.iter().find(|&&y| y >= self.n_classes) {
                return Err(TrialError::InvalidData {
                    message: format!("{name} label {bad} outside 0..{}", self.n_classes),
                });
            }
        }
        Ok(())
    }
}

/// Class-probability predictions, one row per sample.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Predictions {
    pub probabilities: Vec<Vec<f64>>,
}

impl Predictions {
    pub fn new(probabilities: Vec<Vec<f64>>) -> Self {
        Self { probabilities }
    }

    pub fn len(&self) -> usize {
        self.probabilities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.probabilities.is_empty()
    }

    pub fn n_classes(&self) -> usize {
        self.probabilities.first().map(|r| r.len()).unwrap_or(0)
    }

    /// Most probable class per row; ties go to the lowest class index.
    pub fn labels(&self) -> Vec<usize> {
        self.probabilities
            .iter()
            .map(|row| {
                row.iter()
                    .enumerate()
                    .fold((0, f64::NEG_INFINITY), |best, (k, &p)| {
                        if p > best.1 {
                            (k, p)
                        } else {
                            best
                        }
                    })
                    .0
            })
            .collect()
    }
}

/// Assign sample indices to `k` folds, stratified by label.
///
/// Each class is shuffled with a ChaCha8 generator seeded by `seed` and dealt
/// round-robin, continuing from the fold where the previous class stopped so
/// fold sizes differ by at most one. Returned folds are sorted.
pub fn stratified_folds(labels: &[usize], k: usize, seed: u64) -> Vec<Vec<usize>> {
    let k = k.max(1);
    let mut by_class: BTreeMap<usize, Vec<usize>> = BTreeMap::new();
    for (i, &y) in labels.iter().enumerate() {
        by_class.entry(y).or_default().push(i);
    }

    let mut rng = ChaCha8Rng::seed_from_u64(seed);
    let mut folds = vec![Vec::new(); k];
    let mut next = 0;
    for members in by_class.values_mut() {
        members.shuffle(&mut rng);
        for &i in members.iter() {
            folds[next].push(i);
            next = (next + 1) % k;
        }
    }
    for fold in &mut folds {
        fold.sort_unstable();
    }
    folds
}
