//! Column-wise preprocessing: imputation, categorical encoding, scaling.
//!
//! Numeric columns are imputed and standardized. Categorical columns hold
//! integral category codes; missing codes form their own category. They are
//! either passed through as ordinal indices or one-hot encoded, with rare
//! categories folded into an "infrequent" column when there are more than
//! `max_categories`.

use am_types::{FeatureKind, FeatureMatrix, TrialError};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Ordinal value of a missing category.
const MISSING_CODE: f64 = -2.0;
/// Ordinal value of a category first seen at transform time.
const UNKNOWN_CODE: f64 = -1.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ImputeStrategy {
    Mean,
    Median,
}

impl ImputeStrategy {
    pub fn parse(name: &str) -> Option<Self> {
        match name {
            "mean" => Some(Self::Mean),
            "median" => Some(Self::Median),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CategoricalEncoding {
    Passthrough,
    OneHot { max_categories: usize },
}

/// Category key: the integral code, or `None` for missing.
type Category = Option<i64>;

fn category_of(value: f64) -> Category {
    value.is_finite().then(|| value.round() as i64)
}

#[derive(Debug, Clone)]
enum ColumnPlan {
    Numeric {
        fill: f64,
    },
    Ordinal {
        index: BTreeMap<Category, usize>,
    },
    OneHot {
        /// Output position of each kept category.
        kept: BTreeMap<Category, usize>,
        /// Whether an infrequent column follows the kept ones.
        infrequent: bool,
    },
}

impl ColumnPlan {
    fn width(&self) -> usize {
        match self {
            Self::Numeric { .. } | Self::Ordinal { .. } => 1,
            Self::OneHot { kept, infrequent } => kept.len() + usize::from(*infrequent),
        }
    }
}

/// Fitted-on-train transformer producing dense, fully numeric rows.
#[derive(Debug, Clone)]
pub struct Preprocessor {
    strategy: ImputeStrategy,
    encoding: CategoricalEncoding,
    plans: Vec<ColumnPlan>,
    means: Vec<f64>,
    scales: Vec<f64>,
}

impl Preprocessor {
    pub fn new(strategy: ImputeStrategy, encoding: CategoricalEncoding) -> Self {
        Self {
            strategy,
            encoding,
            plans: Vec::new(),
            means: Vec::new(),
            scales: Vec::new(),
        }
    }

    pub fn is_fitted(&self) -> bool {
        !self.plans.is_empty() || !self.means.is_empty()
    }

    /// Output width after encoding.
    pub fn output_width(&self) -> usize {
        self.plans.iter().map(ColumnPlan::width).sum()
    }

    pub fn fit_transform(&mut self, features: &FeatureMatrix) -> Result<Vec<Vec<f64>>, TrialError> {
        if features.n_rows() == 0 {
            return Err(TrialError::InvalidData {
                message: "cannot fit preprocessing on zero rows".into(),
            });
        }

        self.plans = features
            .kinds()
            .iter()
            .enumerate()
            .map(|(j, kind)| match kind {
                FeatureKind::Numeric => ColumnPlan::Numeric {
                    fill: impute_value(self.strategy, features.column_values(j)),
                },
                FeatureKind::Categorical => {
                    categorical_plan(self.encoding, features.column_values(j))
                }
            })
            .collect();

        let encoded = self.encode(features)?;
        let width = self.output_width();
        let n = encoded.len() as f64;
        self.means = (0..width)
            .map(|k| encoded.iter().map(|row| row[k]).sum::<f64>() / n)
            .collect();
        // Population standard deviation; constant columns are only centered.
        self.scales = (0..width)
            .map(|k| {
                let mean = self.means[k];
                let var = encoded.iter().map(|row| (row[k] - mean).powi(2)).sum::<f64>() / n;
                let std = var.sqrt();
                if std > 1e-12 {
                    std
                } else {
                    1.0
                }
            })
            .collect();

        Ok(self.scale(encoded))
    }

    pub fn transform(&self, features: &FeatureMatrix) -> Result<Vec<Vec<f64>>, TrialError> {
        if !self.is_fitted() {
            return Err(TrialError::NotFitted);
        }
        let encoded = self.encode(features)?;
        Ok(self.scale(encoded))
    }

    fn encode(&self, features: &FeatureMatrix) -> Result<Vec<Vec<f64>>, TrialError> {
        if features.n_cols() != self.plans.len() {
            return Err(TrialError::ShapeMismatch {
                message: format!(
                    "preprocessing fitted on {} columns, got {}",
                    self.plans.len(),
                    features.n_cols()
                ),
            });
        }

        let width = self.output_width();
        let rows = features
            .rows()
            .iter()
            .map(|row| {
                let mut out = Vec::with_capacity(width);
                for (value, plan) in row.iter().zip(&self.plans) {
                    match plan {
                        ColumnPlan::Numeric { fill } => {
                            out.push(if value.is_finite() { *value } else { *fill });
                        }
                        ColumnPlan::Ordinal { index } => {
                            let category = category_of(*value);
                            let code = match (category, index.get(&category)) {
                                (None, _) => MISSING_CODE,
                                (Some(_), Some(&i)) => i as f64,
                                (Some(_), None) => UNKNOWN_CODE,
                            };
                            out.push(code);
                        }
                        ColumnPlan::OneHot { kept, infrequent } => {
                            let start = out.len();
                            out.resize(start + plan.width(), 0.0);
                            match kept.get(&category_of(*value)) {
                                Some(&pos) => out[start + pos] = 1.0,
                                None if *infrequent => out[start + kept.len()] = 1.0,
                                // Unknown without an infrequent bucket encodes as all zeros.
                                None => {}
                            }
                        }
                    }
                }
                out
            })
            .collect();
        Ok(rows)
    }

    fn scale(&self, mut rows: Vec<Vec<f64>>) -> Vec<Vec<f64>> {
        for row in &mut rows {
            for (k, v) in row.iter_mut().enumerate() {
                *v = (*v - self.means[k]) / self.scales[k];
            }
        }
        rows
    }
}

fn impute_value(strategy: ImputeStrategy, values: impl Iterator<Item = f64>) -> f64 {
    let mut observed: Vec<f64> = values.filter(|v| v.is_finite()).collect();
    if observed.is_empty() {
        return 0.0;
    }
    match strategy {
        ImputeStrategy::Mean => observed.iter().sum::<f64>() / observed.len() as f64,
        ImputeStrategy::Median => {
            observed.sort_by(|a, b| a.total_cmp(b));
            let mid = observed.len() / 2;
            if observed.len() % 2 == 0 {
                (observed[mid - 1] + observed[mid]) / 2.0
            } else {
                observed[mid]
            }
        }
    }
}

fn categorical_plan(encoding: CategoricalEncoding, values: impl Iterator<Item = f64>) -> ColumnPlan {
    let mut counts: BTreeMap<Category, usize> = BTreeMap::new();
    for value in values {
        *counts.entry(category_of(value)).or_default() += 1;
    }

    match encoding {
        CategoricalEncoding::Passthrough => ColumnPlan::Ordinal {
            index: counts
                .keys()
                .filter(|c| c.is_some())
                .enumerate()
                .map(|(i, c)| (*c, i))
                .collect(),
        },
        CategoricalEncoding::OneHot { max_categories } => {
            let max_categories = max_categories.max(2);
            if counts.len() <= max_categories {
                let kept = counts.keys().enumerate().map(|(i, c)| (*c, i)).collect();
                return ColumnPlan::OneHot {
                    kept,
                    infrequent: false,
                };
            }
            // Most frequent first; ties keep the smaller code.
            let mut by_frequency: Vec<(Category, usize)> = counts.into_iter().collect();
            by_frequency.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(&b.0)));
            let mut frequent: Vec<Category> = by_frequency
                .into_iter()
                .take(max_categories - 1)
                .map(|(c, _)| c)
                .collect();
            frequent.sort();
            ColumnPlan::OneHot {
                kept: frequent.into_iter().enumerate().map(|(i, c)| (c, i)).collect(),
                infrequent: true,
            }
        }
    }
}
