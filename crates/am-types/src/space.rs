//! Search space declarations, parameter values and sampled configurations.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};

use crate::errors::{SpaceError, TrialError};
use crate::table::ColumnKind;

/// Separator used when flattening nested parameter names
/// (`classifier:knn:k`).
pub const KEY_SEPARATOR: char = ':';

/// Dispatch-ordered trial identifier. The n-th configuration produced by a
/// sampler carries `TrialId(n)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TrialId(pub u64);

impl std::fmt::Display for TrialId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A single parameter dimension in the search space.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParameterDef {
    /// Human-readable parameter name (e.g. "strategy").
    pub name: String,
    /// The kind of search range.
    pub kind: ParameterKind,
}

/// Describes how a parameter is sampled.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ParameterKind {
    /// Continuous uniform range [low, high].
    FloatRange { low: f64, high: f64 },
    /// Integer range [low, high] inclusive.
    IntRange { low: i64, high: i64 },
    /// Log-uniform range (sampled in log-space then exponentiated).
    LogUniform { low: f64, high: f64 },
    /// Categorical choices.
    Choice { values: Vec<serde_json::Value> },
    /// Choice of sub-space: the option is drawn first, then its own space.
    Nested { options: Vec<SubSpace> },
}

/// One option of a [`ParameterKind::Nested`] parameter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubSpace {
    pub name: String,
    pub space: SearchSpace,
}

/// A concrete parameter value produced by a sampler.
///
/// `Int` is listed before `Float` so that integers survive a JSON round trip
/// through the worker protocol.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ParameterValue {
    Int(i64),
    Float(f64),
    Json(serde_json::Value),
}

impl ParameterValue {
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Float(v) => Some(*v),
            Self::Int(v) => Some(*v as f64),
            Self::Json(v) => v.as_f64(),
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Self::Int(v) => Some(*v),
            Self::Float(_) => None,
            Self::Json(v) => v.as_i64(),
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Json(serde_json::Value::String(s)) => Some(s.as_str()),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Json(v) => v.as_bool(),
            _ => None,
        }
    }
}

impl std::fmt::Display for ParameterValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Float(v) => write!(f, "{v}"),
            Self::Int(v) => write!(f, "{v}"),
            Self::Json(serde_json::Value::String(s)) => write!(f, "{s}"),
            Self::Json(v) => write!(f, "{v}"),
        }
    }
}

/// The full search space: an ordered list of parameter definitions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchSpace {
    pub parameters: Vec<ParameterDef>,
}

impl SearchSpace {
    pub fn new() -> Self {
        Self {
            parameters: Vec::new(),
        }
    }

    pub fn add_float(mut self, name: impl Into<String>, low: f64, high: f64) -> Self {
        self.parameters.push(ParameterDef {
            name: name.into(),
            kind: ParameterKind::FloatRange { low, high },
        });
        self
    }

    pub fn add_int(mut self, name: impl Into<String>, low: i64, high: i64) -> Self {
        self.parameters.push(ParameterDef {
            name: name.into(),
            kind: ParameterKind::IntRange { low, high },
        });
        self
    }

    pub fn add_log_uniform(mut self, name: impl Into<String>, low: f64, high: f64) -> Self {
        self.parameters.push(ParameterDef {
            name: name.into(),
            kind: ParameterKind::LogUniform { low, high },
        });
        self
    }

    pub fn add_choice(mut self, name: impl Into<String>, values: Vec<serde_json::Value>) -> Self {
        self.parameters.push(ParameterDef {
            name: name.into(),
            kind: ParameterKind::Choice { values },
        });
        self
    }

    /// Add a composite parameter whose options each carry their own sub-space.
    pub fn add_nested(
        mut self,
        name: impl Into<String>,
        options: Vec<(impl Into<String>, SearchSpace)>,
    ) -> Self {
        let options = options
            .into_iter()
            .map(|(option, space)| SubSpace {
                name: option.into(),
                space,
            })
            .collect();
        self.parameters.push(ParameterDef {
            name: name.into(),
            kind: ParameterKind::Nested { options },
        });
        self
    }

    pub fn is_empty(&self) -> bool {
        self.parameters.is_empty()
    }

    /// Check that every declared parameter has a valid sampling rule.
    pub fn validate(&self) -> Result<(), SpaceError> {
        let mut keys = HashSet::new();
        self.validate_level(None, &mut keys)
    }

    fn validate_level(
        &self,
        prefix: Option<&str>,
        keys: &mut HashSet<String>,
    ) -> Result<(), SpaceError> {
        let mut names = HashSet::new();
        for param in &self.parameters {
            if param.name.is_empty() {
                return Err(SpaceError::EmptyName);
            }
            if !names.insert(param.name.as_str()) {
                return Err(SpaceError::DuplicateParameter {
                    name: param.name.clone(),
                });
            }
            let key = flat_key(prefix, &param.name);
            if !keys.insert(key.clone()) {
                return Err(SpaceError::DuplicateParameter { name: key });
            }

            match &param.kind {
                ParameterKind::FloatRange { low, high } => {
                    check_float_range(&key, *low, *high)?;
                }
                ParameterKind::LogUniform { low, high } => {
                    check_float_range(&key, *low, *high)?;
                    if *low <= 0.0 {
                        return Err(SpaceError::InvalidRange {
                            name: key,
                            message: format!("log-uniform lower bound must be positive, got {low}"),
                        });
                    }
                }
                ParameterKind::IntRange { low, high } => {
                    if low > high {
                        return Err(SpaceError::InvalidRange {
                            name: key,
                            message: format!("low {low} > high {high}"),
                        });
                    }
                }
                ParameterKind::Choice { values } => {
                    if values.is_empty() {
                        return Err(SpaceError::EmptyChoice { name: key });
                    }
                }
                ParameterKind::Nested { options } => {
                    if options.is_empty() {
                        return Err(SpaceError::EmptyChoice { name: key });
                    }
                    let mut seen = HashSet::new();
                    for option in options {
                        if option.name.is_empty() {
                            return Err(SpaceError::EmptyName);
                        }
                        if !seen.insert(option.name.as_str()) {
                            return Err(SpaceError::DuplicateOption {
                                name: key.clone(),
                                option: option.name.clone(),
                            });
                        }
                        let nested_prefix = flat_key(Some(&key), &option.name);
                        option.space.validate_level(Some(&nested_prefix), keys)?;
                    }
                }
            }
        }
        Ok(())
    }

    /// Every flattened parameter key with the column type its values take,
    /// in declaration order (depth first).
    pub fn flattened(&self) -> Vec<(String, ColumnKind)> {
        let mut out = Vec::new();
        self.flatten_into(None, &mut out);
        out
    }

    fn flatten_into(&self, prefix: Option<&str>, out: &mut Vec<(String, ColumnKind)>) {
        for param in &self.parameters {
            let key = flat_key(prefix, &param.name);
            match &param.kind {
                ParameterKind::FloatRange { .. } | ParameterKind::LogUniform { .. } => {
                    out.push((key, ColumnKind::Float));
                }
                ParameterKind::IntRange { .. } => out.push((key, ColumnKind::Int)),
                ParameterKind::Choice { .. } => out.push((key, ColumnKind::Text)),
                ParameterKind::Nested { options } => {
                    out.push((key.clone(), ColumnKind::Text));
                    for option in options {
                        let nested_prefix = flat_key(Some(&key), &option.name);
                        option.space.flatten_into(Some(&nested_prefix), out);
                    }
                }
            }
        }
    }
}

impl Default for SearchSpace {
    fn default() -> Self {
        Self::new()
    }
}

/// Join a prefix and a parameter name with [`KEY_SEPARATOR`].
pub fn flat_key(prefix: Option<&str>, name: &str) -> String {
    match prefix {
        Some(prefix) => format!("{prefix}{KEY_SEPARATOR}{name}"),
        None => name.to_string(),
    }
}

fn check_float_range(name: &str, low: f64, high: f64) -> Result<(), SpaceError> {
    if !low.is_finite() || !high.is_finite() {
        return Err(SpaceError::InvalidRange {
            name: name.to_string(),
            message: format!("bounds must be finite, got [{low}, {high}]"),
        });
    }
    if low > high {
        return Err(SpaceError::InvalidRange {
            name: name.to_string(),
            message: format!("low {low} > high {high}"),
        });
    }
    Ok(())
}

/// One concrete assignment of values to the active parameters of a space.
///
/// Created by a sampler and never mutated afterwards.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Configuration {
    pub trial_id: TrialId,
    pub values: BTreeMap<String, ParameterValue>,
    /// Sampler seed and stream that produced these values.
    pub seed: u64,
    pub stream: u64,
}

impl Configuration {
    pub fn new(
        trial_id: TrialId,
        values: BTreeMap<String, ParameterValue>,
        seed: u64,
        stream: u64,
    ) -> Self {
        Self {
            trial_id,
            values,
            seed,
            stream,
        }
    }

    pub fn get(&self, name: &str) -> Option<&ParameterValue> {
        self.values.get(name)
    }

    pub fn require(&self, name: &str) -> Result<&ParameterValue, TrialError> {
        self.values.get(name).ok_or_else(|| TrialError::MissingParameter {
            name: name.to_string(),
        })
    }

    pub fn f64(&self, name: &str) -> Result<f64, TrialError> {
        let value = self.require(name)?;
        value.as_f64().ok_or_else(|| invalid(name, value, "a number"))
    }

    pub fn i64(&self, name: &str) -> Result<i64, TrialError> {
        let value = self.require(name)?;
        value.as_i64().ok_or_else(|| invalid(name, value, "an integer"))
    }

    pub fn str(&self, name: &str) -> Result<&str, TrialError> {
        let value = self.require(name)?;
        value.as_str().ok_or_else(|| invalid(name, value, "a string"))
    }

    /// Canonical text form used for duplicate detection.
    pub fn fingerprint(&self) -> String {
        serde_json::to_string(&self.values).unwrap_or_default()
    }
}

fn invalid(name: &str, value: &ParameterValue, expected: &str) -> TrialError {
    TrialError::InvalidParameter {
        name: name.to_string(),
        message: format!("expected {expected}, got {value}"),
    }
}
