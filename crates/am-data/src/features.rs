//! Feature-engineering providers, applied to an outer fold before tuning.

use am_types::{config_error, AmResult, DataError, FeatureKind, FeatureMatrix, LabeledSplit};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::process::Command;
use tracing::{debug, info};

use crate::loaders::{load_feature_csv, write_feature_csv};

/// Label column appended to the training CSV handed to external providers.
pub const TARGET_COLUMN: &str = "__target__";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FeatureMethod {
    Original,
    Autofeat,
    AutoGluon,
    H2O,
    OpenFE,
    Fetch,
}

impl FeatureMethod {
    pub const ALL: [FeatureMethod; 6] = [
        Self::Original,
        Self::Autofeat,
        Self::AutoGluon,
        Self::H2O,
        Self::OpenFE,
        Self::Fetch,
    ];

    /// Name used in artifact file names and provider invocations.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Original => "original",
            Self::Autofeat => "autofeat",
            Self::AutoGluon => "autogluon",
            Self::H2O => "h2o",
            Self::OpenFE => "openfe",
            Self::Fetch => "fetch",
        }
    }
}

impl fmt::Display for FeatureMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Transforms the train and test features of one outer fold. Labels pass
/// through unchanged; both outputs must share one schema.
pub trait FeatureProvider: Send + Sync + fmt::Debug {
    fn method(&self) -> FeatureMethod;

    fn transform(
        &self,
        train: &LabeledSplit,
        test: &LabeledSplit,
        seed: u64,
    ) -> AmResult<(LabeledSplit, LabeledSplit)>;
}

/// Leaves features untouched.
#[derive(Debug, Clone, Copy, Default)]
pub struct Identity;

impl FeatureProvider for Identity {
    fn method(&self) -> FeatureMethod {
        FeatureMethod::Original
    }

    fn transform(
        &self,
        train: &LabeledSplit,
        test: &LabeledSplit,
        _seed: u64,
    ) -> AmResult<(LabeledSplit, LabeledSplit)> {
        Ok((train.clone(), test.clone()))
    }
}

/// Runs a feature-engineering tool as a child process.
///
/// Invocation: `<program> <args..> <method> <train_in> <test_in> <train_out>
/// <test_out>`. `train_in` carries the labels in a [`TARGET_COLUMN`] column;
/// the outputs hold features only, one row per input row. `AM_SEED` carries
/// the fold seed.
#[derive(Debug, Clone)]
pub struct ExternalProvider {
    method: FeatureMethod,
    program: PathBuf,
    args: Vec<String>,
}

impl ExternalProvider {
    pub fn new(method: FeatureMethod, program: impl Into<PathBuf>) -> Self {
        Self {
            method,
            program: program.into(),
            args: Vec::new(),
        }
    }

    pub fn with_arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    fn failed(&self, message: impl Into<String>) -> DataError {
        DataError::ProviderFailed {
            method: self.method.to_string(),
            message: message.into(),
        }
    }

    fn read_output(&self, path: &Path, expected_rows: usize) -> AmResult<FeatureMatrix> {
        if !path.exists() {
            return Err(self.failed(format!("no output written to {}", path.display())).into());
        }
        let features = load_feature_csv(path)?;
        if features.n_rows() != expected_rows {
            return Err(self
                .failed(format!(
                    "{} returned {} rows, expected {expected_rows}",
                    path.display(),
                    features.n_rows()
                ))
                .into());
        }
        Ok(features)
    }
}

fn with_target(split: &LabeledSplit) -> AmResult<FeatureMatrix> {
    let mut columns = split.features.column_names().to_vec();
    columns.push(TARGET_COLUMN.to_string());
    let mut kinds = split.features.kinds().to_vec();
    kinds.push(FeatureKind::Categorical);
    let rows = split
        .features
        .rows()
        .iter()
        .zip(&split.labels)
        .map(|(row, &label)| {
            let mut row = row.clone();
            row.push(label as f64);
            row
        })
        .collect();
    Ok(FeatureMatrix::new(columns, kinds, rows)?)
}

impl FeatureProvider for ExternalProvider {
    fn method(&self) -> FeatureMethod {
        self.method
    }

    fn transform(
        &self,
        train: &LabeledSplit,
        test: &LabeledSplit,
        seed: u64,
    ) -> AmResult<(LabeledSplit, LabeledSplit)> {
        let workdir = tempfile::Builder::new().prefix("am-features-").tempdir()?;
        let train_in = workdir.path().join("train_in.csv");
        let test_in = workdir.path().join("test_in.csv");
        let train_out = workdir.path().join("train_out.csv");
        let test_out = workdir.path().join("test_out.csv");
        write_feature_csv(&with_target(train)?, &train_in)?;
        write_feature_csv(&test.features, &test_in)?;

        info!(
            method = %self.method,
            program = %self.program.display(),
            train_rows = train.len(),
            test_rows = test.len(),
            "Running feature provider"
        );
        let output = Command::new(&self.program)
            .args(&self.args)
            .arg(self.method.as_str())
            .arg(&train_in)
            .arg(&test_in)
            .arg(&train_out)
            .arg(&test_out)
            .env("AM_SEED", seed.to_string())
            .output()
            .map_err(|e| self.failed(format!("failed to start {}: {e}", self.program.display())))?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(self
                .failed(format!("exited with {}: {}", output.status, stderr.trim()))
                .into());
        }

        let train_features = self.read_output(&train_out, train.len())?;
        let test_features = self.read_output(&test_out, test.len())?;
        if train_features.column_names() != test_features.column_names() {
            return Err(self.failed("train and test outputs have different columns").into());
        }
        debug!(
            method = %self.method,
            columns = train_features.n_cols(),
            "Feature provider finished"
        );

        Ok((
            LabeledSplit::new(train_features, train.labels.clone())?,
            LabeledSplit::new(test_features, test.labels.clone())?,
        ))
    }
}

/// Provider for `method`. Every method but `Original` needs an external
/// command.
pub fn provider_for(
    method: FeatureMethod,
    command: Option<&Path>,
) -> AmResult<Box<dyn FeatureProvider>> {
    match (method, command) {
        (FeatureMethod::Original, _) => Ok(Box::new(Identity)),
        (method, Some(command)) => Ok(Box::new(ExternalProvider::new(method, command))),
        (method, None) => Err(config_error!(
            "feature method {method} requires a provider command"
        )),
    }
}
