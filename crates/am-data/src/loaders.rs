use am_types::{AmResult, DataError, FeatureKind, FeatureMatrix, LabeledSplit};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use crate::synthetic::{make_classification, SyntheticSpec};

/// Cell texts treated as missing values, compared case-insensitively.
const MISSING_TOKENS: &[&str] = &["", "?", "na", "nan", "null"];

fn is_missing(cell: &str) -> bool {
    let cell = cell.trim();
    MISSING_TOKENS.iter().any(|t| cell.eq_ignore_ascii_case(t))
}

/// A fully materialized classification dataset.
#[derive(Debug, Clone, PartialEq)]
pub struct Dataset {
    pub name: String,
    pub features: FeatureMatrix,
    pub labels: Vec<usize>,
    /// Original label text per class index.
    pub class_names: Vec<String>,
}

impl Dataset {
    pub fn n_rows(&self) -> usize {
        self.labels.len()
    }

    pub fn n_classes(&self) -> usize {
        self.class_names.len()
    }

    pub fn split(&self) -> AmResult<LabeledSplit> {
        Ok(LabeledSplit::new(self.features.clone(), self.labels.clone())?)
    }
}

/// Where an experiment's dataset comes from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "source", rename_all = "snake_case")]
pub enum DatasetSource {
    Csv {
        name: String,
        path: PathBuf,
        target: String,
    },
    Synthetic {
        name: String,
        #[serde(flatten)]
        spec: SyntheticSpec,
    },
}

impl DatasetSource {
    pub fn name(&self) -> &str {
        match self {
            Self::Csv { name, .. } | Self::Synthetic { name, .. } => name,
        }
    }

    pub fn load(&self) -> AmResult<Dataset> {
        match self {
            Self::Csv { name, path, target } => {
                let mut dataset = load_csv(path, target)?;
                dataset.name = name.clone();
                Ok(dataset)
            }
            Self::Synthetic { name, spec } => {
                let mut dataset = make_classification(spec)?;
                dataset.name = name.clone();
                Ok(dataset)
            }
        }
    }
}

/// Parsed CSV contents before the target is separated out.
struct CsvTable {
    headers: Vec<String>,
    records: Vec<Vec<String>>,
}

fn read_csv_table(path: &Path) -> AmResult<CsvTable> {
    if !path.exists() {
        return Err(DataError::NotFound(path.display().to_string()).into());
    }

    let mut reader = csv::ReaderBuilder::new()
        .has_headers(true)
        .trim(csv::Trim::All)
        .from_path(path)
        .map_err(|e| DataError::LoadingFailed {
            message: format!("Failed to open CSV file {}: {}", path.display(), e),
        })?;

    let headers: Vec<String> = reader
        .headers()
        .map_err(|e| DataError::LoadingFailed {
            message: format!("Failed to read CSV headers: {}", e),
        })?
        .iter()
        .map(str::to_string)
        .collect();

    let mut records = Vec::new();
    for (line, result) in reader.records().enumerate() {
        let record = result.map_err(|e| DataError::LoadingFailed {
            message: format!("Failed to read CSV record at line {}: {}", line + 2, e),
        })?;
        records.push(record.iter().map(str::to_string).collect());
    }
    Ok(CsvTable { headers, records })
}

/// Infer a column's kind and encode it. Columns where every present cell
/// parses as a number are numeric; all others become category codes in
/// sorted order of their distinct texts.
fn encode_column(cells: &[&str]) -> (FeatureKind, Vec<f64>) {
    let numeric: Option<Vec<f64>> = cells
        .iter()
        .map(|c| {
            if is_missing(c) {
                Some(f64::NAN)
            } else {
                c.trim().parse::<f64>().ok().filter(|v| v.is_finite())
            }
        })
        .collect();
    if let Some(values) = numeric {
        return (FeatureKind::Numeric, values);
    }

    let levels: BTreeSet<&str> = cells.iter().copied().filter(|c| !is_missing(c)).collect();
    let codes: BTreeMap<&str, f64> = levels
        .into_iter()
        .enumerate()
        .map(|(i, level)| (level, i as f64))
        .collect();
    let values = cells
        .iter()
        .map(|c| codes.get(c).copied().unwrap_or(f64::NAN))
        .collect();
    (FeatureKind::Categorical, values)
}

fn build_matrix(headers: Vec<String>, columns: Vec<Vec<&str>>, n_rows: usize) -> AmResult<FeatureMatrix> {
    let mut kinds = Vec::with_capacity(columns.len());
    let mut rows = vec![Vec::with_capacity(columns.len()); n_rows];
    for cells in &columns {
        let (kind, values) = encode_column(cells);
        kinds.push(kind);
        for (row, value) in rows.iter_mut().zip(values) {
            row.push(value);
        }
    }
    Ok(FeatureMatrix::new(headers, kinds, rows)?)
}

/// Load a labeled dataset from a CSV file with a header row.
///
/// Labels are indexed in sorted order of their text; rows with a missing
/// label are rejected.
pub fn load_csv(path: impl AsRef<Path>, target: &str) -> AmResult<Dataset> {
    let path = path.as_ref();
    info!(path = %path.display(), target, "Loading CSV dataset");
    let table = read_csv_table(path)?;

    let target_index = table
        .headers
        .iter()
        .position(|h| h == target)
        .ok_or_else(|| DataError::ColumnNotFound {
            column: target.to_string(),
        })?;

    let mut label_texts = Vec::with_capacity(table.records.len());
    for (i, record) in table.records.iter().enumerate() {
        let label = record[target_index].as_str();
        if is_missing(label) {
            return Err(DataError::InvalidFormat {
                message: format!("row {} has no value for target {target}", i + 2),
            }
            .into());
        }
        label_texts.push(label);
    }
    let class_names: Vec<String> = label_texts
        .iter()
        .copied()
        .collect::<BTreeSet<_>>()
        .into_iter()
        .map(str::to_string)
        .collect();
    if class_names.len() < 2 {
        return Err(DataError::InsufficientData {
            message: format!("target {target} has {} distinct classes", class_names.len()),
        }
        .into());
    }
    let labels = label_texts
        .iter()
        .map(|t| class_names.iter().position(|c| c == t).unwrap_or(0))
        .collect();

    let feature_indices: Vec<usize> = (0..table.headers.len()).filter(|&j| j != target_index).collect();
    let headers = feature_indices.iter().map(|&j| table.headers[j].clone()).collect();
    let columns = feature_indices
        .iter()
        .map(|&j| table.records.iter().map(|r| r[j].as_str()).collect())
        .collect();
    let features = build_matrix(headers, columns, table.records.len())?;

    debug!(
        rows = features.n_rows(),
        columns = features.n_cols(),
        classes = class_names.len(),
        "Loaded CSV dataset"
    );
    Ok(Dataset {
        name: path
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or("dataset")
            .to_string(),
        features,
        labels,
        class_names,
    })
}

/// Load an unlabeled feature matrix, as written back by feature providers.
pub fn load_feature_csv(path: impl AsRef<Path>) -> AmResult<FeatureMatrix> {
    let table = read_csv_table(path.as_ref())?;
    let columns = (0..table.headers.len())
        .map(|j| table.records.iter().map(|r| r[j].as_str()).collect())
        .collect();
    let n_rows = table.records.len();
    build_matrix(table.headers, columns, n_rows)
}

/// Write a feature matrix as CSV; missing cells are left empty.
pub fn write_feature_csv(features: &FeatureMatrix, path: impl AsRef<Path>) -> AmResult<()> {
    let path = path.as_ref();
    let mut writer = csv::Writer::from_path(path).map_err(|e| DataError::LoadingFailed {
        message: format!("Failed to create CSV file {}: {}", path.display(), e),
    })?;
    let csv_error = |e: csv::Error| am_types::AmError::Csv(e.to_string());

    writer.write_record(features.column_names()).map_err(csv_error)?;
    for row in features.rows() {
        writer
            .write_record(row.iter().map(|v| if v.is_finite() { v.to_string() } else { String::new() }))
            .map_err(csv_error)?;
    }
    writer.flush()?;
    Ok(())
}
