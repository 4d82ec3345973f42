use am_types::{AmError, AmResult, ColumnData, ResultsTable};
use arrow::array::{ArrayRef, Float64Array, Int64Array, StringArray};
use arrow::datatypes::{DataType, Field, Schema};
use arrow::record_batch::RecordBatch;
use parquet::arrow::ArrowWriter;
use parquet::file::properties::WriterProperties;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::info;

use crate::features::FeatureMethod;

/// Result artifacts of an experiment, one file per dataset, method and
/// outer fold.
#[derive(Debug, Clone)]
pub struct ResultStore {
    pub root: PathBuf,
}

impl ResultStore {
    pub fn new<P: AsRef<Path>>(root: P) -> AmResult<Self> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    pub fn artifact_name(dataset: &str, method: FeatureMethod, fold: usize) -> String {
        format!("results_{dataset}_{method}_fold_{fold}.parquet")
    }

    pub fn artifact_path(&self, dataset: &str, method: FeatureMethod, fold: usize) -> PathBuf {
        self.root.join(Self::artifact_name(dataset, method, fold))
    }

    pub fn exists(&self, dataset: &str, method: FeatureMethod, fold: usize) -> bool {
        self.artifact_path(dataset, method, fold).is_file()
    }

    /// Write `table` as the Parquet artifact, replacing any previous one.
    pub fn save(
        &self,
        table: &ResultsTable,
        dataset: &str,
        method: FeatureMethod,
        fold: usize,
    ) -> AmResult<PathBuf> {
        let path = self.artifact_path(dataset, method, fold);
        write_parquet(table, &path)?;
        info!(
            path = %path.display(),
            rows = table.n_rows(),
            columns = table.n_cols(),
            "Saved results table"
        );
        Ok(path)
    }

    /// CSV copy next to the Parquet artifact, for quick inspection.
    pub fn save_csv(
        &self,
        table: &ResultsTable,
        dataset: &str,
        method: FeatureMethod,
        fold: usize,
    ) -> AmResult<PathBuf> {
        let path = self
            .artifact_path(dataset, method, fold)
            .with_extension("csv");
        write_csv(table, &path)?;
        Ok(path)
    }
}

fn arrow_error(e: arrow::error::ArrowError) -> AmError {
    AmError::Arrow(e.to_string())
}

fn parquet_error(e: parquet::errors::ParquetError) -> AmError {
    AmError::Parquet(e.to_string())
}

/// Convert a results table to a single Arrow record batch. Every column is
/// nullable.
pub fn table_to_record_batch(table: &ResultsTable) -> AmResult<RecordBatch> {
    let mut fields = Vec::with_capacity(table.n_cols());
    let mut arrays: Vec<ArrayRef> = Vec::with_capacity(table.n_cols());
    for column in table.columns() {
        let (data_type, array): (DataType, ArrayRef) = match &column.data {
            ColumnData::Int(values) => (DataType::Int64, Arc::new(Int64Array::from(values.clone()))),
            ColumnData::Float(values) => {
                (DataType::Float64, Arc::new(Float64Array::from(values.clone())))
            }
            ColumnData::Text(values) => {
                (DataType::Utf8, Arc::new(StringArray::from(values.clone())))
            }
        };
        fields.push(Field::new(column.name.as_str(), data_type, true));
        arrays.push(array);
    }

    let schema = Arc::new(Schema::new(fields));
    if arrays.is_empty() {
        return Ok(RecordBatch::new_empty(schema));
    }
    RecordBatch::try_new(schema, arrays).map_err(arrow_error)
}

pub fn write_parquet(table: &ResultsTable, path: &Path) -> AmResult<()> {
    let batch = table_to_record_batch(table)?;
    let file = fs::File::create(path)?;
    let props = WriterProperties::builder().build();
    let mut writer = ArrowWriter::try_new(file, batch.schema(), Some(props)).map_err(parquet_error)?;
    writer.write(&batch).map_err(parquet_error)?;
    writer.close().map_err(parquet_error)?;
    Ok(())
}

pub fn write_csv(table: &ResultsTable, path: &Path) -> AmResult<()> {
    let csv_error = |e: csv::Error| AmError::Csv(e.to_string());
    let mut writer = csv::Writer::from_path(path).map_err(csv_error)?;
    writer.write_record(table.column_names()).map_err(csv_error)?;
    for row in 0..table.n_rows() {
        writer
            .write_record(table.columns().iter().map(|c| c.data.cell_text(row)))
            .map_err(csv_error)?;
    }
    writer.flush()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use arrow::array::Array;
    use parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder;

    fn table() -> ResultsTable {
        let mut table = ResultsTable::new();
        table
            .push_column("trial_id", ColumnData::Int(vec![Some(0), Some(1)]))
            .unwrap();
        table
            .push_column("score", ColumnData::Float(vec![Some(0.75), None]))
            .unwrap();
        table
            .push_column(
                "status",
                ColumnData::Text(vec![Some("completed".into()), Some("failed".into())]),
            )
            .unwrap();
        table
    }

    #[test]
    fn artifact_names_follow_the_experiment_layout() {
        assert_eq!(
            ResultStore::artifact_name("credit", FeatureMethod::Autofeat, 3),
            "results_credit_autofeat_fold_3.parquet"
        );
    }

    #[test]
    fn parquet_artifact_reads_back() {
        let dir = tempfile::tempdir().unwrap();
        let store = ResultStore::new(dir.path().join("results")).unwrap();
        assert!(!store.exists("credit", FeatureMethod::Original, 0));

        let path = store.save(&table(), "credit", FeatureMethod::Original, 0).unwrap();
        assert!(store.exists("credit", FeatureMethod::Original, 0));

        let file = fs::File::open(path).unwrap();
        let reader = ParquetRecordBatchReaderBuilder::try_new(file)
            .unwrap()
            .build()
            .unwrap();
        let batches: Vec<RecordBatch> = reader.map(|b| b.unwrap()).collect();
        assert_eq!(batches.len(), 1);
        let batch = &batches[0];
        assert_eq!(batch.num_rows(), 2);
        assert_eq!(batch.schema().field(2).name(), "status");

        let scores = batch
            .column(1)
            .as_any()
            .downcast_ref::<Float64Array>()
            .unwrap();
        assert_eq!(scores.value(0), 0.75);
        assert!(scores.is_null(1));
    }

    #[test]
    fn csv_copy_renders_nulls_empty() {
        let dir = tempfile::tempdir().unwrap();
        let store = ResultStore::new(dir.path()).unwrap();
        let path = store.save_csv(&table(), "credit", FeatureMethod::Original, 1).unwrap();
        assert!(path.to_string_lossy().ends_with("results_credit_original_fold_1.csv"));
        let text = fs::read_to_string(path).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines[0], "trial_id,score,status");
        assert_eq!(lines[2], "1,,failed");
    }
}
