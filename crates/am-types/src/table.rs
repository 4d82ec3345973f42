//! Flat, column-typed results table.

use serde::{Deserialize, Serialize};

use crate::errors::AmError;

/// Value type of a table column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ColumnKind {
    Int,
    Float,
    Text,
}

/// Column storage. `None` marks a null cell.
#[derive(Debug, Clone, PartialEq)]
pub enum ColumnData {
    Int(Vec<Option<i64>>),
    Float(Vec<Option<f64>>),
    Text(Vec<Option<String>>),
}

impl ColumnData {
    pub fn empty(kind: ColumnKind) -> Self {
        match kind {
            ColumnKind::Int => Self::Int(Vec::new()),
            ColumnKind::Float => Self::Float(Vec::new()),
            ColumnKind::Text => Self::Text(Vec::new()),
        }
    }

    pub fn kind(&self) -> ColumnKind {
        match self {
            Self::Int(_) => ColumnKind::Int,
            Self::Float(_) => ColumnKind::Float,
            Self::Text(_) => ColumnKind::Text,
        }
    }

    pub fn len(&self) -> usize {
        match self {
            Self::Int(v) => v.len(),
            Self::Float(v) => v.len(),
            Self::Text(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Cell rendered as text; nulls render as an empty string.
    pub fn cell_text(&self, row: usize) -> String {
        match self {
            Self::Int(v) => v.get(row).copied().flatten().map(|x| x.to_string()),
            Self::Float(v) => v.get(row).copied().flatten().map(|x| x.to_string()),
            Self::Text(v) => v.get(row).cloned().flatten(),
        }
        .unwrap_or_default()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Column {
    pub name: String,
    pub data: ColumnData,
}

/// Row-per-trial table with one typed column per field.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ResultsTable {
    columns: Vec<Column>,
}

impl ResultsTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a column; every column must have the same number of rows.
    pub fn push_column(&mut self, name: impl Into<String>, data: ColumnData) -> Result<(), AmError> {
        let name = name.into();
        if let Some(first) = self.columns.first() {
            if first.data.len() != data.len() {
                return Err(AmError::Validation(format!(
                    "column {name} has {} rows, table has {}",
                    data.len(),
                    first.data.len()
                )));
            }
        }
        if self.column(&name).is_some() {
            return Err(AmError::Validation(format!("duplicate column {name}")));
        }
        self.columns.push(Column { name, data });
        Ok(())
    }

    pub fn columns(&self) -> &[Column] {
        &self.columns
    }

    pub fn column(&self, name: &str) -> Option<&ColumnData> {
        self.columns.iter().find(|c| c.name == name).map(|c| &c.data)
    }

    pub fn column_names(&self) -> Vec<&str> {
        self.columns.iter().map(|c| c.name.as_str()).collect()
    }

    pub fn n_rows(&self) -> usize {
        self.columns.first().map(|c| c.data.len()).unwrap_or(0)
    }

    pub fn n_cols(&self) -> usize {
        self.columns.len()
    }
}
