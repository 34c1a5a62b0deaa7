//! Statically declared column lists with semantic types.
//!
//! Every table a stage reads or writes is described by a [`Schema`]. Schemas
//! are checked at the reader boundary (header lookup, numeric parsing) and at
//! the sink boundary (record width, numeric cells).

use crate::error::StageError;
use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;

/// Semantic type of a column.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ColumnType {
    Text,
    Numeric,
}

/// A named, typed column.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Column {
    pub name: String,
    pub ty: ColumnType,
}

impl Column {
    pub fn text(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ty: ColumnType::Text,
        }
    }

    pub fn numeric(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ty: ColumnType::Numeric,
        }
    }
}

/// Ordered column list. Cheap to clone.
#[derive(Clone, Debug, PartialEq, Eq, Default)]
pub struct Schema {
    columns: Arc<Vec<Column>>,
}

impl Schema {
    pub fn new(columns: Vec<Column>) -> Self {
        Self {
            columns: Arc::new(columns),
        }
    }

    /// All-text schema from names.
    pub fn text<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::new(names.into_iter().map(Column::text).collect())
    }

    pub fn columns(&self) -> &[Column] {
        &self.columns
    }

    pub fn len(&self) -> usize {
        self.columns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.columns.iter().map(|c| c.name.as_str())
    }

    pub fn position(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c.name == name)
    }

    /// Like [`position`](Self::position) but a missing column is a `SchemaError`.
    pub fn require(&self, name: &str, source: Option<&Path>) -> Result<usize> {
        self.position(name).ok_or_else(|| {
            StageError::schema(source, format!("required column {name:?} not found")).into()
        })
    }

    /// New schema with `other`'s columns appended.
    pub fn extend(&self, other: &Schema) -> Schema {
        let mut cols = self.columns.as_ref().clone();
        cols.extend(other.columns.iter().cloned());
        Schema::new(cols)
    }

    /// Header row as owned strings.
    pub fn header(&self) -> Vec<String> {
        self.names().map(str::to_string).collect()
    }

    /// Validate one output row against this schema.
    pub fn check_row(&self, cells: &[String]) -> Result<()> {
        if cells.len() != self.len() {
            return Err(StageError::schema(
                None,
                format!(
                    "record has {} cells, schema declares {}",
                    cells.len(),
                    self.len()
                ),
            )
            .into());
        }
        for (col, cell) in self.columns.iter().zip(cells) {
            if col.ty == ColumnType::Numeric && !is_numeric_cell(cell) {
                return Err(StageError::schema(
                    None,
                    format!("column {:?} is numeric but got {:?}", col.name, cell),
                )
                .into());
            }
        }
        Ok(())
    }
}

/// Empty cells are allowed in numeric columns; anything else must parse.
pub fn is_numeric_cell(cell: &str) -> bool {
    cell.is_empty() || cell.trim().parse::<f64>().is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn check_row_rejects_width_and_type() {
        let s = Schema::new(vec![Column::numeric("left_index"), Column::text("name")]);
        assert!(s.check_row(&["1".into(), "x".into()]).is_ok());
        assert!(s.check_row(&["".into(), "x".into()]).is_ok());
        assert!(s.check_row(&["1".into()]).is_err());
        assert!(s.check_row(&["one".into(), "x".into()]).is_err());
    }
}
