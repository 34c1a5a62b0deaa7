//! Broadcast (reference) tables.
//!
//! A [`BroadcastTable`] is a small table fully materialized in memory and
//! keyed by row index. Each pool worker loads its own copy once, at worker
//! start, and only reads it afterwards.

use crate::error::StageError;
use crate::io::reader::{ReadOptions, read_table};
use crate::schema::Schema;
use crate::table::Row;
use anyhow::Result;
use std::collections::HashMap;
use std::path::{Path, PathBuf};

/// Immutable row-index → projected-columns mapping.
#[derive(Clone, Debug, Default)]
pub struct BroadcastTable {
    schema: Schema,
    rows: HashMap<u64, Vec<String>>,
    /// Row indices in file order, for deterministic iteration.
    order: Vec<u64>,
}

impl BroadcastTable {
    /// Build from already-read rows. A repeated index keeps the first row.
    pub fn from_rows(schema: Schema, rows: Vec<Row>) -> Self {
        let mut map = HashMap::with_capacity(rows.len());
        let mut order = Vec::with_capacity(rows.len());
        for row in rows {
            if let std::collections::hash_map::Entry::Vacant(e) = map.entry(row.index) {
                order.push(row.index);
                e.insert(row.values);
            }
        }
        Self {
            schema,
            rows: map,
            order,
        }
    }

    /// Load and fully materialize the table at `path`.
    ///
    /// # Errors
    /// `IOError`/`SchemaError` as for [`ChunkedReader::open`](crate::io::ChunkedReader::open).
    pub fn load(path: impl AsRef<Path>, opts: ReadOptions) -> Result<Self> {
        let (schema, rows) = read_table(path, opts)?;
        Ok(Self::from_rows(schema, rows))
    }

    pub fn schema(&self) -> &Schema {
        &self.schema
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Projected values for `index`.
    pub fn get(&self, index: u64) -> Option<&[String]> {
        self.rows.get(&index).map(Vec::as_slice)
    }

    /// One cell, or `None` if the row or column is absent.
    pub fn value(&self, index: u64, column: &str) -> Option<&str> {
        let col = self.schema.position(column)?;
        self.rows.get(&index).map(|r| r[col].as_str())
    }

    /// `(index, values)` pairs in file order.
    pub fn iter(&self) -> impl Iterator<Item = (u64, &[String])> {
        self.order
            .iter()
            .map(move |i| (*i, self.rows[i].as_slice()))
    }
}

/// Where a stage's broadcast table comes from.
#[derive(Clone, Debug)]
pub struct BroadcastSpec {
    pub path: PathBuf,
    pub options: ReadOptions,
    /// Size budget in bytes for the file on disk. Checked before the stage
    /// starts; it is a coarse proxy for the in-memory footprint.
    pub max_bytes: Option<u64>,
}

impl BroadcastSpec {
    pub fn new(path: impl Into<PathBuf>, options: ReadOptions) -> Self {
        Self {
            path: path.into(),
            options,
            max_bytes: None,
        }
    }

    pub fn with_max_bytes(mut self, max_bytes: Option<u64>) -> Self {
        self.max_bytes = max_bytes;
        self
    }

    /// Reject a reference table over budget before any processing begins.
    ///
    /// # Errors
    /// `IOError` if the file cannot be inspected, `CapacityExceeded` if it is
    /// larger than `max_bytes`.
    pub fn check_capacity(&self) -> Result<()> {
        let Some(budget) = self.max_bytes else {
            return Ok(());
        };
        let size = std::fs::metadata(&self.path)
            .map_err(|e| StageError::io(&self.path, e))?
            .len();
        if size > budget {
            return Err(StageError::CapacityExceeded {
                path: self.path.clone(),
                size,
                budget,
            }
            .into());
        }
        Ok(())
    }

    pub fn load(&self) -> Result<BroadcastTable> {
        BroadcastTable::load(&self.path, self.options.clone())
    }
}
