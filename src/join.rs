//! Row join/decorate stage.
//!
//! A [`Decorator`] augments each row of a chunk with columns looked up from
//! in-memory tables by a foreign row-index column. Lookups are left joins: a
//! key that is missing from the table (or not a valid row index) yields
//! empty-string values, and the row is kept.

use crate::broadcast::BroadcastTable;
use crate::error::StageError;
use crate::schema::Schema;
use crate::table::{Chunk, Row, parse_index};
use anyhow::Result;
use std::sync::Arc;

/// One lookup: `key_column` in the chunk references rows of `table`.
#[derive(Clone, Debug)]
pub struct JoinSpec {
    pub key_column: String,
    pub table: Arc<BroadcastTable>,
}

/// Ordered set of left joins applied to every chunk before dispatch.
#[derive(Clone, Debug, Default)]
pub struct Decorator {
    joins: Vec<JoinSpec>,
}

impl Decorator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a lookup of `table` by the chunk's `key_column`.
    pub fn join(mut self, key_column: impl Into<String>, table: Arc<BroadcastTable>) -> Self {
        self.joins.push(JoinSpec {
            key_column: key_column.into(),
            table,
        });
        self
    }

    pub fn joins(&self) -> &[JoinSpec] {
        &self.joins
    }

    /// Schema of decorated chunks: the input columns, then each table's
    /// columns in join order.
    ///
    /// # Errors
    /// `SchemaError` if a key column is missing or a looked-up column name
    /// collides with an existing one.
    pub fn output_schema(&self, input: &Schema) -> Result<Schema> {
        let mut out = input.clone();
        for j in &self.joins {
            input.require(&j.key_column, None)?;
            for name in j.table.schema().names() {
                if out.position(name).is_some() {
                    return Err(StageError::schema(
                        None,
                        format!("joined column {name:?} already present in chunk"),
                    )
                    .into());
                }
            }
            out = out.extend(j.table.schema());
        }
        Ok(out)
    }

    /// Decorate every row of `chunk`. The result has exactly as many rows as
    /// the input, in the same order.
    pub fn decorate(&self, chunk: Chunk) -> Result<Chunk> {
        let schema = self.output_schema(&chunk.schema)?;
        let keys: Vec<usize> = self
            .joins
            .iter()
            .map(|j| chunk.column(&j.key_column))
            .collect::<Result<_>>()?;

        let Chunk { id, rows, .. } = chunk;
        let rows = rows
            .into_iter()
            .map(|row| {
                let Row { index, mut values } = row;
                values.reserve(schema.len() - values.len());
                for (j, &key_col) in self.joins.iter().zip(&keys) {
                    let found = parse_index(&values[key_col])
                        .ok()
                        .and_then(|k| j.table.get(k));
                    match found {
                        Some(cells) => values.extend(cells.iter().cloned()),
                        None => values.extend(
                            std::iter::repeat_n(String::new(), j.table.schema().len()),
                        ),
                    }
                }
                Row::new(index, values)
            })
            .collect();
        Ok(Chunk::new(id, schema, rows))
    }
}

/// Single left join of `chunk` against `table` by `key_column`.
pub fn left_join(chunk: Chunk, key_column: &str, table: Arc<BroadcastTable>) -> Result<Chunk> {
    Decorator::new().join(key_column, table).decorate(chunk)
}
