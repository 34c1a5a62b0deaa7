//! Rows, chunks, and output records.

use crate::schema::Schema;
use anyhow::Result;

/// One input row. `index` is its stable row index in the source table.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Row {
    pub index: u64,
    /// Cell values in schema order. Missing values are `""`.
    pub values: Vec<String>,
}

impl Row {
    pub fn new(index: u64, values: Vec<String>) -> Self {
        Self { index, values }
    }
}

/// A bounded batch of rows sharing one schema; the unit of parallel work.
#[derive(Clone, Debug)]
pub struct Chunk {
    /// Sequence number of this chunk within its stage, starting at 0.
    pub id: u64,
    pub schema: Schema,
    pub rows: Vec<Row>,
}

impl Chunk {
    pub fn new(id: u64, schema: Schema, rows: Vec<Row>) -> Self {
        Self { id, schema, rows }
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Smallest and largest row index in the chunk.
    pub fn index_range(&self) -> Option<(u64, u64)> {
        let first = self.rows.iter().map(|r| r.index).min()?;
        let last = self.rows.iter().map(|r| r.index).max()?;
        Some((first, last))
    }

    /// Position of `name` in this chunk's schema (`SchemaError` if absent).
    pub fn column(&self, name: &str) -> Result<usize> {
        self.schema.require(name, None)
    }

    /// Parse a cell as a row index (used for foreign-key columns).
    pub fn index_at(&self, row: usize, col: usize) -> Result<u64> {
        parse_index(&self.rows[row].values[col])
    }
}

/// One output row. The stage's output schema declares which leading cells
/// hold the originating row index or indices.
#[derive(Clone, Debug, PartialEq)]
pub struct OutputRecord {
    pub cells: Vec<String>,
}

impl OutputRecord {
    pub fn new(cells: Vec<String>) -> Self {
        Self { cells }
    }

    /// Record keyed by one or more source row indices, followed by `rest`.
    pub fn keyed(keys: &[u64], rest: impl IntoIterator<Item = String>) -> Self {
        let mut cells: Vec<String> = keys.iter().map(u64::to_string).collect();
        cells.extend(rest);
        Self { cells }
    }
}

/// Parse a row index cell. Accepts `"12"` and the float spelling `"12.0"`
/// that numeric round-trips through other tools tend to produce.
pub fn parse_index(cell: &str) -> Result<u64> {
    let cell = cell.trim();
    if let Ok(v) = cell.parse::<u64>() {
        return Ok(v);
    }
    match cell.parse::<f64>() {
        Ok(f) if f >= 0.0 && f.fract() == 0.0 && f <= u64::MAX as f64 => Ok(f as u64),
        _ => Err(anyhow::anyhow!("not a row index: {cell:?}")),
    }
}

/// Format a score cell.
pub fn format_score(v: f64) -> String {
    if v == 0.0 {
        "0.0".to_string()
    } else {
        format!("{v}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_index_variants() {
        assert_eq!(parse_index("7").unwrap(), 7);
        assert_eq!(parse_index(" 7.0 ").unwrap(), 7);
        assert!(parse_index("-1").is_err());
        assert!(parse_index("7.5").is_err());
        assert!(parse_index("").is_err());
    }

    #[test]
    fn index_range_spans_min_max() {
        let c = Chunk::new(
            0,
            Schema::text(["a"]),
            vec![Row::new(5, vec!["x".into()]), Row::new(3, vec!["y".into()])],
        );
        assert_eq!(c.index_range(), Some((3, 5)));
        assert_eq!(Chunk::new(1, Schema::default(), vec![]).index_range(), None);
    }
}
