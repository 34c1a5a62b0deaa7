//! Chunked table reader.
//!
//! [`ChunkedReader`] streams a delimited file with a header row into
//! fixed-size [`Chunk`]s. It is lazy and single-pass: only the current chunk
//! is held in memory.
//!
//! # Design notes
//! - Columns needed by the row predicate are read even when they are not
//!   projected, then dropped before the chunk is yielded.
//! - Chunk size counts rows that *survive* the predicate, so every chunk but
//!   the last has exactly `chunk_size` rows.
//! - The row limit counts rows read from the file, before the predicate.
//! - Rows whose width differs from the header are a `SchemaError`.

use crate::error::StageError;
use crate::io::compression::{TableRead, open_table};
use crate::schema::{Column, ColumnType, Schema, is_numeric_cell};
use crate::table::{Chunk, Row, parse_index};
use anyhow::Result;
use csv::{ErrorKind, StringRecord};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Where a row's index comes from.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum IndexColumn {
    /// The first column holds the integer row index.
    #[default]
    Leading,
    /// The 0-based position of the data row in the file.
    Ordinal,
}

type Predicate = dyn Fn(&RowView<'_>) -> bool + Send + Sync;

/// Row predicate over a declared set of columns.
#[derive(Clone)]
pub struct RowFilter {
    columns: Vec<String>,
    predicate: Arc<Predicate>,
}

impl RowFilter {
    /// Keep rows for which `predicate` returns `true`. Only `columns` are
    /// visible through the [`RowView`].
    pub fn new<I, S, F>(columns: I, predicate: F) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
        F: Fn(&RowView<'_>) -> bool + Send + Sync + 'static,
    {
        Self {
            columns: columns.into_iter().map(Into::into).collect(),
            predicate: Arc::new(predicate),
        }
    }

    /// Keep rows whose `column` equals `value` exactly.
    pub fn equals(column: impl Into<String>, value: impl Into<String>) -> Self {
        let column = column.into();
        let value = value.into();
        let key = column.clone();
        Self::new([column], move |row| row.get(&key) == value)
    }

    pub fn columns(&self) -> &[String] {
        &self.columns
    }
}

impl std::fmt::Debug for RowFilter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RowFilter")
            .field("columns", &self.columns)
            .finish_non_exhaustive()
    }
}

/// Read-only view of the predicate's columns for one raw row.
pub struct RowView<'a> {
    record: &'a StringRecord,
    positions: &'a HashMap<String, usize>,
}

impl RowView<'_> {
    /// Cell value, or `""` for columns the filter did not declare.
    pub fn get(&self, name: &str) -> &str {
        self.positions
            .get(name)
            .and_then(|&i| self.record.get(i))
            .unwrap_or("")
    }
}

/// Reader configuration.
#[derive(Clone, Debug)]
pub struct ReadOptions {
    pub index: IndexColumn,
    /// Columns to keep, in order. `None` keeps every non-index column.
    pub columns: Option<Vec<String>>,
    /// Columns that must hold numbers (or be empty).
    pub numeric: Vec<String>,
    /// Stop after this many data rows have been read.
    pub limit: Option<u64>,
    pub filter: Option<RowFilter>,
    pub delimiter: u8,
}

impl Default for ReadOptions {
    fn default() -> Self {
        Self {
            index: IndexColumn::Leading,
            columns: None,
            numeric: Vec::new(),
            limit: None,
            filter: None,
            delimiter: b',',
        }
    }
}

impl ReadOptions {
    pub fn with_index(mut self, index: IndexColumn) -> Self {
        self.index = index;
        self
    }

    pub fn with_columns<I, S>(mut self, columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.columns = Some(columns.into_iter().map(Into::into).collect());
        self
    }

    pub fn with_numeric<I, S>(mut self, columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.numeric = columns.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_limit(mut self, limit: Option<u64>) -> Self {
        self.limit = limit;
        self
    }

    pub fn with_filter(mut self, filter: RowFilter) -> Self {
        self.filter = Some(filter);
        self
    }

    pub fn with_delimiter(mut self, delimiter: u8) -> Self {
        self.delimiter = delimiter;
        self
    }
}

/// Lazy, single-pass chunk stream over one file.
pub struct ChunkedReader {
    path: PathBuf,
    rdr: csv::Reader<TableRead>,
    schema: Schema,
    index: IndexColumn,
    /// Raw positions of the projected columns, in output order.
    projection: Vec<usize>,
    /// Output positions whose cells must be numeric.
    numeric: Vec<usize>,
    filter: Option<RowFilter>,
    filter_positions: HashMap<String, usize>,
    chunk_size: usize,
    limit: Option<u64>,
    rows_read: u64,
    next_chunk: u64,
    record: StringRecord,
    done: bool,
}

impl ChunkedReader {
    /// Open `path` and resolve the header against `opts`.
    ///
    /// # Errors
    /// `IOError` if the file cannot be opened or read; `SchemaError` if the
    /// header is missing or a projected, filtered, or numeric column is absent.
    pub fn open(path: impl AsRef<Path>, chunk_size: usize, opts: ReadOptions) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if chunk_size == 0 {
            return Err(StageError::config("chunk_size must be at least 1").into());
        }
        let source = open_table(&path)?;
        let mut rdr = csv::ReaderBuilder::new()
            .has_headers(true)
            .flexible(false)
            .delimiter(opts.delimiter)
            .from_reader(source);
        let header = rdr
            .headers()
            .map_err(|e| classify_csv(&path, e))?
            .clone();
        if header.is_empty() {
            return Err(StageError::schema(Some(&path), "missing header row").into());
        }

        let position = |name: &str| -> Result<usize> {
            header.iter().position(|h| h == name).ok_or_else(|| {
                StageError::schema(Some(&path), format!("required column {name:?} not found"))
                    .into()
            })
        };

        let first_data = match opts.index {
            IndexColumn::Leading => 1,
            IndexColumn::Ordinal => 0,
        };
        let projection: Vec<usize> = match &opts.columns {
            Some(cols) => cols.iter().map(|c| position(c)).collect::<Result<_>>()?,
            None => (first_data..header.len()).collect(),
        };

        let mut filter_positions = HashMap::new();
        if let Some(filter) = &opts.filter {
            for c in filter.columns() {
                filter_positions.insert(c.clone(), position(c)?);
            }
        }

        let columns: Vec<Column> = projection
            .iter()
            .map(|&i| {
                let name = &header[i];
                let ty = if opts.numeric.iter().any(|n| n == name) {
                    ColumnType::Numeric
                } else {
                    ColumnType::Text
                };
                Column {
                    name: name.to_string(),
                    ty,
                }
            })
            .collect();
        let schema = Schema::new(columns);

        let mut numeric = Vec::with_capacity(opts.numeric.len());
        for name in &opts.numeric {
            position(name)?;
            if let Some(out) = schema.position(name) {
                numeric.push(out);
            }
        }

        Ok(Self {
            path,
            rdr,
            schema,
            index: opts.index,
            projection,
            numeric,
            filter: opts.filter,
            filter_positions,
            chunk_size,
            limit: opts.limit,
            rows_read: 0,
            next_chunk: 0,
            record: StringRecord::new(),
            done: false,
        })
    }

    /// Schema of the chunks this reader yields.
    pub fn schema(&self) -> &Schema {
        &self.schema
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Data rows read from the file so far, including filtered-out rows.
    pub fn rows_read(&self) -> u64 {
        self.rows_read
    }

    /// Read the next chunk, or `None` at end of input.
    pub fn next_chunk(&mut self) -> Result<Option<Chunk>> {
        if self.done {
            return Ok(None);
        }
        let mut rows = Vec::with_capacity(self.chunk_size);
        while rows.len() < self.chunk_size {
            if self.limit.is_some_and(|l| self.rows_read >= l) {
                self.done = true;
                break;
            }
            let more = self
                .rdr
                .read_record(&mut self.record)
                .map_err(|e| classify_csv(&self.path, e))?;
            if !more {
                self.done = true;
                break;
            }
            let ordinal = self.rows_read;
            self.rows_read += 1;

            if let Some(filter) = &self.filter {
                let view = RowView {
                    record: &self.record,
                    positions: &self.filter_positions,
                };
                if !(filter.predicate)(&view) {
                    continue;
                }
            }

            let index = match self.index {
                IndexColumn::Ordinal => ordinal,
                IndexColumn::Leading => parse_index(&self.record[0]).map_err(|e| {
                    StageError::schema(
                        Some(&self.path),
                        format!("data row {}: {e}", ordinal + 1),
                    )
                })?,
            };
            let values: Vec<String> = self
                .projection
                .iter()
                .map(|&i| self.record[i].to_string())
                .collect();
            for &col in &self.numeric {
                if !is_numeric_cell(&values[col]) {
                    return Err(StageError::schema(
                        Some(&self.path),
                        format!(
                            "data row {}: column {:?} is numeric but got {:?}",
                            ordinal + 1,
                            self.schema.columns()[col].name,
                            values[col]
                        ),
                    )
                    .into());
                }
            }
            rows.push(Row::new(index, values));
        }

        if rows.is_empty() {
            return Ok(None);
        }
        let id = self.next_chunk;
        self.next_chunk += 1;
        Ok(Some(Chunk::new(id, self.schema.clone(), rows)))
    }
}

impl Iterator for ChunkedReader {
    type Item = Result<Chunk>;

    fn next(&mut self) -> Option<Self::Item> {
        match self.next_chunk() {
            Ok(chunk) => chunk.map(Ok),
            Err(e) => {
                self.done = true;
                Some(Err(e))
            }
        }
    }
}

/// Read a whole (filtered, projected) table into memory.
pub fn read_table(path: impl AsRef<Path>, opts: ReadOptions) -> Result<(Schema, Vec<Row>)> {
    let mut reader = ChunkedReader::open(path, 64 * 1024, opts)?;
    let schema = reader.schema().clone();
    let mut rows = Vec::new();
    while let Some(chunk) = reader.next_chunk()? {
        rows.extend(chunk.rows);
    }
    Ok((schema, rows))
}

fn classify_csv(path: &Path, err: csv::Error) -> anyhow::Error {
    let line = err.position().map(|p| p.line());
    match err.into_kind() {
        ErrorKind::Io(e) => StageError::io(path, e).into(),
        ErrorKind::UnequalLengths {
            expected_len, len, ..
        } => StageError::schema(
            Some(path),
            format!(
                "line {}: row has {len} fields, header has {expected_len}",
                line.unwrap_or(0)
            ),
        )
        .into(),
        ErrorKind::Utf8 { err, .. } => StageError::schema(
            Some(path),
            format!("line {}: invalid UTF-8: {err}", line.unwrap_or(0)),
        )
        .into(),
        other => StageError::schema(Some(path), format!("malformed CSV: {other:?}")).into(),
    }
}
