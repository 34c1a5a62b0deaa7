//! Incremental append sink.
//!
//! The output file is created once with its header, then every completed
//! chunk appends its records as one contiguous block. Each [`AppendSink::append`]
//! encodes the whole block in memory, issues a single append-mode write, and
//! syncs before returning, so blocks from concurrent workers never interleave
//! (their relative order is unspecified). Nothing is buffered across calls.

use crate::error::StageError;
use crate::schema::Schema;
use crate::table::OutputRecord;
use anyhow::{Context, Result};
use csv::WriterBuilder;
use std::fs::{File, OpenOptions, create_dir_all};
use std::io::Write;
use std::path::{Path, PathBuf};

/// Handle to an initialized output file. Cheap to clone; every clone appends
/// to the same file.
#[derive(Clone, Debug)]
pub struct AppendSink {
    path: PathBuf,
    schema: Schema,
    delimiter: u8,
}

impl AppendSink {
    /// Truncate or create `path` and write exactly one header row for `schema`.
    ///
    /// Parent directories are created as needed.
    ///
    /// # Errors
    /// `IOError` if the file cannot be created or written; `SchemaError` if the
    /// schema has no columns.
    pub fn initialize(path: impl AsRef<Path>, schema: &Schema) -> Result<Self> {
        Self::initialize_with_delimiter(path, schema, b',')
    }

    /// Like [`AppendSink::initialize`], with `delimiter` separating fields in
    /// the header and in every appended block.
    pub fn initialize_with_delimiter(
        path: impl AsRef<Path>,
        schema: &Schema,
        delimiter: u8,
    ) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if schema.is_empty() {
            return Err(StageError::schema(Some(&path), "output schema has no columns").into());
        }
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            create_dir_all(parent).map_err(|e| StageError::io(parent, e))?;
        }

        let sink = Self {
            path,
            schema: schema.clone(),
            delimiter,
        };
        sink.write_header()?;
        Ok(sink)
    }

    /// Truncate the file back to its header row.
    ///
    /// A stage that fails after streaming started calls this so the output
    /// cannot be mistaken for a complete result.
    pub fn reset(&self) -> Result<()> {
        self.write_header()
    }

    fn write_header(&self) -> Result<()> {
        let mut buf = Vec::new();
        {
            let mut wtr = WriterBuilder::new()
                .delimiter(self.delimiter)
                .from_writer(&mut buf);
            wtr.write_record(self.schema.names())
                .context("encode header row")?;
            wtr.flush().context("encode header row")?;
        }
        let mut file = File::create(&self.path).map_err(|e| StageError::io(&self.path, e))?;
        file.write_all(&buf)
            .map_err(|e| StageError::io(&self.path, e))?;
        file.sync_all().map_err(|e| StageError::io(&self.path, e))?;
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn schema(&self) -> &Schema {
        &self.schema
    }

    /// Append `records` as one block and sync it to disk.
    ///
    /// Every record is checked against the schema before anything is written;
    /// a bad record fails the whole block. An empty slice writes nothing.
    ///
    /// # Returns
    /// The number of records written.
    pub fn append(&self, records: &[OutputRecord]) -> Result<usize> {
        if records.is_empty() {
            return Ok(0);
        }
        let mut buf = Vec::with_capacity(records.len().saturating_mul(64));
        {
            let mut wtr = WriterBuilder::new()
                .delimiter(self.delimiter)
                .has_headers(false)
                .from_writer(&mut buf);
            for (i, rec) in records.iter().enumerate() {
                self.schema
                    .check_row(&rec.cells)
                    .with_context(|| format!("output record #{}", i + 1))?;
                wtr.write_record(&rec.cells)
                    .with_context(|| format!("encode output record #{}", i + 1))?;
            }
            wtr.flush().context("encode output block")?;
        }

        let mut file = OpenOptions::new()
            .append(true)
            .open(&self.path)
            .map_err(|e| StageError::io(&self.path, e))?;
        file.write_all(&buf)
            .map_err(|e| StageError::io(&self.path, e))?;
        file.sync_data()
            .map_err(|e| StageError::io(&self.path, e))?;
        Ok(records.len())
    }
}
