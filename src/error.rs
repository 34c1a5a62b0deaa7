//! Failure taxonomy for stage runs.
//!
//! Library functions return [`anyhow::Result`]; when the failure class matters
//! the root cause is a [`StageError`], so callers can classify with
//! [`classify`] or `err.downcast_ref::<StageError>()`.

use std::fmt;
use std::io;
use std::path::{Path, PathBuf};

/// Classified stage failure.
#[derive(Debug)]
pub enum StageError {
    /// A file could not be opened, read, or written. Fatal to the stage.
    Io { path: PathBuf, source: io::Error },
    /// An expected column is missing or rows disagree on width. Fatal.
    Schema { path: Option<PathBuf>, message: String },
    /// One chunk's transform failed. Recorded, never fatal.
    Task { chunk: u64, first_row: u64, last_row: u64, message: String },
    /// A reference table exceeds the configured memory budget.
    CapacityExceeded { path: PathBuf, size: u64, budget: u64 },
    /// Stage parameters are unusable (zero chunk size, zero workers, ...).
    Config(String),
}

impl StageError {
    pub fn io(path: impl AsRef<Path>, source: io::Error) -> Self {
        Self::Io {
            path: path.as_ref().to_path_buf(),
            source,
        }
    }

    pub fn schema<M: Into<String>>(path: Option<&Path>, message: M) -> Self {
        Self::Schema {
            path: path.map(Path::to_path_buf),
            message: message.into(),
        }
    }

    pub fn config<M: Into<String>>(message: M) -> Self {
        Self::Config(message.into())
    }

    /// Short class name, used in logs and the failure manifest.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Io { .. } => "io",
            Self::Schema { .. } => "schema",
            Self::Task { .. } => "task",
            Self::CapacityExceeded { .. } => "capacity_exceeded",
            Self::Config(_) => "config",
        }
    }
}

impl fmt::Display for StageError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Io { path, source } => write!(f, "I/O error on {}: {}", path.display(), source),
            Self::Schema {
                path: Some(path),
                message,
            } => write!(f, "schema error in {}: {}", path.display(), message),
            Self::Schema {
                path: None,
                message,
            } => write!(f, "schema error: {message}"),
            Self::Task {
                chunk,
                first_row,
                last_row,
                message,
            } => write!(
                f,
                "task for chunk {chunk} (rows {first_row}..={last_row}) failed: {message}"
            ),
            Self::CapacityExceeded { path, size, budget } => write!(
                f,
                "reference table {} is {} bytes, over the {} byte budget",
                path.display(),
                size,
                budget
            ),
            Self::Config(message) => write!(f, "invalid stage configuration: {message}"),
        }
    }
}

impl std::error::Error for StageError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io { source, .. } => Some(source),
            _ => None,
        }
    }
}

/// Find the classified cause inside an `anyhow` chain, if any.
pub fn classify(err: &anyhow::Error) -> Option<&StageError> {
    err.chain().find_map(|e| e.downcast_ref::<StageError>())
}
