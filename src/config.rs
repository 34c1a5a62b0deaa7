//! Run-wide stage parameters.

use crate::error::StageError;
use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

pub const DEFAULT_CHUNK_SIZE: usize = 10_000;
pub const DEFAULT_MAX_IN_FLIGHT: usize = 12;

/// Parameters shared by every stage run.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StageConfig {
    /// Rows per chunk (counted after the row predicate).
    pub chunk_size: usize,
    pub worker_count: usize,
    /// Upper bound on submitted-but-unfinished chunk tasks.
    pub max_in_flight: usize,
    /// Stop after this many primary input rows (counted before the predicate).
    pub row_limit: Option<u64>,
    /// Reject reference tables larger than this on disk.
    pub broadcast_max_bytes: Option<u64>,
    /// Where to write the metrics JSON after the run.
    pub metrics_path: Option<PathBuf>,
}

impl Default for StageConfig {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            worker_count: num_cpus::get(),
            max_in_flight: DEFAULT_MAX_IN_FLIGHT,
            row_limit: None,
            broadcast_max_bytes: None,
            metrics_path: None,
        }
    }
}

impl StageConfig {
    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size;
        self
    }

    pub fn with_workers(mut self, worker_count: usize) -> Self {
        self.worker_count = worker_count;
        self
    }

    pub fn with_max_in_flight(mut self, max_in_flight: usize) -> Self {
        self.max_in_flight = max_in_flight;
        self
    }

    pub fn with_row_limit(mut self, row_limit: Option<u64>) -> Self {
        self.row_limit = row_limit;
        self
    }

    pub fn with_broadcast_max_bytes(mut self, max_bytes: Option<u64>) -> Self {
        self.broadcast_max_bytes = max_bytes;
        self
    }

    pub fn with_metrics_path(mut self, path: Option<PathBuf>) -> Self {
        self.metrics_path = path;
        self
    }

    /// Reject zero chunk size, zero workers, or a zero in-flight cap.
    pub fn validate(&self) -> Result<()> {
        if self.chunk_size == 0 {
            return Err(StageError::config("chunk_size must be at least 1").into());
        }
        if self.worker_count == 0 {
            return Err(StageError::config("worker_count must be at least 1").into());
        }
        if self.max_in_flight == 0 {
            return Err(StageError::config("max_in_flight must be at least 1").into());
        }
        Ok(())
    }

    /// Load from a JSON file; missing keys take their defaults.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|e| StageError::io(path, e))?;
        let cfg: StageConfig = serde_json::from_str(&text)
            .map_err(|e| StageError::config(format!("{}: {e}", path.display())))?;
        cfg.validate()?;
        Ok(cfg)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let cfg = StageConfig::default();
        assert_eq!(cfg.chunk_size, 10_000);
        assert_eq!(cfg.max_in_flight, 12);
        assert!(cfg.worker_count >= 1);
        cfg.validate().unwrap();
    }

    #[test]
    fn zero_values_rejected() {
        for cfg in [
            StageConfig::default().with_chunk_size(0),
            StageConfig::default().with_workers(0),
            StageConfig::default().with_max_in_flight(0),
        ] {
            let err = cfg.validate().unwrap_err();
            assert!(matches!(
                crate::error::classify(&err),
                Some(StageError::Config(_))
            ));
        }
    }

    #[test]
    fn partial_json_keeps_defaults() {
        let cfg: StageConfig = serde_json::from_str(r#"{"chunk_size": 5}"#).unwrap();
        assert_eq!(cfg.chunk_size, 5);
        assert_eq!(cfg.max_in_flight, DEFAULT_MAX_IN_FLIGHT);
    }
}
