//! Counters and timings for one stage run.
//!
//! [`StageMetrics`] is a cheap-to-clone handle; the orchestrator records into
//! it while streaming and snapshots it into the [`StageReport`](crate::StageReport).
//! The snapshot can be printed through the `log` facade or saved as JSON.
//!
//! # Example
//!
//! ```no_run
//! use chunkjoin::metrics::StageMetrics;
//!
//! # fn main() -> anyhow::Result<()> {
//! let m = StageMetrics::new("candidates");
//! m.record_start();
//! m.increment(StageMetrics::ROWS_READ, 10_000);
//! m.record_end();
//! m.print();
//! m.save_to_file("metrics.json")?;
//! # Ok(())
//! # }
//! ```

use crate::error::StageError;
use anyhow::{Context, Result};
use log::info;
use serde_json::{Value, json};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

#[derive(Clone)]
pub struct StageMetrics {
    inner: Arc<Mutex<Inner>>,
}

struct Inner {
    stage: String,
    counters: BTreeMap<String, u64>,
    gauges: BTreeMap<String, f64>,
    start_time: Option<Instant>,
    end_time: Option<Instant>,
}

impl StageMetrics {
    pub const ROWS_READ: &'static str = "rows_read";
    pub const CHUNKS_SUBMITTED: &'static str = "chunks_submitted";
    pub const CHUNKS_COMPLETED: &'static str = "chunks_completed";
    pub const CHUNKS_FAILED: &'static str = "chunks_failed";
    pub const ROWS_WRITTEN: &'static str = "rows_written";
    pub const PEAK_IN_FLIGHT: &'static str = "peak_in_flight";
    pub const PEAK_RSS_MB: &'static str = "peak_rss_mb";

    #[must_use]
    pub fn new(stage: impl Into<String>) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner {
                stage: stage.into(),
                counters: BTreeMap::new(),
                gauges: BTreeMap::new(),
                start_time: None,
                end_time: None,
            })),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn stage(&self) -> String {
        self.lock().stage.clone()
    }

    pub fn record_start(&self) {
        self.lock().start_time = Some(Instant::now());
    }

    pub fn record_end(&self) {
        self.lock().end_time = Some(Instant::now());
    }

    /// Time between `record_start` and `record_end`, or until now if the run
    /// has not ended.
    #[must_use]
    pub fn elapsed(&self) -> Option<Duration> {
        let inner = self.lock();
        let start = inner.start_time?;
        Some(inner.end_time.unwrap_or_else(Instant::now).duration_since(start))
    }

    pub fn increment(&self, name: &str, by: u64) {
        *self.lock().counters.entry(name.to_string()).or_insert(0) += by;
    }

    pub fn set_counter(&self, name: &str, value: u64) {
        self.lock().counters.insert(name.to_string(), value);
    }

    #[must_use]
    pub fn counter(&self, name: &str) -> u64 {
        self.lock().counters.get(name).copied().unwrap_or(0)
    }

    /// Keep the larger of the current and the new value.
    pub fn observe_max(&self, name: &str, value: f64) {
        let mut inner = self.lock();
        let slot = inner.gauges.entry(name.to_string()).or_insert(value);
        if value > *slot {
            *slot = value;
        }
    }

    #[must_use]
    pub fn gauge(&self, name: &str) -> Option<f64> {
        self.lock().gauges.get(name).copied()
    }

    #[must_use]
    pub fn to_json(&self) -> Value {
        let elapsed_ms = self.elapsed().map(|d| d.as_millis() as u64);
        let inner = self.lock();
        let mut metrics = serde_json::Map::new();
        for (name, v) in &inner.counters {
            metrics.insert(name.clone(), json!(v));
        }
        for (name, v) in &inner.gauges {
            metrics.insert(name.clone(), json!(v));
        }
        if let Some(ms) = elapsed_ms {
            metrics.insert("execution_time_ms".to_string(), json!(ms));
        }
        json!({ "stage": inner.stage, "metrics": metrics })
    }

    /// Log every metric at `info` level.
    pub fn print(&self) {
        let elapsed = self.elapsed();
        let inner = self.lock();
        info!("========== {} metrics ==========", inner.stage);
        if let Some(e) = elapsed {
            info!(
                "execution time: {:.3}s ({} ms)",
                e.as_secs_f64(),
                e.as_millis()
            );
        }
        for (name, v) in &inner.counters {
            info!("{name}: {v}");
        }
        for (name, v) in &inner.gauges {
            info!("{name}: {v:.1}");
        }
    }

    pub fn save_to_file(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let formatted =
            serde_json::to_string_pretty(&self.to_json()).context("serialize metrics")?;
        std::fs::write(path, formatted).map_err(|e| StageError::io(path, e))?;
        Ok(())
    }
}

/// Resident set size of this process in MiB, where the platform exposes it.
pub fn process_rss_mb() -> Option<f64> {
    let status = std::fs::read_to_string("/proc/self/status").ok()?;
    let line = status.lines().find(|l| l.starts_with("VmRSS:"))?;
    let kb: f64 = line.split_whitespace().nth(1)?.parse().ok()?;
    Some(kb / 1024.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_accumulate_and_serialize() {
        let m = StageMetrics::new("t");
        m.record_start();
        m.increment(StageMetrics::ROWS_READ, 3);
        m.increment(StageMetrics::ROWS_READ, 4);
        m.observe_max(StageMetrics::PEAK_RSS_MB, 2.0);
        m.observe_max(StageMetrics::PEAK_RSS_MB, 1.0);
        m.record_end();

        assert_eq!(m.counter(StageMetrics::ROWS_READ), 7);
        assert_eq!(m.gauge(StageMetrics::PEAK_RSS_MB), Some(2.0));
        let v = m.to_json();
        assert_eq!(v["stage"], "t");
        assert_eq!(v["metrics"]["rows_read"], 7);
        assert!(v["metrics"]["execution_time_ms"].is_u64());
    }
}
