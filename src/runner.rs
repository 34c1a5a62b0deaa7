//! Stage orchestrator.
//!
//! [`Runner::run`] drives one stage through
//! `Init → Streaming → Draining → Done`, or `Failed`:
//!
//! - **Init** validates parameters, checks the reference table against its
//!   byte budget, opens the reader, resolves every schema, writes the output
//!   header, and starts the worker pool (each worker loads its own copy of the
//!   reference table and runs [`Transform::prepare`] on it).
//! - **Streaming** reads chunks on the calling thread, decorates them, and
//!   submits one task per chunk. Submission blocks while the in-flight cap is
//!   reached.
//! - **Draining** waits for every submitted task.
//! - **Done** writes the failure manifest (if any task failed) and returns a
//!   [`StageReport`].
//!
//! Reader errors, decoration errors, and sink I/O errors end the stage in
//! `Failed` after outstanding tasks drain, and the output is truncated back
//! to its header. Individual task failures do not.

use crate::broadcast::{BroadcastSpec, BroadcastTable};
use crate::config::StageConfig;
use crate::error::StageError;
use crate::io::{AppendSink, ChunkedReader, ReadOptions};
use crate::join::Decorator;
use crate::metrics::{StageMetrics, process_rss_mb};
use crate::pool::{PoolSummary, TaskFailure, TaskLabel, WorkerPool};
use crate::transform::{Prepared, Transform};
use anyhow::{Context, Result};
use log::{debug, error, info, warn};
use serde::Serialize;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

/// What each worker holds for the whole stage.
struct WorkerState {
    table: Option<BroadcastTable>,
    prepared: Option<Prepared>,
}

/// Lifecycle of one stage run.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StageState {
    Init,
    Streaming,
    Draining,
    Done,
    Failed,
}

impl fmt::Display for StageState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Init => "INIT",
            Self::Streaming => "STREAMING",
            Self::Draining => "DRAINING",
            Self::Done => "DONE",
            Self::Failed => "FAILED",
        };
        f.write_str(s)
    }
}

/// Everything needed to run one stage.
#[derive(Clone)]
pub struct StageSpec {
    pub name: String,
    /// Primary (streamed) input table.
    pub input: PathBuf,
    pub read: ReadOptions,
    pub output: PathBuf,
    /// Reference table replicated into every worker.
    pub broadcast: Option<BroadcastSpec>,
    /// Lookups applied on the orchestrator thread before dispatch.
    pub decorator: Option<Decorator>,
    pub transform: Arc<dyn Transform>,
}

impl StageSpec {
    pub fn new(
        name: impl Into<String>,
        input: impl Into<PathBuf>,
        output: impl Into<PathBuf>,
        transform: Arc<dyn Transform>,
    ) -> Self {
        Self {
            name: name.into(),
            input: input.into(),
            read: ReadOptions::default(),
            output: output.into(),
            broadcast: None,
            decorator: None,
            transform,
        }
    }

    pub fn with_read(mut self, read: ReadOptions) -> Self {
        self.read = read;
        self
    }

    pub fn with_broadcast(mut self, broadcast: BroadcastSpec) -> Self {
        self.broadcast = Some(broadcast);
        self
    }

    pub fn with_decorator(mut self, decorator: Decorator) -> Self {
        self.decorator = Some(decorator);
        self
    }
}

/// Outcome of a stage that reached `Done`.
#[derive(Clone, Debug, Serialize)]
pub struct StageReport {
    pub stage: String,
    pub state: StageState,
    pub output: PathBuf,
    pub rows_read: u64,
    pub chunks: u64,
    pub summary: PoolSummary,
    pub elapsed: Duration,
    pub metrics: serde_json::Value,
    /// Written only when at least one task failed.
    pub failure_manifest: Option<PathBuf>,
}

impl StageReport {
    pub fn rows_written(&self) -> u64 {
        self.summary.rows_written
    }

    pub fn failures(&self) -> &[TaskFailure] {
        &self.summary.failures
    }

    /// No task failed.
    pub fn is_clean(&self) -> bool {
        self.summary.failures.is_empty()
    }
}

#[derive(Serialize)]
struct FailureManifest<'a> {
    stage: &'a str,
    input: &'a Path,
    output: &'a Path,
    failures: &'a [TaskFailure],
}

/// `<output>.failures.json` next to the output file.
pub fn failure_manifest_path(output: &Path) -> PathBuf {
    let mut name = output.as_os_str().to_owned();
    name.push(".failures.json");
    PathBuf::from(name)
}

type Observer = Box<dyn Fn(StageState) + Send + Sync>;

pub struct Runner {
    config: StageConfig,
    observer: Option<Observer>,
}

impl Runner {
    pub fn new(config: StageConfig) -> Self {
        Self {
            config,
            observer: None,
        }
    }

    /// Call `f` on every state transition.
    pub fn with_observer<F>(mut self, f: F) -> Self
    where
        F: Fn(StageState) + Send + Sync + 'static,
    {
        self.observer = Some(Box::new(f));
        self
    }

    pub fn config(&self) -> &StageConfig {
        &self.config
    }

    fn enter(&self, stage: &str, state: StageState) {
        info!("[{stage}] {state}");
        if let Some(f) = &self.observer {
            f(state);
        }
    }

    /// Run `spec` to completion.
    ///
    /// # Errors
    /// Any `Config`, `CapacityExceeded`, `IOError` or `SchemaError`; the
    /// root cause is a [`StageError`] (see [`classify`](crate::error::classify)).
    /// Task failures are reported in the returned [`StageReport`] instead.
    pub fn run(&self, spec: StageSpec) -> Result<StageReport> {
        let metrics = StageMetrics::new(&spec.name);
        metrics.record_start();
        self.enter(&spec.name, StageState::Init);
        match self.execute(&spec, &metrics) {
            Ok(report) => {
                self.enter(&spec.name, StageState::Done);
                Ok(report)
            }
            Err(e) => {
                error!("[{}] stage failed: {e:#}", spec.name);
                self.enter(&spec.name, StageState::Failed);
                Err(e).with_context(|| format!("stage {}", spec.name))
            }
        }
    }

    fn execute(&self, spec: &StageSpec, metrics: &StageMetrics) -> Result<StageReport> {
        let cfg = &self.config;
        cfg.validate()?;

        let broadcast = spec
            .broadcast
            .clone()
            .map(|b| {
                let budget = b.max_bytes.or(cfg.broadcast_max_bytes);
                b.with_max_bytes(budget)
            });
        if let Some(b) = &broadcast {
            b.check_capacity()?;
        }

        let manifest = failure_manifest_path(&spec.output);
        match std::fs::remove_file(&manifest) {
            Ok(()) => debug!("removed stale {}", manifest.display()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(StageError::io(&manifest, e).into()),
        }

        let read = spec.read.clone().with_limit(spec.read.limit.or(cfg.row_limit));
        let mut reader = ChunkedReader::open(&spec.input, cfg.chunk_size, read)?;
        let decorated = match &spec.decorator {
            Some(d) => d.output_schema(reader.schema())?,
            None => reader.schema().clone(),
        };
        // Header and projection of the reference table are checked here, so a
        // bad reference file fails before the output is created.
        if let Some(b) = &broadcast {
            let probe = ChunkedReader::open(&b.path, 1, b.options.clone())?;
            debug!(
                "[{}] reference columns {:?}",
                spec.name,
                probe.schema().names().collect::<Vec<_>>()
            );
        }
        let out_schema = spec
            .transform
            .output_schema(&decorated)
            .with_context(|| format!("{} output schema", spec.transform.name()))?;
        let sink =
            AppendSink::initialize_with_delimiter(&spec.output, &out_schema, spec.read.delimiter)?;

        let transform = &spec.transform;
        let pool = WorkerPool::start(cfg.worker_count, cfg.max_in_flight, |worker| {
            let table = broadcast
                .as_ref()
                .map(|b| -> Result<BroadcastTable> {
                    let table = b.load()?;
                    debug!("worker {worker} holds {} reference rows", table.len());
                    Ok(table)
                })
                .transpose()?;
            let prepared = transform
                .prepare(table.as_ref())
                .with_context(|| format!("prepare {}", transform.name()))?;
            Ok(WorkerState { table, prepared })
        })?;
        info!(
            "[{}] {} workers, in-flight cap {}, chunk size {}",
            spec.name,
            pool.workers(),
            pool.max_in_flight(),
            cfg.chunk_size
        );

        self.enter(&spec.name, StageState::Streaming);
        let mut fatal: Option<anyhow::Error> = None;
        let mut chunks = 0u64;
        loop {
            if pool.has_fatal() {
                break;
            }
            let chunk = match reader.next_chunk() {
                Ok(Some(c)) => c,
                Ok(None) => break,
                Err(e) => {
                    fatal = Some(e);
                    break;
                }
            };
            metrics.set_counter(StageMetrics::ROWS_READ, reader.rows_read());
            info!(
                "[{}] read chunk {} ({} rows so far)",
                spec.name,
                chunk.id,
                reader.rows_read()
            );
            let chunk = match &spec.decorator {
                Some(d) => match d.decorate(chunk) {
                    Ok(c) => c,
                    Err(e) => {
                        fatal = Some(e);
                        break;
                    }
                },
                None => chunk,
            };
            let Some((first_row, last_row)) = chunk.index_range() else {
                continue;
            };
            let label = TaskLabel {
                chunk: chunk.id,
                first_row,
                last_row,
                rows: chunk.len(),
            };
            let transform = Arc::clone(&spec.transform);
            let sink = sink.clone();
            pool.submit(label, move |state: &WorkerState| {
                let records = transform.apply_prepared(
                    &chunk,
                    state.table.as_ref(),
                    state.prepared.as_deref(),
                )?;
                sink.append(&records)
            });
            chunks += 1;
            if let Some(mb) = process_rss_mb() {
                metrics.observe_max(StageMetrics::PEAK_RSS_MB, mb);
            }
        }

        self.enter(&spec.name, StageState::Draining);
        pool.wait_idle();
        let fatal = fatal.or_else(|| pool.take_fatal());
        let summary = pool.shutdown();
        metrics.set_counter(StageMetrics::ROWS_READ, reader.rows_read());
        metrics.set_counter(StageMetrics::CHUNKS_SUBMITTED, summary.submitted);
        metrics.set_counter(StageMetrics::CHUNKS_COMPLETED, summary.completed);
        metrics.set_counter(StageMetrics::CHUNKS_FAILED, summary.failed);
        metrics.set_counter(StageMetrics::ROWS_WRITTEN, summary.rows_written);
        metrics.set_counter(StageMetrics::PEAK_IN_FLIGHT, summary.peak_in_flight as u64);
        metrics.record_end();
        metrics.print();

        let failure_manifest = if summary.failures.is_empty() {
            None
        } else {
            match write_manifest(&manifest, spec, &summary.failures) {
                Ok(()) => {}
                Err(e) if fatal.is_some() => {
                    warn!("[{}] could not write failure manifest: {e:#}", spec.name);
                }
                Err(e) => return Err(e),
            }
            warn!(
                "[{}] {} of {} chunks failed; see {}",
                spec.name,
                summary.failed,
                summary.submitted,
                manifest.display()
            );
            Some(manifest)
        };
        if let Some(e) = fatal {
            if let Err(reset) = sink.reset() {
                warn!("[{}] could not truncate {}: {reset:#}", spec.name, spec.output.display());
            }
            if let Some(path) = &cfg.metrics_path
                && let Err(save) = metrics.save_to_file(path)
            {
                warn!("[{}] could not save metrics: {save:#}", spec.name);
            }
            return Err(e);
        }
        if let Some(path) = &cfg.metrics_path {
            metrics.save_to_file(path)?;
        }

        info!(
            "[{}] wrote {} rows from {} input rows",
            spec.name,
            summary.rows_written,
            reader.rows_read()
        );
        Ok(StageReport {
            stage: spec.name.clone(),
            state: StageState::Done,
            output: spec.output.clone(),
            rows_read: reader.rows_read(),
            chunks,
            elapsed: metrics.elapsed().unwrap_or_default(),
            metrics: metrics.to_json(),
            summary,
            failure_manifest,
        })
    }
}

fn write_manifest(path: &Path, spec: &StageSpec, failures: &[TaskFailure]) -> Result<()> {
    let manifest = FailureManifest {
        stage: &spec.name,
        input: &spec.input,
        output: &spec.output,
        failures,
    };
    let text = serde_json::to_string_pretty(&manifest).context("serialize failure manifest")?;
    std::fs::write(path, text).map_err(|e| StageError::io(path, e))?;
    Ok(())
}
