//! Bounded-queue worker pool.
//!
//! A fixed set of long-lived workers on a dedicated `rayon` thread pool. Each
//! worker builds its own state (typically a [`BroadcastTable`](crate::BroadcastTable))
//! exactly once, before any task is accepted, and every task it runs sees
//! only that worker's state.
//!
//! Submission is asynchronous but gated: at most `max_in_flight` tasks may be
//! submitted and not yet finished. [`WorkerPool::submit`] blocks on a condition
//! variable while the gate is full. A task that returns an error or panics is
//! recorded as a [`TaskFailure`] and does not affect sibling tasks. A task
//! error whose cause is [`StageError::Io`] (the sink could not be written) is
//! additionally kept as the pool's fatal error, see [`WorkerPool::take_fatal`].

use crate::error::{StageError, classify};
use crate::metrics::process_rss_mb;
use anyhow::{Context, Result};
use log::{debug, info, warn};
use serde::Serialize;
use std::any::Any;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};

/// Identifies one chunk task for logging and failure reports.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct TaskLabel {
    pub chunk: u64,
    pub first_row: u64,
    pub last_row: u64,
    pub rows: usize,
}

/// A task that returned an error or panicked.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct TaskFailure {
    #[serde(flatten)]
    pub label: TaskLabel,
    pub error: String,
}

impl TaskFailure {
    pub fn to_stage_error(&self) -> StageError {
        StageError::Task {
            chunk: self.label.chunk,
            first_row: self.label.first_row,
            last_row: self.label.last_row,
            message: self.error.clone(),
        }
    }
}

/// Counters accumulated over the pool's lifetime.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct PoolSummary {
    pub submitted: u64,
    pub completed: u64,
    pub failed: u64,
    pub rows_written: u64,
    pub peak_in_flight: usize,
    pub failures: Vec<TaskFailure>,
}

#[derive(Default)]
struct GateState {
    in_flight: usize,
    summary: PoolSummary,
    fatal: Option<anyhow::Error>,
}

/// How one task ended.
enum Outcome {
    Wrote(usize),
    Failed(TaskFailure),
    Fatal(TaskFailure, anyhow::Error),
}

/// In-flight counter plus the bookkeeping updated on every completion.
struct Gate {
    state: Mutex<GateState>,
    cv: Condvar,
}

impl Gate {
    fn lock(&self) -> MutexGuard<'_, GateState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn acquire(&self, limit: usize) {
        let mut st = self.lock();
        while st.in_flight >= limit {
            st = self.cv.wait(st).unwrap_or_else(PoisonError::into_inner);
        }
        st.in_flight += 1;
        st.summary.submitted += 1;
        st.summary.peak_in_flight = st.summary.peak_in_flight.max(st.in_flight);
    }

    fn release(&self, outcome: Outcome) {
        let mut st = self.lock();
        st.in_flight -= 1;
        match outcome {
            Outcome::Wrote(rows) => {
                st.summary.completed += 1;
                st.summary.rows_written += rows as u64;
            }
            Outcome::Failed(failure) => {
                st.summary.failed += 1;
                st.summary.failures.push(failure);
            }
            Outcome::Fatal(failure, err) => {
                st.summary.failed += 1;
                st.summary.failures.push(failure);
                st.fatal.get_or_insert(err);
            }
        }
        drop(st);
        self.cv.notify_all();
    }

    fn wait_idle(&self) {
        let mut st = self.lock();
        while st.in_flight > 0 {
            st = self.cv.wait(st).unwrap_or_else(PoisonError::into_inner);
        }
    }
}

/// Fixed-size pool of workers, each owning one `S`.
pub struct WorkerPool<S> {
    pool: rayon::ThreadPool,
    states: Arc<Vec<S>>,
    gate: Arc<Gate>,
    max_in_flight: usize,
}

impl<S: Send + Sync + 'static> WorkerPool<S> {
    /// Start `workers` threads and run `init(worker_index)` once on each of
    /// them, in parallel. Returns only after every worker is initialized.
    ///
    /// # Errors
    /// `Config` if `workers` or `max_in_flight` is zero; otherwise the first
    /// initialization error (these are fatal to the stage).
    pub fn start<F>(workers: usize, max_in_flight: usize, init: F) -> Result<Self>
    where
        F: Fn(usize) -> Result<S> + Sync,
    {
        if workers == 0 {
            return Err(StageError::config("worker_count must be at least 1").into());
        }
        if max_in_flight == 0 {
            return Err(StageError::config("max_in_flight must be at least 1").into());
        }
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(workers)
            .thread_name(|i| format!("chunkjoin-worker-{i}"))
            .build()
            .context("build worker pool")?;

        let states = pool
            .broadcast(|ctx| {
                debug!("worker {} initializing", ctx.index());
                init(ctx.index())
            })
            .into_iter()
            .enumerate()
            .map(|(i, r)| r.with_context(|| format!("initialize worker {i}")))
            .collect::<Result<Vec<S>>>()?;

        Ok(Self {
            pool,
            states: Arc::new(states),
            gate: Arc::new(Gate {
                state: Mutex::new(GateState::default()),
                cv: Condvar::new(),
            }),
            max_in_flight,
        })
    }

    pub fn workers(&self) -> usize {
        self.states.len()
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight
    }

    /// Submitted tasks that have not finished yet.
    pub fn in_flight(&self) -> usize {
        self.gate.lock().in_flight
    }

    /// Snapshot of the counters so far.
    pub fn summary(&self) -> PoolSummary {
        self.gate.lock().summary.clone()
    }

    /// Whether a task has hit a fatal (I/O) error.
    pub fn has_fatal(&self) -> bool {
        self.gate.lock().fatal.is_some()
    }

    /// Take the first fatal task error, if any.
    pub fn take_fatal(&self) -> Option<anyhow::Error> {
        self.gate.lock().fatal.take()
    }

    /// Submit one task. Blocks while `max_in_flight` tasks are outstanding,
    /// then returns without waiting for the task to run.
    ///
    /// The task returns the number of rows it wrote.
    pub fn submit<F>(&self, label: TaskLabel, task: F)
    where
        F: FnOnce(&S) -> Result<usize> + Send + 'static,
    {
        self.gate.acquire(self.max_in_flight);
        let states = Arc::clone(&self.states);
        let gate = Arc::clone(&self.gate);
        self.pool.spawn(move || {
            let worker = rayon::current_thread_index().unwrap_or(0);
            let outcome = catch_unwind(AssertUnwindSafe(|| task(&states[worker])));
            let outcome = match outcome {
                Ok(Ok(rows)) => {
                    let rss = process_rss_mb()
                        .map_or_else(|| "n/a".to_string(), |mb| format!("{mb:.1} MB"));
                    info!(
                        "worker {worker} chunk {} rows {}..={} wrote {rows:>10} (rss {rss})",
                        label.chunk, label.first_row, label.last_row
                    );
                    Outcome::Wrote(rows)
                }
                Ok(Err(e)) => {
                    let failure = TaskFailure {
                        label,
                        error: format!("{e:#}"),
                    };
                    warn!("{}", failure.to_stage_error());
                    if matches!(classify(&e), Some(StageError::Io { .. })) {
                        Outcome::Fatal(failure, e)
                    } else {
                        Outcome::Failed(failure)
                    }
                }
                Err(payload) => {
                    let failure = TaskFailure {
                        label,
                        error: format!("panic: {}", panic_message(payload.as_ref())),
                    };
                    warn!("{}", failure.to_stage_error());
                    Outcome::Failed(failure)
                }
            };
            gate.release(outcome);
        });
    }

    /// Block until every submitted task has finished.
    pub fn wait_idle(&self) {
        self.gate.wait_idle();
    }

    /// Drain outstanding work, stop the workers, and return the final counters.
    pub fn shutdown(self) -> PoolSummary {
        self.wait_idle();
        let summary = self.summary();
        drop(self.pool);
        summary
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
