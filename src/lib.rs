//! # chunkjoin
//!
//! A **chunked, memory-bounded batch pipeline** for matching records in a
//! large table against a smaller reference table. The large table is streamed
//! in fixed-size chunks, the reference table is broadcast into every worker,
//! and results are appended to a single output file as they are produced.
//!
//! ## Key Features
//!
//! - **Lazy chunked reader** - projection, row predicate, row limit, and
//!   transparent gzip/zstd/bzip2/xz decompression
//! - **Broadcast tables** - each worker loads its own read-only copy once
//! - **Left-join decoration** - unmatched lookups are filled with empty strings
//! - **Bounded worker pool** - at most `max_in_flight` chunks are outstanding,
//!   which caps peak memory regardless of input size
//! - **Append sink** - header written once, every chunk's output appended as
//!   one durable block
//! - **Per-chunk failure isolation** - failed chunks are recorded in a manifest
//!   and the stage carries on
//!
//! ## Quick Start
//!
//! ```no_run
//! use chunkjoin::*;
//! use chunkjoin::stages::CandidatesConfig;
//! # use anyhow::Result;
//!
//! # fn main() -> Result<()> {
//! let stage = StageConfig::default().with_chunk_size(5_000).with_workers(4);
//! let cfg = CandidatesConfig::new("invoices.csv", "partners.csv", "candidates.csv")
//!     .with_threshold(0.05);
//! let report = stages::candidates::run(&cfg, &stage)?;
//! println!("{} pairs written", report.rows_written());
//! # Ok(())
//! # }
//! ```
//!
//! ## Core Concepts
//!
//! ### Stages
//!
//! A stage reads one primary table, optionally decorates each chunk with
//! looked-up columns, applies a [`Transform`] on a worker, and appends the
//! resulting records. [`Runner`] drives a [`StageSpec`] through
//! `INIT → STREAMING → DRAINING → DONE` (or `FAILED`).
//!
//! ### Transforms
//!
//! - [`CandidateScorer`] - weighted n-gram similarity against the broadcast table
//! - [`FeatureRescorer`] - string similarity features per candidate pair
//! - [`ClassifyTransform`] - probability from a fitted [`Classifier`]
//!
//! ### Errors
//!
//! Functions return [`anyhow::Result`]. Classified failures carry a
//! [`StageError`] root cause; use [`error::classify`] to recover it.
//! I/O and schema errors end the stage; a failing chunk does not.

pub mod broadcast;
pub mod config;
pub mod error;
pub mod io;
pub mod join;
pub mod metrics;
pub mod pool;
pub mod runner;
pub mod schema;
pub mod stages;
pub mod table;
pub mod transform;

pub use broadcast::{BroadcastSpec, BroadcastTable};
pub use config::StageConfig;
pub use error::{StageError, classify};
pub use io::{AppendSink, ChunkedReader, IndexColumn, ReadOptions, RowFilter, RowView};
pub use join::{Decorator, left_join};
pub use metrics::StageMetrics;
pub use pool::{PoolSummary, TaskFailure, TaskLabel, WorkerPool};
pub use runner::{Runner, StageReport, StageSpec, StageState};
pub use schema::{Column, ColumnType, Schema};
pub use table::{Chunk, OutputRecord, Row};
pub use transform::{
    CandidateScorer, Classifier, ClassifyTransform, FeatureRescorer, FieldPair, LogisticModel,
    Prepared, Transform,
};
