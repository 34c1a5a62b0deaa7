//! Pluggable per-chunk transforms.
//!
//! A [`Transform`] turns one chunk (plus the worker's broadcast table, when the
//! stage has one) into the records to append. Implementations must be pure with
//! respect to their inputs and hold no shared mutable state, since the same
//! instance runs on every worker concurrently.
//!
//! Concrete transforms:
//! - [`CandidateScorer`] - n-gram similarity between chunk rows and broadcast rows
//! - [`FeatureRescorer`] - string-similarity features for decorated candidate pairs
//! - [`ClassifyTransform`] - fitted-model probability with a threshold

pub mod candidates;
pub mod classify;
pub mod preprocess;
pub mod rescore;
pub mod similarity;

use crate::broadcast::BroadcastTable;
use crate::schema::Schema;
use crate::table::{Chunk, OutputRecord};
use anyhow::Result;
use std::any::Any;

pub use candidates::{CandidateScorer, FieldPair, default_field_pairs};
pub use classify::{ClassifyTransform, Classifier, LogisticModel};
pub use preprocess::{Preprocessor, TextPreprocessor};
pub use rescore::FeatureRescorer;
pub use similarity::Analyzer;

/// Worker-local data a transform derives from the broadcast table.
pub type Prepared = Box<dyn Any + Send + Sync>;

/// Stage-specific chunk function.
pub trait Transform: Send + Sync {
    /// Short name for logs.
    fn name(&self) -> &str;

    /// Output schema for chunks with schema `input`. Called once, before the
    /// sink is initialized.
    ///
    /// # Errors
    /// `SchemaError` if `input` lacks a column the transform needs.
    fn output_schema(&self, input: &Schema) -> Result<Schema>;

    /// Build worker-local lookup data from the broadcast table. Runs once per
    /// worker, right after the worker loads its copy of the table.
    fn prepare(&self, _broadcast: Option<&BroadcastTable>) -> Result<Option<Prepared>> {
        Ok(None)
    }

    /// Compute the surviving output records for `chunk`.
    fn apply(&self, chunk: &Chunk, broadcast: Option<&BroadcastTable>)
    -> Result<Vec<OutputRecord>>;

    /// [`Transform::apply`] with whatever [`Transform::prepare`] returned on
    /// this worker.
    fn apply_prepared(
        &self,
        chunk: &Chunk,
        broadcast: Option<&BroadcastTable>,
        _prepared: Option<&(dyn Any + Send + Sync)>,
    ) -> Result<Vec<OutputRecord>> {
        self.apply(chunk, broadcast)
    }
}
