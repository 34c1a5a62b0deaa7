//! Concrete stage drivers.
//!
//! Each driver turns its stage config plus the shared [`StageConfig`](crate::StageConfig)
//! into a [`StageSpec`](crate::runner::StageSpec) and runs it:
//!
//! 1. [`candidates`]: primary table streamed, reference table broadcast,
//!    fuzzy candidate pairs written.
//! 2. [`rescore`]: the candidate file streamed, both source tables held by
//!    the orchestrator for decoration, similarity features written.
//! 3. [`classify`]: the feature file streamed, model scores written.

pub mod candidates;
pub mod classify;
pub mod rescore;

pub use candidates::CandidatesConfig;
pub use classify::ClassifyConfig;
pub use rescore::{EqualityFilter, RescoreConfig};
