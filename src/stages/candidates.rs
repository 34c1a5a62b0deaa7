use crate::broadcast::BroadcastSpec;
use crate::config::StageConfig;
use crate::io::ReadOptions;
use crate::runner::{Runner, StageReport, StageSpec};
use crate::transform::{CandidateScorer, FieldPair, default_field_pairs};
use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;

pub const DEFAULT_THRESHOLD: f64 = 0.02;

fn default_threshold() -> f64 {
    DEFAULT_THRESHOLD
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CandidatesConfig {
    /// Primary table; its first column is the row index.
    pub left: PathBuf,
    /// Reference table broadcast to every worker.
    pub right: PathBuf,
    pub output: PathBuf,
    #[serde(default = "default_threshold")]
    pub threshold: f64,
    #[serde(default = "default_field_pairs")]
    pub pairs: Vec<FieldPair>,
}

impl CandidatesConfig {
    pub fn new(
        left: impl Into<PathBuf>,
        right: impl Into<PathBuf>,
        output: impl Into<PathBuf>,
    ) -> Self {
        Self {
            left: left.into(),
            right: right.into(),
            output: output.into(),
            threshold: DEFAULT_THRESHOLD,
            pairs: default_field_pairs(),
        }
    }

    pub fn with_threshold(mut self, threshold: f64) -> Self {
        self.threshold = threshold;
        self
    }

    pub fn with_pairs(mut self, pairs: Vec<FieldPair>) -> Self {
        self.pairs = pairs;
        self
    }

    pub fn spec(&self) -> Result<StageSpec> {
        let scorer = CandidateScorer::new(self.pairs.clone(), self.threshold)?;
        let read = ReadOptions::default().with_columns(scorer.left_fields());
        let broadcast = BroadcastSpec::new(
            &self.right,
            ReadOptions::default().with_columns(scorer.right_fields()),
        );
        Ok(StageSpec::new("candidates", &self.left, &self.output, Arc::new(scorer))
            .with_read(read)
            .with_broadcast(broadcast))
    }
}

/// Generate candidate pairs.
pub fn run(cfg: &CandidatesConfig, stage: &StageConfig) -> Result<StageReport> {
    Runner::new(stage.clone()).run(cfg.spec()?)
}
