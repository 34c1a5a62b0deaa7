use crate::config::StageConfig;
use crate::io::{IndexColumn, ReadOptions};
use crate::runner::{Runner, StageReport, StageSpec};
use crate::transform::{ClassifyTransform, LogisticModel};
use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;

pub const DEFAULT_THRESHOLD: f64 = 0.5;

fn default_threshold() -> f64 {
    DEFAULT_THRESHOLD
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ClassifyConfig {
    /// Output of the rescore stage.
    pub scores: PathBuf,
    /// JSON model artifact (see [`LogisticModel`]).
    pub model: PathBuf,
    pub output: PathBuf,
    #[serde(default = "default_threshold")]
    pub threshold: f64,
}

impl ClassifyConfig {
    pub fn new(
        scores: impl Into<PathBuf>,
        model: impl Into<PathBuf>,
        output: impl Into<PathBuf>,
    ) -> Self {
        Self {
            scores: scores.into(),
            model: model.into(),
            output: output.into(),
            threshold: DEFAULT_THRESHOLD,
        }
    }

    pub fn with_threshold(mut self, threshold: f64) -> Self {
        self.threshold = threshold;
        self
    }

    /// Loads the model once; workers share it read-only.
    pub fn spec(&self) -> Result<StageSpec> {
        let model = LogisticModel::load(&self.model)?;
        let transform = ClassifyTransform::new(Arc::new(model), self.threshold)?;
        Ok(
            StageSpec::new("classify", &self.scores, &self.output, Arc::new(transform))
                .with_read(ReadOptions::default().with_index(IndexColumn::Ordinal)),
        )
    }
}

/// Keep candidate pairs the model scores above the threshold.
pub fn run(cfg: &ClassifyConfig, stage: &StageConfig) -> Result<StageReport> {
    Runner::new(stage.clone()).run(cfg.spec()?)
}
