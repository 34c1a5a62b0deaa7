//! Model-based classification of scored candidate pairs.

use super::Transform;
use crate::broadcast::BroadcastTable;
use crate::error::StageError;
use crate::schema::{Column, Schema};
use crate::table::{Chunk, OutputRecord};
use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;

pub const LEFT_INDEX: &str = "left_index";
pub const RIGHT_INDEX: &str = "right_index";
pub const PREDICTION: &str = "prediction_prob";

/// A fitted probabilistic classifier over a numeric feature vector.
pub trait Classifier: Send + Sync {
    /// Feature columns the model was fitted on, if it records them.
    fn feature_names(&self) -> Option<&[String]>;

    /// Expected feature vector length.
    fn n_features(&self) -> usize;

    /// Probability of the positive class.
    fn predict_proba(&self, features: &[f64]) -> f64;
}

/// Logistic model: `sigmoid(intercept + coefficients · x)`.
///
/// The model artifact is JSON:
/// `{"intercept": -3.1, "coefficients": [..], "feature_names": [..]}`
/// with `feature_names` optional.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct LogisticModel {
    pub intercept: f64,
    pub coefficients: Vec<f64>,
    #[serde(default)]
    pub feature_names: Option<Vec<String>>,
}

impl LogisticModel {
    /// Load and check a model artifact.
    ///
    /// # Errors
    /// `IOError` if the file cannot be read; `Config` if it is not a valid
    /// model or its feature names disagree with its coefficients.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|e| StageError::io(path, e))?;
        let model: LogisticModel = serde_json::from_str(&text)
            .map_err(|e| StageError::config(format!("model {}: {e}", path.display())))?;
        model.check()?;
        Ok(model)
    }

    fn check(&self) -> Result<()> {
        if self.coefficients.is_empty() {
            return Err(StageError::config("model has no coefficients").into());
        }
        if let Some(names) = &self.feature_names
            && names.len() != self.coefficients.len()
        {
            return Err(StageError::config(format!(
                "model lists {} feature names for {} coefficients",
                names.len(),
                self.coefficients.len()
            ))
            .into());
        }
        Ok(())
    }
}

impl Classifier for LogisticModel {
    fn feature_names(&self) -> Option<&[String]> {
        self.feature_names.as_deref()
    }

    fn n_features(&self) -> usize {
        self.coefficients.len()
    }

    fn predict_proba(&self, features: &[f64]) -> f64 {
        let z = self.intercept
            + self
                .coefficients
                .iter()
                .zip(features)
                .map(|(c, x)| c * x)
                .sum::<f64>();
        1.0 / (1.0 + (-z).exp())
    }
}

/// Scores each candidate pair and keeps those above `threshold`.
pub struct ClassifyTransform {
    model: Arc<dyn Classifier>,
    threshold: f64,
}

impl ClassifyTransform {
    pub fn new(model: Arc<dyn Classifier>, threshold: f64) -> Result<Self> {
        if !(0.0..=1.0).contains(&threshold) {
            return Err(StageError::config(format!(
                "classification threshold must be in [0, 1], got {threshold}"
            ))
            .into());
        }
        Ok(Self { model, threshold })
    }

    /// Positions of the model's features in `schema`: the named columns when
    /// the model records names, otherwise every column after the two keys.
    fn feature_positions(&self, schema: &Schema) -> Result<Vec<usize>> {
        let positions: Vec<usize> = match self.model.feature_names() {
            Some(names) => names
                .iter()
                .map(|n| schema.require(n, None))
                .collect::<Result<_>>()?,
            None => schema
                .columns()
                .iter()
                .enumerate()
                .filter(|(_, c)| c.name != LEFT_INDEX && c.name != RIGHT_INDEX)
                .map(|(i, _)| i)
                .collect(),
        };
        if positions.len() != self.model.n_features() {
            return Err(StageError::schema(
                None,
                format!(
                    "input has {} feature columns, model expects {}",
                    positions.len(),
                    self.model.n_features()
                ),
            )
            .into());
        }
        Ok(positions)
    }
}

impl Transform for ClassifyTransform {
    fn name(&self) -> &str {
        "classify"
    }

    fn output_schema(&self, input: &Schema) -> Result<Schema> {
        input.require(LEFT_INDEX, None)?;
        input.require(RIGHT_INDEX, None)?;
        self.feature_positions(input)?;
        Ok(Schema::new(vec![
            Column::numeric(LEFT_INDEX),
            Column::numeric(RIGHT_INDEX),
            Column::numeric(PREDICTION),
        ]))
    }

    fn apply(
        &self,
        chunk: &Chunk,
        _broadcast: Option<&BroadcastTable>,
    ) -> Result<Vec<OutputRecord>> {
        let left = chunk.column(LEFT_INDEX)?;
        let right = chunk.column(RIGHT_INDEX)?;
        let features = self.feature_positions(&chunk.schema)?;

        let mut x = vec![0.0; features.len()];
        let mut out = Vec::new();
        for (r, row) in chunk.rows.iter().enumerate() {
            for (slot, &c) in x.iter_mut().zip(&features) {
                let cell = row.values[c].trim();
                *slot = cell.parse::<f64>().map_err(|_| {
                    anyhow!(
                        "row {}: feature {:?} is not numeric: {:?}",
                        row.index,
                        chunk.schema.columns()[c].name,
                        cell
                    )
                })?;
            }
            let p = self.model.predict_proba(&x);
            if p > self.threshold {
                let l = chunk.index_at(r, left).context("left_index")?;
                let rr = chunk.index_at(r, right).context("right_index")?;
                out.push(OutputRecord::keyed(&[l, rr], [format!("{p:.4}")]));
            }
        }
        Ok(out)
    }
}
