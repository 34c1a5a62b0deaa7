use crate::broadcast::BroadcastSpec;
use crate::config::StageConfig;
use crate::io::{IndexColumn, ReadOptions, RowFilter};
use crate::join::Decorator;
use crate::runner::{Runner, StageReport, StageSpec};
use crate::transform::FeatureRescorer;
use crate::transform::classify::{LEFT_INDEX, RIGHT_INDEX};
use anyhow::Result;
use log::info;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;

fn default_left_fields() -> Vec<String> {
    vec!["Supplier".into(), "Invoice_Ship_to_Address".into()]
}

fn default_right_fields() -> Vec<String> {
    vec!["Partner_Name".into(), "DBA".into()]
}

/// Keep only rows whose `column` equals `value`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct EqualityFilter {
    pub column: String,
    pub value: String,
}

impl EqualityFilter {
    /// Parse `COLUMN=VALUE`.
    pub fn parse(s: &str) -> Option<Self> {
        let (column, value) = s.split_once('=')?;
        let column = column.trim();
        if column.is_empty() {
            return None;
        }
        Some(Self {
            column: column.to_string(),
            value: value.to_string(),
        })
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RescoreConfig {
    /// Output of the candidate stage.
    pub candidates: PathBuf,
    pub left: PathBuf,
    pub right: PathBuf,
    pub output: PathBuf,
    #[serde(default = "default_left_fields")]
    pub left_fields: Vec<String>,
    #[serde(default = "default_right_fields")]
    pub right_fields: Vec<String>,
    /// Restrict the left table before lookup.
    #[serde(default)]
    pub left_filter: Option<EqualityFilter>,
}

impl RescoreConfig {
    pub fn new(
        candidates: impl Into<PathBuf>,
        left: impl Into<PathBuf>,
        right: impl Into<PathBuf>,
        output: impl Into<PathBuf>,
    ) -> Self {
        Self {
            candidates: candidates.into(),
            left: left.into(),
            right: right.into(),
            output: output.into(),
            left_fields: default_left_fields(),
            right_fields: default_right_fields(),
            left_filter: None,
        }
    }

    pub fn with_left_filter(mut self, filter: Option<EqualityFilter>) -> Self {
        self.left_filter = filter;
        self
    }

    pub fn with_fields(mut self, left: Vec<String>, right: Vec<String>) -> Self {
        self.left_fields = left;
        self.right_fields = right;
        self
    }

    /// Loads both lookup tables, so this already checks their budgets.
    pub fn spec(&self, stage: &StageConfig) -> Result<StageSpec> {
        let rescorer = FeatureRescorer::new(self.left_fields.clone(), self.right_fields.clone())?;

        let mut left_opts = ReadOptions::default().with_columns(self.left_fields.clone());
        if let Some(f) = &self.left_filter {
            left_opts = left_opts.with_filter(RowFilter::equals(&f.column, &f.value));
        }
        let left = BroadcastSpec::new(&self.left, left_opts)
            .with_max_bytes(stage.broadcast_max_bytes);
        let right = BroadcastSpec::new(
            &self.right,
            ReadOptions::default().with_columns(self.right_fields.clone()),
        )
        .with_max_bytes(stage.broadcast_max_bytes);
        left.check_capacity()?;
        right.check_capacity()?;
        let left = left.load()?;
        let right = right.load()?;
        info!(
            "rescore lookups: {} left rows, {} right rows",
            left.len(),
            right.len()
        );

        let decorator = Decorator::new()
            .join(LEFT_INDEX, Arc::new(left))
            .join(RIGHT_INDEX, Arc::new(right));
        Ok(
            StageSpec::new("rescore", &self.candidates, &self.output, Arc::new(rescorer))
                .with_read(ReadOptions::default().with_index(IndexColumn::Ordinal))
                .with_decorator(decorator),
        )
    }
}

/// Compute similarity features for every candidate pair.
pub fn run(cfg: &RescoreConfig, stage: &StageConfig) -> Result<StageReport> {
    stage.validate()?;
    Runner::new(stage.clone()).run(cfg.spec(stage)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_equality_filter() {
        assert_eq!(
            EqualityFilter::parse("Fiscal_Year=2019"),
            Some(EqualityFilter {
                column: "Fiscal_Year".into(),
                value: "2019".into()
            })
        );
        assert_eq!(EqualityFilter::parse("=x"), None);
        assert_eq!(EqualityFilter::parse("novalue"), None);
    }
}
