//! Feature rescoring of decorated candidate pairs.

use super::Transform;
use super::preprocess::{Preprocessor, TextPreprocessor};
use super::similarity::{overlap_coefficient, token_set_ratio};
use crate::broadcast::BroadcastTable;
use crate::error::StageError;
use crate::schema::{Column, Schema};
use crate::table::{Chunk, OutputRecord, format_score};
use anyhow::Result;
use std::sync::Arc;

/// Shingle length for the overlap coefficient.
pub const SHINGLE_K: usize = 3;

/// Adds `overlapIJ` and `ratioIJ` for every (left field I, right field J)
/// pair to each row. Decorated text columns are dropped from the output;
/// every other input column passes through. No rows are filtered.
pub struct FeatureRescorer {
    left_fields: Vec<String>,
    right_fields: Vec<String>,
    preprocessor: Arc<dyn Preprocessor>,
}

impl FeatureRescorer {
    pub fn new<L, R, S>(left_fields: L, right_fields: R) -> Result<Self>
    where
        L: IntoIterator<Item = S>,
        R: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let left_fields: Vec<String> = left_fields.into_iter().map(Into::into).collect();
        let right_fields: Vec<String> = right_fields.into_iter().map(Into::into).collect();
        if left_fields.is_empty() || right_fields.is_empty() {
            return Err(StageError::config("rescoring needs left and right fields").into());
        }
        Ok(Self {
            left_fields,
            right_fields,
            preprocessor: Arc::new(TextPreprocessor::standard()),
        })
    }

    pub fn with_preprocessor(mut self, preprocessor: Arc<dyn Preprocessor>) -> Self {
        self.preprocessor = preprocessor;
        self
    }

    pub fn left_fields(&self) -> &[String] {
        &self.left_fields
    }

    pub fn right_fields(&self) -> &[String] {
        &self.right_fields
    }

    /// Names of the added feature columns, in output order.
    pub fn feature_columns(&self) -> Vec<String> {
        let mut out = Vec::new();
        for i in 1..=self.left_fields.len() {
            for j in 1..=self.right_fields.len() {
                out.push(format!("overlap{i}{j}"));
                out.push(format!("ratio{i}{j}"));
            }
        }
        out
    }

    fn is_text_field(&self, name: &str) -> bool {
        self.left_fields.iter().chain(&self.right_fields).any(|f| f == name)
    }

    fn passthrough(&self, input: &Schema) -> Vec<usize> {
        input
            .columns()
            .iter()
            .enumerate()
            .filter(|(_, c)| !self.is_text_field(&c.name))
            .map(|(i, _)| i)
            .collect()
    }
}

impl Transform for FeatureRescorer {
    fn name(&self) -> &str {
        "rescore"
    }

    fn output_schema(&self, input: &Schema) -> Result<Schema> {
        for f in self.left_fields.iter().chain(&self.right_fields) {
            input.require(f, None)?;
        }
        let mut cols: Vec<Column> = self
            .passthrough(input)
            .into_iter()
            .map(|i| input.columns()[i].clone())
            .collect();
        cols.extend(self.feature_columns().into_iter().map(Column::numeric));
        Ok(Schema::new(cols))
    }

    fn apply(
        &self,
        chunk: &Chunk,
        _broadcast: Option<&BroadcastTable>,
    ) -> Result<Vec<OutputRecord>> {
        let keep = self.passthrough(&chunk.schema);
        let lcols = self
            .left_fields
            .iter()
            .map(|f| chunk.column(f))
            .collect::<Result<Vec<_>>>()?;
        let rcols = self
            .right_fields
            .iter()
            .map(|f| chunk.column(f))
            .collect::<Result<Vec<_>>>()?;

        let mut out = Vec::with_capacity(chunk.len());
        for row in &chunk.rows {
            let left: Vec<String> = lcols
                .iter()
                .map(|&c| self.preprocessor.process(&row.values[c]))
                .collect();
            let right: Vec<String> = rcols
                .iter()
                .map(|&c| self.preprocessor.process(&row.values[c]))
                .collect();

            let mut cells: Vec<String> = keep.iter().map(|&c| row.values[c].clone()).collect();
            for l in &left {
                for r in &right {
                    cells.push(format_score(overlap_coefficient(l, r, SHINGLE_K)));
                    cells.push(format_score(token_set_ratio(l, r)));
                }
            }
            out.push(OutputRecord::new(cells));
        }
        Ok(out)
    }
}
