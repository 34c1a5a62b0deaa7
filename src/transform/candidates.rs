//! Candidate generation: fuzzy n-gram matching of chunk rows against the
//! broadcast table.

use super::{Prepared, Transform};
use super::preprocess::{Preprocessor, TextPreprocessor};
use super::similarity::{Analyzer, TermIndex, TermVector};
use crate::broadcast::BroadcastTable;
use crate::error::StageError;
use crate::schema::{Column, Schema};
use crate::table::{Chunk, OutputRecord, format_score};
use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};
use std::any::Any;
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

pub const WEIGHTED_SCORE: &str = "Weighted Mean Similarity Score";

fn default_min_similarity() -> f64 {
    0.2
}

/// One compared field pair and its weight in the combined score.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FieldPair {
    /// Column of the primary (chunked) table.
    pub left: String,
    /// Column of the broadcast table.
    pub right: String,
    pub weight: f64,
    pub analyzer: Analyzer,
    /// Pair scores below this count as zero.
    #[serde(default = "default_min_similarity")]
    pub min_similarity: f64,
}

impl FieldPair {
    pub fn new(left: &str, right: &str, weight: f64, analyzer: Analyzer) -> Self {
        Self {
            left: left.to_string(),
            right: right.to_string(),
            weight,
            analyzer,
            min_similarity: default_min_similarity(),
        }
    }
}

/// Supplier/ship-to vs partner-name/DBA, each with word and char_wb n-grams.
pub fn default_field_pairs() -> Vec<FieldPair> {
    let word = Analyzer::Word { min_n: 1, max_n: 2 };
    let chars = Analyzer::CharWb { min_n: 5, max_n: 7 };
    vec![
        FieldPair::new("Supplier", "Partner_Name", 1.0, word),
        FieldPair::new("Supplier", "Partner_Name", 0.2, chars),
        FieldPair::new("Supplier", "DBA", 0.8, word),
        FieldPair::new("Supplier", "DBA", 0.7, chars),
        FieldPair::new("Invoice_Ship_to_Address", "Partner_Name", 0.3, word),
        FieldPair::new("Invoice_Ship_to_Address", "Partner_Name", 0.25, chars),
        FieldPair::new("Invoice_Ship_to_Address", "DBA", 0.5, word),
        FieldPair::new("Invoice_Ship_to_Address", "DBA", 0.1, chars),
    ]
}

/// Read field pairs from a JSON array.
pub fn load_field_pairs(path: impl AsRef<Path>) -> Result<Vec<FieldPair>> {
    let path = path.as_ref();
    let text = std::fs::read_to_string(path).map_err(|e| StageError::io(path, e))?;
    let pairs: Vec<FieldPair> = serde_json::from_str(&text)
        .map_err(|e| StageError::config(format!("{}: {e}", path.display())))?;
    Ok(pairs)
}

/// Scores every chunk row against every broadcast row and keeps pairs whose
/// weighted mean similarity exceeds the threshold.
pub struct CandidateScorer {
    pairs: Vec<FieldPair>,
    threshold: f64,
    preprocessor: Arc<dyn Preprocessor>,
}

impl CandidateScorer {
    /// # Errors
    /// `Config` if there are no pairs, a weight is negative, all weights are
    /// zero, or the threshold is negative.
    pub fn new(pairs: Vec<FieldPair>, threshold: f64) -> Result<Self> {
        if pairs.is_empty() {
            return Err(StageError::config("at least one field pair is required").into());
        }
        if pairs.iter().any(|p| p.weight < 0.0) || pairs.iter().map(|p| p.weight).sum::<f64>() <= 0.0
        {
            return Err(StageError::config("field pair weights must be >= 0 and not all zero").into());
        }
        if !(threshold >= 0.0) {
            return Err(StageError::config(format!("threshold must be >= 0, got {threshold}")).into());
        }
        Ok(Self {
            pairs,
            threshold,
            preprocessor: Arc::new(TextPreprocessor::standard().with_recipient_extraction(true)),
        })
    }

    pub fn with_preprocessor(mut self, preprocessor: Arc<dyn Preprocessor>) -> Self {
        self.preprocessor = preprocessor;
        self
    }

    pub fn pairs(&self) -> &[FieldPair] {
        &self.pairs
    }

    /// Primary-table columns the scorer reads, deduplicated, in pair order.
    pub fn left_fields(&self) -> Vec<String> {
        unique(self.pairs.iter().map(|p| p.left.as_str()))
    }

    /// Broadcast-table columns the scorer reads.
    pub fn right_fields(&self) -> Vec<String> {
        unique(self.pairs.iter().map(|p| p.right.as_str()))
    }

    fn vectors(&self, texts: &[&str], analyzer: Analyzer) -> Vec<TermVector> {
        texts
            .iter()
            .map(|t| TermVector::new(&self.preprocessor.process(t), analyzer))
            .collect()
    }

    /// Postings over the broadcast side, one per field pair.
    pub fn index(&self, right: &BroadcastTable) -> Result<ReferenceIndex> {
        let right_rows: Vec<(u64, &[String])> = right.iter().collect();
        let mut pairs = Vec::with_capacity(self.pairs.len());
        for p in &self.pairs {
            let rcol = right
                .schema()
                .require(&p.right, None)
                .context("broadcast table")?;
            let rtexts: Vec<&str> = right_rows.iter().map(|(_, v)| v[rcol].as_str()).collect();
            pairs.push(TermIndex::build(&self.vectors(&rtexts, p.analyzer)));
        }
        Ok(ReferenceIndex {
            right_index: right_rows.iter().map(|(i, _)| *i).collect(),
            pairs,
        })
    }

    fn score(&self, chunk: &Chunk, reference: &ReferenceIndex) -> Result<Vec<OutputRecord>> {
        let total_weight: f64 = self.pairs.iter().map(|p| p.weight).sum();
        let mut lvecs = Vec::with_capacity(self.pairs.len());
        for p in &self.pairs {
            let lcol = chunk.column(&p.left)?;
            let ltexts: Vec<&str> = chunk.rows.iter().map(|r| r.values[lcol].as_str()).collect();
            lvecs.push(self.vectors(&ltexts, p.analyzer));
        }

        let mut out = Vec::new();
        for (li, row) in chunk.rows.iter().enumerate() {
            // right position -> score per pair
            let mut hits: BTreeMap<usize, Vec<f64>> = BTreeMap::new();
            for (k, (p, (index, vecs))) in self
                .pairs
                .iter()
                .zip(reference.pairs.iter().zip(&lvecs))
                .enumerate()
            {
                for (ri, s) in index.scores(&vecs[li]) {
                    if s >= p.min_similarity && s > 0.0 {
                        hits.entry(ri).or_insert_with(|| vec![0.0; self.pairs.len()])[k] = s;
                    }
                }
            }
            for (ri, scores) in hits {
                let weighted = self
                    .pairs
                    .iter()
                    .zip(&scores)
                    .map(|(p, s)| p.weight * s)
                    .sum::<f64>()
                    / total_weight;
                if weighted > self.threshold {
                    let mut cells = vec![format_score(weighted)];
                    cells.extend(scores.iter().map(|s| format_score(*s)));
                    out.push(OutputRecord::keyed(&[row.index, reference.right_index[ri]], cells));
                }
            }
        }
        Ok(out)
    }
}

/// Broadcast-side postings for every field pair of a [`CandidateScorer`].
/// Built once per worker and reused for every chunk.
#[derive(Debug)]
pub struct ReferenceIndex {
    right_index: Vec<u64>,
    pairs: Vec<TermIndex>,
}

impl ReferenceIndex {
    /// Number of indexed broadcast rows.
    pub fn len(&self) -> usize {
        self.right_index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.right_index.is_empty()
    }
}

fn unique<'a>(names: impl Iterator<Item = &'a str>) -> Vec<String> {
    let mut out: Vec<String> = Vec::new();
    for n in names {
        if !out.iter().any(|o| o == n) {
            out.push(n.to_string());
        }
    }
    out
}

impl Transform for CandidateScorer {
    fn name(&self) -> &str {
        "candidates"
    }

    fn output_schema(&self, input: &Schema) -> Result<Schema> {
        for f in self.left_fields() {
            input.require(&f, None)?;
        }
        let mut cols = vec![
            Column::numeric("left_index"),
            Column::numeric("right_index"),
            Column::numeric(WEIGHTED_SCORE),
        ];
        cols.extend(
            self.pairs
                .iter()
                .enumerate()
                .map(|(k, p)| Column::numeric(format!("{k}:{}/{}", p.left, p.right))),
        );
        Ok(Schema::new(cols))
    }

    fn prepare(&self, broadcast: Option<&BroadcastTable>) -> Result<Option<Prepared>> {
        let right = broadcast.ok_or_else(|| anyhow!("candidate scoring needs a broadcast table"))?;
        Ok(Some(Box::new(self.index(right)?)))
    }

    fn apply(
        &self,
        chunk: &Chunk,
        broadcast: Option<&BroadcastTable>,
    ) -> Result<Vec<OutputRecord>> {
        let right = broadcast.ok_or_else(|| anyhow!("candidate scoring needs a broadcast table"))?;
        self.score(chunk, &self.index(right)?)
    }

    fn apply_prepared(
        &self,
        chunk: &Chunk,
        broadcast: Option<&BroadcastTable>,
        prepared: Option<&(dyn Any + Send + Sync)>,
    ) -> Result<Vec<OutputRecord>> {
        match prepared.and_then(|p| p.downcast_ref::<ReferenceIndex>()) {
            Some(index) => self.score(chunk, index),
            None => self.apply(chunk, broadcast),
        }
    }
}
