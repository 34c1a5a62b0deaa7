//! String similarity primitives.
//!
//! Every measure here returns a value in `[0, 1]`, and any comparison with an
//! empty operand scores `0.0`. Two empty strings are *not* similar: treating
//! them as identical would make missing data look like a perfect match.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::LazyLock;

static WORD: LazyLock<Regex> = LazyLock::new(|| {
    // Same token rule as common TF-IDF vectorizers: two or more word chars.
    Regex::new(r"\w\w+").expect("static token pattern")
});

/// How a string is split into n-gram terms.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Analyzer {
    /// Word n-grams over tokens of two or more word characters.
    Word { min_n: usize, max_n: usize },
    /// Character n-grams inside word boundaries; each word is padded with a
    /// space on both sides.
    CharWb { min_n: usize, max_n: usize },
}

impl Analyzer {
    pub fn terms(&self, text: &str) -> Vec<String> {
        match *self {
            Analyzer::Word { min_n, max_n } => word_ngrams(text, min_n, max_n),
            Analyzer::CharWb { min_n, max_n } => char_wb_ngrams(text, min_n, max_n),
        }
    }
}

fn word_ngrams(text: &str, min_n: usize, max_n: usize) -> Vec<String> {
    let tokens: Vec<&str> = WORD.find_iter(text).map(|m| m.as_str()).collect();
    let mut out = Vec::new();
    for n in min_n.max(1)..=max_n {
        if n > tokens.len() {
            break;
        }
        for w in tokens.windows(n) {
            out.push(w.join(" "));
        }
    }
    out
}

fn char_wb_ngrams(text: &str, min_n: usize, max_n: usize) -> Vec<String> {
    let mut out = Vec::new();
    for word in text.split_whitespace() {
        let padded: Vec<char> = std::iter::once(' ')
            .chain(word.chars())
            .chain(std::iter::once(' '))
            .collect();
        for n in min_n.max(1)..=max_n {
            if padded.len() <= n {
                // Short words contribute themselves once.
                out.push(padded.iter().collect());
                break;
            }
            for w in padded.windows(n) {
                out.push(w.iter().collect());
            }
        }
    }
    out
}

/// L2-normalized term-frequency vector.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct TermVector {
    weights: HashMap<String, f64>,
}

impl TermVector {
    pub fn new(text: &str, analyzer: Analyzer) -> Self {
        let mut counts: HashMap<String, f64> = HashMap::new();
        for t in analyzer.terms(text) {
            *counts.entry(t).or_insert(0.0) += 1.0;
        }
        let norm = counts.values().map(|v| v * v).sum::<f64>().sqrt();
        if norm > 0.0 {
            for v in counts.values_mut() {
                *v /= norm;
            }
        }
        Self { weights: counts }
    }

    pub fn is_empty(&self) -> bool {
        self.weights.is_empty()
    }

    pub fn terms(&self) -> impl Iterator<Item = (&str, f64)> {
        self.weights.iter().map(|(k, v)| (k.as_str(), *v))
    }

    pub fn cosine(&self, other: &TermVector) -> f64 {
        let (small, large) = if self.weights.len() <= other.weights.len() {
            (self, other)
        } else {
            (other, self)
        };
        let dot: f64 = small
            .weights
            .iter()
            .filter_map(|(k, v)| large.weights.get(k).map(|w| v * w))
            .sum();
        dot.clamp(0.0, 1.0)
    }
}

/// Cosine similarity of the two strings' n-gram vectors.
pub fn ngram_similarity(a: &str, b: &str, analyzer: Analyzer) -> f64 {
    TermVector::new(a, analyzer).cosine(&TermVector::new(b, analyzer))
}

/// Postings list over a set of vectors, for sparse all-pairs cosine.
#[derive(Clone, Debug, Default)]
pub struct TermIndex {
    postings: HashMap<String, Vec<(usize, f64)>>,
}

impl TermIndex {
    pub fn build<'a, I>(vectors: I) -> Self
    where
        I: IntoIterator<Item = &'a TermVector>,
    {
        let mut postings: HashMap<String, Vec<(usize, f64)>> = HashMap::new();
        for (i, v) in vectors.into_iter().enumerate() {
            for (t, w) in v.terms() {
                postings.entry(t.to_string()).or_default().push((i, w));
            }
        }
        Self { postings }
    }

    /// Cosine of `query` against every indexed vector sharing a term with it.
    pub fn scores(&self, query: &TermVector) -> HashMap<usize, f64> {
        let mut acc: HashMap<usize, f64> = HashMap::new();
        for (t, w) in query.terms() {
            if let Some(list) = self.postings.get(t) {
                for &(i, v) in list {
                    *acc.entry(i).or_insert(0.0) += w * v;
                }
            }
        }
        for v in acc.values_mut() {
            *v = v.clamp(0.0, 1.0);
        }
        acc
    }
}

/// Character k-shingles after collapsing whitespace runs.
pub fn shingles(text: &str, k: usize) -> HashSet<String> {
    let collapsed = text.split_whitespace().collect::<Vec<_>>().join(" ");
    let chars: Vec<char> = collapsed.chars().collect();
    if k == 0 || chars.len() < k {
        return HashSet::new();
    }
    chars.windows(k).map(|w| w.iter().collect()).collect()
}

/// Overlap coefficient `|A ∩ B| / min(|A|, |B|)` over k-shingles.
///
/// Returns `0.0` when either string is empty or too short to shingle.
pub fn overlap_coefficient(a: &str, b: &str, k: usize) -> f64 {
    if a.is_empty() || b.is_empty() {
        return 0.0;
    }
    let sa = shingles(a, k);
    let sb = shingles(b, k);
    let smaller = sa.len().min(sb.len());
    if smaller == 0 {
        return 0.0;
    }
    sa.intersection(&sb).count() as f64 / smaller as f64
}

fn tokens(text: &str) -> Vec<String> {
    text.to_lowercase()
        .split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(str::to_string)
        .collect()
}

/// Token-set ratio: compares the shared tokens with each side's full token
/// set, so word order and extra tokens on one side are forgiven.
pub fn token_set_ratio(a: &str, b: &str) -> f64 {
    let ta: HashSet<String> = tokens(a).into_iter().collect();
    let tb: HashSet<String> = tokens(b).into_iter().collect();
    if ta.is_empty() || tb.is_empty() {
        return 0.0;
    }
    let sorted = |set: HashSet<&String>| {
        let mut v: Vec<&str> = set.into_iter().map(String::as_str).collect();
        v.sort_unstable();
        v.join(" ")
    };
    let sect = sorted(ta.intersection(&tb).collect());
    let only_a = sorted(ta.difference(&tb).collect());
    let only_b = sorted(tb.difference(&ta).collect());

    if !sect.is_empty() && (only_a.is_empty() || only_b.is_empty()) {
        return 1.0;
    }
    let join = |x: &str, y: &str| match (x.is_empty(), y.is_empty()) {
        (true, _) => y.to_string(),
        (_, true) => x.to_string(),
        _ => format!("{x} {y}"),
    };
    let full_a = join(&sect, &only_a);
    let full_b = join(&sect, &only_b);

    let mut best = strsim::normalized_levenshtein(&full_a, &full_b);
    if !sect.is_empty() {
        best = best
            .max(strsim::normalized_levenshtein(&sect, &full_a))
            .max(strsim::normalized_levenshtein(&sect, &full_b));
    }
    best.clamp(0.0, 1.0)
}
