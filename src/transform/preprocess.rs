//! Text normalization applied before similarity scoring.

use regex::Regex;

/// Company-name noise words removed before comparison.
pub const STOPWORDS: &[&str] = &[
    "a", "an", "and", "the", "of", "for", "at", "by", "in", "on", "to", "dba",
    "inc", "incorporated", "llc", "l.l.c", "llp", "lp", "ltd", "limited",
    "corp", "corporation", "co", "company", "companies", "group", "pc", "pllc",
    "plc", "na", "usa", "us",
];

/// Normalizes one free-text field to its salient tokens.
pub trait Preprocessor: Send + Sync {
    fn process(&self, text: &str) -> String;
}

impl<F> Preprocessor for F
where
    F: Fn(&str) -> String + Send + Sync,
{
    fn process(&self, text: &str) -> String {
        self(text)
    }
}

/// Lower-case, optionally keep only the recipient part of an address-like
/// string, then drop stopwords and collapse whitespace.
#[derive(Clone, Debug)]
pub struct TextPreprocessor {
    stopwords: Option<Regex>,
    extract_recipient: bool,
}

impl TextPreprocessor {
    /// Preprocessor removing the given stopwords (matched on word boundaries).
    pub fn new(stopwords: &[&str]) -> Self {
        let stopwords = if stopwords.is_empty() {
            None
        } else {
            let alternation = stopwords
                .iter()
                .map(|w| regex::escape(w))
                .collect::<Vec<_>>()
                .join("|");
            // Built only from escaped literals; cannot fail.
            Regex::new(&format!(r"\b(?:{alternation})\b")).ok()
        };
        Self {
            stopwords,
            extract_recipient: false,
        }
    }

    /// [`STOPWORDS`], no recipient extraction.
    pub fn standard() -> Self {
        Self::new(STOPWORDS)
    }

    pub fn with_recipient_extraction(mut self, on: bool) -> Self {
        self.extract_recipient = on;
        self
    }
}

impl Default for TextPreprocessor {
    fn default() -> Self {
        Self::standard()
    }
}

impl Preprocessor for TextPreprocessor {
    fn process(&self, text: &str) -> String {
        let mut s = text.to_lowercase();
        if self.extract_recipient {
            s = extract_recipient(&s);
        }
        if let Some(re) = &self.stopwords {
            s = re.replace_all(&s, " ").into_owned();
        }
        s.split_whitespace().collect::<Vec<_>>().join(" ")
    }
}

/// Leading name tokens of an address-like string.
///
/// Stops at the first token that looks like the start of a street address or
/// mailbox: one beginning with a digit or `#`, or a `po`/`box` marker. A
/// string that starts with an address yields `""`.
pub fn extract_recipient(text: &str) -> String {
    let mut out: Vec<&str> = Vec::new();
    for token in text.split_whitespace() {
        if is_address_token(token) {
            break;
        }
        out.push(token);
    }
    out.join(" ")
}

fn is_address_token(token: &str) -> bool {
    let first = token.chars().next();
    if first.is_some_and(|c| c.is_ascii_digit() || c == '#') {
        return true;
    }
    let bare: String = token
        .chars()
        .filter(|c| c.is_alphanumeric())
        .collect::<String>()
        .to_lowercase();
    matches!(bare.as_str(), "po" | "box" | "pobox")
}
