//! Rule-based urgency classifier.
//!
//! Counts urgency keywords and exclamation marks in the subject and body.
//! Any keyword hit marks the message urgent; otherwise the combined score
//! must reach [`URGENT_THRESHOLD`]. The summary is the leading body text.

use async_trait::async_trait;
use regex::RegexSet;

use crate::error::{ClassifyError, ConfigError};
use crate::pipeline::classifier::truncate_chars;
use crate::pipeline::types::{Classification, Classifier};

pub const DEFAULT_KEYWORDS: &[&str] = &[
    "urgent",
    "asap",
    "immediately",
    "important",
    "high priority",
    "action required",
    "critical",
    "deadline",
    "response needed",
    "reply needed",
    "time-sensitive",
];

const KEYWORD_WEIGHT: f32 = 0.2;
const EXCLAMATION_WEIGHT: f32 = 0.1;
const MAX_EXCLAMATIONS: usize = 3;
pub const URGENT_THRESHOLD: f32 = 0.5;

/// Bodies shorter than this many words are used verbatim as the summary.
const SHORT_BODY_WORDS: usize = 20;
const SUMMARY_MAX_CHARS: usize = 280;

pub struct KeywordClassifier {
    keywords: RegexSet,
}

impl KeywordClassifier {
    /// Build a classifier matching each keyword case-insensitively as a substring.
    pub fn new<I, S>(keywords: I) -> Result<Self, ConfigError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let patterns: Vec<String> = keywords
            .into_iter()
            .map(|k| k.as_ref().trim().to_string())
            .filter(|k| !k.is_empty())
            .map(|k| format!("(?i){}", regex::escape(&k)))
            .collect();
        let keywords = RegexSet::new(&patterns).map_err(|e| ConfigError::InvalidValue {
            key: "TRIAGE_URGENT_KEYWORDS".into(),
            message: e.to_string(),
        })?;
        Ok(Self { keywords })
    }

    pub fn with_default_keywords() -> Result<Self, ConfigError> {
        Self::new(DEFAULT_KEYWORDS)
    }

    /// Keyword list from `TRIAGE_URGENT_KEYWORDS` (comma separated), or the defaults.
    pub fn from_env() -> Result<Self, ConfigError> {
        match std::env::var("TRIAGE_URGENT_KEYWORDS") {
            Ok(list) if !list.trim().is_empty() => Self::new(list.split(',')),
            _ => Self::with_default_keywords(),
        }
    }

    /// `(is_urgent, score)` for the given text.
    pub fn score(&self, text: &str) -> (bool, f32) {
        let hits = self.keywords.matches(text).iter().count();
        let exclamations = text.matches('!').count().min(MAX_EXCLAMATIONS);
        let score =
            (hits as f32 * KEYWORD_WEIGHT + exclamations as f32 * EXCLAMATION_WEIGHT).min(1.0);
        (hits > 0 || score >= URGENT_THRESHOLD, score)
    }
}

#[async_trait]
impl Classifier for KeywordClassifier {
    async fn classify(&self, subject: &str, body: &str) -> Result<Classification, ClassifyError> {
        let text = format!("Subject: {subject}\n\nBody: {body}");
        let (is_urgent, score) = self.score(&text);
        Ok(Classification {
            is_urgent,
            summary: summarize(subject, body),
            confidence: Some(score),
        })
    }
}

fn summarize(subject: &str, body: &str) -> String {
    let body = body.trim();
    if body.is_empty() {
        return truncate_chars(subject.trim(), SUMMARY_MAX_CHARS).to_string();
    }
    if body.split_whitespace().count() < SHORT_BODY_WORDS {
        return truncate_chars(body, SUMMARY_MAX_CHARS).to_string();
    }
    let lead = truncate_chars(body, SUMMARY_MAX_CHARS);
    if lead.len() < body.len() {
        format!("{}...", lead.trim_end())
    } else {
        lead.to_string()
    }
}
