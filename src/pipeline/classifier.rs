//! Classifier gateway: body selection, truncation and timeout around a
//! black-box [`Classifier`].

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};

use crate::error::ClassifyError;
use crate::pipeline::retry::{Attempted, RetryPolicy, retry};
use crate::pipeline::types::{AnalysisResult, Classifier, Message};

pub struct ClassifierGateway {
    classifier: Arc<dyn Classifier>,
    max_body_chars: usize,
    timeout: Duration,
    policy: RetryPolicy,
}

impl ClassifierGateway {
    pub fn new(
        classifier: Arc<dyn Classifier>,
        max_body_chars: usize,
        timeout: Duration,
        policy: RetryPolicy,
    ) -> Self {
        Self {
            classifier,
            max_body_chars,
            timeout,
            policy,
        }
    }

    /// Classify a message. Timeouts and backend errors both surface as
    /// `ClassifyError::Unavailable` once retries are exhausted.
    pub async fn analyze(&self, message: &Message) -> Attempted<AnalysisResult, ClassifyError> {
        let body = select_body(message);
        let body = truncate_chars(&body, self.max_body_chars);

        let classifier = &self.classifier;
        let subject = message.subject.as_str();
        let timeout = self.timeout;
        let out = retry(
            &self.policy,
            "classify",
            move || {
                let call = classifier.classify(subject, body);
                async move {
                    match tokio::time::timeout(timeout, call).await {
                        Ok(result) => result,
                        Err(_) => Err(ClassifyError::Unavailable(format!(
                            "timed out after {}ms",
                            timeout.as_millis()
                        ))),
                    }
                }
            },
            |_| true,
        )
        .await;

        match &out.result {
            Ok(c) => debug!(
                message_id = %message.id,
                urgent = c.is_urgent,
                confidence = ?c.confidence,
                "Classified"
            ),
            Err(e) => warn!(message_id = %message.id, error = %e, "Classification unavailable"),
        }

        Attempted {
            result: out.result.map(|c| AnalysisResult {
                message_id: message.id.clone(),
                is_urgent: c.is_urgent,
                summary: c.summary,
                confidence: c.confidence,
            }),
            attempts: out.attempts,
        }
    }
}

/// Best available body text: the plain part, or the HTML part reduced to
/// text when the plain part is blank.
pub fn select_body(message: &Message) -> String {
    if !message.body_plain.trim().is_empty() {
        return message.body_plain.clone();
    }
    message
        .body_html
        .as_deref()
        .map(strip_html)
        .unwrap_or_default()
}

/// First `max_chars` characters of `text`, cut on a char boundary.
pub fn truncate_chars(text: &str, max_chars: usize) -> &str {
    match text.char_indices().nth(max_chars) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}

/// Strip HTML tags, drop `<script>`/`<style>` contents, decode common
/// entities and normalize whitespace.
pub fn strip_html(html: &str) -> String {
    let mut result = String::with_capacity(html.len());
    let mut in_tag = false;
    let mut tag = String::new();
    let mut skip_until: Option<&'static str> = None;

    for ch in html.chars() {
        match ch {
            '<' => {
                in_tag = true;
                tag.clear();
            }
            '>' if in_tag => {
                in_tag = false;
                let name = tag_name(&tag);
                match (skip_until, name.as_str()) {
                    (None, "script") => skip_until = Some("/script"),
                    (None, "style") => skip_until = Some("/style"),
                    (Some(end), n) if n == end => skip_until = None,
                    _ => {}
                }
                // Tags separate words.
                result.push(' ');
            }
            _ if in_tag => tag.push(ch),
            _ if skip_until.is_none() => result.push(ch),
            _ => {}
        }
    }

    decode_entities(&result)
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

/// Lowercased element name, with a leading `/` for closing tags.
fn tag_name(tag: &str) -> String {
    let tag = tag.trim_start();
    let (closing, rest) = match tag.strip_prefix('/') {
        Some(rest) => (true, rest),
        None => (false, tag),
    };
    let name: String = rest
        .chars()
        .take_while(|c| c.is_ascii_alphanumeric())
        .collect::<String>()
        .to_ascii_lowercase();
    if closing { format!("/{name}") } else { name }
}

fn decode_entities(text: &str) -> String {
    text.replace("&nbsp;", " ")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&#39;", "'")
        .replace("&apos;", "'")
        .replace("&amp;", "&")
}
