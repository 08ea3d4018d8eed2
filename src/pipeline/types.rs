//! Shared types and boundary traits for the triage pipeline.

use std::fmt;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{ClassifyError, DeliveryError, FetchError, LabelError, ResolveError};

// ── Watermark ───────────────────────────────────────────────────────

/// Totally ordered position in a mailbox's change stream.
///
/// Only ever committed forward; see `CursorStore::commit`.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct Watermark(u64);

impl Watermark {
    /// Sentinel for a mailbox with no stored cursor.
    pub const BEGINNING: Self = Self(0);

    pub const fn new(position: u64) -> Self {
        Self(position)
    }

    pub const fn value(self) -> u64 {
        self.0
    }

    pub fn is_beginning(self) -> bool {
        self == Self::BEGINNING
    }

    /// The position immediately before this one (never below `BEGINNING`).
    pub fn preceding(self) -> Self {
        Self(self.0.saturating_sub(1))
    }

    pub fn rewind(self, positions: u64) -> Self {
        Self(self.0.saturating_sub(positions))
    }
}

impl fmt::Display for Watermark {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u64> for Watermark {
    fn from(value: u64) -> Self {
        Self(value)
    }
}

// ── Ingress ─────────────────────────────────────────────────────────

/// "New mail" notification. Delivered at-least-once, possibly out of order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Trigger {
    pub mailbox_id: String,
    /// Newest change-stream position the notifier knew about.
    pub sequence: Watermark,
}

impl Trigger {
    pub fn new(mailbox_id: impl Into<String>, sequence: impl Into<Watermark>) -> Self {
        Self {
            mailbox_id: mailbox_id.into(),
            sequence: sequence.into(),
        }
    }
}

// ── Changes ─────────────────────────────────────────────────────────

/// A single reported mutation mapping to a candidate message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeRecord {
    pub sequence: Watermark,
    pub message_id: String,
}

impl ChangeRecord {
    pub fn new(sequence: impl Into<Watermark>, message_id: impl Into<String>) -> Self {
        Self {
            sequence: sequence.into(),
            message_id: message_id.into(),
        }
    }
}

/// Raw change listing as returned by the upstream mail store.
///
/// May contain duplicates and arrive unordered.
#[derive(Debug, Clone, Default)]
pub struct ChangeSet {
    pub records: Vec<ChangeRecord>,
    /// The upstream's current position (commit target once all records settle).
    pub new_watermark: Watermark,
}

// ── Messages ────────────────────────────────────────────────────────

/// Normalized message content. Immutable once fetched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    /// Conversation the message belongs to, used for deep links.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thread_id: Option<String>,
    pub subject: String,
    pub sender: String,
    pub body_plain: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body_html: Option<String>,
    pub received_at: DateTime<Utc>,
}

/// Raw verdict from the classification backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Classification {
    pub is_urgent: bool,
    pub summary: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f32>,
}

/// Classification bound to the message it describes. Batch-local.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalysisResult {
    pub message_id: String,
    pub is_urgent: bool,
    pub summary: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f32>,
}

// ── Actions ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionKind {
    Tag,
    Notify,
}

impl ActionKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Tag => "tag",
            Self::Notify => "notify",
        }
    }
}

impl fmt::Display for ActionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionStatus {
    Pending,
    Done,
    Failed,
}

/// Deterministic key for a side effect: same message and kind, same key.
pub fn idempotency_key(message_id: &str, kind: ActionKind) -> String {
    format!("triage:{}:{}", kind.as_str(), message_id)
}

/// Tracks one side effect for one message within a batch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionRecord {
    pub message_id: String,
    pub kind: ActionKind,
    pub idempotency_key: String,
    pub status: ActionStatus,
    /// Boundary calls made (0 when suppressed by the recency cache).
    pub attempts: u32,
    /// Completed without a boundary call because the key was recently issued.
    #[serde(default)]
    pub deduplicated: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ActionRecord {
    pub fn pending(message_id: &str, kind: ActionKind) -> Self {
        Self {
            message_id: message_id.to_string(),
            kind,
            idempotency_key: idempotency_key(message_id, kind),
            status: ActionStatus::Pending,
            attempts: 0,
            deduplicated: false,
            error: None,
        }
    }

    pub fn is_done(&self) -> bool {
        self.status == ActionStatus::Done
    }

    pub fn is_failed(&self) -> bool {
        self.status == ActionStatus::Failed
    }

    pub fn is_terminal(&self) -> bool {
        self.status != ActionStatus::Pending
    }
}

/// Structured notification sent to the downstream channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NotificationPayload {
    pub sender: String,
    pub subject: String,
    pub summary: String,
    pub source_link: String,
}

// ── Boundary traits ─────────────────────────────────────────────────

/// Upstream change stream for a mailbox.
///
/// Must be side-effect-free: the same input may be listed many times.
#[async_trait]
pub trait ChangeSource: Send + Sync {
    async fn list_changes_since(
        &self,
        mailbox_id: &str,
        since: Watermark,
    ) -> Result<ChangeSet, ResolveError>;
}

/// Read-only access to message content.
#[async_trait]
pub trait MessageSource: Send + Sync {
    async fn fetch(&self, mailbox_id: &str, message_id: &str) -> Result<Message, FetchError>;
}

/// Black-box urgency model. No accuracy is assumed, only the latency/error contract.
#[async_trait]
pub trait Classifier: Send + Sync {
    async fn classify(&self, subject: &str, body: &str) -> Result<Classification, ClassifyError>;
}

/// Applies labels in the mail store. Re-applying an existing label must not fail.
#[async_trait]
pub trait LabelSink: Send + Sync {
    async fn apply_label(
        &self,
        mailbox_id: &str,
        message_id: &str,
        label: &str,
    ) -> Result<(), LabelError>;
}

/// Downstream notification channel. At-least-once.
#[async_trait]
pub trait NotifySink: Send + Sync {
    /// Channel name for logs (e.g. "slack").
    fn name(&self) -> &str;

    /// Whether the channel collapses repeats of the same key on its own.
    fn dedups_natively(&self) -> bool {
        false
    }

    async fn deliver(
        &self,
        idempotency_key: &str,
        payload: &NotificationPayload,
    ) -> Result<(), DeliveryError>;
}
