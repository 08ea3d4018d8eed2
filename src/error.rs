//! Error types for the triage pipeline.

use crate::pipeline::types::Watermark;

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },
}

/// Cursor persistence errors.
#[derive(Debug, Clone, thiserror::Error)]
pub enum StoreError {
    /// Storage could not be reached or the write did not land. Retryable.
    #[error("Cursor store unavailable: {0}")]
    Unavailable(String),

    #[error("Corrupt cursor record: {0}")]
    Corrupt(String),

    #[error("Migration failed: {0}")]
    Migration(String),
}

/// Change resolution errors.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ResolveError {
    /// The watermark is older than the upstream retention horizon.
    #[error("Watermark {watermark} expired for mailbox {mailbox_id}")]
    WatermarkExpired {
        mailbox_id: String,
        watermark: Watermark,
    },

    #[error("Change listing unavailable: {0}")]
    Unavailable(String),
}

/// Message fetch errors.
#[derive(Debug, Clone, thiserror::Error)]
pub enum FetchError {
    /// Deleted or moved between notification and fetch.
    #[error("Message {message_id} not found")]
    NotFound { message_id: String },

    #[error("Transient fetch error for {message_id}: {reason}")]
    Transient { message_id: String, reason: String },
}

/// Classification errors.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ClassifyError {
    #[error("Classification unavailable: {0}")]
    Unavailable(String),
}

/// Label application errors reported by the mail store boundary.
#[derive(Debug, Clone, thiserror::Error)]
pub enum LabelError {
    #[error("Label already applied")]
    AlreadyApplied,

    #[error("Transient label error: {0}")]
    Transient(String),

    #[error("Label rejected: {0}")]
    Rejected(String),
}

/// Notification delivery errors reported by the channel boundary.
#[derive(Debug, Clone, thiserror::Error)]
pub enum DeliveryError {
    #[error("Transient delivery error: {0}")]
    Transient(String),

    #[error("Delivery rejected: {0}")]
    Rejected(String),
}

/// Per-message action failures. Recorded, never propagated as batch failures.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ActionError {
    #[error("Tag failed for {message_id}: {reason}")]
    TagFailed { message_id: String, reason: String },

    #[error("Notify failed for {message_id}: {reason}")]
    NotifyFailed { message_id: String, reason: String },
}

/// Batch-level failures. The watermark does not advance past any of these.
#[derive(Debug, thiserror::Error)]
pub enum BatchError {
    #[error("Cursor store unavailable at batch start: {0}")]
    StoreUnavailable(StoreError),

    #[error("Change resolution failed: {0}")]
    Resolve(ResolveError),

    #[error("Watermark commit to {watermark} failed for mailbox {mailbox_id}: {source}")]
    CommitFailed {
        mailbox_id: String,
        watermark: Watermark,
        #[source]
        source: StoreError,
    },

    #[error("A batch is already running for mailbox {mailbox_id}")]
    MailboxBusy { mailbox_id: String },
}

/// Transport and ingress errors.
#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    #[error("Invalid notification payload: {0}")]
    InvalidPayload(String),

    #[error("HTTP error: {0}")]
    Http(String),

    #[error("Server failed to start: {0}")]
    StartupFailed(String),
}

impl ResolveError {
    /// Whether this is a retention-horizon expiry rather than an outage.
    pub fn is_expired(&self) -> bool {
        matches!(self, Self::WatermarkExpired { .. })
    }
}

impl FetchError {
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient { .. })
    }
}

impl LabelError {
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_))
    }
}

impl DeliveryError {
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_))
    }
}

impl BatchError {
    /// Whether running the same trigger again may succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::StoreUnavailable(_) | Self::CommitFailed { .. } => true,
            Self::Resolve(e) => !e.is_expired(),
            Self::MailboxBusy { .. } => false,
        }
    }
}
