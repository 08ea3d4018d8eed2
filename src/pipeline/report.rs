//! Per-message outcomes and batch reports.

use serde::Serialize;
use uuid::Uuid;

use crate::pipeline::executor::ActionOutcome;
use crate::pipeline::types::{ActionRecord, AnalysisResult, Watermark};

/// How a message left the batch.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Settlement {
    /// Urgent; both actions reached a terminal status.
    Actioned { tag: ActionRecord, notify: ActionRecord },
    /// Classified non-urgent.
    NoAction,
    /// Gone before it could be fetched.
    Skipped,
    /// Fetch retries exhausted.
    FetchFailed { reason: String },
    /// Classification unavailable; treated as non-urgent.
    FailedOpen { reason: String },
    /// Classification unavailable; replayed by the next batch.
    Held { reason: String },
    /// Not finished within the batch budget or shutdown grace; replayed by the next batch.
    Deferred { reason: String },
}

impl Settlement {
    pub fn actioned(outcome: ActionOutcome) -> Self {
        Self::Actioned {
            tag: outcome.tag,
            notify: outcome.notify,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            Self::Actioned { .. } => "actioned",
            Self::NoAction => "no_action",
            Self::Skipped => "skipped",
            Self::FetchFailed { .. } => "fetch_failed",
            Self::FailedOpen { .. } => "failed_open",
            Self::Held { .. } => "held",
            Self::Deferred { .. } => "deferred",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MessageOutcome {
    pub message_id: String,
    pub sequence: Watermark,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub analysis: Option<AnalysisResult>,
    pub settlement: Settlement,
}

impl MessageOutcome {
    /// Whether the message counts as handled for the watermark commit.
    pub fn is_settled(&self) -> bool {
        !matches!(
            self.settlement,
            Settlement::Held { .. } | Settlement::Deferred { .. }
        )
    }

    /// Settled, but with a failed fetch or a failed action.
    pub fn has_failure(&self) -> bool {
        match &self.settlement {
            Settlement::Actioned { tag, notify } => tag.is_failed() || notify.is_failed(),
            Settlement::FetchFailed { .. } => true,
            _ => false,
        }
    }

    pub fn actions(&self) -> Option<(&ActionRecord, &ActionRecord)> {
        match &self.settlement {
            Settlement::Actioned { tag, notify } => Some((tag, notify)),
            _ => None,
        }
    }
}

/// What happened to the watermark at the end of a batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum CommitStatus {
    /// Trigger already covered by the stored watermark; nothing ran.
    AlreadyCovered,
    /// Nothing settled beyond the starting watermark.
    Unchanged,
    Committed { watermark: Watermark },
    /// The store already held a newer watermark.
    Superseded { watermark: Watermark },
}

/// Retention-horizon recovery taken during resolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Recovery {
    pub expired: Watermark,
    pub resumed_from: Watermark,
    /// False only when bootstrapping a mailbox that had no cursor.
    pub data_loss: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BatchReport {
    pub batch_id: Uuid,
    pub mailbox_id: String,
    pub trigger_sequence: Watermark,
    pub started_from: Watermark,
    pub commit: CommitStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub recovery: Option<Recovery>,
    pub outcomes: Vec<MessageOutcome>,
}

impl BatchReport {
    pub fn already_covered(mailbox_id: &str, trigger_sequence: Watermark, stored: Watermark) -> Self {
        Self {
            batch_id: Uuid::new_v4(),
            mailbox_id: mailbox_id.to_string(),
            trigger_sequence,
            started_from: stored,
            commit: CommitStatus::AlreadyCovered,
            recovery: None,
            outcomes: Vec::new(),
        }
    }

    pub fn is_noop(&self) -> bool {
        self.commit == CommitStatus::AlreadyCovered
    }

    pub fn committed(&self) -> Option<Watermark> {
        match self.commit {
            CommitStatus::Committed { watermark } => Some(watermark),
            _ => None,
        }
    }

    pub fn outcome(&self, message_id: &str) -> Option<&MessageOutcome> {
        self.outcomes.iter().find(|o| o.message_id == message_id)
    }

    pub fn settled_count(&self) -> usize {
        self.outcomes.iter().filter(|o| o.is_settled()).count()
    }

    pub fn unsettled_count(&self) -> usize {
        self.outcomes.len() - self.settled_count()
    }
}
