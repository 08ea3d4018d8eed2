//! Action executor: tag and notify for one urgent message.
//!
//! The two actions run concurrently and independently: each has its own
//! retry policy, each reaches its own terminal status, and neither is rolled
//! back when the other fails.

use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::error::{ActionError, DeliveryError, LabelError};
use crate::pipeline::dedup::RecentKeys;
use crate::pipeline::retry::{RetryPolicy, retry};
use crate::pipeline::types::{
    ActionKind, ActionRecord, ActionStatus, AnalysisResult, LabelSink, Message,
    NotificationPayload, NotifySink,
};

/// Terminal records for both actions of one message.
#[derive(Debug, Clone, PartialEq)]
pub struct ActionOutcome {
    pub tag: ActionRecord,
    pub notify: ActionRecord,
}

impl ActionOutcome {
    pub fn all_done(&self) -> bool {
        self.tag.is_done() && self.notify.is_done()
    }

    pub fn failures(&self) -> Vec<ActionError> {
        let mut failures = Vec::new();
        if self.tag.is_failed() {
            failures.push(ActionError::TagFailed {
                message_id: self.tag.message_id.clone(),
                reason: self.tag.error.clone().unwrap_or_default(),
            });
        }
        if self.notify.is_failed() {
            failures.push(ActionError::NotifyFailed {
                message_id: self.notify.message_id.clone(),
                reason: self.notify.error.clone().unwrap_or_default(),
            });
        }
        failures
    }
}

pub struct ActionExecutor {
    labels: Arc<dyn LabelSink>,
    notifier: Arc<dyn NotifySink>,
    urgent_label: String,
    tag_retry: RetryPolicy,
    notify_retry: RetryPolicy,
    recent: RecentKeys,
}

impl ActionExecutor {
    pub fn new(
        labels: Arc<dyn LabelSink>,
        notifier: Arc<dyn NotifySink>,
        urgent_label: impl Into<String>,
        tag_retry: RetryPolicy,
        notify_retry: RetryPolicy,
        recent: RecentKeys,
    ) -> Self {
        Self {
            labels,
            notifier,
            urgent_label: urgent_label.into(),
            tag_retry,
            notify_retry,
            recent,
        }
    }

    /// Tag and notify for an urgent message. Always returns terminal records.
    pub async fn execute(
        &self,
        mailbox_id: &str,
        message: &Message,
        analysis: &AnalysisResult,
        source_link: String,
    ) -> ActionOutcome {
        let payload = NotificationPayload {
            sender: message.sender.clone(),
            subject: message.subject.clone(),
            summary: analysis.summary.clone(),
            source_link,
        };

        let (tag, notify) = tokio::join!(
            self.tag(mailbox_id, &message.id),
            self.notify(mailbox_id, &message.id, &payload)
        );
        let outcome = ActionOutcome { tag, notify };
        for failure in outcome.failures() {
            warn!(mailbox = mailbox_id, error = %failure, "Action left failed");
        }
        outcome
    }

    async fn tag(&self, mailbox_id: &str, message_id: &str) -> ActionRecord {
        let mut record = ActionRecord::pending(message_id, ActionKind::Tag);
        let labels = &self.labels;
        let label = self.urgent_label.as_str();

        let out = retry(
            &self.tag_retry,
            "tag",
            move || labels.apply_label(mailbox_id, message_id, label),
            LabelError::is_transient,
        )
        .await;
        record.attempts = out.attempts;

        match out.result {
            Ok(()) | Err(LabelError::AlreadyApplied) => {
                record.status = ActionStatus::Done;
                info!(message_id, label, attempts = out.attempts, "Tag applied");
            }
            Err(e) => {
                record.status = ActionStatus::Failed;
                record.error = Some(e.to_string());
                debug!(message_id, label, attempts = out.attempts, "Tag retries exhausted");
            }
        }
        record
    }

    async fn notify(
        &self,
        mailbox_id: &str,
        message_id: &str,
        payload: &NotificationPayload,
    ) -> ActionRecord {
        let mut record = ActionRecord::pending(message_id, ActionKind::Notify);
        let channel = self.notifier.name().to_string();
        let native = self.notifier.dedups_natively();
        // Message ids are only unique within a mailbox.
        let cache_key = format!("{mailbox_id}/{}", record.idempotency_key);

        if !native && self.recent.contains(&cache_key) {
            record.status = ActionStatus::Done;
            record.deduplicated = true;
            info!(
                message_id,
                channel = %channel,
                key = %record.idempotency_key,
                "Notification suppressed, key recently issued"
            );
            return record;
        }

        let notifier = &self.notifier;
        let key = record.idempotency_key.as_str();
        let out = retry(
            &self.notify_retry,
            "notify",
            move || notifier.deliver(key, payload),
            DeliveryError::is_transient,
        )
        .await;
        record.attempts = out.attempts;

        match out.result {
            Ok(()) => {
                if !native {
                    self.recent.insert(&cache_key);
                }
                record.status = ActionStatus::Done;
                info!(message_id, channel = %channel, attempts = out.attempts, "Notification delivered");
            }
            Err(e) => {
                record.status = ActionStatus::Failed;
                record.error = Some(e.to_string());
                debug!(
                    message_id,
                    channel = %channel,
                    attempts = out.attempts,
                    "Notification retries exhausted"
                );
            }
        }
        record
    }
}
