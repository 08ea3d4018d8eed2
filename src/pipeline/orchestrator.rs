//! Triage orchestrator: one batch per trigger, one commit per batch.
//!
//! Flow for a batch:
//! 1. Load the stored watermark; a trigger at or below it is a no-op
//! 2. Resolve changes since the watermark (with retention-horizon recovery)
//! 3. Fetch, classify and act on each record on a bounded worker pool
//! 4. Commit up to the position before the earliest unsettled record
//!
//! Only the commit touches shared state, and it only moves forward.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use futures::StreamExt;
use futures::stream::FuturesUnordered;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::{ClassificationPolicy, RecoveryPoint, TriageConfig};
use crate::error::{BatchError, FetchError, ResolveError};
use crate::pipeline::classifier::ClassifierGateway;
use crate::pipeline::dedup::RecentKeys;
use crate::pipeline::executor::ActionExecutor;
use crate::pipeline::fetcher::MessageFetcher;
use crate::pipeline::report::{BatchReport, CommitStatus, MessageOutcome, Recovery, Settlement};
use crate::pipeline::resolver::{ChangeResolver, ResolvedBatch};
use crate::pipeline::scheduler::ShutdownSignal;
use crate::pipeline::types::{
    AnalysisResult, ChangeRecord, ChangeSource, Classifier, LabelSink, MessageSource, NotifySink,
    Trigger, Watermark,
};
use crate::store::CursorStore;

/// External collaborators the orchestrator drives.
pub struct Boundaries {
    pub changes: Arc<dyn ChangeSource>,
    pub messages: Arc<dyn MessageSource>,
    pub classifier: Arc<dyn Classifier>,
    pub labels: Arc<dyn LabelSink>,
    pub notifier: Arc<dyn NotifySink>,
}

/// Refuses a second concurrent batch for the same mailbox.
#[derive(Default)]
struct MailboxGuard {
    active: Mutex<HashSet<String>>,
}

struct MailboxLease<'a> {
    guard: &'a MailboxGuard,
    mailbox_id: String,
}

impl MailboxGuard {
    fn acquire(&self, mailbox_id: &str) -> Result<MailboxLease<'_>, BatchError> {
        let mut active = self.active.lock().unwrap_or_else(|e| e.into_inner());
        if !active.insert(mailbox_id.to_string()) {
            return Err(BatchError::MailboxBusy {
                mailbox_id: mailbox_id.to_string(),
            });
        }
        Ok(MailboxLease {
            guard: self,
            mailbox_id: mailbox_id.to_string(),
        })
    }
}

impl Drop for MailboxLease<'_> {
    fn drop(&mut self) {
        let mut active = self.guard.active.lock().unwrap_or_else(|e| e.into_inner());
        active.remove(&self.mailbox_id);
    }
}

pub struct TriageOrchestrator {
    config: TriageConfig,
    store: Arc<dyn CursorStore>,
    resolver: ChangeResolver,
    fetcher: MessageFetcher,
    gateway: ClassifierGateway,
    executor: ActionExecutor,
    guard: MailboxGuard,
    shutdown: ShutdownSignal,
}

impl TriageOrchestrator {
    pub fn new(config: TriageConfig, store: Arc<dyn CursorStore>, boundaries: Boundaries) -> Self {
        let resolver = ChangeResolver::new(boundaries.changes);
        let fetcher = MessageFetcher::new(boundaries.messages, config.fetch_retry.clone());
        let gateway = ClassifierGateway::new(
            boundaries.classifier,
            config.max_body_chars,
            config.classify_timeout,
            config.classify_retry.clone(),
        );
        let executor = ActionExecutor::new(
            boundaries.labels,
            boundaries.notifier,
            config.urgent_label.clone(),
            config.tag_retry.clone(),
            config.notify_retry.clone(),
            RecentKeys::new(config.dedup_window, config.dedup_capacity),
        );
        Self {
            config,
            store,
            resolver,
            fetcher,
            gateway,
            executor,
            guard: MailboxGuard::default(),
            shutdown: ShutdownSignal::never(),
        }
    }

    /// Stop starting new messages once `signal` fires; in-flight ones get
    /// `shutdown_grace` to finish.
    pub fn with_shutdown(mut self, signal: ShutdownSignal) -> Self {
        self.shutdown = signal;
        self
    }

    pub fn config(&self) -> &TriageConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<dyn CursorStore> {
        &self.store
    }

    /// Run one batch for `trigger`.
    ///
    /// Per-message failures are recorded in the report. Errors are reserved
    /// for batch-level failures, none of which advance the watermark.
    pub async fn run_batch(&self, trigger: &Trigger) -> Result<BatchReport, BatchError> {
        let mailbox_id = trigger.mailbox_id.as_str();
        let _lease = self.guard.acquire(mailbox_id)?;

        let start = self
            .store
            .load(mailbox_id)
            .await
            .map_err(BatchError::StoreUnavailable)?;

        if trigger.sequence <= start {
            debug!(
                mailbox = mailbox_id,
                trigger = %trigger.sequence,
                stored = %start,
                "Trigger already covered by stored watermark"
            );
            return Ok(BatchReport::already_covered(mailbox_id, trigger.sequence, start));
        }

        let batch_id = Uuid::new_v4();
        let deadline = Instant::now() + self.config.batch_timeout;
        info!(
            mailbox = mailbox_id,
            batch_id = %batch_id,
            from = %start,
            trigger = %trigger.sequence,
            "Batch started"
        );

        // ── Resolving ───────────────────────────────────────────────
        let (resolved, recovery) = self.resolve(trigger, start, deadline).await?;

        // ── Fetching / Classifying / Acting ─────────────────────────
        let outcomes = self
            .process_records(mailbox_id, &batch_id, &resolved.records, deadline)
            .await;

        // ── CommittingWatermark ─────────────────────────────────────
        let target = commit_target(&outcomes, resolved.new_watermark);
        let commit = if target <= start {
            CommitStatus::Unchanged
        } else {
            match self.store.commit(mailbox_id, target).await {
                Ok(true) => CommitStatus::Committed { watermark: target },
                Ok(false) => CommitStatus::Superseded { watermark: target },
                Err(source) => {
                    error!(
                        mailbox = mailbox_id,
                        batch_id = %batch_id,
                        watermark = %target,
                        loud = true,
                        error = %source,
                        "Watermark commit failed; batch will be replayed"
                    );
                    return Err(BatchError::CommitFailed {
                        mailbox_id: mailbox_id.to_string(),
                        watermark: target,
                        source,
                    });
                }
            }
        };

        let report = BatchReport {
            batch_id,
            mailbox_id: mailbox_id.to_string(),
            trigger_sequence: trigger.sequence,
            started_from: start,
            commit,
            recovery,
            outcomes,
        };
        info!(
            mailbox = mailbox_id,
            batch_id = %batch_id,
            messages = report.outcomes.len(),
            unsettled = report.unsettled_count(),
            commit = ?report.commit,
            "Batch done"
        );
        Ok(report)
    }

    async fn resolve(
        &self,
        trigger: &Trigger,
        start: Watermark,
        deadline: Instant,
    ) -> Result<(ResolvedBatch, Option<Recovery>), BatchError> {
        let mailbox_id = trigger.mailbox_id.as_str();
        match self.resolve_by(mailbox_id, start, deadline).await {
            Ok(batch) => Ok((batch, None)),
            Err(ResolveError::WatermarkExpired { .. }) => {
                let data_loss = !start.is_beginning();
                let (batch, resumed_from) = self.recover(trigger, deadline).await?;
                let recovery = Recovery {
                    expired: start,
                    resumed_from,
                    data_loss,
                };
                if data_loss {
                    error!(
                        mailbox = mailbox_id,
                        expired = %start,
                        resumed_from = %resumed_from,
                        data_loss = true,
                        "Stored watermark is past the retention horizon; changes in between are lost"
                    );
                } else {
                    info!(
                        mailbox = mailbox_id,
                        resumed_from = %resumed_from,
                        data_loss = false,
                        "No cursor for mailbox, bootstrapping from recovery point"
                    );
                }
                Ok((batch, Some(recovery)))
            }
            Err(e) => Err(BatchError::Resolve(e)),
        }
    }

    /// Apply the configured recovery point. Returns the batch and the
    /// position it was resolved from.
    async fn recover(
        &self,
        trigger: &Trigger,
        deadline: Instant,
    ) -> Result<(ResolvedBatch, Watermark), BatchError> {
        let now = ResolvedBatch {
            records: Vec::new(),
            new_watermark: trigger.sequence,
        };
        let RecoveryPoint::Rewind { positions } = self.config.recovery else {
            return Ok((now, trigger.sequence));
        };

        let from = trigger.sequence.rewind(positions);
        if from >= trigger.sequence {
            return Ok((now, trigger.sequence));
        }
        match self.resolve_by(&trigger.mailbox_id, from, deadline).await {
            Ok(batch) => Ok((batch, from)),
            Err(ResolveError::WatermarkExpired { .. }) => {
                warn!(
                    mailbox = %trigger.mailbox_id,
                    rewind_from = %from,
                    "Rewind point also expired, recovering to trigger sequence"
                );
                Ok((now, trigger.sequence))
            }
            Err(e) => Err(BatchError::Resolve(e)),
        }
    }

    async fn resolve_by(
        &self,
        mailbox_id: &str,
        since: Watermark,
        deadline: Instant,
    ) -> Result<ResolvedBatch, ResolveError> {
        tokio::time::timeout_at(deadline, self.resolver.resolve(mailbox_id, since))
            .await
            .unwrap_or_else(|_| {
                Err(ResolveError::Unavailable(
                    "change listing exceeded batch budget".into(),
                ))
            })
    }

    /// Run every record through fetch, classify and act, at most
    /// `worker_concurrency` at a time. Records not finished by the batch
    /// deadline, or by the shutdown grace once shutdown is signalled, come
    /// back as `Deferred`.
    async fn process_records(
        &self,
        mailbox_id: &str,
        batch_id: &Uuid,
        records: &[ChangeRecord],
        deadline: Instant,
    ) -> Vec<MessageOutcome> {
        let mut queue = records.iter();
        let mut in_flight = FuturesUnordered::new();
        let mut finished: HashMap<String, MessageOutcome> = HashMap::with_capacity(records.len());
        let mut shutdown = self.shutdown.clone();
        let mut stop: Option<(Instant, &'static str)> = None;
        let concurrency = self.config.worker_concurrency.max(1);

        loop {
            if stop.is_none() {
                while in_flight.len() < concurrency {
                    let Some(record) = queue.next() else { break };
                    in_flight.push(self.process_message(mailbox_id, record));
                }
            }
            if in_flight.is_empty() {
                break;
            }

            let limit = stop.map_or(deadline, |(grace, _)| grace.min(deadline));
            tokio::select! {
                Some(outcome) = in_flight.next() => {
                    finished.insert(outcome.message_id.clone(), outcome);
                }
                _ = shutdown.triggered(), if stop.is_none() => {
                    warn!(
                        mailbox = mailbox_id,
                        batch_id = %batch_id,
                        in_flight = in_flight.len(),
                        grace_ms = self.config.shutdown_grace.as_millis() as u64,
                        "Shutdown requested, finishing in-flight messages"
                    );
                    stop = Some((Instant::now() + self.config.shutdown_grace, "shutdown"));
                }
                _ = tokio::time::sleep_until(limit) => {
                    let reason = match stop {
                        Some((grace, why)) if grace <= deadline => why,
                        _ => "batch budget",
                    };
                    warn!(
                        mailbox = mailbox_id,
                        batch_id = %batch_id,
                        in_flight = in_flight.len(),
                        reason,
                        "Time ran out, deferring unfinished messages"
                    );
                    stop = Some((limit, reason));
                    break;
                }
            }
        }
        // Dropping the pool cancels anything still running.
        drop(in_flight);

        let deferred_reason = stop.map(|(_, why)| why).unwrap_or("batch budget");
        records
            .iter()
            .map(|record| {
                finished.remove(&record.message_id).unwrap_or_else(|| {
                    warn!(
                        mailbox = mailbox_id,
                        message_id = %record.message_id,
                        sequence = %record.sequence,
                        reason = deferred_reason,
                        "Message deferred to next batch"
                    );
                    MessageOutcome {
                        message_id: record.message_id.clone(),
                        sequence: record.sequence,
                        analysis: None,
                        settlement: Settlement::Deferred {
                            reason: format!("{deferred_reason} elapsed before the message settled"),
                        },
                    }
                })
            })
            .collect()
    }

    async fn process_message(&self, mailbox_id: &str, record: &ChangeRecord) -> MessageOutcome {
        let message_id = record.message_id.as_str();
        let settle = |analysis: Option<AnalysisResult>, settlement: Settlement| {
            log_settlement(mailbox_id, record, &settlement);
            MessageOutcome {
                message_id: message_id.to_string(),
                sequence: record.sequence,
                analysis,
                settlement,
            }
        };

        let message = match self.fetcher.fetch(mailbox_id, message_id).await.result {
            Ok(message) => message,
            Err(FetchError::NotFound { .. }) => return settle(None, Settlement::Skipped),
            Err(e) => {
                return settle(
                    None,
                    Settlement::FetchFailed {
                        reason: e.to_string(),
                    },
                );
            }
        };

        let analysis = match self.gateway.analyze(&message).await.result {
            Ok(analysis) => analysis,
            Err(e) => {
                let reason = e.to_string();
                let settlement = match self.config.classification_policy {
                    ClassificationPolicy::FailOpen => Settlement::FailedOpen { reason },
                    ClassificationPolicy::FailClosed => Settlement::Held { reason },
                };
                return settle(None, settlement);
            }
        };

        if !analysis.is_urgent {
            return settle(Some(analysis), Settlement::NoAction);
        }

        let link_id = message.thread_id.as_deref().unwrap_or(&message.id);
        let outcome = self
            .executor
            .execute(mailbox_id, &message, &analysis, self.config.source_link(link_id))
            .await;
        settle(Some(analysis), Settlement::actioned(outcome))
    }
}

/// Position just before the earliest unsettled record, or the resolver's
/// watermark when everything settled.
pub fn commit_target(outcomes: &[MessageOutcome], resolved: Watermark) -> Watermark {
    outcomes
        .iter()
        .filter(|o| !o.is_settled())
        .map(|o| o.sequence)
        .min()
        .map_or(resolved, Watermark::preceding)
}

fn log_settlement(mailbox_id: &str, record: &ChangeRecord, settlement: &Settlement) {
    let outcome = settlement.label();
    match settlement {
        Settlement::Actioned { tag, notify } if tag.is_failed() || notify.is_failed() => warn!(
            mailbox = mailbox_id,
            message_id = %record.message_id,
            sequence = %record.sequence,
            outcome,
            tag = ?tag.status,
            notify = ?notify.status,
            "Message settled with failed action"
        ),
        Settlement::Actioned { tag, notify } => info!(
            mailbox = mailbox_id,
            message_id = %record.message_id,
            sequence = %record.sequence,
            outcome,
            tag = ?tag.status,
            notify = ?notify.status,
            deduplicated = notify.deduplicated,
            "Message settled"
        ),
        Settlement::FetchFailed { reason }
        | Settlement::FailedOpen { reason }
        | Settlement::Held { reason } => warn!(
            mailbox = mailbox_id,
            message_id = %record.message_id,
            sequence = %record.sequence,
            outcome,
            reason = %reason,
            "Message not fully handled"
        ),
        _ => info!(
            mailbox = mailbox_id,
            message_id = %record.message_id,
            sequence = %record.sequence,
            outcome,
            "Message settled"
        ),
    }
}
