//! Fake boundaries shared by the integration tests.
#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::Semaphore;

use mail_triage::config::{ClassificationPolicy, RecoveryPoint, TriageConfig};
use mail_triage::error::{ClassifyError, DeliveryError, FetchError, LabelError, ResolveError};
use mail_triage::pipeline::retry::RetryPolicy;
use mail_triage::pipeline::types::{
    ChangeRecord, ChangeSet, ChangeSource, Classification, Classifier, LabelSink, Message,
    MessageSource, NotificationPayload, NotifySink, Watermark,
};
use mail_triage::pipeline::{Boundaries, TriageOrchestrator};
use mail_triage::store::CursorStore;

pub const MAILBOX: &str = "me@example.com";
pub const URGENT_LABEL: &str = "URGENT_AI";

// ── Change source ───────────────────────────────────────────────────

#[derive(Default)]
struct MailboxHistory {
    records: Vec<ChangeRecord>,
    latest: Watermark,
    /// Listings from below this position report `WatermarkExpired`.
    horizon: Watermark,
}

#[derive(Default)]
pub struct FakeChanges {
    history: Mutex<HashMap<String, MailboxHistory>>,
    calls: AtomicUsize,
    gate: Mutex<Option<Arc<Semaphore>>>,
}

impl FakeChanges {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Append a change. Records may be pushed out of order or duplicated.
    pub fn push(&self, mailbox_id: &str, sequence: u64, message_id: &str) {
        let mut history = self.history.lock().unwrap();
        let entry = history.entry(mailbox_id.to_string()).or_default();
        entry.records.push(ChangeRecord::new(sequence, message_id));
        entry.latest = entry.latest.max(Watermark::new(sequence));
    }

    pub fn set_latest(&self, mailbox_id: &str, sequence: u64) {
        let mut history = self.history.lock().unwrap();
        history.entry(mailbox_id.to_string()).or_default().latest = Watermark::new(sequence);
    }

    pub fn set_horizon(&self, mailbox_id: &str, horizon: u64) {
        let mut history = self.history.lock().unwrap();
        history.entry(mailbox_id.to_string()).or_default().horizon = Watermark::new(horizon);
    }

    /// Block listings until `release` is called.
    pub fn close_gate(&self) -> Arc<Semaphore> {
        let gate = Arc::new(Semaphore::new(0));
        *self.gate.lock().unwrap() = Some(Arc::clone(&gate));
        gate
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Poll until at least `n` listings have started.
    pub async fn wait_for_calls(&self, n: usize) {
        for _ in 0..200 {
            if self.calls() >= n {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("expected {n} change listings, saw {}", self.calls());
    }
}

#[async_trait]
impl ChangeSource for FakeChanges {
    async fn list_changes_since(
        &self,
        mailbox_id: &str,
        since: Watermark,
    ) -> Result<ChangeSet, ResolveError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let gate = self.gate.lock().unwrap().clone();
        if let Some(gate) = gate {
            let permit = gate.acquire().await.unwrap();
            permit.forget();
        }

        let history = self.history.lock().unwrap();
        let Some(entry) = history.get(mailbox_id) else {
            return Ok(ChangeSet {
                records: Vec::new(),
                new_watermark: since,
            });
        };
        if since < entry.horizon {
            return Err(ResolveError::WatermarkExpired {
                mailbox_id: mailbox_id.to_string(),
                watermark: since,
            });
        }
        Ok(ChangeSet {
            records: entry
                .records
                .iter()
                .filter(|r| r.sequence > since)
                .cloned()
                .collect(),
            new_watermark: entry.latest,
        })
    }
}

// ── Message source ──────────────────────────────────────────────────

#[derive(Default)]
pub struct FakeMessages {
    messages: Mutex<HashMap<String, Message>>,
    fetches: Mutex<HashMap<String, usize>>,
}

impl FakeMessages {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn add(&self, id: &str, subject: &str, sender: &str, body: &str) {
        self.messages.lock().unwrap().insert(
            id.to_string(),
            Message {
                id: id.to_string(),
                thread_id: Some(format!("thread-{id}")),
                subject: subject.to_string(),
                sender: sender.to_string(),
                body_plain: body.to_string(),
                body_html: None,
                received_at: Utc::now(),
            },
        );
    }

    pub fn fetches(&self, id: &str) -> usize {
        self.fetches.lock().unwrap().get(id).copied().unwrap_or(0)
    }

    pub fn total_fetches(&self) -> usize {
        self.fetches.lock().unwrap().values().sum()
    }
}

#[async_trait]
impl MessageSource for FakeMessages {
    async fn fetch(&self, _mailbox_id: &str, message_id: &str) -> Result<Message, FetchError> {
        *self
            .fetches
            .lock()
            .unwrap()
            .entry(message_id.to_string())
            .or_default() += 1;
        self.messages
            .lock()
            .unwrap()
            .get(message_id)
            .cloned()
            .ok_or_else(|| FetchError::NotFound {
                message_id: message_id.to_string(),
            })
    }
}

// ── Classifier ──────────────────────────────────────────────────────

/// Urgent when the subject starts with "URGENT". Subjects marked failing
/// return `Unavailable`; subjects marked slow sleep first.
#[derive(Default)]
pub struct FakeClassifier {
    failing: Mutex<HashSet<String>>,
    slow: Mutex<HashMap<String, Duration>>,
    calls: AtomicUsize,
}

impl FakeClassifier {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn fail_on(&self, subject: &str) {
        self.failing.lock().unwrap().insert(subject.to_string());
    }

    pub fn heal(&self, subject: &str) {
        self.failing.lock().unwrap().remove(subject);
    }

    pub fn slow_on(&self, subject: &str, delay: Duration) {
        self.slow.lock().unwrap().insert(subject.to_string(), delay);
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Classifier for FakeClassifier {
    async fn classify(&self, subject: &str, body: &str) -> Result<Classification, ClassifyError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let delay = self.slow.lock().unwrap().get(subject).copied();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if self.failing.lock().unwrap().contains(subject) {
            return Err(ClassifyError::Unavailable("model offline".into()));
        }
        let urgent = subject.starts_with("URGENT");
        Ok(Classification {
            is_urgent: urgent,
            summary: format!("summary of {body}"),
            confidence: Some(if urgent { 0.9 } else { 0.1 }),
        })
    }
}

// ── Label sink ──────────────────────────────────────────────────────

#[derive(Default)]
pub struct FakeLabels {
    applied: Mutex<HashSet<(String, String, String)>>,
    calls: AtomicUsize,
    failing: Mutex<bool>,
}

impl FakeLabels {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn set_failing(&self, failing: bool) {
        *self.failing.lock().unwrap() = failing;
    }

    pub fn is_labelled(&self, message_id: &str) -> bool {
        self.applied
            .lock()
            .unwrap()
            .iter()
            .any(|(_, id, label)| id == message_id && label == URGENT_LABEL)
    }

    pub fn labelled_count(&self) -> usize {
        self.applied.lock().unwrap().len()
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl LabelSink for FakeLabels {
    async fn apply_label(
        &self,
        mailbox_id: &str,
        message_id: &str,
        label: &str,
    ) -> Result<(), LabelError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if *self.failing.lock().unwrap() {
            return Err(LabelError::Transient("labels api unavailable".into()));
        }
        let fresh = self.applied.lock().unwrap().insert((
            mailbox_id.to_string(),
            message_id.to_string(),
            label.to_string(),
        ));
        if fresh {
            Ok(())
        } else {
            Err(LabelError::AlreadyApplied)
        }
    }
}

// ── Notifier ────────────────────────────────────────────────────────

#[derive(Default)]
pub struct FakeNotifier {
    delivered: Mutex<Vec<(String, NotificationPayload)>>,
    attempts: AtomicUsize,
    failing: Mutex<bool>,
}

impl FakeNotifier {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn set_failing(&self, failing: bool) {
        *self.failing.lock().unwrap() = failing;
    }

    pub fn delivered(&self) -> Vec<(String, NotificationPayload)> {
        self.delivered.lock().unwrap().clone()
    }

    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl NotifySink for FakeNotifier {
    fn name(&self) -> &str {
        "fake"
    }

    async fn deliver(
        &self,
        idempotency_key: &str,
        payload: &NotificationPayload,
    ) -> Result<(), DeliveryError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        if *self.failing.lock().unwrap() {
            return Err(DeliveryError::Transient("channel unavailable".into()));
        }
        self.delivered
            .lock()
            .unwrap()
            .push((idempotency_key.to_string(), payload.clone()));
        Ok(())
    }
}

// ── Harness ─────────────────────────────────────────────────────────

pub struct Harness {
    pub changes: Arc<FakeChanges>,
    pub messages: Arc<FakeMessages>,
    pub classifier: Arc<FakeClassifier>,
    pub labels: Arc<FakeLabels>,
    pub notifier: Arc<FakeNotifier>,
}

impl Harness {
    pub fn new() -> Self {
        Self {
            changes: FakeChanges::new(),
            messages: FakeMessages::new(),
            classifier: FakeClassifier::new(),
            labels: FakeLabels::new(),
            notifier: FakeNotifier::new(),
        }
    }

    pub fn boundaries(&self) -> Boundaries {
        Boundaries {
            changes: self.changes.clone(),
            messages: self.messages.clone(),
            classifier: self.classifier.clone(),
            labels: self.labels.clone(),
            notifier: self.notifier.clone(),
        }
    }

    pub fn orchestrator(
        &self,
        config: TriageConfig,
        store: Arc<dyn CursorStore>,
    ) -> TriageOrchestrator {
        TriageOrchestrator::new(config, store, self.boundaries())
    }
}

/// Defaults with immediate retries so tests never sleep on backoff.
pub fn test_config() -> TriageConfig {
    TriageConfig {
        urgent_label: URGENT_LABEL.to_string(),
        classification_policy: ClassificationPolicy::FailClosed,
        recovery: RecoveryPoint::Now,
        fetch_retry: RetryPolicy::immediate(3),
        classify_retry: RetryPolicy::immediate(2),
        tag_retry: RetryPolicy::immediate(3),
        notify_retry: RetryPolicy::immediate(3),
        batch_retry: RetryPolicy::immediate(2),
        ..TriageConfig::default()
    }
}
