//! Per-mailbox batch scheduler.
//!
//! Each mailbox has one slot: a pending trigger sequence and a running flag.
//! A trigger for an idle mailbox spawns a worker; a trigger for a busy
//! mailbox raises the pending sequence and is picked up by the running
//! worker after its current batch. Different mailboxes run in parallel.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::error::BatchError;
use crate::pipeline::orchestrator::TriageOrchestrator;
use crate::pipeline::report::BatchReport;
use crate::pipeline::retry::{RetryPolicy, retry};
use crate::pipeline::types::{Trigger, Watermark};

// ── Shutdown ────────────────────────────────────────────────────────

/// Fires the shutdown signal.
pub struct ShutdownTrigger {
    tx: watch::Sender<bool>,
}

impl ShutdownTrigger {
    pub fn trigger(&self) {
        let _ = self.tx.send(true);
    }

    pub fn signal(&self) -> ShutdownSignal {
        ShutdownSignal {
            rx: Some(self.tx.subscribe()),
        }
    }
}

/// Observes the shutdown signal.
#[derive(Clone)]
pub struct ShutdownSignal {
    rx: Option<watch::Receiver<bool>>,
}

impl ShutdownSignal {
    /// A signal that never fires.
    pub fn never() -> Self {
        Self { rx: None }
    }

    pub fn is_triggered(&self) -> bool {
        self.rx.as_ref().is_some_and(|rx| *rx.borrow())
    }

    /// Resolves once shutdown is signalled. Never resolves if the trigger is
    /// dropped without firing.
    pub async fn triggered(&mut self) {
        if let Some(rx) = self.rx.as_mut() {
            let fired = rx.wait_for(|stop| *stop).await.is_ok();
            if fired {
                return;
            }
        }
        std::future::pending::<()>().await;
    }
}

pub fn shutdown_channel() -> (ShutdownTrigger, ShutdownSignal) {
    let (tx, rx) = watch::channel(false);
    (ShutdownTrigger { tx }, ShutdownSignal { rx: Some(rx) })
}

// ── Scheduler ───────────────────────────────────────────────────────

/// Result of submitting a trigger.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Submission {
    /// A worker was spawned for the mailbox.
    Started,
    /// Folded into the running worker's next batch.
    Coalesced,
    /// Refused because shutdown has been signalled.
    ShuttingDown,
}

#[derive(Default)]
struct Slot {
    /// Highest trigger sequence not yet handed to a batch.
    pending: Option<Watermark>,
    running: bool,
}

struct Inner {
    orchestrator: Arc<TriageOrchestrator>,
    batch_retry: RetryPolicy,
    slots: Mutex<HashMap<String, Slot>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    shutdown: ShutdownSignal,
    reports: Option<mpsc::Sender<BatchReport>>,
}

#[derive(Clone)]
pub struct MailboxScheduler {
    inner: Arc<Inner>,
}

impl MailboxScheduler {
    /// `reports` receives every completed batch report when set.
    pub fn new(
        orchestrator: Arc<TriageOrchestrator>,
        batch_retry: RetryPolicy,
        shutdown: ShutdownSignal,
        reports: Option<mpsc::Sender<BatchReport>>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                orchestrator,
                batch_retry,
                slots: Mutex::new(HashMap::new()),
                workers: Mutex::new(Vec::new()),
                shutdown,
                reports,
            }),
        }
    }

    pub fn orchestrator(&self) -> &Arc<TriageOrchestrator> {
        &self.inner.orchestrator
    }

    /// Queue a trigger for its mailbox.
    pub fn submit(&self, trigger: Trigger) -> Submission {
        if self.inner.shutdown.is_triggered() {
            debug!(mailbox = %trigger.mailbox_id, "Trigger refused, shutting down");
            return Submission::ShuttingDown;
        }

        let start = {
            let mut slots = self.inner.slots.lock().unwrap_or_else(|e| e.into_inner());
            let slot = slots.entry(trigger.mailbox_id.clone()).or_default();
            slot.pending = Some(slot.pending.map_or(trigger.sequence, |p| p.max(trigger.sequence)));
            if slot.running {
                false
            } else {
                slot.running = true;
                true
            }
        };

        if !start {
            debug!(
                mailbox = %trigger.mailbox_id,
                sequence = %trigger.sequence,
                "Batch running, trigger coalesced"
            );
            return Submission::Coalesced;
        }

        let inner = Arc::clone(&self.inner);
        let mailbox_id = trigger.mailbox_id;
        let handle = tokio::spawn(async move { inner.drive(mailbox_id).await });

        let mut workers = self.inner.workers.lock().unwrap_or_else(|e| e.into_inner());
        workers.retain(|h| !h.is_finished());
        workers.push(handle);
        Submission::Started
    }

    /// Mailboxes with a worker running.
    pub fn active_mailboxes(&self) -> Vec<String> {
        let slots = self.inner.slots.lock().unwrap_or_else(|e| e.into_inner());
        let mut ids: Vec<String> = slots
            .iter()
            .filter(|(_, s)| s.running)
            .map(|(id, _)| id.clone())
            .collect();
        ids.sort();
        ids
    }

    /// Wait for running workers to finish, up to `timeout`. Returns whether
    /// all of them finished in time.
    pub async fn drain(&self, timeout: Duration) -> bool {
        let handles: Vec<JoinHandle<()>> = {
            let mut workers = self.inner.workers.lock().unwrap_or_else(|e| e.into_inner());
            workers.drain(..).collect()
        };
        let count = handles.len();
        let joined = tokio::time::timeout(timeout, futures::future::join_all(handles)).await;
        match joined {
            Ok(results) => {
                for result in results {
                    if let Err(e) = result {
                        error!(error = %e, "Mailbox worker panicked");
                    }
                }
                info!(workers = count, "Scheduler drained");
                true
            }
            Err(_) => {
                warn!(workers = count, "Scheduler drain timed out");
                false
            }
        }
    }
}

impl Inner {
    /// Worker loop for one mailbox. Exits when no trigger is pending.
    async fn drive(&self, mailbox_id: String) {
        loop {
            let sequence = {
                let mut slots = self.slots.lock().unwrap_or_else(|e| e.into_inner());
                let next = slots.get_mut(&mailbox_id).and_then(|s| s.pending.take());
                match next {
                    Some(sequence) if !self.shutdown.is_triggered() => sequence,
                    _ => {
                        slots.remove(&mailbox_id);
                        return;
                    }
                }
            };

            let trigger = Trigger::new(mailbox_id.clone(), sequence);
            let shutdown = &self.shutdown;
            let orchestrator = &self.orchestrator;
            let trigger_ref = &trigger;
            let out = retry(
                &self.batch_retry,
                "batch",
                move || orchestrator.run_batch(trigger_ref),
                |e: &BatchError| e.is_retryable() && !shutdown.is_triggered(),
            )
            .await;

            match out.result {
                Ok(report) => {
                    if let Some(tx) = &self.reports
                        && tx.send(report).await.is_err()
                    {
                        debug!("Report receiver dropped");
                    }
                }
                Err(e) => error!(
                    mailbox = %mailbox_id,
                    sequence = %sequence,
                    attempts = out.attempts,
                    error = %e,
                    "Batch failed, waiting for the next trigger"
                ),
            }
        }
    }
}
