//! In-memory cursor store: one slot per mailbox.
//!
//! Used for tests and embedding. Supports fault injection so callers can
//! exercise the `StoreUnavailable` paths without a real outage.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::RwLock;

use crate::error::StoreError;
use crate::pipeline::types::Watermark;
use crate::store::traits::{CursorRecord, CursorStore};

#[derive(Default)]
pub struct InMemoryCursorStore {
    slots: RwLock<HashMap<String, CursorRecord>>,
    fail_loads: AtomicBool,
    fail_commits: AtomicBool,
}

impl InMemoryCursorStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pre-populate a mailbox's cursor.
    pub async fn seed(&self, mailbox_id: &str, watermark: Watermark) {
        self.slots.write().await.insert(
            mailbox_id.to_string(),
            CursorRecord {
                mailbox_id: mailbox_id.to_string(),
                watermark,
                updated_at: Utc::now(),
            },
        );
    }

    /// Make subsequent `load` calls fail with `StoreError::Unavailable`.
    pub fn set_loads_failing(&self, failing: bool) {
        self.fail_loads.store(failing, Ordering::SeqCst);
    }

    /// Make subsequent `commit` calls fail with `StoreError::Unavailable`.
    pub fn set_commits_failing(&self, failing: bool) {
        self.fail_commits.store(failing, Ordering::SeqCst);
    }
}

#[async_trait]
impl CursorStore for InMemoryCursorStore {
    async fn load(&self, mailbox_id: &str) -> Result<Watermark, StoreError> {
        if self.fail_loads.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("injected load failure".into()));
        }
        Ok(self
            .slots
            .read()
            .await
            .get(mailbox_id)
            .map(|r| r.watermark)
            .unwrap_or(Watermark::BEGINNING))
    }

    async fn commit(&self, mailbox_id: &str, watermark: Watermark) -> Result<bool, StoreError> {
        if self.fail_commits.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("injected commit failure".into()));
        }
        let mut slots = self.slots.write().await;
        match slots.get_mut(mailbox_id) {
            Some(record) if watermark <= record.watermark => Ok(false),
            Some(record) => {
                record.watermark = watermark;
                record.updated_at = Utc::now();
                Ok(true)
            }
            None => {
                slots.insert(
                    mailbox_id.to_string(),
                    CursorRecord {
                        mailbox_id: mailbox_id.to_string(),
                        watermark,
                        updated_at: Utc::now(),
                    },
                );
                Ok(true)
            }
        }
    }

    async fn record(&self, mailbox_id: &str) -> Result<Option<CursorRecord>, StoreError> {
        Ok(self.slots.read().await.get(mailbox_id).cloned())
    }

    async fn list(&self) -> Result<Vec<CursorRecord>, StoreError> {
        let mut records: Vec<CursorRecord> = self.slots.read().await.values().cloned().collect();
        records.sort_by(|a, b| a.mailbox_id.cmp(&b.mailbox_id));
        Ok(records)
    }
}
