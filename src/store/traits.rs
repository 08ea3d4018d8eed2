//! `CursorStore` trait: backend-agnostic watermark persistence.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::error::StoreError;
use crate::pipeline::types::Watermark;

/// One persisted cursor per mailbox.
///
/// External readers (health endpoints) may read this record; only the
/// mailbox's own orchestrator writes it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CursorRecord {
    pub mailbox_id: String,
    pub watermark: Watermark,
    pub updated_at: DateTime<Utc>,
}

/// Compare-and-advance watermark storage.
#[async_trait]
pub trait CursorStore: Send + Sync {
    /// Stored watermark, or `Watermark::BEGINNING` if none exists.
    async fn load(&self, mailbox_id: &str) -> Result<Watermark, StoreError>;

    /// Advance the stored watermark to `watermark`.
    ///
    /// A no-op (not an error) when `watermark` is at or below the stored
    /// value, so a late stale commit never overwrites a newer one. Returns
    /// whether the stored value moved.
    async fn commit(&self, mailbox_id: &str, watermark: Watermark) -> Result<bool, StoreError>;

    /// Full record for one mailbox, if any.
    async fn record(&self, mailbox_id: &str) -> Result<Option<CursorRecord>, StoreError>;

    /// All records, ordered by mailbox id.
    async fn list(&self) -> Result<Vec<CursorRecord>, StoreError>;
}
