//! Change resolver: turns a watermark into an ordered, deduplicated batch.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::debug;

use crate::error::ResolveError;
use crate::pipeline::types::{ChangeRecord, ChangeSource, Watermark};

/// Ordered, deduplicated change records plus the watermark to commit once
/// all of them settle.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResolvedBatch {
    /// Non-decreasing `sequence` order, one entry per message id.
    pub records: Vec<ChangeRecord>,
    pub new_watermark: Watermark,
}

impl ResolvedBatch {
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }
}

/// Wraps a [`ChangeSource`] with dedup and ordering.
///
/// Holds no state of its own, so resolving the same input twice yields the
/// same batch.
pub struct ChangeResolver {
    source: Arc<dyn ChangeSource>,
}

impl ChangeResolver {
    pub fn new(source: Arc<dyn ChangeSource>) -> Self {
        Self { source }
    }

    pub async fn resolve(
        &self,
        mailbox_id: &str,
        since: Watermark,
    ) -> Result<ResolvedBatch, ResolveError> {
        let changes = self.source.list_changes_since(mailbox_id, since).await?;
        let raw = changes.records.len();
        let batch = normalize(changes.records, changes.new_watermark, since);

        debug!(
            mailbox = mailbox_id,
            since = %since,
            raw,
            unique = batch.len(),
            new_watermark = %batch.new_watermark,
            "Resolved change batch"
        );
        Ok(batch)
    }
}

/// Keep the highest sequence per message id, drop anything at or below
/// `since`, and sort by sequence.
///
/// The returned watermark is never behind `since` or any returned record.
pub fn normalize(
    records: Vec<ChangeRecord>,
    reported: Watermark,
    since: Watermark,
) -> ResolvedBatch {
    let mut latest: HashMap<String, Watermark> = HashMap::with_capacity(records.len());
    for record in records {
        if record.sequence <= since {
            continue;
        }
        latest
            .entry(record.message_id)
            .and_modify(|seq| *seq = (*seq).max(record.sequence))
            .or_insert(record.sequence);
    }

    let mut records: Vec<ChangeRecord> = latest
        .into_iter()
        .map(|(message_id, sequence)| ChangeRecord {
            sequence,
            message_id,
        })
        .collect();
    // Message id as tie-break keeps the order deterministic.
    records.sort_by(|a, b| {
        a.sequence
            .cmp(&b.sequence)
            .then_with(|| a.message_id.cmp(&b.message_id))
    });

    let highest = records.last().map(|r| r.sequence).unwrap_or(since);
    ResolvedBatch {
        records,
        new_watermark: reported.max(highest).max(since),
    }
}
