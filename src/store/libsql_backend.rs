//! libSQL backend: durable `CursorStore` implementation.
//!
//! Supports local file and in-memory databases. Commits are a single
//! compare-and-advance UPSERT, so a stale watermark never overwrites a
//! newer one even if two writers race.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use libsql::{Connection, Database as LibSqlDatabase, params};
use tracing::{debug, info};

use crate::error::StoreError;
use crate::pipeline::types::Watermark;
use crate::store::migrations;
use crate::store::traits::{CursorRecord, CursorStore};

/// libSQL cursor store.
///
/// Stores a single connection that is reused for all operations.
/// `libsql::Connection` is `Send + Sync` and safe for concurrent async use.
pub struct LibSqlCursorStore {
    #[allow(dead_code)]
    db: Arc<LibSqlDatabase>,
    conn: Connection,
}

impl LibSqlCursorStore {
    /// Open (or create) a local database file and run migrations.
    pub async fn new_local(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent).map_err(|e| {
                StoreError::Unavailable(format!("Failed to create database directory: {e}"))
            })?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(|e| StoreError::Unavailable(format!("Failed to open libSQL database: {e}")))?;

        let store = Self::from_database(db).await?;
        info!(path = %path.display(), "Cursor store opened");
        Ok(store)
    }

    /// Create an in-memory database (for tests).
    pub async fn new_memory() -> Result<Self, StoreError> {
        let db = libsql::Builder::new_local(":memory:")
            .build()
            .await
            .map_err(|e| {
                StoreError::Unavailable(format!("Failed to create in-memory database: {e}"))
            })?;
        Self::from_database(db).await
    }

    async fn from_database(db: LibSqlDatabase) -> Result<Self, StoreError> {
        let conn = db
            .connect()
            .map_err(|e| StoreError::Unavailable(format!("Failed to create connection: {e}")))?;
        migrations::run_migrations(&conn).await?;
        Ok(Self {
            db: Arc::new(db),
            conn,
        })
    }

    fn conn(&self) -> &Connection {
        &self.conn
    }
}

// ── Helper functions ────────────────────────────────────────────────

/// Parse an RFC 3339 or SQLite datetime string into DateTime<Utc>.
fn parse_datetime(s: &str) -> Result<DateTime<Utc>, StoreError> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Ok(dt.with_timezone(&Utc));
    }
    if let Ok(ndt) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f") {
        return Ok(ndt.and_utc());
    }
    if let Ok(ndt) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S") {
        return Ok(ndt.and_utc());
    }
    Err(StoreError::Corrupt(format!("unparseable updated_at '{s}'")))
}

/// Watermarks are stored as SQLite INTEGER (i64).
fn to_sql_watermark(watermark: Watermark) -> Result<i64, StoreError> {
    i64::try_from(watermark.value()).map_err(|_| {
        StoreError::Corrupt(format!("watermark {watermark} exceeds storable range"))
    })
}

fn from_sql_watermark(value: i64) -> Result<Watermark, StoreError> {
    u64::try_from(value)
        .map(Watermark::new)
        .map_err(|_| StoreError::Corrupt(format!("negative watermark {value}")))
}

fn row_to_record(row: &libsql::Row) -> Result<CursorRecord, StoreError> {
    let mailbox_id: String = row
        .get(0)
        .map_err(|e| StoreError::Corrupt(format!("mailbox_id: {e}")))?;
    let watermark: i64 = row
        .get(1)
        .map_err(|e| StoreError::Corrupt(format!("watermark: {e}")))?;
    let updated_at: String = row
        .get(2)
        .map_err(|e| StoreError::Corrupt(format!("updated_at: {e}")))?;
    Ok(CursorRecord {
        mailbox_id,
        watermark: from_sql_watermark(watermark)?,
        updated_at: parse_datetime(&updated_at)?,
    })
}

// ── Trait implementation ────────────────────────────────────────────

#[async_trait]
impl CursorStore for LibSqlCursorStore {
    async fn load(&self, mailbox_id: &str) -> Result<Watermark, StoreError> {
        Ok(self
            .record(mailbox_id)
            .await?
            .map(|r| r.watermark)
            .unwrap_or(Watermark::BEGINNING))
    }

    async fn commit(&self, mailbox_id: &str, watermark: Watermark) -> Result<bool, StoreError> {
        let value = to_sql_watermark(watermark)?;
        let now = Utc::now().to_rfc3339();
        let affected = self
            .conn()
            .execute(
                "INSERT INTO cursors (mailbox_id, watermark, updated_at) VALUES (?1, ?2, ?3)
                 ON CONFLICT(mailbox_id) DO UPDATE SET
                     watermark = excluded.watermark,
                     updated_at = excluded.updated_at
                 WHERE excluded.watermark > cursors.watermark",
                params![mailbox_id, value, now],
            )
            .await
            .map_err(|e| StoreError::Unavailable(format!("Failed to commit watermark: {e}")))?;

        let advanced = affected > 0;
        debug!(mailbox = mailbox_id, watermark = %watermark, advanced, "Cursor commit");
        Ok(advanced)
    }

    async fn record(&self, mailbox_id: &str) -> Result<Option<CursorRecord>, StoreError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT mailbox_id, watermark, updated_at FROM cursors WHERE mailbox_id = ?1",
                params![mailbox_id],
            )
            .await
            .map_err(|e| StoreError::Unavailable(format!("Failed to load cursor: {e}")))?;

        match rows
            .next()
            .await
            .map_err(|e| StoreError::Unavailable(format!("Failed to read cursor row: {e}")))?
        {
            Some(row) => Ok(Some(row_to_record(&row)?)),
            None => Ok(None),
        }
    }

    async fn list(&self) -> Result<Vec<CursorRecord>, StoreError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT mailbox_id, watermark, updated_at FROM cursors ORDER BY mailbox_id",
                (),
            )
            .await
            .map_err(|e| StoreError::Unavailable(format!("Failed to list cursors: {e}")))?;

        let mut records = Vec::new();
        while let Some(row) = rows
            .next()
            .await
            .map_err(|e| StoreError::Unavailable(format!("Failed to read cursor row: {e}")))?
        {
            records.push(row_to_record(&row)?);
        }
        Ok(records)
    }
}
