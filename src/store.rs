//! Primary durable store seam.
//!
//! Everything the queue manager and dedup store need from the durable
//! backend is expressed here as atomic single-row operations: conditional
//! inserts, guarded status updates with in-place counter increments, and
//! timestamp range queries. No read-modify-write round trips cross this
//! boundary, so concurrent workers cannot lose updates.

use serde::Serialize;
use thiserror::Error;

use crate::model::{
    MessageId, MessageStatus, OutboundMessage, ProcessedRecord, StuckReason, UnixTimeMs,
};

#[derive(Debug, Error)]
pub enum StoreError {
    /// The backend could not be reached. Write paths fall back to the WAL on
    /// this variant and only on this variant.
    #[error("store unavailable: {0}")]
    Unavailable(String),

    #[error("store backend error: {0}")]
    Backend(String),

    #[error("corrupted row {id}: {reason}")]
    CorruptedRow { id: String, reason: String },
}

impl StoreError {
    pub fn is_unavailable(&self) -> bool {
        matches!(self, StoreError::Unavailable(_))
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct StatusCounts {
    pub pending: u64,
    pub sent: u64,
    pub failed: u64,
}

/// Durable structured store operations consumed by the delivery subsystem.
#[async_trait::async_trait]
pub trait PrimaryStore: Send + Sync {
    /// Insert a message row. Idempotent by id: replaying an existing id is a
    /// no-op, which keeps WAL drains safe to repeat.
    async fn insert_message(&self, message: &OutboundMessage) -> Result<(), StoreError>;

    async fn get_message(&self, id: &MessageId) -> Result<Option<OutboundMessage>, StoreError>;

    /// Transition to `sent` and clear failure fields, guarded so a terminal
    /// row is never rewritten. Returns whether a row changed.
    async fn mark_sent(&self, id: &MessageId) -> Result<bool, StoreError>;

    /// Record a failed attempt: increments `retry_count` in place, stores the
    /// error verbatim and schedules the next attempt. Returns whether a row
    /// changed (false when the row is missing or already sent).
    async fn mark_failed(
        &self,
        id: &MessageId,
        error_message: &str,
        next_retry_at: UnixTimeMs,
    ) -> Result<bool, StoreError>;

    /// Operator reset to `pending`: clears `error_message`/`next_retry_at`
    /// but preserves `retry_count` for audit. Returns whether a row changed.
    async fn reset_to_pending(&self, id: &MessageId) -> Result<bool, StoreError>;

    /// Everything the sweep should attempt now: all `pending`, plus `failed`
    /// under the retry ceiling whose `next_retry_at` is due (or unset).
    async fn due_messages(
        &self,
        now: UnixTimeMs,
        retry_ceiling: u32,
        limit: usize,
    ) -> Result<Vec<OutboundMessage>, StoreError>;

    /// Failed rows at/over the retry ceiling, plus failed rows whose
    /// scheduled retry is past due by more than `stale_after_ms`, each tagged
    /// with the reason it qualified.
    async fn stuck_messages(
        &self,
        now: UnixTimeMs,
        retry_ceiling: u32,
        stale_after_ms: u64,
        limit: usize,
    ) -> Result<Vec<(OutboundMessage, StuckReason)>, StoreError>;

    async fn count_stuck(
        &self,
        now: UnixTimeMs,
        retry_ceiling: u32,
        stale_after_ms: u64,
    ) -> Result<u64, StoreError>;

    async fn status_counts(&self) -> Result<StatusCounts, StoreError>;

    /// Conditional insert of a processed-message claim; the uniqueness
    /// constraint on `message_id` is the single-writer gate. Returns `true`
    /// only for the winning claimer.
    async fn insert_processed(
        &self,
        id: &MessageId,
        processed_at: UnixTimeMs,
    ) -> Result<bool, StoreError>;

    async fn processed_exists(&self, id: &MessageId) -> Result<bool, StoreError>;

    async fn get_processed(&self, id: &MessageId)
        -> Result<Option<ProcessedRecord>, StoreError>;

    /// Operator un-process. Returns whether a row was removed.
    async fn delete_processed(&self, id: &MessageId) -> Result<bool, StoreError>;

    /// Processed records with `from <= processed_at <= to`, ascending.
    async fn processed_between(
        &self,
        from: UnixTimeMs,
        to: UnixTimeMs,
    ) -> Result<Vec<ProcessedRecord>, StoreError>;

    async fn processed_count_since(&self, since: UnixTimeMs) -> Result<u64, StoreError>;
}

// ============================================================================
// SQLite implementation
// ============================================================================

const SCHEMA: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS outbound_messages (
        id TEXT PRIMARY KEY,
        recipient TEXT NOT NULL,
        subject TEXT NOT NULL,
        body TEXT NOT NULL,
        status TEXT NOT NULL,
        retry_count INTEGER NOT NULL DEFAULT 0,
        next_retry_at INTEGER,
        error_message TEXT,
        created_at INTEGER NOT NULL
    )",
    "CREATE INDEX IF NOT EXISTS idx_outbound_status ON outbound_messages(status)",
    "CREATE INDEX IF NOT EXISTS idx_outbound_next_retry ON outbound_messages(next_retry_at)",
    "CREATE TABLE IF NOT EXISTS processed_messages (
        message_id TEXT PRIMARY KEY,
        processed_at INTEGER NOT NULL
    )",
    "CREATE INDEX IF NOT EXISTS idx_processed_at ON processed_messages(processed_at)",
];

type MessageRow = (
    String,
    String,
    String,
    String,
    String,
    i64,
    Option<i64>,
    Option<String>,
    i64,
);

const MESSAGE_COLUMNS: &str =
    "id, recipient, subject, body, status, retry_count, next_retry_at, error_message, created_at";

fn classify(err: sqlx::Error) -> StoreError {
    match &err {
        sqlx::Error::Io(_)
        | sqlx::Error::PoolTimedOut
        | sqlx::Error::PoolClosed
        | sqlx::Error::Tls(_) => StoreError::Unavailable(err.to_string()),
        _ => StoreError::Backend(err.to_string()),
    }
}

fn decode_message(row: MessageRow) -> Result<OutboundMessage, StoreError> {
    let (id, recipient, subject, body, status, retry_count, next_retry_at, error_message, created_at) =
        row;

    let corrupted = |reason: String| StoreError::CorruptedRow {
        id: id.clone(),
        reason,
    };

    let status = MessageStatus::try_from_str(&status)
        .ok_or_else(|| corrupted(format!("unknown status '{status}'")))?;
    let message_id = MessageId::new(id.clone()).map_err(|e| corrupted(e.to_string()))?;

    Ok(OutboundMessage {
        id: message_id,
        recipient,
        subject,
        body,
        status,
        retry_count: retry_count.max(0) as u32,
        next_retry_at: next_retry_at.map(|ms| UnixTimeMs(ms.max(0) as u64)),
        error_message,
        created_at: UnixTimeMs(created_at.max(0) as u64),
    })
}

/// `PrimaryStore` over a SQLite pool.
pub struct SqlitePrimaryStore {
    pool: sqlx::SqlitePool,
}

impl SqlitePrimaryStore {
    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        let pool = sqlx::sqlite::SqlitePoolOptions::new()
            .max_connections(5)
            .connect(database_url)
            .await
            .map_err(classify)?;
        Self::bootstrap(pool).await
    }

    /// In-memory database for tests. Pinned to a single connection because
    /// each new in-memory connection would otherwise be a fresh database.
    pub async fn connect_in_memory() -> Result<Self, StoreError> {
        let pool = sqlx::sqlite::SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .map_err(classify)?;
        Self::bootstrap(pool).await
    }

    async fn bootstrap(pool: sqlx::SqlitePool) -> Result<Self, StoreError> {
        for statement in SCHEMA {
            sqlx::query(statement)
                .execute(&pool)
                .await
                .map_err(classify)?;
        }
        Ok(Self { pool })
    }
}

#[async_trait::async_trait]
impl PrimaryStore for SqlitePrimaryStore {
    async fn insert_message(&self, message: &OutboundMessage) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO outbound_messages
                (id, recipient, subject, body, status, retry_count, next_retry_at, error_message, created_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT(id) DO NOTHING",
        )
        .bind(message.id.as_str())
        .bind(&message.recipient)
        .bind(&message.subject)
        .bind(&message.body)
        .bind(message.status.as_str())
        .bind(message.retry_count as i64)
        .bind(message.next_retry_at.map(|t| t.0 as i64))
        .bind(message.error_message.as_deref())
        .bind(message.created_at.0 as i64)
        .execute(&self.pool)
        .await
        .map_err(classify)?;

        Ok(())
    }

    async fn get_message(
        &self,
        id: &MessageId,
    ) -> Result<Option<OutboundMessage>, StoreError> {
        let row: Option<MessageRow> = sqlx::query_as(&format!(
            "SELECT {MESSAGE_COLUMNS} FROM outbound_messages WHERE id = ?"
        ))
        .bind(id.as_str())
        .fetch_optional(&self.pool)
        .await
        .map_err(classify)?;

        row.map(decode_message).transpose()
    }

    async fn mark_sent(&self, id: &MessageId) -> Result<bool, StoreError> {
        let result = sqlx::query(
            "UPDATE outbound_messages
             SET status = 'sent', error_message = NULL, next_retry_at = NULL
             WHERE id = ? AND status <> 'sent'",
        )
        .bind(id.as_str())
        .execute(&self.pool)
        .await
        .map_err(classify)?;

        Ok(result.rows_affected() > 0)
    }

    async fn mark_failed(
        &self,
        id: &MessageId,
        error_message: &str,
        next_retry_at: UnixTimeMs,
    ) -> Result<bool, StoreError> {
        let result = sqlx::query(
            "UPDATE outbound_messages
             SET status = 'failed',
                 retry_count = retry_count + 1,
                 next_retry_at = ?,
                 error_message = ?
             WHERE id = ? AND status <> 'sent'",
        )
        .bind(next_retry_at.0 as i64)
        .bind(error_message)
        .bind(id.as_str())
        .execute(&self.pool)
        .await
        .map_err(classify)?;

        Ok(result.rows_affected() > 0)
    }

    async fn reset_to_pending(&self, id: &MessageId) -> Result<bool, StoreError> {
        let result = sqlx::query(
            "UPDATE outbound_messages
             SET status = 'pending', error_message = NULL, next_retry_at = NULL
             WHERE id = ? AND status <> 'sent'",
        )
        .bind(id.as_str())
        .execute(&self.pool)
        .await
        .map_err(classify)?;

        Ok(result.rows_affected() > 0)
    }

    async fn due_messages(
        &self,
        now: UnixTimeMs,
        retry_ceiling: u32,
        limit: usize,
    ) -> Result<Vec<OutboundMessage>, StoreError> {
        let rows: Vec<MessageRow> = sqlx::query_as(&format!(
            "SELECT {MESSAGE_COLUMNS} FROM outbound_messages
             WHERE status = 'pending'
                OR (status = 'failed'
                    AND retry_count < ?
                    AND (next_retry_at IS NULL OR next_retry_at <= ?))
             ORDER BY created_at ASC
             LIMIT ?"
        ))
        .bind(retry_ceiling as i64)
        .bind(now.0 as i64)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(classify)?;

        rows.into_iter().map(decode_message).collect()
    }

    async fn stuck_messages(
        &self,
        now: UnixTimeMs,
        retry_ceiling: u32,
        stale_after_ms: u64,
        limit: usize,
    ) -> Result<Vec<(OutboundMessage, StuckReason)>, StoreError> {
        let stale_cutoff = now.saturating_sub_ms(stale_after_ms);

        let rows: Vec<MessageRow> = sqlx::query_as(&format!(
            "SELECT {MESSAGE_COLUMNS} FROM outbound_messages
             WHERE status = 'failed'
               AND (retry_count >= ?
                    OR (next_retry_at IS NOT NULL AND next_retry_at <= ?))
             ORDER BY created_at ASC
             LIMIT ?"
        ))
        .bind(retry_ceiling as i64)
        .bind(stale_cutoff.0 as i64)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(classify)?;

        rows.into_iter()
            .map(|row| {
                let message = decode_message(row)?;
                let reason = if message.retry_count >= retry_ceiling {
                    StuckReason::RetryCeilingExceeded
                } else {
                    StuckReason::SweepStale
                };
                Ok((message, reason))
            })
            .collect()
    }

    async fn count_stuck(
        &self,
        now: UnixTimeMs,
        retry_ceiling: u32,
        stale_after_ms: u64,
    ) -> Result<u64, StoreError> {
        let stale_cutoff = now.saturating_sub_ms(stale_after_ms);

        let (count,): (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM outbound_messages
             WHERE status = 'failed'
               AND (retry_count >= ?
                    OR (next_retry_at IS NOT NULL AND next_retry_at <= ?))",
        )
        .bind(retry_ceiling as i64)
        .bind(stale_cutoff.0 as i64)
        .fetch_one(&self.pool)
        .await
        .map_err(classify)?;

        Ok(count.max(0) as u64)
    }

    async fn status_counts(&self) -> Result<StatusCounts, StoreError> {
        let rows: Vec<(String, i64)> =
            sqlx::query_as("SELECT status, COUNT(*) FROM outbound_messages GROUP BY status")
                .fetch_all(&self.pool)
                .await
                .map_err(classify)?;

        let mut counts = StatusCounts::default();
        for (status, count) in rows {
            let count = count.max(0) as u64;
            match MessageStatus::try_from_str(&status) {
                Some(MessageStatus::Pending) => counts.pending = count,
                Some(MessageStatus::Sent) => counts.sent = count,
                Some(MessageStatus::Failed) => counts.failed = count,
                None => {
                    return Err(StoreError::Backend(format!(
                        "unknown status '{status}' in status counts"
                    )))
                }
            }
        }
        Ok(counts)
    }

    async fn insert_processed(
        &self,
        id: &MessageId,
        processed_at: UnixTimeMs,
    ) -> Result<bool, StoreError> {
        let result = sqlx::query(
            "INSERT INTO processed_messages (message_id, processed_at)
             VALUES (?, ?)
             ON CONFLICT(message_id) DO NOTHING",
        )
        .bind(id.as_str())
        .bind(processed_at.0 as i64)
        .execute(&self.pool)
        .await
        .map_err(classify)?;

        Ok(result.rows_affected() > 0)
    }

    async fn processed_exists(&self, id: &MessageId) -> Result<bool, StoreError> {
        let row: Option<(i64,)> =
            sqlx::query_as("SELECT 1 FROM processed_messages WHERE message_id = ?")
                .bind(id.as_str())
                .fetch_optional(&self.pool)
                .await
                .map_err(classify)?;

        Ok(row.is_some())
    }

    async fn get_processed(
        &self,
        id: &MessageId,
    ) -> Result<Option<ProcessedRecord>, StoreError> {
        let row: Option<(String, i64)> = sqlx::query_as(
            "SELECT message_id, processed_at FROM processed_messages WHERE message_id = ?",
        )
        .bind(id.as_str())
        .fetch_optional(&self.pool)
        .await
        .map_err(classify)?;

        row.map(|(message_id, processed_at)| {
            let message_id = MessageId::new(message_id.clone()).map_err(|e| {
                StoreError::CorruptedRow {
                    id: message_id,
                    reason: e.to_string(),
                }
            })?;
            Ok(ProcessedRecord {
                message_id,
                processed_at: UnixTimeMs(processed_at.max(0) as u64),
            })
        })
        .transpose()
    }

    async fn delete_processed(&self, id: &MessageId) -> Result<bool, StoreError> {
        let result = sqlx::query("DELETE FROM processed_messages WHERE message_id = ?")
            .bind(id.as_str())
            .execute(&self.pool)
            .await
            .map_err(classify)?;

        Ok(result.rows_affected() > 0)
    }

    async fn processed_between(
        &self,
        from: UnixTimeMs,
        to: UnixTimeMs,
    ) -> Result<Vec<ProcessedRecord>, StoreError> {
        let rows: Vec<(String, i64)> = sqlx::query_as(
            "SELECT message_id, processed_at FROM processed_messages
             WHERE processed_at >= ? AND processed_at <= ?
             ORDER BY processed_at ASC",
        )
        .bind(from.0 as i64)
        .bind(to.0 as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(classify)?;

        rows.into_iter()
            .map(|(message_id, processed_at)| {
                let message_id = MessageId::new(message_id.clone()).map_err(|e| {
                    StoreError::CorruptedRow {
                        id: message_id,
                        reason: e.to_string(),
                    }
                })?;
                Ok(ProcessedRecord {
                    message_id,
                    processed_at: UnixTimeMs(processed_at.max(0) as u64),
                })
            })
            .collect()
    }

    async fn processed_count_since(&self, since: UnixTimeMs) -> Result<u64, StoreError> {
        let (count,): (i64,) =
            sqlx::query_as("SELECT COUNT(*) FROM processed_messages WHERE processed_at >= ?")
                .bind(since.0 as i64)
                .fetch_one(&self.pool)
                .await
                .map_err(classify)?;

        Ok(count.max(0) as u64)
    }
}
