//! Offline Storage - durable queue of pending mutations
//!
//! Thin layer over the SQLite substrate. Every public method is async and runs
//! its SQL on the blocking pool, so callers treat storage I/O as a suspension
//! point. Payloads go through the `PayloadCodec` (compression + encryption)
//! on the way in and out; callers only ever see plain `QueueItem`s.
//!
//! Features:
//! - Priority-then-age ordered retrieval with status/user/type filters
//! - Atomic pending → processing claims (at most one owner per item)
//! - Partial updates that are a no-op for vanished items
//! - Dead-letter store for items that are dropped from the queue
//! - Maintenance: retention, oversized eviction, stale claim release

use super::item::{now_millis, ItemMetadata, OperationType, Priority, QueueItem, QueueOperation, QueueStatus};
use crate::crypto::{CryptoError, EncodedPayload, PayloadCodec};
use crate::db::{Database, DbError};
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::types::Value;
use rusqlite::{params, params_from_iter, Row};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

const ITEM_COLUMNS: &str = "id, user_id, operation_type, priority, status, payload, encoding, \
     checksum, retry_count, max_retries, last_error, next_retry_at, estimated_size, created_at, \
     processing_started_at";

const DEAD_LETTER_COLUMNS: &str = "id, user_id, operation_type, priority, payload, encoding, \
     checksum, retry_count, max_retries, estimated_size, reason, last_error, created_at, \
     dead_lettered_at";

// ============================================================================
// Configuration
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Payloads larger than this are gzip-compressed
    pub compression_threshold_bytes: usize,
    /// Encrypt payloads with the device secret
    pub encrypt_payloads: bool,
    /// Items older than this are moved to the dead-letter store
    pub retention_days: u32,
    /// Items larger than this are moved to the dead-letter store
    pub max_item_size_bytes: u64,
    /// Claims older than this are assumed abandoned and released
    pub stale_claim_timeout_secs: u64,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            compression_threshold_bytes: 1024,
            encrypt_payloads: true,
            retention_days: 7,
            max_item_size_bytes: 5 * 1024 * 1024,
            stale_claim_timeout_secs: 600,
        }
    }
}

// ============================================================================
// Data Types
// ============================================================================

/// Retrieval filter
#[derive(Debug, Clone, Default)]
pub struct QueueFilter {
    pub status: Option<QueueStatus>,
    pub user_id: Option<String>,
    pub operation_type: Option<OperationType>,
    /// Only pending items and failed items whose backoff has elapsed
    pub ready_only: bool,
}

impl QueueFilter {
    pub fn pending() -> Self {
        Self {
            status: Some(QueueStatus::Pending),
            ..Default::default()
        }
    }

    pub fn ready() -> Self {
        Self {
            ready_only: true,
            ..Default::default()
        }
    }

    pub fn with_status(mut self, status: QueueStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn with_user(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }

    pub fn with_operation(mut self, operation_type: OperationType) -> Self {
        self.operation_type = Some(operation_type);
        self
    }

    /// WHERE clause (without the keyword) and its parameters
    fn to_sql(&self, now: &str) -> (String, Vec<Value>) {
        let mut conditions: Vec<&str> = Vec::new();
        let mut values: Vec<Value> = Vec::new();

        if let Some(status) = self.status {
            conditions.push("status = ?");
            values.push(Value::Text(status.as_str().to_string()));
        }
        if let Some(user_id) = &self.user_id {
            conditions.push("user_id = ?");
            values.push(Value::Text(user_id.clone()));
        }
        if let Some(operation_type) = self.operation_type {
            conditions.push("operation_type = ?");
            values.push(Value::Text(operation_type.as_str().to_string()));
        }
        if self.ready_only {
            conditions.push(
                "(status = 'pending' OR (status = 'failed' AND (next_retry_at IS NULL OR next_retry_at <= ?)))",
            );
            values.push(Value::Text(now.to_string()));
        }

        if conditions.is_empty() {
            ("1 = 1".to_string(), values)
        } else {
            (conditions.join(" AND "), values)
        }
    }
}

/// Partial field update; `None` leaves a column untouched
#[derive(Debug, Clone, Default)]
pub struct ItemUpdate {
    pub status: Option<QueueStatus>,
    pub priority: Option<Priority>,
    pub retry_count: Option<u32>,
    pub last_error: Option<Option<String>>,
    pub next_retry_at: Option<Option<DateTime<Utc>>>,
    pub processing_started_at: Option<Option<DateTime<Utc>>>,
}

impl ItemUpdate {
    fn assignments(&self) -> (Vec<&'static str>, Vec<Value>) {
        let mut sets = Vec::new();
        let mut values = Vec::new();

        if let Some(status) = self.status {
            sets.push("status = ?");
            values.push(Value::Text(status.as_str().to_string()));
        }
        if let Some(priority) = self.priority {
            sets.push("priority = ?");
            values.push(Value::Integer(priority.as_i64()));
        }
        if let Some(retry_count) = self.retry_count {
            sets.push("retry_count = ?");
            values.push(Value::Integer(i64::from(retry_count)));
        }
        if let Some(last_error) = &self.last_error {
            sets.push("last_error = ?");
            values.push(last_error.clone().map_or(Value::Null, Value::Text));
        }
        if let Some(next_retry_at) = &self.next_retry_at {
            sets.push("next_retry_at = ?");
            values.push(next_retry_at.map_or(Value::Null, |dt| Value::Text(db_time(&dt))));
        }
        if let Some(started) = &self.processing_started_at {
            sets.push("processing_started_at = ?");
            values.push(started.map_or(Value::Null, |dt| Value::Text(db_time(&dt))));
        }

        (sets, values)
    }
}

/// Storage statistics
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StorageStats {
    pub total_items: u64,
    /// Sum of the items' serialized payload sizes
    pub total_size_bytes: u64,
    /// Bytes actually held in the payload column after encoding
    pub stored_size_bytes: u64,
    pub oldest_item_age: Option<Duration>,
    pub pending_items: u64,
    pub processing_items: u64,
    pub failed_items: u64,
    pub dead_letter_items: u64,
}

/// Outcome of one maintenance pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MaintenanceReport {
    pub expired: usize,
    pub oversized: usize,
    pub released_claims: usize,
}

/// Why an item left the queue without being synced
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeadLetterReason {
    RetriesExhausted,
    NonRetryable,
    Expired,
    Oversized,
}

impl DeadLetterReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::RetriesExhausted => "retries_exhausted",
            Self::NonRetryable => "non_retryable",
            Self::Expired => "expired",
            Self::Oversized => "oversized",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "retries_exhausted" => Some(Self::RetriesExhausted),
            "non_retryable" => Some(Self::NonRetryable),
            "expired" => Some(Self::Expired),
            "oversized" => Some(Self::Oversized),
            _ => None,
        }
    }
}

/// Item parked in the dead-letter store
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeadLetterEntry {
    pub id: String,
    pub user_id: String,
    pub operation_type: Option<OperationType>,
    pub priority: Priority,
    /// `None` if the stored payload no longer decodes
    pub operation: Option<QueueOperation>,
    pub retry_count: u32,
    pub reason: Option<DeadLetterReason>,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub dead_lettered_at: DateTime<Utc>,
}

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("Database error: {0}")]
    Database(#[from] DbError),

    #[error("Payload codec error: {0}")]
    Codec(#[from] CryptoError),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Corrupt queue row {id}: {reason}")]
    CorruptRow { id: String, reason: String },

    #[error("Storage task failed: {0}")]
    Task(String),
}

impl From<rusqlite::Error> for StorageError {
    fn from(e: rusqlite::Error) -> Self {
        StorageError::Database(DbError::Sqlite(e))
    }
}

// ============================================================================
// Row mapping
// ============================================================================

fn db_time(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Millis, true)
}

fn parse_db_time(id: &str, s: &str) -> Result<DateTime<Utc>, StorageError> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| StorageError::CorruptRow {
            id: id.to_string(),
            reason: format!("bad timestamp '{}': {}", s, e),
        })
}

fn parse_opt_time(id: &str, s: Option<String>) -> Result<Option<DateTime<Utc>>, StorageError> {
    s.map(|value| parse_db_time(id, &value)).transpose()
}

/// Queue row as read from SQLite, before payload decoding
struct RawItem {
    id: String,
    user_id: String,
    operation_type: String,
    priority: i64,
    status: String,
    payload: EncodedPayload,
    retry_count: i64,
    max_retries: i64,
    last_error: Option<String>,
    next_retry_at: Option<String>,
    estimated_size: i64,
    created_at: String,
    processing_started_at: Option<String>,
}

impl RawItem {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            user_id: row.get(1)?,
            operation_type: row.get(2)?,
            priority: row.get(3)?,
            status: row.get(4)?,
            payload: EncodedPayload {
                data: row.get(5)?,
                flags: row.get::<_, i64>(6)? as u8,
                checksum: row.get(7)?,
            },
            retry_count: row.get(8)?,
            max_retries: row.get(9)?,
            last_error: row.get(10)?,
            next_retry_at: row.get(11)?,
            estimated_size: row.get(12)?,
            created_at: row.get(13)?,
            processing_started_at: row.get(14)?,
        })
    }

    fn decode(self, codec: &PayloadCodec) -> Result<QueueItem, StorageError> {
        let operation = decode_operation(codec, &self.user_id, &self.payload)?;

        if operation.operation_type().as_str() != self.operation_type {
            return Err(StorageError::CorruptRow {
                id: self.id,
                reason: format!("operation type column '{}' does not match payload", self.operation_type),
            });
        }

        let status = QueueStatus::parse(&self.status).ok_or_else(|| StorageError::CorruptRow {
            id: self.id.clone(),
            reason: format!("unknown status '{}'", self.status),
        })?;

        Ok(QueueItem {
            operation,
            priority: Priority::from_i64(self.priority),
            status,
            metadata: ItemMetadata {
                retry_count: self.retry_count.max(0) as u32,
                max_retries: self.max_retries.max(0) as u32,
                last_error: self.last_error,
                next_retry_at: parse_opt_time(&self.id, self.next_retry_at)?,
                estimated_size: self.estimated_size.max(0) as u64,
                created_at: parse_db_time(&self.id, &self.created_at)?,
                processing_started_at: parse_opt_time(&self.id, self.processing_started_at)?,
            },
            user_id: self.user_id,
            id: self.id,
        })
    }
}

fn decode_operation(
    codec: &PayloadCodec,
    user_id: &str,
    payload: &EncodedPayload,
) -> Result<QueueOperation, StorageError> {
    let bytes = codec.decode(user_id, payload)?;
    serde_json::from_slice(&bytes).map_err(|e| StorageError::Serialization(e.to_string()))
}

// ============================================================================
// Offline Storage
// ============================================================================

/// Durable store for queue items
#[derive(Clone)]
pub struct OfflineStorage {
    db: Database,
    codec: Arc<PayloadCodec>,
    config: Arc<StorageConfig>,
}

impl OfflineStorage {
    pub fn new(db: Database, codec: PayloadCodec, config: StorageConfig) -> Self {
        Self {
            db,
            codec: Arc::new(codec),
            config: Arc::new(config),
        }
    }

    pub fn database(&self) -> &Database {
        &self.db
    }

    pub fn config(&self) -> &StorageConfig {
        &self.config
    }

    /// Run blocking SQL work off the async executor
    async fn run<T, F>(&self, f: F) -> Result<T, StorageError>
    where
        F: FnOnce(&OfflineStorage) -> Result<T, StorageError> + Send + 'static,
        T: Send + 'static,
    {
        let storage = self.clone();
        tokio::task::spawn_blocking(move || f(&storage))
            .await
            .map_err(|e| StorageError::Task(e.to_string()))?
    }

    // ------------------------------------------------------------------------
    // Writes
    // ------------------------------------------------------------------------

    /// Persist one item (insert, or overwrite an item with the same id)
    pub async fn store(&self, item: &QueueItem) -> Result<(), StorageError> {
        let item = item.clone();
        self.run(move |s| {
            let encoded = s.encode(&item)?;
            s.db.with_transaction(|tx| {
                upsert_row(tx, &item, &encoded)?;
                Ok(())
            })?;
            log::debug!("Stored queue item {} ({})", item.id, item.operation_type().as_str());
            Ok(())
        })
        .await
    }

    /// Persist many items in a single transaction
    pub async fn store_batch(&self, items: &[QueueItem]) -> Result<usize, StorageError> {
        let items = items.to_vec();
        self.run(move |s| {
            let encoded = items
                .iter()
                .map(|item| s.encode(item))
                .collect::<Result<Vec<_>, _>>()?;

            s.db.with_transaction(|tx| {
                for (item, payload) in items.iter().zip(encoded.iter()) {
                    upsert_row(tx, item, payload)?;
                }
                Ok(())
            })?;

            log::debug!("Stored batch of {} queue items", items.len());
            Ok(items.len())
        })
        .await
    }

    fn encode(&self, item: &QueueItem) -> Result<EncodedPayload, StorageError> {
        let json = serde_json::to_vec(&item.operation)
            .map_err(|e| StorageError::Serialization(e.to_string()))?;
        Ok(self.codec.encode(&item.user_id, &json)?)
    }

    /// Merge fields into an existing item; returns false if the item is gone
    pub async fn update(&self, id: &str, update: ItemUpdate) -> Result<bool, StorageError> {
        let id = id.to_string();
        self.run(move |s| {
            let (mut sets, mut values) = update.assignments();
            sets.push("updated_at = ?");
            values.push(Value::Text(db_time(&now_millis())));
            values.push(Value::Text(id.clone()));

            let sql = format!("UPDATE offline_queue SET {} WHERE id = ?", sets.join(", "));
            let affected = s.db.execute(&sql, params_from_iter(values.iter()))?;

            if affected == 0 {
                log::debug!("Update skipped, queue item {} no longer exists", id);
            }
            Ok(affected > 0)
        })
        .await
    }

    pub async fn delete(&self, id: &str) -> Result<bool, StorageError> {
        let id = id.to_string();
        self.run(move |s| {
            let affected = s.db.execute("DELETE FROM offline_queue WHERE id = ?1", params![id])?;
            Ok(affected > 0)
        })
        .await
    }

    /// Remove all items matching `filter` (everything when `None`)
    pub async fn clear(&self, filter: Option<QueueFilter>) -> Result<usize, StorageError> {
        self.run(move |s| {
            let filter = filter.unwrap_or_default();
            let (where_clause, values) = filter.to_sql(&db_time(&Utc::now()));
            let sql = format!("DELETE FROM offline_queue WHERE {}", where_clause);
            let deleted = s.db.execute(&sql, params_from_iter(values.iter()))?;
            log::info!("Cleared {} queue items", deleted);
            Ok(deleted)
        })
        .await
    }

    // ------------------------------------------------------------------------
    // Reads
    // ------------------------------------------------------------------------

    pub async fn retrieve(&self, id: &str) -> Result<Option<QueueItem>, StorageError> {
        let id = id.to_string();
        self.run(move |s| {
            let sql = format!("SELECT {} FROM offline_queue WHERE id = ?1", ITEM_COLUMNS);
            let rows = s.db.query(&sql, params![id], RawItem::from_row)?;
            rows.into_iter()
                .next()
                .map(|raw| raw.decode(&s.codec))
                .transpose()
        })
        .await
    }

    /// Matching items, highest priority first, oldest first within a priority
    pub async fn retrieve_many(
        &self,
        filter: QueueFilter,
        limit: usize,
    ) -> Result<Vec<QueueItem>, StorageError> {
        self.run(move |s| s.retrieve_many_blocking(&filter, limit)).await
    }

    fn retrieve_many_blocking(
        &self,
        filter: &QueueFilter,
        limit: usize,
    ) -> Result<Vec<QueueItem>, StorageError> {
        let (where_clause, mut values) = filter.to_sql(&db_time(&Utc::now()));
        values.push(Value::Integer(limit.min(i64::MAX as usize) as i64));

        let sql = format!(
            "SELECT {} FROM offline_queue WHERE {} \
             ORDER BY priority DESC, created_at ASC, rowid ASC LIMIT ?",
            ITEM_COLUMNS, where_clause
        );
        let rows = self.db.query(&sql, params_from_iter(values.iter()), RawItem::from_row)?;

        let mut items = Vec::with_capacity(rows.len());
        for raw in rows {
            let id = raw.id.clone();
            match raw.decode(&self.codec) {
                Ok(item) => items.push(item),
                // A single undecodable row must not wedge the whole queue
                Err(e) => log::error!("Skipping unreadable queue item {}: {}", id, e),
            }
        }
        Ok(items)
    }

    // ------------------------------------------------------------------------
    // Claims
    // ------------------------------------------------------------------------

    /// Atomically move a ready item to `processing`; false if someone else owns it
    pub async fn claim(&self, id: &str) -> Result<bool, StorageError> {
        let id = id.to_string();
        self.run(move |s| s.claim_blocking(&id, &now_millis())).await
    }

    fn claim_blocking(&self, id: &str, now: &DateTime<Utc>) -> Result<bool, StorageError> {
        let now = db_time(now);
        let affected = self.db.execute(
            r#"
            UPDATE offline_queue
            SET status = 'processing', processing_started_at = ?1, updated_at = ?1
            WHERE id = ?2
              AND (status = 'pending'
                   OR (status = 'failed' AND (next_retry_at IS NULL OR next_retry_at <= ?1)))
            "#,
            params![now, id],
        )?;
        Ok(affected == 1)
    }

    /// Retrieve up to `limit` ready items in priority order and claim each
    ///
    /// Items claimed concurrently by another caller are skipped, so the
    /// result may be shorter than the ready set.
    pub async fn claim_ready(
        &self,
        filter: QueueFilter,
        limit: usize,
    ) -> Result<Vec<QueueItem>, StorageError> {
        self.run(move |s| {
            let filter = QueueFilter {
                ready_only: true,
                status: None,
                ..filter
            };
            let candidates = s.retrieve_many_blocking(&filter, limit)?;

            let mut claimed = Vec::with_capacity(candidates.len());
            for mut item in candidates {
                let now = now_millis();
                if s.claim_blocking(&item.id, &now)? {
                    item.status = QueueStatus::Processing;
                    item.metadata.processing_started_at = Some(now);
                    claimed.push(item);
                } else {
                    log::debug!("Queue item {} was claimed elsewhere", item.id);
                }
            }
            Ok(claimed)
        })
        .await
    }

    /// Hand claimed items back as pending, keeping their retry metadata
    ///
    /// For items claimed but never dispatched; returns how many were released.
    pub async fn release_claims(&self, ids: &[String]) -> Result<usize, StorageError> {
        if ids.is_empty() {
            return Ok(0);
        }
        let ids = ids.to_vec();
        self.run(move |s| {
            let placeholders = vec!["?"; ids.len()].join(", ");
            let sql = format!(
                "UPDATE offline_queue \
                 SET status = 'pending', processing_started_at = NULL, updated_at = ? \
                 WHERE status = 'processing' AND id IN ({})",
                placeholders
            );
            let mut values = vec![Value::Text(db_time(&now_millis()))];
            values.extend(ids.iter().cloned().map(Value::Text));

            let released = s.db.execute(&sql, params_from_iter(values.iter()))?;
            log::debug!("Released {} claimed queue items", released);
            Ok(released)
        })
        .await
    }

    // ------------------------------------------------------------------------
    // Stats & maintenance
    // ------------------------------------------------------------------------

    pub async fn get_stats(&self) -> Result<StorageStats, StorageError> {
        self.run(|s| {
            let (mut stats, oldest) = s.db.query_row(
                r#"
                SELECT
                    COUNT(*),
                    COALESCE(SUM(estimated_size), 0),
                    COALESCE(SUM(LENGTH(payload)), 0),
                    MIN(created_at),
                    COALESCE(SUM(CASE WHEN status = 'pending' THEN 1 ELSE 0 END), 0),
                    COALESCE(SUM(CASE WHEN status = 'processing' THEN 1 ELSE 0 END), 0),
                    COALESCE(SUM(CASE WHEN status = 'failed' THEN 1 ELSE 0 END), 0)
                FROM offline_queue
                "#,
                [],
                |row| {
                    Ok((
                        StorageStats {
                            total_items: row.get::<_, i64>(0)?.max(0) as u64,
                            total_size_bytes: row.get::<_, i64>(1)?.max(0) as u64,
                            stored_size_bytes: row.get::<_, i64>(2)?.max(0) as u64,
                            oldest_item_age: None,
                            pending_items: row.get::<_, i64>(4)?.max(0) as u64,
                            processing_items: row.get::<_, i64>(5)?.max(0) as u64,
                            failed_items: row.get::<_, i64>(6)?.max(0) as u64,
                            dead_letter_items: 0,
                        },
                        row.get::<_, Option<String>>(3)?,
                    ))
                },
            )?;

            if let Some(oldest) = oldest {
                let created = parse_db_time("<stats>", &oldest)?;
                stats.oldest_item_age = Some((Utc::now() - created).to_std().unwrap_or_default());
            }

            stats.dead_letter_items = s
                .db
                .query_row("SELECT COUNT(*) FROM dead_letter_queue", [], |row| row.get::<_, i64>(0))?
                .max(0) as u64;

            Ok(stats)
        })
        .await
    }

    /// Evict expired and oversized items and release abandoned claims
    pub async fn perform_maintenance(&self) -> Result<MaintenanceReport, StorageError> {
        self.run(|s| {
            let now = Utc::now();
            let now_str = db_time(&now);
            let retention_cutoff =
                db_time(&(now - chrono::Duration::days(i64::from(s.config.retention_days))));
            let stale_cutoff = db_time(
                &(now - chrono::Duration::seconds(s.config.stale_claim_timeout_secs.min(u64::from(u32::MAX)) as i64)),
            );
            let max_size = s.config.max_item_size_bytes.min(i64::MAX as u64) as i64;

            let report = s.db.with_transaction(|tx| {
                let expired = move_to_dead_letter(
                    tx,
                    "created_at < ?1 AND status != 'processing'",
                    &[Value::Text(retention_cutoff.clone())],
                    DeadLetterReason::Expired,
                    &now_str,
                )?;

                let oversized = move_to_dead_letter(
                    tx,
                    "estimated_size > ?1 AND status != 'processing'",
                    &[Value::Integer(max_size)],
                    DeadLetterReason::Oversized,
                    &now_str,
                )?;

                let released_claims = tx.execute(
                    r#"
                    UPDATE offline_queue
                    SET status = 'pending', processing_started_at = NULL, updated_at = ?1
                    WHERE status = 'processing'
                      AND (processing_started_at IS NULL OR processing_started_at < ?2)
                    "#,
                    params![now_str, stale_cutoff],
                )?;

                Ok(MaintenanceReport {
                    expired,
                    oversized,
                    released_claims,
                })
            })?;

            if report != MaintenanceReport::default() {
                log::info!(
                    "Queue maintenance: {} expired, {} oversized, {} stale claims released",
                    report.expired,
                    report.oversized,
                    report.released_claims
                );
            }
            Ok(report)
        })
        .await
    }

    // ------------------------------------------------------------------------
    // Dead letters
    // ------------------------------------------------------------------------

    /// Move an item out of the queue into the dead-letter store
    pub async fn dead_letter(
        &self,
        id: &str,
        reason: DeadLetterReason,
        last_error: Option<String>,
    ) -> Result<bool, StorageError> {
        let id = id.to_string();
        self.run(move |s| {
            let moved = s.db.with_transaction(|tx| {
                if let Some(error) = &last_error {
                    tx.execute(
                        "UPDATE offline_queue SET last_error = ?1 WHERE id = ?2",
                        params![error, id],
                    )?;
                }
                move_to_dead_letter(
                    tx,
                    "id = ?1",
                    &[Value::Text(id.clone())],
                    reason,
                    &db_time(&Utc::now()),
                )
            })?;

            if moved > 0 {
                log::warn!("Queue item {} moved to dead-letter store ({})", id, reason.as_str());
            }
            Ok(moved > 0)
        })
        .await
    }

    pub async fn dead_letters(&self, limit: usize) -> Result<Vec<DeadLetterEntry>, StorageError> {
        self.run(move |s| {
            let sql = format!(
                "SELECT {} FROM dead_letter_queue ORDER BY dead_lettered_at DESC LIMIT ?1",
                DEAD_LETTER_COLUMNS
            );
            let rows = s.db.query(
                &sql,
                params![limit.min(i64::MAX as usize) as i64],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, i64>(3)?,
                        EncodedPayload {
                            data: row.get(4)?,
                            flags: row.get::<_, i64>(5)? as u8,
                            checksum: row.get(6)?,
                        },
                        row.get::<_, i64>(7)?,
                        row.get::<_, String>(10)?,
                        row.get::<_, Option<String>>(11)?,
                        row.get::<_, String>(12)?,
                        row.get::<_, String>(13)?,
                    ))
                },
            )?;

            rows.into_iter()
                .map(
                    |(id, user_id, op, priority, payload, retries, reason, last_error, created, dead)|
                     -> Result<DeadLetterEntry, StorageError> {
                        let operation = decode_operation(&s.codec, &user_id, &payload).ok();
                        Ok(DeadLetterEntry {
                            created_at: parse_db_time(&id, &created)?,
                            dead_lettered_at: parse_db_time(&id, &dead)?,
                            operation_type: OperationType::parse(&op),
                            priority: Priority::from_i64(priority),
                            operation,
                            retry_count: retries.max(0) as u32,
                            reason: DeadLetterReason::parse(&reason),
                            last_error,
                            user_id,
                            id,
                        })
                    },
                )
                .collect()
        })
        .await
    }

    /// Put a dead-lettered item back in the queue with a fresh retry budget
    pub async fn requeue_dead_letter(&self, id: &str) -> Result<bool, StorageError> {
        let id = id.to_string();
        self.run(move |s| {
            let now = db_time(&Utc::now());
            let moved = s.db.with_transaction(|tx| {
                let inserted = tx.execute(
                    r#"
                    INSERT OR REPLACE INTO offline_queue (
                        id, user_id, operation_type, priority, status, payload, encoding,
                        checksum, retry_count, max_retries, last_error, next_retry_at,
                        estimated_size, created_at, processing_started_at, updated_at
                    )
                    SELECT id, user_id, operation_type, priority, 'pending', payload, encoding,
                           checksum, 0, max_retries, NULL, NULL,
                           estimated_size, created_at, NULL, ?1
                    FROM dead_letter_queue WHERE id = ?2
                    "#,
                    params![now, id],
                )?;
                tx.execute("DELETE FROM dead_letter_queue WHERE id = ?1", params![id])?;
                Ok(inserted)
            })?;

            if moved > 0 {
                log::info!("Requeued dead-lettered item {}", id);
            }
            Ok(moved > 0)
        })
        .await
    }

    pub async fn purge_dead_letters(&self) -> Result<usize, StorageError> {
        self.run(|s| {
            let deleted = s.db.execute("DELETE FROM dead_letter_queue", [])?;
            log::info!("Purged {} dead-lettered items", deleted);
            Ok(deleted)
        })
        .await
    }
}

fn upsert_row(
    tx: &rusqlite::Transaction<'_>,
    item: &QueueItem,
    payload: &EncodedPayload,
) -> Result<(), DbError> {
    let now = db_time(&now_millis());
    tx.execute(
        r#"
        INSERT INTO offline_queue (
            id, user_id, operation_type, priority, status, payload, encoding, checksum,
            retry_count, max_retries, last_error, next_retry_at, estimated_size,
            created_at, processing_started_at, updated_at
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16)
        ON CONFLICT(id) DO UPDATE SET
            user_id = excluded.user_id,
            operation_type = excluded.operation_type,
            priority = excluded.priority,
            status = excluded.status,
            payload = excluded.payload,
            encoding = excluded.encoding,
            checksum = excluded.checksum,
            retry_count = excluded.retry_count,
            max_retries = excluded.max_retries,
            last_error = excluded.last_error,
            next_retry_at = excluded.next_retry_at,
            estimated_size = excluded.estimated_size,
            created_at = excluded.created_at,
            processing_started_at = excluded.processing_started_at,
            updated_at = excluded.updated_at
        "#,
        params![
            item.id,
            item.user_id,
            item.operation_type().as_str(),
            item.priority.as_i64(),
            item.status.as_str(),
            payload.data,
            i64::from(payload.flags),
            payload.checksum,
            i64::from(item.metadata.retry_count),
            i64::from(item.metadata.max_retries),
            item.metadata.last_error,
            item.metadata.next_retry_at.as_ref().map(db_time),
            item.metadata.estimated_size.min(i64::MAX as u64) as i64,
            db_time(&item.metadata.created_at),
            item.metadata.processing_started_at.as_ref().map(db_time),
            now,
        ],
    )?;
    Ok(())
}

/// Copy matching queue rows to the dead-letter table and delete them
fn move_to_dead_letter(
    tx: &rusqlite::Transaction<'_>,
    condition: &str,
    values: &[Value],
    reason: DeadLetterReason,
    now: &str,
) -> Result<usize, DbError> {
    let insert = format!(
        r#"
        INSERT OR REPLACE INTO dead_letter_queue ({columns})
        SELECT id, user_id, operation_type, priority, payload, encoding, checksum,
               retry_count, max_retries, estimated_size, '{reason}', last_error, created_at, '{now}'
        FROM offline_queue WHERE {condition}
        "#,
        columns = DEAD_LETTER_COLUMNS,
        reason = reason.as_str(),
        now = now,
        condition = condition,
    );
    tx.execute(&insert, params_from_iter(values.iter()))?;

    let delete = format!("DELETE FROM offline_queue WHERE {}", condition);
    Ok(tx.execute(&delete, params_from_iter(values.iter()))?)
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::DeviceSecret;
    use crate::test_support::{memory_storage, sample_contact, sample_event};
    use std::collections::HashSet;

    fn event_item(user_id: &str, priority: Priority) -> QueueItem {
        QueueItem::new(user_id, QueueOperation::CreateEvent(sample_event(user_id)), priority)
    }

    #[tokio::test]
    async fn test_store_retrieve_roundtrip() {
        let storage = memory_storage();

        let mut event = sample_event("user-1");
        event.content = Some("a long message body ".repeat(40));
        let item = QueueItem::new("user-1", QueueOperation::CreateEvent(event), Priority::High);

        storage.store(&item).await.unwrap();
        let loaded = storage.retrieve(&item.id).await.unwrap().unwrap();

        assert_eq!(loaded, item);
    }

    #[tokio::test]
    async fn test_retrieve_missing_returns_none() {
        let storage = memory_storage();
        assert!(storage.retrieve("nope").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_retrieve_many_priority_then_age() {
        let storage = memory_storage();
        let base = now_millis() - chrono::Duration::minutes(10);

        let specs = [
            ("low-old", Priority::Low, 0),
            ("normal-new", Priority::Normal, 5),
            ("critical", Priority::Critical, 3),
            ("normal-old", Priority::Normal, 1),
            ("high", Priority::High, 4),
        ];

        let mut ids = std::collections::HashMap::new();
        for (name, priority, minutes) in specs {
            let mut item = event_item("user-1", priority);
            item.metadata.created_at = base + chrono::Duration::minutes(minutes);
            ids.insert(item.id.clone(), name);
            storage.store(&item).await.unwrap();
        }

        let items = storage.retrieve_many(QueueFilter::pending(), 10).await.unwrap();
        let order: Vec<&str> = items.iter().map(|i| ids[&i.id]).collect();
        assert_eq!(order, vec!["critical", "high", "normal-old", "normal-new", "low-old"]);

        let limited = storage.retrieve_many(QueueFilter::pending(), 2).await.unwrap();
        assert_eq!(limited.len(), 2);
    }

    #[tokio::test]
    async fn test_filter_by_user_and_type() {
        let storage = memory_storage();

        storage.store(&event_item("user-1", Priority::Normal)).await.unwrap();
        storage.store(&event_item("user-2", Priority::Normal)).await.unwrap();
        storage
            .store(&QueueItem::new(
                "user-1",
                QueueOperation::CreateContact(sample_contact("user-1")),
                Priority::Normal,
            ))
            .await
            .unwrap();

        let user1 = storage
            .retrieve_many(QueueFilter::default().with_user("user-1"), 10)
            .await
            .unwrap();
        assert_eq!(user1.len(), 2);

        let contacts = storage
            .retrieve_many(
                QueueFilter::default().with_operation(OperationType::CreateContact),
                10,
            )
            .await
            .unwrap();
        assert_eq!(contacts.len(), 1);
        assert_eq!(contacts[0].user_id, "user-1");
    }

    #[tokio::test]
    async fn test_store_batch() {
        let storage = memory_storage();
        let items: Vec<_> = (0..5).map(|_| event_item("user-1", Priority::Low)).collect();

        assert_eq!(storage.store_batch(&items).await.unwrap(), 5);
        assert_eq!(storage.get_stats().await.unwrap().total_items, 5);
    }

    #[tokio::test]
    async fn test_update_merges_fields() {
        let storage = memory_storage();
        let item = event_item("user-1", Priority::Normal);
        storage.store(&item).await.unwrap();

        let retry_at = now_millis() + chrono::Duration::seconds(30);
        let updated = storage
            .update(
                &item.id,
                ItemUpdate {
                    status: Some(QueueStatus::Failed),
                    retry_count: Some(2),
                    last_error: Some(Some("timeout".to_string())),
                    next_retry_at: Some(Some(retry_at)),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert!(updated);

        let loaded = storage.retrieve(&item.id).await.unwrap().unwrap();
        assert_eq!(loaded.status, QueueStatus::Failed);
        assert_eq!(loaded.metadata.retry_count, 2);
        assert_eq!(loaded.metadata.last_error.as_deref(), Some("timeout"));
        assert_eq!(loaded.metadata.next_retry_at, Some(retry_at));
        assert_eq!(loaded.priority, Priority::Normal);
        assert_eq!(loaded.operation, item.operation);
    }

    #[tokio::test]
    async fn test_update_missing_item_is_noop() {
        let storage = memory_storage();
        let updated = storage
            .update(
                "ghost",
                ItemUpdate {
                    status: Some(QueueStatus::Failed),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert!(!updated);
    }

    #[tokio::test]
    async fn test_ready_filter_respects_backoff() {
        let storage = memory_storage();

        let mut waiting = event_item("user-1", Priority::High);
        waiting.status = QueueStatus::Failed;
        waiting.metadata.next_retry_at = Some(now_millis() + chrono::Duration::minutes(5));
        storage.store(&waiting).await.unwrap();

        let mut due = event_item("user-1", Priority::Low);
        due.status = QueueStatus::Failed;
        due.metadata.next_retry_at = Some(now_millis() - chrono::Duration::seconds(1));
        storage.store(&due).await.unwrap();

        let ready = storage.retrieve_many(QueueFilter::ready(), 10).await.unwrap();
        assert_eq!(ready.len(), 1);
        assert_eq!(ready[0].id, due.id);

        assert!(!storage.claim(&waiting.id).await.unwrap());
        assert!(storage.claim(&due.id).await.unwrap());
    }

    #[tokio::test]
    async fn test_claim_is_exclusive() {
        let storage = memory_storage();
        let item = event_item("user-1", Priority::Normal);
        storage.store(&item).await.unwrap();

        assert!(storage.claim(&item.id).await.unwrap());
        assert!(!storage.claim(&item.id).await.unwrap());

        let pending = storage.retrieve_many(QueueFilter::pending(), 10).await.unwrap();
        assert!(pending.is_empty());
    }

    #[tokio::test]
    async fn test_release_claims_keeps_retry_count() {
        let storage = memory_storage();
        let mut item = event_item("user-1", Priority::Normal);
        item.metadata.retry_count = 2;
        storage.store(&item).await.unwrap();
        let untouched = event_item("user-1", Priority::Normal);
        storage.store(&untouched).await.unwrap();

        let claimed = storage.claim_ready(QueueFilter::default(), 1).await.unwrap();
        assert_eq!(claimed.len(), 1);
        let ids = vec![item.id.clone(), untouched.id.clone()];
        // Only the processing row changes
        assert_eq!(storage.release_claims(&ids).await.unwrap(), 1);

        let released = storage.retrieve(&item.id).await.unwrap().unwrap();
        assert_eq!(released.status, QueueStatus::Pending);
        assert_eq!(released.metadata.retry_count, 2);
        assert!(released.metadata.processing_started_at.is_none());
        assert_eq!(storage.release_claims(&[]).await.unwrap(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_claims_never_overlap() {
        let dir = tempfile::tempdir().unwrap();
        let db = Database::new(dir.path().join("queue.db")).unwrap();
        let codec = PayloadCodec::new(Some(DeviceSecret::from_bytes([9u8; 32])), 1024);
        let storage = OfflineStorage::new(db, codec, StorageConfig::default());

        let items: Vec<_> = (0..40).map(|_| event_item("user-1", Priority::Normal)).collect();
        storage.store_batch(&items).await.unwrap();

        let mut handles = Vec::new();
        for _ in 0..4 {
            let storage = storage.clone();
            handles.push(tokio::spawn(async move {
                let mut mine = Vec::new();
                loop {
                    let claimed = storage.claim_ready(QueueFilter::default(), 5).await.unwrap();
                    if claimed.is_empty() {
                        break;
                    }
                    mine.extend(claimed.into_iter().map(|i| i.id));
                }
                mine
            }));
        }

        let mut seen = HashSet::new();
        let mut total = 0;
        for handle in handles {
            for id in handle.await.unwrap() {
                total += 1;
                assert!(seen.insert(id), "item claimed twice");
            }
        }
        assert_eq!(total, 40);
    }

    #[tokio::test]
    async fn test_clear_with_filter() {
        let storage = memory_storage();
        storage.store(&event_item("user-1", Priority::Normal)).await.unwrap();
        storage.store(&event_item("user-1", Priority::Normal)).await.unwrap();
        storage.store(&event_item("user-2", Priority::Normal)).await.unwrap();

        let cleared = storage
            .clear(Some(QueueFilter::default().with_user("user-1")))
            .await
            .unwrap();
        assert_eq!(cleared, 2);
        assert_eq!(storage.clear(None).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_stats() {
        let storage = memory_storage();
        let empty = storage.get_stats().await.unwrap();
        assert_eq!(empty.total_items, 0);
        assert!(empty.oldest_item_age.is_none());

        let mut old = event_item("user-1", Priority::Normal);
        old.metadata.created_at = now_millis() - chrono::Duration::hours(2);
        storage.store(&old).await.unwrap();
        let fresh = event_item("user-1", Priority::Normal);
        storage.store(&fresh).await.unwrap();
        storage.claim(&fresh.id).await.unwrap();

        let stats = storage.get_stats().await.unwrap();
        assert_eq!(stats.total_items, 2);
        assert_eq!(stats.pending_items, 1);
        assert_eq!(stats.processing_items, 1);
        assert_eq!(
            stats.total_size_bytes,
            old.metadata.estimated_size + fresh.metadata.estimated_size
        );
        assert!(stats.oldest_item_age.unwrap() >= Duration::from_secs(7190));
    }

    #[tokio::test]
    async fn test_maintenance_evicts_and_releases() {
        let db = Database::in_memory().unwrap();
        let config = StorageConfig {
            max_item_size_bytes: 2_000,
            stale_claim_timeout_secs: 60,
            ..Default::default()
        };
        let storage = OfflineStorage::new(db, PayloadCodec::new(None, 1024), config);

        let mut expired = event_item("user-1", Priority::Normal);
        expired.metadata.created_at = now_millis() - chrono::Duration::days(30);
        storage.store(&expired).await.unwrap();

        let mut big_event = sample_event("user-1");
        big_event.content = Some("x".repeat(4_000));
        let oversized = QueueItem::new("user-1", QueueOperation::CreateEvent(big_event), Priority::Normal);
        storage.store(&oversized).await.unwrap();

        let mut stuck = event_item("user-1", Priority::Normal);
        stuck.status = QueueStatus::Processing;
        stuck.metadata.processing_started_at = Some(now_millis() - chrono::Duration::minutes(30));
        storage.store(&stuck).await.unwrap();

        let healthy = event_item("user-1", Priority::Normal);
        storage.store(&healthy).await.unwrap();

        let report = storage.perform_maintenance().await.unwrap();
        assert_eq!(
            report,
            MaintenanceReport {
                expired: 1,
                oversized: 1,
                released_claims: 1
            }
        );

        let stuck_now = storage.retrieve(&stuck.id).await.unwrap().unwrap();
        assert_eq!(stuck_now.status, QueueStatus::Pending);
        assert!(storage.retrieve(&healthy.id).await.unwrap().is_some());

        let stats = storage.get_stats().await.unwrap();
        assert_eq!(stats.total_items, 2);
        assert_eq!(stats.dead_letter_items, 2);
    }

    #[tokio::test]
    async fn test_dead_letter_and_requeue() {
        let storage = memory_storage();
        let mut item = event_item("user-1", Priority::High);
        item.metadata.retry_count = 5;
        storage.store(&item).await.unwrap();

        assert!(storage
            .dead_letter(&item.id, DeadLetterReason::RetriesExhausted, Some("timeout".to_string()))
            .await
            .unwrap());
        assert!(storage.retrieve(&item.id).await.unwrap().is_none());

        let letters = storage.dead_letters(10).await.unwrap();
        assert_eq!(letters.len(), 1);
        assert_eq!(letters[0].reason, Some(DeadLetterReason::RetriesExhausted));
        assert_eq!(letters[0].last_error.as_deref(), Some("timeout"));
        assert_eq!(letters[0].operation.as_ref(), Some(&item.operation));
        assert_eq!(letters[0].priority, Priority::High);

        assert!(storage.requeue_dead_letter(&item.id).await.unwrap());
        let back = storage.retrieve(&item.id).await.unwrap().unwrap();
        assert_eq!(back.status, QueueStatus::Pending);
        assert_eq!(back.metadata.retry_count, 0);
        assert!(storage.dead_letters(10).await.unwrap().is_empty());

        storage
            .dead_letter(&item.id, DeadLetterReason::NonRetryable, None)
            .await
            .unwrap();
        assert_eq!(storage.purge_dead_letters().await.unwrap(), 1);
    }
}
