//! Persistent store backed by SQLite.
//!
//! Owns durability of delivery records, the recorded inbound messages and the checkpoint.
//! Every write goes through a single write lock and, where several rows depend on each other,
//! a transaction. Terminal delivery records are never modified once written.

use crate::channels::{InboundMessage, MediaRef, Payload};
use crate::error::{Error, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions, SqliteRow,
    SqliteSynchronous,
};
use sqlx::Row;
use std::path::Path;
use std::time::Duration;
use tokio::sync::Mutex;

/// Delivery state of one (message, target) pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum DeliveryStatus {
    Pending,
    Delivered,
    FailedPermanent,
}

impl DeliveryStatus {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "delivered" => Some(Self::Delivered),
            "failed-permanent" => Some(Self::FailedPermanent),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Delivered => "delivered",
            Self::FailedPermanent => "failed-permanent",
        }
    }

    /// Delivered and failed-permanent are terminal: no further transition occurs.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Pending)
    }
}

impl std::fmt::Display for DeliveryStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Composite key of a delivery record.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RecordKey {
    pub message_id: String,
    pub target_id: String,
}

impl RecordKey {
    pub fn new(message_id: impl Into<String>, target_id: impl Into<String>) -> Self {
        Self {
            message_id: message_id.into(),
            target_id: target_id.into(),
        }
    }
}

impl std::fmt::Display for RecordKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "({}, {})", self.message_id, self.target_id)
    }
}

/// Durable state of one (message, target) pair.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeliveryRecord {
    pub message_id: String,
    pub target_id: String,
    /// Upstream offset of the message, used to place the record against the checkpoint.
    pub offset: i64,
    pub status: DeliveryStatus,
    pub attempts: u32,
    pub last_attempt_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

impl DeliveryRecord {
    pub fn pending(message: &InboundMessage, target_id: impl Into<String>) -> Self {
        Self {
            message_id: message.id.clone(),
            target_id: target_id.into(),
            offset: message.offset,
            status: DeliveryStatus::Pending,
            attempts: 0,
            last_attempt_at: None,
            last_error: None,
        }
    }

    pub fn key(&self) -> RecordKey {
        RecordKey::new(&self.message_id, &self.target_id)
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }
}

/// Aggregate counters for operators.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ForwardStats {
    pub messages: u64,
    pub pending: u64,
    pub delivered: u64,
    pub failed_permanent: u64,
    pub checkpoint: Option<i64>,
    pub last_delivered_at: Option<DateTime<Utc>>,
}

const CREATE_MESSAGES: &str = r#"
    CREATE TABLE IF NOT EXISTS messages (
        id TEXT PRIMARY KEY,
        update_offset INTEGER NOT NULL,
        origin_chat_id TEXT NOT NULL,
        source_message_id INTEGER NOT NULL,
        received_at TEXT NOT NULL
    )
"#;

const CREATE_DELIVERY_RECORDS: &str = r#"
    CREATE TABLE IF NOT EXISTS delivery_records (
        message_id TEXT NOT NULL,
        target_id TEXT NOT NULL,
        update_offset INTEGER NOT NULL,
        status TEXT NOT NULL DEFAULT 'pending',
        attempts INTEGER NOT NULL DEFAULT 0,
        PRIMARY KEY (message_id, target_id)
    )
"#;

const CREATE_CHECKPOINT: &str = r#"
    CREATE TABLE IF NOT EXISTS checkpoint (
        id INTEGER PRIMARY KEY CHECK (id = 1),
        update_offset INTEGER NOT NULL
    )
"#;

/// Columns added after the first schema. Applied with ALTER TABLE ADD COLUMN when missing,
/// so older database files keep working.
const ADDITIVE_COLUMNS: &[(&str, &str, &str)] = &[
    ("messages", "origin_username", "TEXT"),
    ("messages", "text", "TEXT"),
    ("messages", "media_kind", "TEXT"),
    ("messages", "media_file_id", "TEXT"),
    ("delivery_records", "last_attempt_at", "TEXT"),
    ("delivery_records", "last_error", "TEXT"),
    ("delivery_records", "created_at", "TEXT"),
    ("delivery_records", "updated_at", "TEXT"),
    ("checkpoint", "updated_at", "TEXT"),
];

const UPSERT_RECORD: &str = r#"
    INSERT INTO delivery_records
        (message_id, target_id, update_offset, status, attempts, last_attempt_at, last_error, created_at, updated_at)
    VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
    ON CONFLICT (message_id, target_id) DO UPDATE SET
        status = excluded.status,
        attempts = excluded.attempts,
        last_attempt_at = excluded.last_attempt_at,
        last_error = excluded.last_error,
        updated_at = excluded.updated_at
    WHERE delivery_records.status = 'pending'
"#;

const SET_CHECKPOINT: &str = r#"
    INSERT INTO checkpoint (id, update_offset, updated_at) VALUES (1, ?, ?)
    ON CONFLICT (id) DO UPDATE SET
        update_offset = MAX(checkpoint.update_offset, excluded.update_offset),
        updated_at = excluded.updated_at
"#;

const RECORD_COLUMNS: &str =
    "message_id, target_id, update_offset, status, attempts, last_attempt_at, last_error";

/// SQLite-backed persistent store.
pub struct Store {
    pool: SqlitePool,
    write_lock: Mutex<()>,
}

impl Store {
    /// Open or create the database at `path`. Creates parent directories and the schema.
    pub async fn open(path: impl AsRef<Path>, pool_size: u32) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|e| {
                Error::StoreUnavailable(format!(
                    "failed to create directory {}: {}",
                    parent.display(),
                    e
                ))
            })?;
        }

        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Full)
            .busy_timeout(Duration::from_secs(5));

        let pool = SqlitePoolOptions::new()
            .max_connections(pool_size.max(1))
            .connect_with(options)
            .await
            .map_err(|e| {
                Error::StoreUnavailable(format!("failed to open {}: {}", path.display(), e))
            })?;

        let store = Self {
            pool,
            write_lock: Mutex::new(()),
        };
        store.init_schema().await?;
        log::info!(
            "store opened at {} (pool size {})",
            path.display(),
            pool_size.max(1)
        );
        Ok(store)
    }

    /// In-memory store with a single connection (every pooled connection would otherwise see its own database).
    pub async fn open_in_memory() -> Result<Self> {
        let options: SqliteConnectOptions = "sqlite::memory:".parse()?;
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await?;
        let store = Self {
            pool,
            write_lock: Mutex::new(()),
        };
        store.init_schema().await?;
        Ok(store)
    }

    async fn init_schema(&self) -> Result<()> {
        for ddl in [CREATE_MESSAGES, CREATE_DELIVERY_RECORDS, CREATE_CHECKPOINT] {
            sqlx::query(ddl).execute(&self.pool).await?;
        }
        for (table, column, decl) in ADDITIVE_COLUMNS {
            self.ensure_column(table, column, decl).await?;
        }
        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_delivery_records_status ON delivery_records(status)",
        )
        .execute(&self.pool)
        .await?;
        log::debug!("store schema initialized");
        Ok(())
    }

    async fn ensure_column(&self, table: &str, column: &str, decl: &str) -> Result<()> {
        let rows = sqlx::query(&format!("PRAGMA table_info({})", table))
            .fetch_all(&self.pool)
            .await?;
        let exists = rows
            .iter()
            .any(|r| r.try_get::<String, _>("name").map(|n| n == column).unwrap_or(false));
        if !exists {
            sqlx::query(&format!("ALTER TABLE {} ADD COLUMN {} {}", table, column, decl))
                .execute(&self.pool)
                .await?;
            log::info!("store: added column {}.{}", table, column);
        }
        Ok(())
    }

    /// Insert or update a delivery record. Returns false when the stored record is already terminal
    /// (the write is ignored).
    pub async fn upsert_delivery_record(&self, record: &DeliveryRecord) -> Result<bool> {
        let _guard = self.write_lock.lock().await;
        let res = bind_record(sqlx::query(UPSERT_RECORD), record, Utc::now())
            .execute(&self.pool)
            .await?;
        Ok(res.rows_affected() > 0)
    }

    pub async fn get_record(
        &self,
        message_id: &str,
        target_id: &str,
    ) -> Result<Option<DeliveryRecord>> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM delivery_records WHERE message_id = ? AND target_id = ?",
            RECORD_COLUMNS
        ))
        .bind(message_id)
        .bind(target_id)
        .fetch_optional(&self.pool)
        .await?;
        row.map(|r| record_from_row(&r)).transpose()
    }

    /// All non-terminal records, oldest offset first.
    pub async fn list_pending(&self) -> Result<Vec<DeliveryRecord>> {
        self.list_by_status(DeliveryStatus::Pending).await
    }

    /// All failed-permanent records, for operator inspection.
    pub async fn list_failed(&self) -> Result<Vec<DeliveryRecord>> {
        self.list_by_status(DeliveryStatus::FailedPermanent).await
    }

    async fn list_by_status(&self, status: DeliveryStatus) -> Result<Vec<DeliveryRecord>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM delivery_records WHERE status = ? ORDER BY update_offset, target_id",
            RECORD_COLUMNS
        ))
        .bind(status.as_str())
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(record_from_row).collect()
    }

    /// Every record of one message, ordered by target id.
    pub async fn records_for(&self, message_id: &str) -> Result<Vec<DeliveryRecord>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM delivery_records WHERE message_id = ? ORDER BY target_id",
            RECORD_COLUMNS
        ))
        .bind(message_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(record_from_row).collect()
    }

    /// Advance the checkpoint. Never lowers it; returns the stored value.
    pub async fn set_checkpoint(&self, offset: i64) -> Result<i64> {
        let _guard = self.write_lock.lock().await;
        sqlx::query(SET_CHECKPOINT)
            .bind(offset)
            .bind(Utc::now().to_rfc3339())
            .execute(&self.pool)
            .await?;
        let stored: i64 = sqlx::query_scalar("SELECT update_offset FROM checkpoint WHERE id = 1")
            .fetch_one(&self.pool)
            .await?;
        Ok(stored)
    }

    pub async fn get_checkpoint(&self) -> Result<Option<i64>> {
        let v: Option<i64> =
            sqlx::query_scalar("SELECT update_offset FROM checkpoint WHERE id = 1")
                .fetch_optional(&self.pool)
                .await?;
        Ok(v)
    }

    /// Record a message and a pending record for each target that has none yet, in one transaction.
    /// Existing records (terminal or not) are left untouched. Returns the current record of every
    /// requested target, in the order given.
    pub async fn admit_message(
        &self,
        message: &InboundMessage,
        target_ids: &[String],
    ) -> Result<Vec<DeliveryRecord>> {
        let _guard = self.write_lock.lock().await;
        let now = Utc::now().to_rfc3339();
        let mut tx = self.pool.begin().await?;
        let (media_kind, media_file_id) = match &message.payload.media {
            Some(m) => (Some(m.kind.as_str()), Some(m.file_id.as_str())),
            None => (None, None),
        };
        sqlx::query(
            r#"
            INSERT OR IGNORE INTO messages
                (id, update_offset, origin_chat_id, origin_username, source_message_id, text, media_kind, media_file_id, received_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&message.id)
        .bind(message.offset)
        .bind(&message.origin_chat_id)
        .bind(message.origin_username.as_deref())
        .bind(message.source_message_id)
        .bind(message.payload.text.as_deref())
        .bind(media_kind)
        .bind(media_file_id)
        .bind(message.received_at.to_rfc3339())
        .execute(&mut *tx)
        .await?;

        for target_id in target_ids {
            sqlx::query(
                r#"
                INSERT OR IGNORE INTO delivery_records
                    (message_id, target_id, update_offset, status, attempts, created_at, updated_at)
                VALUES (?, ?, ?, 'pending', 0, ?, ?)
                "#,
            )
            .bind(&message.id)
            .bind(target_id)
            .bind(message.offset)
            .bind(&now)
            .bind(&now)
            .execute(&mut *tx)
            .await?;
        }

        let mut records = Vec::with_capacity(target_ids.len());
        for target_id in target_ids {
            let row = sqlx::query(&format!(
                "SELECT {} FROM delivery_records WHERE message_id = ? AND target_id = ?",
                RECORD_COLUMNS
            ))
            .bind(&message.id)
            .bind(target_id)
            .fetch_one(&mut *tx)
            .await?;
            records.push(record_from_row(&row)?);
        }
        tx.commit().await?;
        Ok(records)
    }

    /// Write a record and, when given, advance the checkpoint in the same transaction.
    /// Returns false when the record was already terminal (checkpoint is still advanced).
    pub async fn settle(&self, record: &DeliveryRecord, checkpoint: Option<i64>) -> Result<bool> {
        let _guard = self.write_lock.lock().await;
        let now = Utc::now();
        let mut tx = self.pool.begin().await?;
        let res = bind_record(sqlx::query(UPSERT_RECORD), record, now)
            .execute(&mut *tx)
            .await?;
        if let Some(offset) = checkpoint {
            sqlx::query(SET_CHECKPOINT)
                .bind(offset)
                .bind(now.to_rfc3339())
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;
        Ok(res.rows_affected() > 0)
    }

    /// Load a recorded message by id.
    pub async fn get_message(&self, id: &str) -> Result<Option<InboundMessage>> {
        let row = sqlx::query(
            r#"
            SELECT id, update_offset, origin_chat_id, origin_username, source_message_id,
                   text, media_kind, media_file_id, received_at
            FROM messages WHERE id = ?
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        let Some(row) = row else {
            return Ok(None);
        };
        let media_kind: Option<String> = row.try_get("media_kind")?;
        let media_file_id: Option<String> = row.try_get("media_file_id")?;
        let media = match (media_kind, media_file_id) {
            (Some(kind), Some(file_id)) => Some(MediaRef { kind, file_id }),
            _ => None,
        };
        let received_at: String = row.try_get("received_at")?;
        Ok(Some(InboundMessage {
            id: row.try_get("id")?,
            offset: row.try_get("update_offset")?,
            origin_chat_id: row.try_get("origin_chat_id")?,
            origin_username: row.try_get("origin_username")?,
            source_message_id: row.try_get("source_message_id")?,
            payload: Payload {
                text: row.try_get("text")?,
                media,
            },
            received_at: parse_time(&received_at).unwrap_or_else(Utc::now),
        }))
    }

    pub async fn stats(&self) -> Result<ForwardStats> {
        let messages: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM messages")
            .fetch_one(&self.pool)
            .await?;
        let rows = sqlx::query("SELECT status, COUNT(*) AS n FROM delivery_records GROUP BY status")
            .fetch_all(&self.pool)
            .await?;
        let mut stats = ForwardStats {
            messages: messages as u64,
            ..Default::default()
        };
        for row in rows {
            let status: String = row.try_get("status")?;
            let n: i64 = row.try_get("n")?;
            match DeliveryStatus::parse(&status) {
                Some(DeliveryStatus::Pending) => stats.pending = n as u64,
                Some(DeliveryStatus::Delivered) => stats.delivered = n as u64,
                Some(DeliveryStatus::FailedPermanent) => stats.failed_permanent = n as u64,
                None => log::warn!("store: unknown delivery status {:?}", status),
            }
        }
        let last: Option<String> = sqlx::query_scalar(
            "SELECT MAX(last_attempt_at) FROM delivery_records WHERE status = 'delivered'",
        )
        .fetch_one(&self.pool)
        .await?;
        stats.last_delivered_at = last.as_deref().and_then(parse_time);
        stats.checkpoint = self.get_checkpoint().await?;
        Ok(stats)
    }

    /// Close the pool, flushing WAL state.
    pub async fn close(&self) {
        self.pool.close().await;
    }
}

fn bind_record<'q>(
    query: sqlx::query::Query<'q, sqlx::Sqlite, sqlx::sqlite::SqliteArguments<'q>>,
    record: &'q DeliveryRecord,
    now: DateTime<Utc>,
) -> sqlx::query::Query<'q, sqlx::Sqlite, sqlx::sqlite::SqliteArguments<'q>> {
    let now = now.to_rfc3339();
    query
        .bind(&record.message_id)
        .bind(&record.target_id)
        .bind(record.offset)
        .bind(record.status.as_str())
        .bind(record.attempts as i64)
        .bind(record.last_attempt_at.map(|t| t.to_rfc3339()))
        .bind(record.last_error.as_deref())
        .bind(now.clone())
        .bind(now)
}

fn record_from_row(row: &SqliteRow) -> Result<DeliveryRecord> {
    let status: String = row.try_get("status")?;
    let status = DeliveryStatus::parse(&status)
        .ok_or_else(|| Error::StoreUnavailable(format!("corrupt delivery status {:?}", status)))?;
    let attempts: i64 = row.try_get("attempts")?;
    let last_attempt_at: Option<String> = row.try_get("last_attempt_at")?;
    Ok(DeliveryRecord {
        message_id: row.try_get("message_id")?,
        target_id: row.try_get("target_id")?,
        offset: row.try_get("update_offset")?,
        status,
        attempts: attempts.max(0) as u32,
        last_attempt_at: last_attempt_at.as_deref().and_then(parse_time),
        last_error: row.try_get("last_error")?,
    })
}

fn parse_time(s: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .ok()
}
