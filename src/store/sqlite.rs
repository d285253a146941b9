// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! SQLite-backed event log.
//!
//! # Schema
//!
//! ```text
//! events             (seq_id PK, event_type, data, timestamp ms, tombstone)
//! event_sequence     (id = 1, value)          -- highest assigned position
//! event_progression  (name PK, last_seq_id, last_updated ms)
//! ```
//!
//! Positions are reserved from `event_sequence` independently of the insert
//! into `events`, so a writer that reserves and then fails leaves a gap. Such
//! a gap is closed by [`SqliteEventLog::settle`], which commits a tombstone
//! row at the abandoned position. Tombstones count as committed for gap
//! detection but are never handed to projections.
//!
//! # Time
//!
//! Every timestamp comes from the database clock (`julianday('now')`), so
//! statistics and commit times share one clock.
//!
//! # SQLite Busy Handling
//!
//! SQLITE_BUSY/SQLITE_LOCKED are retried with exponential backoff (5
//! attempts, 10ms doubling to 500ms). Any other error is returned to the
//! caller unchanged.

use super::{BoxFuture, EventLog, RawStatistics};
use crate::config::StoreConfig;
use crate::error::{ProgressError, Result};
use crate::types::{EventRecord, SequencePosition, ShardName, ShardProgress};
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};
use std::future::Future;
use std::path::Path;
use std::pin::Pin;
use std::str::FromStr;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Configuration for SQLite busy retry behavior
const SQLITE_RETRY_MAX_ATTEMPTS: u32 = 5;
const SQLITE_RETRY_BASE_DELAY_MS: u64 = 10;
const SQLITE_RETRY_MAX_DELAY_MS: u64 = 500;

/// Milliseconds since the Unix epoch, evaluated by SQLite.
const DB_NOW_MS: &str = "CAST((julianday('now') - 2440587.5) * 86400000 AS INTEGER)";

/// Check if an error is a retryable SQLite busy/locked error
fn is_sqlite_busy_error(e: &sqlx::Error) -> bool {
    match e {
        sqlx::Error::Database(db_err) => {
            // SQLite error codes: SQLITE_BUSY = 5, SQLITE_LOCKED = 6
            if let Some(code) = db_err.code() {
                return code == "5" || code == "6";
            }
            let msg = db_err.message().to_lowercase();
            msg.contains("database is locked") || msg.contains("database is busy")
        }
        _ => false,
    }
}

/// Execute a database operation with retry on SQLITE_BUSY/SQLITE_LOCKED
async fn execute_with_retry<F, Fut, T>(
    operation_name: &str,
    mut f: F,
) -> std::result::Result<T, sqlx::Error>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = std::result::Result<T, sqlx::Error>>,
{
    let mut attempts = 0;
    let mut delay_ms = SQLITE_RETRY_BASE_DELAY_MS;

    loop {
        attempts += 1;
        match f().await {
            Ok(result) => {
                if attempts > 1 {
                    debug!(
                        operation = operation_name,
                        attempts, "SQLite operation succeeded after retry"
                    );
                }
                return Ok(result);
            }
            Err(e) if is_sqlite_busy_error(&e) && attempts < SQLITE_RETRY_MAX_ATTEMPTS => {
                warn!(
                    operation = operation_name,
                    attempts,
                    max_attempts = SQLITE_RETRY_MAX_ATTEMPTS,
                    delay_ms,
                    "SQLite busy, retrying"
                );
                crate::metrics::record_store_retry(operation_name);
                tokio::time::sleep(Duration::from_millis(delay_ms)).await;
                delay_ms = (delay_ms * 2).min(SQLITE_RETRY_MAX_DELAY_MS);
            }
            Err(e) => {
                if is_sqlite_busy_error(&e) {
                    warn!(
                        operation = operation_name,
                        attempts, "SQLite busy, max retries exceeded"
                    );
                }
                return Err(e);
            }
        }
    }
}

fn from_millis(ms: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(ms).unwrap_or_default()
}

/// Event log stored in a single SQLite database.
pub struct SqliteEventLog {
    pool: SqlitePool,
    path: String,
}

impl SqliteEventLog {
    /// Open (or create) the event log at `path` in WAL mode.
    pub async fn new(path: impl AsRef<Path>) -> Result<Self> {
        let config = StoreConfig {
            sqlite_path: path.as_ref().to_string_lossy().to_string(),
            wal_mode: true,
        };
        Self::open(&config).await
    }

    /// Open the event log described by `config`.
    ///
    /// `":memory:"` opens a private in-memory database on a single
    /// connection.
    pub async fn open(config: &StoreConfig) -> Result<Self> {
        let path = config.sqlite_path.clone();
        info!(path = %path, wal = config.wal_mode, "Opening event log");

        let in_memory = path == ":memory:";
        let url = if in_memory {
            "sqlite::memory:".to_string()
        } else {
            format!("sqlite://{}?mode=rwc", path)
        };

        let mut options = SqliteConnectOptions::from_str(&url)
            .map_err(|e| ProgressError::Config(format!("Invalid SQLite path: {}", e)))?
            .synchronous(sqlx::sqlite::SqliteSynchronous::Normal)
            .create_if_missing(true);
        if config.wal_mode && !in_memory {
            options = options.journal_mode(SqliteJournalMode::Wal);
        }

        let pool = SqlitePoolOptions::new()
            .max_connections(if in_memory { 1 } else { 4 })
            .connect_with(options)
            .await?;

        let log = Self { pool, path };
        log.migrate().await?;
        Ok(log)
    }

    async fn migrate(&self) -> Result<()> {
        for statement in [
            r#"
            CREATE TABLE IF NOT EXISTS events (
                seq_id INTEGER PRIMARY KEY,
                event_type TEXT NOT NULL,
                data BLOB NOT NULL,
                timestamp INTEGER NOT NULL,
                tombstone INTEGER NOT NULL DEFAULT 0
            )
            "#,
            "CREATE INDEX IF NOT EXISTS idx_events_timestamp ON events (timestamp)",
            r#"
            CREATE TABLE IF NOT EXISTS event_sequence (
                id INTEGER PRIMARY KEY CHECK (id = 1),
                value INTEGER NOT NULL
            )
            "#,
            "INSERT OR IGNORE INTO event_sequence (id, value) VALUES (1, 0)",
            r#"
            CREATE TABLE IF NOT EXISTS event_progression (
                name TEXT PRIMARY KEY,
                last_seq_id INTEGER NOT NULL,
                last_updated INTEGER
            )
            "#,
        ] {
            sqlx::query(statement).execute(&self.pool).await?;
        }
        Ok(())
    }

    /// Get database path (for diagnostics).
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Reserve the next position without committing an event.
    ///
    /// Until [`commit_reserved`](Self::commit_reserved) or
    /// [`settle`](Self::settle) is called, the position is a gap.
    pub async fn reserve_position(&self) -> Result<SequencePosition> {
        let pool = &self.pool;
        let position: i64 = execute_with_retry("reserve_position", || async {
            sqlx::query_scalar(
                "UPDATE event_sequence SET value = value + 1 WHERE id = 1 RETURNING value",
            )
            .fetch_one(pool)
            .await
        })
        .await?;
        Ok(position)
    }

    /// Commit an event at a previously reserved position.
    pub async fn commit_reserved(
        &self,
        position: SequencePosition,
        event_type: &str,
        data: &[u8],
    ) -> Result<()> {
        let pool = &self.pool;
        let sql = format!(
            "INSERT INTO events (seq_id, event_type, data, timestamp) VALUES (?, ?, ?, {})",
            DB_NOW_MS
        );
        execute_with_retry("commit_reserved", || async {
            sqlx::query(&sql)
                .bind(position)
                .bind(event_type)
                .bind(data)
                .execute(pool)
                .await
        })
        .await?;
        Ok(())
    }

    /// Reserve a position and commit an event there in one transaction.
    pub async fn append_event(&self, event_type: &str, data: &[u8]) -> Result<SequencePosition> {
        let pool = &self.pool;
        let sql = format!(
            "INSERT INTO events (seq_id, event_type, data, timestamp) VALUES (?, ?, ?, {})",
            DB_NOW_MS
        );
        let position = execute_with_retry("append_event", || async {
            let mut tx = pool.begin().await?;
            let position: i64 = sqlx::query_scalar(
                "UPDATE event_sequence SET value = value + 1 WHERE id = 1 RETURNING value",
            )
            .fetch_one(&mut *tx)
            .await?;
            sqlx::query(&sql)
                .bind(position)
                .bind(event_type)
                .bind(data)
                .execute(&mut *tx)
                .await?;
            tx.commit().await?;
            Ok(position)
        })
        .await?;
        debug!(position, event_type, "Appended event");
        Ok(position)
    }

    /// Close a permanently abandoned position with a tombstone.
    ///
    /// No-op if the position is already committed.
    pub async fn settle(&self, position: SequencePosition) -> Result<()> {
        let pool = &self.pool;
        let sql = format!(
            "INSERT OR IGNORE INTO events (seq_id, event_type, data, timestamp, tombstone) \
             VALUES (?, 'tombstone', x'', {}, 1)",
            DB_NOW_MS
        );
        execute_with_retry("settle", || async {
            sqlx::query(&sql).bind(position).execute(pool).await
        })
        .await?;
        info!(position, "Settled abandoned position");
        Ok(())
    }

    /// Force flush WAL to main database (for clean shutdown).
    pub async fn checkpoint(&self) -> Result<()> {
        let pool = &self.pool;
        execute_with_retry("checkpoint", || async {
            sqlx::query("PRAGMA wal_checkpoint(TRUNCATE)")
                .execute(pool)
                .await
        })
        .await?;
        debug!("WAL checkpoint complete");
        Ok(())
    }
}

impl EventLog for SqliteEventLog {
    fn fetch_statistics(&self, shard: &ShardName) -> BoxFuture<'_, RawStatistics> {
        let name = shard.identity();
        Box::pin(async move {
            let pool = &self.pool;
            let sql = format!(
                r#"
                SELECT
                    COALESCE((SELECT value FROM event_sequence WHERE id = 1), 0),
                    COALESCE((SELECT last_seq_id FROM event_progression WHERE name = ?1), 0),
                    (SELECT last_updated FROM event_progression WHERE name = ?1),
                    {}
                "#,
                DB_NOW_MS
            );
            let (highest, last_mark, last_updated, now_ms): (i64, i64, Option<i64>, i64) =
                execute_with_retry("fetch_statistics", || async {
                    sqlx::query_as(&sql).bind(&name).fetch_one(pool).await
                })
                .await?;

            Ok(RawStatistics {
                highest_sequence: highest,
                last_mark,
                last_updated: last_updated.map(from_millis),
                timestamp: from_millis(now_ms),
            })
        })
    }

    fn highest_assigned_position(&self) -> BoxFuture<'_, SequencePosition> {
        Box::pin(async move {
            let pool = &self.pool;
            let value: Option<i64> = execute_with_retry("highest_assigned_position", || async {
                sqlx::query_scalar("SELECT value FROM event_sequence WHERE id = 1")
                    .fetch_optional(pool)
                    .await
            })
            .await?;
            Ok(value.unwrap_or(0))
        })
    }

    fn last_persisted_mark(
        &self,
        shard: &ShardName,
    ) -> BoxFuture<'_, (SequencePosition, Option<DateTime<Utc>>)> {
        let name = shard.identity();
        Box::pin(async move {
            let pool = &self.pool;
            let row: Option<(i64, Option<i64>)> =
                execute_with_retry("last_persisted_mark", || async {
                    sqlx::query_as(
                        "SELECT last_seq_id, last_updated FROM event_progression WHERE name = ?",
                    )
                    .bind(&name)
                    .fetch_optional(pool)
                    .await
                })
                .await?;
            Ok(match row {
                Some((mark, updated)) => (mark, updated.map(from_millis)),
                None => (0, None),
            })
        })
    }

    fn find_first_gap_at_or_after(
        &self,
        start: SequencePosition,
    ) -> BoxFuture<'_, Option<SequencePosition>> {
        Box::pin(async move {
            let pool = &self.pool;
            let gap: Option<i64> = execute_with_retry("find_first_gap", || async {
                sqlx::query_scalar(
                    r#"
                    SELECT seq_id FROM (
                        SELECT seq_id, LEAD(seq_id) OVER (ORDER BY seq_id) AS next_seq_id
                        FROM events
                        WHERE seq_id >= ?
                    )
                    WHERE next_seq_id - seq_id > 1
                    ORDER BY seq_id
                    LIMIT 1
                    "#,
                )
                .bind(start)
                .fetch_optional(pool)
                .await
            })
            .await?;
            Ok(gap)
        })
    }

    fn find_max_committed_at_or_after(
        &self,
        start: SequencePosition,
    ) -> BoxFuture<'_, Option<SequencePosition>> {
        Box::pin(async move {
            let pool = &self.pool;
            let max: Option<i64> = execute_with_retry("find_max_committed", || async {
                sqlx::query_scalar("SELECT MAX(seq_id) FROM events WHERE seq_id >= ?")
                    .bind(start)
                    .fetch_one(pool)
                    .await
            })
            .await?;
            Ok(max)
        })
    }

    fn find_earliest_committed_at_or_after(
        &self,
        timestamp: DateTime<Utc>,
    ) -> BoxFuture<'_, Option<SequencePosition>> {
        let ts = timestamp.timestamp_millis();
        Box::pin(async move {
            let pool = &self.pool;
            let min: Option<i64> = execute_with_retry("find_earliest_committed", || async {
                sqlx::query_scalar("SELECT MIN(seq_id) FROM events WHERE timestamp >= ?")
                    .bind(ts)
                    .fetch_one(pool)
                    .await
            })
            .await?;
            Ok(min)
        })
    }

    fn persist_mark(
        &self,
        shard: &ShardName,
        position: SequencePosition,
    ) -> BoxFuture<'_, Option<DateTime<Utc>>> {
        let name = shard.identity();
        Box::pin(async move {
            let pool = &self.pool;
            let sql = format!(
                r#"
                INSERT INTO event_progression (name, last_seq_id, last_updated)
                VALUES (?, ?, {})
                ON CONFLICT(name) DO UPDATE SET
                    last_seq_id = excluded.last_seq_id,
                    last_updated = excluded.last_updated
                RETURNING last_updated
                "#,
                DB_NOW_MS
            );
            let updated: Option<i64> = execute_with_retry("persist_mark", || async {
                sqlx::query_scalar(&sql)
                    .bind(&name)
                    .bind(position)
                    .fetch_one(pool)
                    .await
            })
            .await?;
            debug!(shard = %name, position, "Persisted mark");
            Ok(updated.map(from_millis))
        })
    }

    fn all_progress(&self) -> BoxFuture<'_, Vec<ShardProgress>> {
        Box::pin(async move {
            let pool = &self.pool;
            let rows: Vec<(String, i64, Option<i64>)> =
                execute_with_retry("all_progress", || async {
                    sqlx::query_as(
                        "SELECT name, last_seq_id, last_updated FROM event_progression ORDER BY name",
                    )
                    .fetch_all(pool)
                    .await
                })
                .await?;
            Ok(rows
                .into_iter()
                .map(|(shard, sequence, updated)| ShardProgress {
                    shard,
                    sequence,
                    last_updated: updated.map(from_millis),
                })
                .collect())
        })
    }

    fn fetch_events(
        &self,
        after: SequencePosition,
        up_to: SequencePosition,
        limit: usize,
    ) -> BoxFuture<'_, Vec<EventRecord>> {
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        Box::pin(async move {
            let pool = &self.pool;
            let rows: Vec<(i64, String, Vec<u8>, i64)> =
                execute_with_retry("fetch_events", || async {
                    sqlx::query_as(
                        r#"
                        SELECT seq_id, event_type, data, timestamp
                        FROM events
                        WHERE seq_id > ? AND seq_id <= ? AND tombstone = 0
                        ORDER BY seq_id
                        LIMIT ?
                        "#,
                    )
                    .bind(after)
                    .bind(up_to)
                    .bind(limit)
                    .fetch_all(pool)
                    .await
                })
                .await?;
            Ok(rows
                .into_iter()
                .map(|(sequence, event_type, data, ts)| EventRecord {
                    sequence,
                    event_type,
                    data,
                    timestamp: from_millis(ts),
                })
                .collect())
        })
    }

    fn close(&self) -> Pin<Box<dyn Future<Output = ()> + Send + '_>> {
        Box::pin(async move {
            if let Err(e) = self.checkpoint().await {
                warn!(error = %e, "Failed to checkpoint WAL on close");
            }
            self.pool.close().await;
            info!("Event log closed");
        })
    }
}
