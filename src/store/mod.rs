// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Event log integration.
//!
//! Defines what the progress engine needs from the durable event log: an
//! appendable, gap-tolerant sequence with a queryable maximum and one
//! durable progress row per shard. Writers, serialization and schema
//! management live elsewhere.
//!
//! Two implementations ship with the crate:
//!
//! - [`SqliteEventLog`]: SQLite via `sqlx`, WAL mode, busy retry
//! - [`InMemoryEventLog`]: for tests and standalone runs; can simulate
//!   out-of-order commits, abandoned reservations and injected failures
//!
//! # Example
//!
//! ```rust,no_run
//! use projection_progress::store::{BoxFuture, EventLog, RawStatistics};
//! use projection_progress::{EventRecord, SequencePosition, ShardName, ShardProgress};
//! use chrono::{DateTime, Utc};
//!
//! struct MyLog;
//!
//! impl EventLog for MyLog {
//!     fn fetch_statistics(&self, _shard: &ShardName) -> BoxFuture<'_, RawStatistics> {
//!         Box::pin(async { Ok(RawStatistics::empty(Utc::now())) })
//!     }
//!     fn highest_assigned_position(&self) -> BoxFuture<'_, SequencePosition> {
//!         Box::pin(async { Ok(0) })
//!     }
//!     fn last_persisted_mark(&self, _shard: &ShardName) -> BoxFuture<'_, (SequencePosition, Option<DateTime<Utc>>)> {
//!         Box::pin(async { Ok((0, None)) })
//!     }
//!     fn find_first_gap_at_or_after(&self, _start: SequencePosition) -> BoxFuture<'_, Option<SequencePosition>> {
//!         Box::pin(async { Ok(None) })
//!     }
//!     fn find_max_committed_at_or_after(&self, _start: SequencePosition) -> BoxFuture<'_, Option<SequencePosition>> {
//!         Box::pin(async { Ok(None) })
//!     }
//!     fn find_earliest_committed_at_or_after(&self, _ts: DateTime<Utc>) -> BoxFuture<'_, Option<SequencePosition>> {
//!         Box::pin(async { Ok(None) })
//!     }
//!     fn persist_mark(&self, _shard: &ShardName, _position: SequencePosition) -> BoxFuture<'_, Option<DateTime<Utc>>> {
//!         Box::pin(async { Ok(Some(Utc::now())) })
//!     }
//!     fn all_progress(&self) -> BoxFuture<'_, Vec<ShardProgress>> {
//!         Box::pin(async { Ok(vec![]) })
//!     }
//!     fn fetch_events(&self, _after: SequencePosition, _up_to: SequencePosition, _limit: usize) -> BoxFuture<'_, Vec<EventRecord>> {
//!         Box::pin(async { Ok(vec![]) })
//!     }
//! }
//! ```

mod memory;
mod sqlite;

pub use memory::InMemoryEventLog;
pub use sqlite::SqliteEventLog;

use crate::error::Result;
use crate::types::{EventRecord, SequencePosition, ShardName, ShardProgress};
use chrono::{DateTime, Utc};
use std::future::Future;
use std::pin::Pin;

/// Type alias for boxed async futures (reduces trait signature complexity).
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T>> + Send + 'a>>;

/// Statistics loaded in a single round trip to the log.
///
/// `timestamp` is the database's clock, not the application's, so staleness
/// reasoning is immune to clock skew between the two.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RawStatistics {
    /// Highest position ever assigned by the sequence (may be uncommitted).
    pub highest_sequence: SequencePosition,
    /// Last durably recorded mark for the requested shard (0 if none).
    pub last_mark: SequencePosition,
    /// When that mark was written.
    pub last_updated: Option<DateTime<Utc>>,
    /// Database wall-clock time of the query.
    pub timestamp: DateTime<Utc>,
}

impl RawStatistics {
    /// Statistics of an empty log with no recorded progress.
    pub fn empty(timestamp: DateTime<Utc>) -> Self {
        Self {
            highest_sequence: 0,
            last_mark: 0,
            last_updated: None,
            timestamp,
        }
    }
}

/// Trait defining what the engine needs from the event log.
///
/// All methods are single round trips. Implementations must not retry
/// beyond transient lock contention: the high water agent owns retry policy.
pub trait EventLog: Send + Sync + 'static {
    /// Highest assigned position, the shard's last mark and the database
    /// time, read together.
    fn fetch_statistics(&self, shard: &ShardName) -> BoxFuture<'_, RawStatistics>;

    /// Highest position ever handed out by the sequence.
    fn highest_assigned_position(&self) -> BoxFuture<'_, SequencePosition>;

    /// Last durably recorded position for a shard (0 and `None` if absent).
    fn last_persisted_mark(
        &self,
        shard: &ShardName,
    ) -> BoxFuture<'_, (SequencePosition, Option<DateTime<Utc>>)>;

    /// First committed position `>= start` that is immediately followed by
    /// a hole.
    fn find_first_gap_at_or_after(
        &self,
        start: SequencePosition,
    ) -> BoxFuture<'_, Option<SequencePosition>>;

    /// Maximum committed position `>= start`.
    fn find_max_committed_at_or_after(
        &self,
        start: SequencePosition,
    ) -> BoxFuture<'_, Option<SequencePosition>>;

    /// Smallest committed position whose commit time is `>= timestamp`.
    fn find_earliest_committed_at_or_after(
        &self,
        timestamp: DateTime<Utc>,
    ) -> BoxFuture<'_, Option<SequencePosition>>;

    /// Atomically upsert the shard's mark, returning the stored `last_updated`
    /// from the same statement.
    fn persist_mark(
        &self,
        shard: &ShardName,
        position: SequencePosition,
    ) -> BoxFuture<'_, Option<DateTime<Utc>>>;

    /// Every progress row (for health checks and lag reporting).
    fn all_progress(&self) -> BoxFuture<'_, Vec<ShardProgress>>;

    /// Committed events in `(after, up_to]`, ascending, at most `limit`.
    fn fetch_events(
        &self,
        after: SequencePosition,
        up_to: SequencePosition,
        limit: usize,
    ) -> BoxFuture<'_, Vec<EventRecord>>;

    /// Release resources (flush WAL, close pools).
    fn close(&self) -> Pin<Box<dyn Future<Output = ()> + Send + '_>> {
        Box::pin(async {})
    }
}
