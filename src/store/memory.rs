// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! In-memory event log for tests and standalone runs.
//!
//! Behaves like [`SqliteEventLog`](super::SqliteEventLog) but lets callers
//! reserve positions and commit them out of order, pin commit timestamps,
//! abandon reservations, and make the next N calls fail.

use super::{BoxFuture, EventLog, RawStatistics};
use crate::error::{ProgressError, Result};
use crate::types::{EventRecord, SequencePosition, ShardName, ShardProgress};
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::RwLock;

#[derive(Debug, Clone)]
struct StoredEvent {
    event_type: String,
    data: Vec<u8>,
    timestamp: DateTime<Utc>,
    tombstone: bool,
}

#[derive(Debug, Default)]
struct LogState {
    highest: SequencePosition,
    events: BTreeMap<SequencePosition, StoredEvent>,
    progress: HashMap<String, (SequencePosition, Option<DateTime<Utc>>)>,
}

/// Consume one unit of an armed failure counter.
fn take(counter: &AtomicU32) -> bool {
    counter
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok()
}

/// Event log held in process memory. Cheap to clone; clones share state.
#[derive(Clone, Default)]
pub struct InMemoryEventLog {
    state: Arc<RwLock<LogState>>,
    fail_next: Arc<AtomicU32>,
    fail_persists: Arc<AtomicU32>,
    calls: Arc<AtomicU64>,
}

impl InMemoryEventLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `count` trait calls fail with
    /// [`ProgressError::InjectedFailure`].
    pub fn fail_next(&self, count: u32) {
        self.fail_next.store(count, Ordering::SeqCst);
    }

    /// Make the next `count` progress writes for projection shards fail.
    /// High water mark writes are unaffected.
    pub fn fail_persists(&self, count: u32) {
        self.fail_persists.store(count, Ordering::SeqCst);
    }

    /// Number of trait calls served (including failed ones).
    pub fn call_count(&self) -> u64 {
        self.calls.load(Ordering::SeqCst)
    }

    fn check(&self, operation: &str) -> Result<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if take(&self.fail_next) {
            return Err(ProgressError::InjectedFailure {
                operation: operation.to_string(),
            });
        }
        Ok(())
    }

    /// Reserve the next position without committing it.
    pub async fn reserve(&self) -> SequencePosition {
        let mut state = self.state.write().await;
        state.highest += 1;
        state.highest
    }

    /// Reserve and commit an event now.
    pub async fn append(&self, event_type: &str, data: &[u8]) -> SequencePosition {
        let mut state = self.state.write().await;
        state.highest += 1;
        let position = state.highest;
        state.events.insert(
            position,
            StoredEvent {
                event_type: event_type.to_string(),
                data: data.to_vec(),
                timestamp: Utc::now(),
                tombstone: false,
            },
        );
        position
    }

    /// Commit an event at a reserved position with the current time.
    pub async fn commit(&self, position: SequencePosition, event_type: &str, data: &[u8]) {
        self.commit_at(position, event_type, data, Utc::now()).await
    }

    /// Commit an event at a position with an explicit commit time.
    ///
    /// Reserves up to `position` if needed, so tests can lay out arbitrary
    /// committed sets.
    pub async fn commit_at(
        &self,
        position: SequencePosition,
        event_type: &str,
        data: &[u8],
        timestamp: DateTime<Utc>,
    ) {
        let mut state = self.state.write().await;
        state.highest = state.highest.max(position);
        state.events.insert(
            position,
            StoredEvent {
                event_type: event_type.to_string(),
                data: data.to_vec(),
                timestamp,
                tombstone: false,
            },
        );
    }

    /// Raise the highest assigned position without committing anything.
    pub async fn set_highest(&self, position: SequencePosition) {
        let mut state = self.state.write().await;
        state.highest = state.highest.max(position);
    }

    /// Close an abandoned position with a tombstone. No-op if committed.
    pub async fn settle(&self, position: SequencePosition) {
        let mut state = self.state.write().await;
        state.events.entry(position).or_insert_with(|| StoredEvent {
            event_type: "tombstone".to_string(),
            data: Vec::new(),
            timestamp: Utc::now(),
            tombstone: true,
        });
    }

    /// Committed positions (tombstones included), ascending.
    pub async fn committed_positions(&self) -> Vec<SequencePosition> {
        self.state.read().await.events.keys().copied().collect()
    }
}

impl EventLog for InMemoryEventLog {
    fn fetch_statistics(&self, shard: &ShardName) -> BoxFuture<'_, RawStatistics> {
        let name = shard.identity();
        Box::pin(async move {
            self.check("fetch_statistics")?;
            let state = self.state.read().await;
            let (last_mark, last_updated) = state.progress.get(&name).copied().unwrap_or((0, None));
            Ok(RawStatistics {
                highest_sequence: state.highest,
                last_mark,
                last_updated,
                timestamp: Utc::now(),
            })
        })
    }

    fn highest_assigned_position(&self) -> BoxFuture<'_, SequencePosition> {
        Box::pin(async move {
            self.check("highest_assigned_position")?;
            Ok(self.state.read().await.highest)
        })
    }

    fn last_persisted_mark(
        &self,
        shard: &ShardName,
    ) -> BoxFuture<'_, (SequencePosition, Option<DateTime<Utc>>)> {
        let name = shard.identity();
        Box::pin(async move {
            self.check("last_persisted_mark")?;
            Ok(self
                .state
                .read()
                .await
                .progress
                .get(&name)
                .copied()
                .unwrap_or((0, None)))
        })
    }

    fn find_first_gap_at_or_after(
        &self,
        start: SequencePosition,
    ) -> BoxFuture<'_, Option<SequencePosition>> {
        Box::pin(async move {
            self.check("find_first_gap")?;
            let state = self.state.read().await;
            let mut positions = state.events.range(start..).map(|(p, _)| *p).peekable();
            while let Some(position) = positions.next() {
                if let Some(&next) = positions.peek() {
                    if next - position > 1 {
                        return Ok(Some(position));
                    }
                }
            }
            Ok(None)
        })
    }

    fn find_max_committed_at_or_after(
        &self,
        start: SequencePosition,
    ) -> BoxFuture<'_, Option<SequencePosition>> {
        Box::pin(async move {
            self.check("find_max_committed")?;
            let state = self.state.read().await;
            Ok(state.events.range(start..).next_back().map(|(p, _)| *p))
        })
    }

    fn find_earliest_committed_at_or_after(
        &self,
        timestamp: DateTime<Utc>,
    ) -> BoxFuture<'_, Option<SequencePosition>> {
        Box::pin(async move {
            self.check("find_earliest_committed")?;
            let state = self.state.read().await;
            Ok(state
                .events
                .iter()
                .filter(|(_, e)| e.timestamp >= timestamp)
                .map(|(p, _)| *p)
                .min())
        })
    }

    fn persist_mark(
        &self,
        shard: &ShardName,
        position: SequencePosition,
    ) -> BoxFuture<'_, Option<DateTime<Utc>>> {
        let name = shard.identity();
        let shard_write = !shard.is_high_water();
        Box::pin(async move {
            self.check("persist_mark")?;
            if shard_write && take(&self.fail_persists) {
                return Err(ProgressError::InjectedFailure {
                    operation: "persist_mark".to_string(),
                });
            }
            let now = Utc::now();
            self.state
                .write()
                .await
                .progress
                .insert(name, (position, Some(now)));
            Ok(Some(now))
        })
    }

    fn all_progress(&self) -> BoxFuture<'_, Vec<ShardProgress>> {
        Box::pin(async move {
            self.check("all_progress")?;
            let state = self.state.read().await;
            let mut progress: Vec<ShardProgress> = state
                .progress
                .iter()
                .map(|(shard, (sequence, last_updated))| ShardProgress {
                    shard: shard.clone(),
                    sequence: *sequence,
                    last_updated: *last_updated,
                })
                .collect();
            progress.sort_by(|a, b| a.shard.cmp(&b.shard));
            Ok(progress)
        })
    }

    fn fetch_events(
        &self,
        after: SequencePosition,
        up_to: SequencePosition,
        limit: usize,
    ) -> BoxFuture<'_, Vec<EventRecord>> {
        Box::pin(async move {
            self.check("fetch_events")?;
            if up_to <= after {
                return Ok(Vec::new());
            }
            let state = self.state.read().await;
            Ok(state
                .events
                .range(after + 1..=up_to)
                .filter(|(_, e)| !e.tombstone)
                .take(limit)
                .map(|(p, e)| EventRecord {
                    sequence: *p,
                    event_type: e.event_type.clone(),
                    data: e.data.clone(),
                    timestamp: e.timestamp,
                })
                .collect())
        })
    }
}
