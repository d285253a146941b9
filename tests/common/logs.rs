//! Event log wrappers for chaos tests.

use chrono::{DateTime, Utc};
use projection_progress::store::{BoxFuture, EventLog, InMemoryEventLog, RawStatistics};
use projection_progress::{EventRecord, ProgressError, SequencePosition, ShardName, ShardProgress};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

/// Delegates to an [`InMemoryEventLog`] with two fault knobs: panics inside
/// `fetch_statistics` (a detection worker fault) and errors from
/// `fetch_events` (a shard read fault).
pub struct FaultyLog {
    inner: Arc<InMemoryEventLog>,
    panics: AtomicU32,
    fetch_failures: AtomicU32,
}

impl FaultyLog {
    pub fn new(inner: Arc<InMemoryEventLog>) -> Self {
        Self {
            inner,
            panics: AtomicU32::new(0),
            fetch_failures: AtomicU32::new(0),
        }
    }

    /// Panic on the next `count` statistics reads.
    pub fn panic_next(&self, count: u32) {
        self.panics.store(count, Ordering::SeqCst);
    }

    /// Fail the next `count` event fetches.
    pub fn fail_fetches(&self, count: u32) {
        self.fetch_failures.store(count, Ordering::SeqCst);
    }

    pub fn inner(&self) -> &Arc<InMemoryEventLog> {
        &self.inner
    }

    fn maybe_panic(&self) {
        if take(&self.panics) {
            panic!("simulated detection fault");
        }
    }
}

fn take(counter: &AtomicU32) -> bool {
    counter
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok()
}

impl EventLog for FaultyLog {
    fn fetch_statistics(&self, shard: &ShardName) -> BoxFuture<'_, RawStatistics> {
        let shard = shard.clone();
        Box::pin(async move {
            self.maybe_panic();
            self.inner.fetch_statistics(&shard).await
        })
    }

    fn highest_assigned_position(&self) -> BoxFuture<'_, SequencePosition> {
        self.inner.highest_assigned_position()
    }

    fn last_persisted_mark(
        &self,
        shard: &ShardName,
    ) -> BoxFuture<'_, (SequencePosition, Option<DateTime<Utc>>)> {
        self.inner.last_persisted_mark(shard)
    }

    fn find_first_gap_at_or_after(
        &self,
        start: SequencePosition,
    ) -> BoxFuture<'_, Option<SequencePosition>> {
        self.inner.find_first_gap_at_or_after(start)
    }

    fn find_max_committed_at_or_after(
        &self,
        start: SequencePosition,
    ) -> BoxFuture<'_, Option<SequencePosition>> {
        self.inner.find_max_committed_at_or_after(start)
    }

    fn find_earliest_committed_at_or_after(
        &self,
        timestamp: DateTime<Utc>,
    ) -> BoxFuture<'_, Option<SequencePosition>> {
        self.inner.find_earliest_committed_at_or_after(timestamp)
    }

    fn persist_mark(
        &self,
        shard: &ShardName,
        position: SequencePosition,
    ) -> BoxFuture<'_, Option<DateTime<Utc>>> {
        self.inner.persist_mark(shard, position)
    }

    fn all_progress(&self) -> BoxFuture<'_, Vec<ShardProgress>> {
        self.inner.all_progress()
    }

    fn fetch_events(
        &self,
        after: SequencePosition,
        up_to: SequencePosition,
        limit: usize,
    ) -> BoxFuture<'_, Vec<EventRecord>> {
        if take(&self.fetch_failures) {
            return Box::pin(async {
                Err(ProgressError::InjectedFailure {
                    operation: "fetch_events".to_string(),
                })
            });
        }
        self.inner.fetch_events(after, up_to, limit)
    }
}
