//! Resilience utilities: backoff schedules and bulkheads.
//!
//! - [`RetrySchedule`]: explicit per-attempt backoff delays
//! - [`Bulkhead`]: semaphore bounding the retry block's concurrency
//! - `sleep_or_shutdown`: the cancellable sleep every background loop uses

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, OwnedSemaphorePermit, Semaphore};

/// Backoff schedule indexed by the number of failed attempts.
///
/// ```text
/// Failed attempts  Delay before next attempt
/// ---------------  -------------------------
/// 1                delays[0]   (50ms)
/// 2                delays[1]   (100ms)
/// 3                delays[2]   (250ms)
/// 4+               last entry  (250ms)
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetrySchedule {
    delays: Vec<Duration>,
}

impl Default for RetrySchedule {
    fn default() -> Self {
        Self::new(vec![
            Duration::from_millis(50),
            Duration::from_millis(100),
            Duration::from_millis(250),
        ])
    }
}

impl RetrySchedule {
    /// Create a schedule from explicit delays.
    ///
    /// An empty list means "retry immediately".
    pub fn new(delays: Vec<Duration>) -> Self {
        Self { delays }
    }

    /// Delay to wait after the given number of failed attempts (1-indexed).
    pub fn delay_for_attempt(&self, failed_attempts: u32) -> Duration {
        if self.delays.is_empty() {
            return Duration::ZERO;
        }
        let index = (failed_attempts.max(1) as usize - 1).min(self.delays.len() - 1);
        self.delays[index]
    }

    /// The configured delays.
    pub fn delays(&self) -> &[Duration] {
        &self.delays
    }
}

/// Sleep for `delay` unless shutdown is signaled first.
///
/// Returns `false` if the task should stop (shutdown requested or the
/// signal's sender was dropped).
pub(crate) async fn sleep_or_shutdown(
    delay: Duration,
    shutdown_rx: &mut watch::Receiver<bool>,
) -> bool {
    if *shutdown_rx.borrow() {
        return false;
    }
    tokio::select! {
        _ = tokio::time::sleep(delay) => true,
        changed = shutdown_rx.changed() => match changed {
            Ok(()) => !*shutdown_rx.borrow(),
            Err(_) => false,
        },
    }
}

// =============================================================================
// Bulkhead
// =============================================================================

/// The bulkhead's semaphore was closed while waiting for a slot.
#[derive(Debug, Clone, thiserror::Error)]
#[error("bulkhead closed with {in_flight} of {limit} slots in use")]
pub struct BulkheadClosed {
    pub in_flight: usize,
    pub limit: usize,
}

/// Caps how many retry items run at once. A permit is held for the whole
/// lifetime of an item, backoff sleeps included.
#[derive(Debug)]
pub struct Bulkhead {
    semaphore: Arc<Semaphore>,
    limit: usize,
}

impl Bulkhead {
    /// Limit of at least one slot.
    pub fn new(limit: usize) -> Self {
        let limit = limit.max(1);
        Self {
            semaphore: Arc::new(Semaphore::new(limit)),
            limit,
        }
    }

    /// Wait for a free slot. Dropping the permit frees it.
    pub async fn acquire(&self) -> Result<OwnedSemaphorePermit, BulkheadClosed> {
        Arc::clone(&self.semaphore)
            .acquire_owned()
            .await
            .map_err(|_| BulkheadClosed {
                in_flight: self.in_flight(),
                limit: self.limit,
            })
    }

    /// Slots currently taken.
    pub fn in_flight(&self) -> usize {
        self.limit - self.semaphore.available_permits()
    }

    pub fn limit(&self) -> usize {
        self.limit
    }
}
