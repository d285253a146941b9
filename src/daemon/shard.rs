//! Shard consumer: applies committed events up to the high water mark.
//!
//! Each registered [`Projection`] gets a dedicated task that:
//! 1. Loads the shard's committed position from the event log
//! 2. Waits until the high water mark passes that position
//! 3. Fetches events in `(position, mark]` in batches and applies them
//! 4. Persists the new position after every batch
//!
//! Positions never pass the high water mark, so a shard never applies an
//! event while an earlier one may still commit.
//!
//! # Failures
//!
//! A failed apply first persists the progress made so far in the batch,
//! then asks the supervisor for a [`Continuation`]:
//!
//! | Continuation | Effect |
//! |--------------|--------|
//! | `SkipEvent`, `DoNothing` | continue with the next event |
//! | `RetryLater(d)` | wait `d`, refetch from the failed event |
//! | `PauseShard(d)`, `PauseAllShards(d)` | pause for `d`, resume from committed progress |
//! | `StopShard`, `StopAllShards` | exit the task |
//!
//! Store failures while loading, fetching or persisting go through the same
//! policy, as `EventFetch` and `ProgressUpdate` errors.

use super::supervisor::{ShardHandle, ShardSupervisor};
use super::types::{ShardControl, ShardStatus};
use crate::error::ProgressError;
use crate::metrics;
use crate::policy::{Continuation, ErrorCategory, ShardError};
use crate::resilience::sleep_or_shutdown;
use crate::store::EventLog;
use crate::tracker::{HighWaterSubscription, ShardAction, ShardState, ShardStateTracker};
use crate::types::{EventRecord, SequencePosition, ShardName};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::watch;
use tracing::{debug, info, info_span, warn, Instrument};

/// Future returned by [`Projection::apply`].
pub type ApplyFuture<'a> = Pin<Box<dyn Future<Output = Result<(), ShardError>> + Send + 'a>>;

/// A read model fed by the daemon.
///
/// ```rust
/// use projection_progress::daemon::{ApplyFuture, Projection};
/// use projection_progress::policy::{ErrorCategory, ShardError};
/// use projection_progress::EventRecord;
/// use std::sync::atomic::{AtomicU64, Ordering};
///
/// struct TripCount(AtomicU64);
///
/// impl Projection for TripCount {
///     fn name(&self) -> &str {
///         "TripCount"
///     }
///
///     fn apply<'a>(&'a self, event: &'a EventRecord) -> ApplyFuture<'a> {
///         Box::pin(async move {
///             if event.event_type == "TripStarted" {
///                 self.0
///                     .fetch_add(1, Ordering::Relaxed)
///                     .checked_add(1)
///                     .ok_or_else(|| ShardError::new(ErrorCategory::Arithmetic, "overflow"))?;
///             }
///             Ok(())
///         })
///     }
/// }
/// ```
pub trait Projection: Send + Sync + 'static {
    /// Projection name; the first half of the shard identity.
    fn name(&self) -> &str;

    /// Apply one committed event.
    fn apply<'a>(&'a self, event: &'a EventRecord) -> ApplyFuture<'a>;

    /// Shard this projection consumes as. Defaults to `"<name>:All"`.
    fn shard_name(&self) -> ShardName {
        ShardName::all(self.name())
    }
}

/// What the consumer loop does after a failure.
enum Flow {
    /// Treat the failed event as handled.
    Next,
    /// Drop the rest of the batch and fetch again from committed progress.
    Refetch,
    /// Leave the loop.
    Exit,
}

/// Everything a shard task needs.
pub(crate) struct ShardRunner<L: EventLog> {
    pub(crate) log: Arc<L>,
    pub(crate) projection: Arc<dyn Projection>,
    pub(crate) handle: Arc<ShardHandle>,
    pub(crate) supervisor: Arc<ShardSupervisor>,
    pub(crate) tracker: Arc<ShardStateTracker>,
    pub(crate) batch_size: usize,
    pub(crate) shutdown_rx: watch::Receiver<bool>,
}

impl<L: EventLog> ShardRunner<L> {
    /// Run until stopped, shut down, or the tracker goes away.
    pub(crate) async fn run(self) {
        let span = info_span!("shard", shard = %self.handle.name());
        self.consume().instrument(span).await
    }

    fn shard(&self) -> &ShardName {
        self.handle.name()
    }

    fn announce(&self, action: ShardAction) {
        self.tracker
            .publish(ShardState::new(self.shard(), self.handle.position(), action));
    }

    async fn consume(mut self) {
        let mut subscription = self.tracker.subscribe(self.shard());
        let mut control_rx = self.handle.control();
        let mut position: Option<SequencePosition> = None;

        info!("Shard starting");
        self.handle.set_status(ShardStatus::Running);

        loop {
            if *self.shutdown_rx.borrow() {
                break;
            }

            let control = *control_rx.borrow_and_update();
            match control {
                ShardControl::Stop => break,
                ShardControl::Pause { until } => {
                    if !self.wait_out_pause(control, until, &mut control_rx).await {
                        break;
                    }
                    continue;
                }
                ShardControl::Run => {}
            }

            let committed = match position {
                Some(committed) => committed,
                None => match self.load_position().await {
                    Ok(committed) => {
                        self.handle.set_position(committed);
                        self.announce(ShardAction::Started);
                        position = Some(committed);
                        committed
                    }
                    Err(flow) => match flow {
                        Flow::Exit => break,
                        Flow::Next | Flow::Refetch => continue,
                    },
                },
            };

            let mark = subscription.current();
            if committed >= mark {
                if !self
                    .wait_for_work(&mut subscription, &mut control_rx)
                    .await
                {
                    break;
                }
                continue;
            }

            match self.process_batch(committed, mark).await {
                Ok(next) => position = Some(next),
                Err((next, Flow::Exit)) => {
                    position = Some(next);
                    break;
                }
                Err((next, _)) => position = Some(next),
            }
        }

        self.handle.set_status(ShardStatus::Stopped);
        self.announce(ShardAction::Stopped);
        info!(position = self.handle.position(), "Shard stopped");
    }

    async fn load_position(&mut self) -> Result<SequencePosition, Flow> {
        match self.log.last_persisted_mark(self.shard()).await {
            Ok((committed, _)) => {
                debug!(position = committed, "Loaded shard progress");
                Ok(committed)
            }
            Err(e) => {
                let error = store_error(ErrorCategory::EventFetch, &e);
                Err(self.recover(&error).await)
            }
        }
    }

    /// Apply one batch above `committed`. Returns the committed position
    /// afterwards, paired with the flow when a failure cut the batch short.
    async fn process_batch(
        &mut self,
        committed: SequencePosition,
        mark: SequencePosition,
    ) -> Result<SequencePosition, (SequencePosition, Flow)> {
        let started = Instant::now();
        let limit = self.batch_size.max(1);

        let events = match self.log.fetch_events(committed, mark, limit).await {
            Ok(events) => events,
            Err(e) => {
                let error = store_error(ErrorCategory::EventFetch, &e);
                let flow = self.recover(&error).await;
                return Err((committed, flow));
            }
        };

        // A short batch means everything up to the mark was read; positions
        // without events (settled gaps) are covered by the mark itself.
        let batch_end = match events.last() {
            Some(last) if events.len() >= limit => last.sequence,
            _ => mark,
        };

        let mut handled = committed;
        let mut applied = 0usize;
        for event in &events {
            match self.projection.apply(event).await {
                Ok(()) => {
                    handled = event.sequence;
                    applied += 1;
                }
                Err(error) => {
                    let error = if error.category == ErrorCategory::ApplyEvent {
                        error
                    } else {
                        ShardError::apply(error)
                    };
                    let saved = match self.save(committed, handled).await {
                        Ok(saved) => saved,
                        Err((saved, Flow::Next)) => saved,
                        Err(cut) => return Err(cut),
                    };
                    match self.recover(&error).await {
                        Flow::Next => {
                            debug!(sequence = event.sequence, "Event skipped");
                            metrics::record_event_skipped(&self.shard().identity());
                            self.announce(ShardAction::Skipped);
                            handled = event.sequence;
                        }
                        flow => return Err((saved, flow)),
                    }
                }
            }
        }

        let saved = match self.save(committed, batch_end).await {
            Ok(saved) => saved,
            // progress was not recorded; read the batch again
            Err((saved, Flow::Next)) => return Err((saved, Flow::Refetch)),
            Err(cut) => return Err(cut),
        };

        self.handle.reset_attempts();
        metrics::record_events_applied(&self.shard().identity(), applied, started.elapsed());
        metrics::set_shard_progress(&self.shard().identity(), saved, mark);
        self.announce(ShardAction::Updated);
        debug!(from = committed, to = saved, applied, "Batch committed");
        Ok(saved)
    }

    /// Persist `target` if it moved past `committed`. On failure the policy
    /// decides, and the error carries the position still on record together
    /// with the flow it chose.
    async fn save(
        &mut self,
        committed: SequencePosition,
        target: SequencePosition,
    ) -> Result<SequencePosition, (SequencePosition, Flow)> {
        if target <= committed {
            return Ok(committed);
        }
        match self.log.persist_mark(self.shard(), target).await {
            Ok(_) => {
                self.handle.set_position(target);
                Ok(target)
            }
            Err(e) => {
                let error = store_error(ErrorCategory::ProgressUpdate, &e);
                let flow = self.recover(&error).await;
                Err((committed, flow))
            }
        }
    }

    /// Resolve a failure through the supervisor and apply the local effect.
    async fn recover(&mut self, error: &ShardError) -> Flow {
        let identity = self.shard().identity();
        let continuation = match self.supervisor.report_failure(&identity, error).await {
            Ok(continuation) => continuation,
            Err(e) => {
                warn!(error = %e, "Failure could not be resolved, stopping shard");
                Continuation::StopShard
            }
        };

        match continuation {
            Continuation::SkipEvent | Continuation::DoNothing => Flow::Next,
            Continuation::RetryLater(delay) => {
                if sleep_or_shutdown(delay, &mut self.shutdown_rx).await {
                    Flow::Refetch
                } else {
                    Flow::Exit
                }
            }
            Continuation::PauseShard(delay) | Continuation::PauseAllShards(delay) => {
                self.handle.pause(delay);
                Flow::Refetch
            }
            Continuation::StopShard | Continuation::StopAllShards => {
                self.handle.stop();
                Flow::Exit
            }
        }
    }

    /// Sit out a pause. Returns false if the shard should exit.
    async fn wait_out_pause(
        &mut self,
        control: ShardControl,
        until: tokio::time::Instant,
        control_rx: &mut watch::Receiver<ShardControl>,
    ) -> bool {
        self.handle.set_status(ShardStatus::Paused);
        self.announce(ShardAction::Paused);
        info!(remaining = ?until.saturating_duration_since(tokio::time::Instant::now()), "Shard paused");

        tokio::select! {
            _ = tokio::time::sleep_until(until) => {
                self.handle.resume_after(control);
            }
            changed = control_rx.changed() => {
                if changed.is_err() {
                    return false;
                }
                // re-read at the top of the loop
                return true;
            }
            _ = self.shutdown_rx.changed() => {
                return false;
            }
        }

        self.handle.set_status(ShardStatus::Running);
        self.announce(ShardAction::Resumed);
        info!("Shard resumed");
        true
    }

    /// Wait for the mark to move, a control change or shutdown. Returns
    /// false if the shard should exit.
    async fn wait_for_work(
        &mut self,
        subscription: &mut HighWaterSubscription,
        control_rx: &mut watch::Receiver<ShardControl>,
    ) -> bool {
        tokio::select! {
            mark = subscription.changed() => mark.is_some(),
            changed = control_rx.changed() => changed.is_ok(),
            _ = self.shutdown_rx.changed() => false,
        }
    }
}

fn store_error(category: ErrorCategory, error: &ProgressError) -> ShardError {
    ShardError::new(category, error.to_string())
}
