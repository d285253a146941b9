//! Adaptive polling loop for high water detection.
//!
//! # Tasks
//!
//! The agent owns two independent tasks:
//!
//! - **Detection loop**: polls the detector, classifies each pass, publishes
//!   the mark and picks the next delay.
//! - **Heartbeat**: every `health_check_polling_time` checks whether the
//!   detection loop has died (panicked). If it has and shutdown was not
//!   requested, the loop is restarted with a full bootstrap detection.
//!
//! # Delays
//!
//! | Status | Action | Next poll |
//! |--------|--------|-----------|
//! | `Changed` | publish | `fast_polling_time` |
//! | `CaughtUp` | publish | `slow_polling_time` |
//! | `Stale` | wait for the safe harbor, rescan the safe zone, publish | `fast_polling_time` |
//! | error | log | `slow_polling_time` |
//!
//! # Graceful Shutdown
//!
//! [`stop()`](HighWaterAgent::stop) signals a watch channel that every sleep
//! selects on. No mark is published after the signal is observed.

use super::{HighWaterDetector, HighWaterStatistics, HighWaterStatus};
use crate::config::HighWaterConfig;
use crate::error::{ProgressError, Result};
use crate::metrics;
use crate::resilience::sleep_or_shutdown;
use crate::store::EventLog;
use crate::tracker::ShardStateTracker;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, info_span, warn, Instrument};

struct AgentInner<L: EventLog> {
    detector: HighWaterDetector<L>,
    tracker: Arc<ShardStateTracker>,
    config: HighWaterConfig,
    latest: RwLock<Option<HighWaterStatistics>>,
    restarts: AtomicU64,
}

impl<L: EventLog> AgentInner<L> {
    async fn bootstrap(&self) -> Result<HighWaterStatistics> {
        let statistics = self.detector.detect().await?;
        info!(
            mark = statistics.current_mark,
            highest = statistics.highest_sequence,
            "High water bootstrap detection complete"
        );
        self.publish(&statistics).await;
        Ok(statistics)
    }

    async fn publish(&self, statistics: &HighWaterStatistics) {
        self.tracker.mark_high_water(statistics.current_mark);
        metrics::set_high_water_mark(statistics.current_mark, statistics.highest_sequence);
        *self.latest.write().await = Some(*statistics);
    }
}

/// Drives high water detection in the background.
pub struct HighWaterAgent<L: EventLog> {
    inner: Arc<AgentInner<L>>,
    shutdown_tx: watch::Sender<bool>,
    loop_handle: Arc<Mutex<Option<JoinHandle<()>>>>,
    heartbeat_handle: Option<JoinHandle<()>>,
}

impl<L: EventLog> HighWaterAgent<L> {
    pub fn new(log: Arc<L>, tracker: Arc<ShardStateTracker>, config: HighWaterConfig) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            inner: Arc::new(AgentInner {
                detector: HighWaterDetector::new(log),
                tracker,
                config,
                latest: RwLock::new(None),
                restarts: AtomicU64::new(0),
            }),
            shutdown_tx,
            loop_handle: Arc::new(Mutex::new(None)),
            heartbeat_handle: None,
        }
    }

    /// Run the bootstrap detection and spawn the detection and heartbeat
    /// tasks.
    ///
    /// Bootstrap errors are returned to the caller; once running, the agent
    /// never stops on a detection error.
    pub async fn start(&mut self) -> Result<HighWaterStatistics> {
        if self.heartbeat_handle.is_some() {
            return Err(ProgressError::InvalidState {
                expected: "Idle".to_string(),
                actual: "Running".to_string(),
            });
        }
        self.shutdown_tx.send_replace(false);

        let bootstrap = self.inner.bootstrap().await?;

        let handle = spawn_detection_loop(
            Arc::clone(&self.inner),
            Some(bootstrap),
            self.shutdown_tx.subscribe(),
        );
        *self.loop_handle.lock().await = Some(handle);

        self.heartbeat_handle = Some(spawn_heartbeat(
            Arc::clone(&self.inner),
            Arc::clone(&self.loop_handle),
            self.shutdown_tx.subscribe(),
        ));

        metrics::set_agent_running(true);
        info!(
            fast_polling = ?self.inner.config.fast_polling(),
            slow_polling = ?self.inner.config.slow_polling(),
            "High water agent started"
        );
        Ok(bootstrap)
    }

    /// Signal both tasks to stop and wait for them.
    pub async fn stop(&mut self) {
        self.shutdown_tx.send_replace(true);

        if let Some(handle) = self.heartbeat_handle.take() {
            if let Err(e) = handle.await {
                warn!(error = %e, "Heartbeat task panicked");
            }
        }
        if let Some(handle) = self.loop_handle.lock().await.take() {
            if let Err(e) = handle.await {
                warn!(error = %e, "Detection loop panicked during shutdown");
            }
        }

        metrics::set_agent_running(false);
        info!("High water agent stopped");
    }

    /// True while the agent has been started and not stopped.
    pub fn is_running(&self) -> bool {
        self.heartbeat_handle.is_some() && !*self.shutdown_tx.borrow()
    }

    /// Times the heartbeat restarted a dead detection loop.
    pub fn restart_count(&self) -> u64 {
        self.inner.restarts.load(Ordering::Relaxed)
    }

    /// The most recently published statistics.
    pub async fn latest(&self) -> Option<HighWaterStatistics> {
        *self.inner.latest.read().await
    }

    pub fn tracker(&self) -> &Arc<ShardStateTracker> {
        &self.inner.tracker
    }
}

fn spawn_detection_loop<L: EventLog>(
    inner: Arc<AgentInner<L>>,
    bootstrap: Option<HighWaterStatistics>,
    shutdown_rx: watch::Receiver<bool>,
) -> JoinHandle<()> {
    let span = info_span!("high_water");
    tokio::spawn(
        async move {
            let previous = match bootstrap {
                Some(statistics) => statistics,
                None => match inner.bootstrap().await {
                    Ok(statistics) => statistics,
                    Err(e) => {
                        // The heartbeat tries again on its next tick.
                        warn!(error = %e, "Bootstrap detection failed after restart");
                        metrics::record_detection_error(e.kind());
                        return;
                    }
                },
            };
            run_detection_loop(inner, previous, shutdown_rx).await;
        }
        .instrument(span),
    )
}

fn spawn_heartbeat<L: EventLog>(
    inner: Arc<AgentInner<L>>,
    loop_handle: Arc<Mutex<Option<JoinHandle<()>>>>,
    mut shutdown_rx: watch::Receiver<bool>,
) -> JoinHandle<()> {
    let period = inner.config.health_check_polling();
    let span = info_span!("high_water_heartbeat");
    tokio::spawn(
        async move {
            let mut timer = tokio::time::interval(period);
            timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            timer.tick().await;

            loop {
                tokio::select! {
                    _ = timer.tick() => {
                        if *shutdown_rx.borrow() {
                            break;
                        }
                        let mut guard = loop_handle.lock().await;
                        let dead = guard.as_ref().map_or(true, |h| h.is_finished());
                        if !dead {
                            continue;
                        }
                        if let Some(finished) = guard.take() {
                            if let Err(e) = finished.await {
                                error!(error = %e, "Detection loop died");
                            }
                        }
                        let restarts = inner.restarts.fetch_add(1, Ordering::Relaxed) + 1;
                        warn!(restarts, "Restarting high water detection loop");
                        metrics::record_agent_restart();
                        *guard = Some(spawn_detection_loop(
                            Arc::clone(&inner),
                            None,
                            shutdown_rx.clone(),
                        ));
                    }
                    changed = shutdown_rx.changed() => {
                        if changed.is_err() || *shutdown_rx.borrow() {
                            break;
                        }
                    }
                }
            }
            debug!("Heartbeat stopped");
        }
        .instrument(span),
    )
}

async fn run_detection_loop<L: EventLog>(
    inner: Arc<AgentInner<L>>,
    mut previous: HighWaterStatistics,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let fast = inner.config.fast_polling();
    let slow = inner.config.slow_polling();
    let leading_edge = chrono::Duration::from_std(inner.config.leading_edge())
        .unwrap_or_else(|_| chrono::Duration::seconds(1));

    debug!("Detection loop running");

    loop {
        if *shutdown_rx.borrow() {
            break;
        }

        let statistics = match inner.detector.detect().await {
            Ok(statistics) => statistics,
            Err(e) => {
                warn!(error = %e, "High water detection failed");
                metrics::record_detection_error(e.kind());
                if !sleep_or_shutdown(slow, &mut shutdown_rx).await {
                    break;
                }
                continue;
            }
        };

        let status = statistics.interpret_status(&previous);
        metrics::record_detection(status);

        let (published, delay) = match status {
            HighWaterStatus::Changed => (statistics, fast),
            HighWaterStatus::CaughtUp => (statistics, slow),
            HighWaterStatus::Stale => {
                let safe_harbor = previous.timestamp + leading_edge;
                debug!(
                    mark = statistics.current_mark,
                    highest = statistics.highest_sequence,
                    safe_harbor = %safe_harbor,
                    "High water mark is stale"
                );
                metrics::record_stale_recheck();

                let wait = (safe_harbor - statistics.timestamp)
                    .to_std()
                    .unwrap_or(Duration::ZERO);
                if !wait.is_zero() && !sleep_or_shutdown(wait, &mut shutdown_rx).await {
                    break;
                }

                match inner.detector.detect_in_safe_zone(safe_harbor).await {
                    Ok(rescanned) => (rescanned, fast),
                    Err(e) => {
                        warn!(error = %e, "Safe zone detection failed");
                        metrics::record_detection_error(e.kind());
                        if !sleep_or_shutdown(slow, &mut shutdown_rx).await {
                            break;
                        }
                        continue;
                    }
                }
            }
        };

        if *shutdown_rx.borrow() {
            break;
        }

        inner.publish(&published).await;
        previous = published;

        if !sleep_or_shutdown(delay, &mut shutdown_rx).await {
            break;
        }
    }

    debug!("Detection loop stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::InMemoryEventLog;
    use crate::types::ShardName;

    fn agent(log: &Arc<InMemoryEventLog>) -> HighWaterAgent<InMemoryEventLog> {
        HighWaterAgent::new(
            Arc::clone(log),
            Arc::new(ShardStateTracker::new()),
            HighWaterConfig::for_testing(),
        )
    }

    async fn wait_for_mark(tracker: &ShardStateTracker, mark: i64) -> bool {
        for _ in 0..200 {
            if tracker.high_water_mark() >= mark {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        false
    }

    #[tokio::test]
    async fn test_start_publishes_bootstrap_mark() {
        let log = Arc::new(InMemoryEventLog::new());
        log.append("E", b"").await;
        log.append("E", b"").await;

        let mut agent = agent(&log);
        let bootstrap = agent.start().await.unwrap();
        assert_eq!(bootstrap.current_mark, 2);
        assert_eq!(agent.tracker().high_water_mark(), 2);
        assert!(agent.is_running());

        agent.stop().await;
        assert!(!agent.is_running());
    }

    #[tokio::test]
    async fn test_bootstrap_error_propagates() {
        let log = Arc::new(InMemoryEventLog::new());
        log.fail_next(1);
        let mut agent = agent(&log);
        assert!(agent.start().await.is_err());
        assert!(!agent.is_running());
    }

    #[tokio::test]
    async fn test_start_twice_is_invalid() {
        let log = Arc::new(InMemoryEventLog::new());
        let mut agent = agent(&log);
        agent.start().await.unwrap();
        assert!(matches!(agent.start().await, Err(ProgressError::InvalidState { .. })));
        agent.stop().await;
    }

    #[tokio::test]
    async fn test_follows_new_commits() {
        let log = Arc::new(InMemoryEventLog::new());
        let mut agent = agent(&log);
        agent.start().await.unwrap();

        for _ in 0..5 {
            log.append("E", b"").await;
        }
        assert!(wait_for_mark(agent.tracker(), 5).await);

        agent.stop().await;
    }

    #[tokio::test]
    async fn test_survives_detection_errors() {
        let log = Arc::new(InMemoryEventLog::new());
        let mut agent = agent(&log);
        agent.start().await.unwrap();

        log.fail_next(3);
        log.append("E", b"").await;
        assert!(wait_for_mark(agent.tracker(), 1).await);
        assert_eq!(agent.restart_count(), 0);

        agent.stop().await;
    }

    #[tokio::test]
    async fn test_stale_gap_resolves_after_settle() {
        let log = Arc::new(InMemoryEventLog::new());
        log.commit(1, "E", b"").await;
        log.commit(3, "E", b"").await;

        let mut agent = agent(&log);
        assert_eq!(agent.start().await.unwrap().current_mark, 1);

        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(agent.tracker().high_water_mark(), 1);

        log.settle(2).await;
        assert!(wait_for_mark(agent.tracker(), 3).await);
        assert_eq!(agent.latest().await.map(|s| s.current_mark), Some(3));

        agent.stop().await;
    }

    #[tokio::test]
    async fn test_stop_is_prompt() {
        let log = Arc::new(InMemoryEventLog::new());
        let mut agent = HighWaterAgent::new(
            Arc::clone(&log),
            Arc::new(ShardStateTracker::new()),
            HighWaterConfig {
                slow_polling_time: "1h".to_string(),
                health_check_polling_time: "1h".to_string(),
                ..HighWaterConfig::for_testing()
            },
        );
        agent.start().await.unwrap();

        let stopped = tokio::time::timeout(Duration::from_secs(2), agent.stop()).await;
        assert!(stopped.is_ok());
    }

    #[tokio::test]
    async fn test_no_publish_after_stop() {
        let log = Arc::new(InMemoryEventLog::new());
        log.append("E", b"").await;
        log.append("E", b"").await;

        let mut agent = agent(&log);
        agent.start().await.unwrap();
        log.append("E", b"").await;
        assert!(wait_for_mark(agent.tracker(), 3).await);

        agent.stop().await;
        let latest = agent.latest().await.unwrap();
        assert_eq!(latest.current_mark, 3);

        log.append("E", b"").await;
        log.append("E", b"").await;
        // several fast and slow polling periods
        tokio::time::sleep(Duration::from_millis(120)).await;

        assert_eq!(agent.tracker().high_water_mark(), 3);
        assert_eq!(agent.latest().await.unwrap().current_mark, 3);
        let (persisted, _) = log.last_persisted_mark(&ShardName::high_water()).await.unwrap();
        assert_eq!(persisted, 3);
    }
}
