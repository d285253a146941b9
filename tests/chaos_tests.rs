// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Chaos tests: simulate failures and verify graceful degradation.
//!
//! These tests verify the daemon keeps detecting and projecting through
//! worker panics, store errors and slow shutdowns without deadlocking.
//!
//! Run with: cargo test --test chaos_tests -- --nocapture

mod common;

use common::*;
use projection_progress::config::{DaemonConfig, HighWaterConfig};
use projection_progress::daemon::{DaemonState, ShardStatus};
use projection_progress::high_water::HighWaterAgent;
use projection_progress::policy::ErrorCategory;
use projection_progress::store::InMemoryEventLog;
use projection_progress::tracker::ShardStateTracker;
use projection_progress::{ProjectionDaemon, ShardName};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::time::{sleep, timeout};

// =============================================================================
// Detection Worker Faults
// =============================================================================

/// Test: a panicking detection loop is restarted by the heartbeat and the
/// mark keeps advancing afterwards.
#[tokio::test]
async fn detection_panic_is_restarted() {
    let inner = log_with(&[1, 2, 3]).await;
    let log = Arc::new(FaultyLog::new(Arc::clone(&inner)));
    let tracker = Arc::new(ShardStateTracker::new());
    let mut agent = HighWaterAgent::new(
        Arc::clone(&log),
        Arc::clone(&tracker),
        HighWaterConfig::for_testing(),
    );

    agent.start().await.unwrap();
    assert_eq!(tracker.high_water_mark(), 3);

    log.panic_next(1);
    assert!(wait_for(|| agent.restart_count() > 0).await, "heartbeat never restarted the loop");

    inner.commit(4, "TripRecorded", b"4").await;
    assert!(wait_for(|| tracker.high_water_mark() == 4).await);
    assert!(agent.is_running());

    agent.stop().await;
    assert!(!agent.is_running());
}

/// Test: repeated panics, including during the restart bootstrap, are
/// survived as long as the heartbeat keeps ticking.
#[tokio::test]
async fn repeated_panics_do_not_kill_the_agent() {
    let inner = log_with(&[1, 2]).await;
    let log = Arc::new(FaultyLog::new(Arc::clone(&inner)));
    let tracker = Arc::new(ShardStateTracker::new());
    let mut agent = HighWaterAgent::new(
        Arc::clone(&log),
        Arc::clone(&tracker),
        HighWaterConfig::for_testing(),
    );

    agent.start().await.unwrap();
    log.panic_next(3);
    inner.commit(3, "TripRecorded", b"3").await;

    assert!(wait_for(|| tracker.high_water_mark() == 3).await);
    assert!(agent.restart_count() >= 1);

    agent.stop().await;
}

/// Test: store errors during detection are logged and retried on the slow
/// interval; no restart is needed.
#[tokio::test]
async fn injected_store_errors_are_survived() {
    let log = log_with(&[1, 2, 3]).await;
    let tracker = Arc::new(ShardStateTracker::new());
    let mut agent = HighWaterAgent::new(
        Arc::clone(&log),
        Arc::clone(&tracker),
        HighWaterConfig::for_testing(),
    );

    agent.start().await.unwrap();

    log.fail_next(5);
    log.commit(4, "TripRecorded", b"4").await;
    log.commit(5, "TripRecorded", b"5").await;

    assert!(wait_for(|| tracker.high_water_mark() == 5).await);
    assert_eq!(agent.restart_count(), 0);
    assert!(agent.is_running());

    agent.stop().await;
}

/// Test: a bootstrap failure fails the daemon instead of leaving it half
/// started.
#[tokio::test]
async fn bootstrap_failure_fails_daemon() {
    let log = log_with(&[1, 2]).await;
    log.fail_next(1);

    let mut daemon = ProjectionDaemon::new(fast_config(), Arc::clone(&log));
    daemon
        .add_projection(Arc::new(RecordingProjection::new("Trips")))
        .unwrap();

    assert!(daemon.start().await.is_err());
    assert_eq!(daemon.state(), DaemonState::Failed);
    assert!(!daemon.health_check().await.ready);
}

// =============================================================================
// Shard Store Faults
// =============================================================================

/// Test: fetch failures resolve through the policy and the shard catches
/// up once reads succeed again.
#[tokio::test]
async fn fetch_failures_follow_policy() {
    let inner = log_with(&[1, 2, 3]).await;
    let log = Arc::new(FaultyLog::new(Arc::clone(&inner)));
    log.fail_fetches(2);

    let trips = Arc::new(RecordingProjection::new("Trips"));
    let mut daemon = ProjectionDaemon::new(fast_config(), Arc::clone(&log));
    daemon.add_projection(trips.clone()).unwrap();
    daemon
        .exception_policy_mut()
        .unwrap()
        .on(ErrorCategory::EventFetch)
        .retry_later([Duration::from_millis(5), Duration::from_millis(5)])
        .then()
        .stop();

    daemon.start().await.unwrap();

    assert!(wait_for(|| trips.applied() == vec![1, 2, 3]).await);
    let shard = ShardName::all("Trips");
    assert_eq!(daemon.shard_status(&shard).unwrap(), ShardStatus::Running);

    let mut settled = false;
    for _ in 0..100 {
        let health = daemon.health_check().await;
        if health.shards[0].failed_attempts == 0 && health.shards[0].position == 3 {
            settled = true;
            break;
        }
        sleep(Duration::from_millis(5)).await;
    }
    assert!(settled);

    daemon.shutdown().await;
}

/// Test: fetch failures outlasting the retry chain stop the shard without
/// touching its persisted progress.
#[tokio::test]
async fn persistent_fetch_failures_stop_shard() {
    let inner = log_with(&[1, 2, 3]).await;
    let log = Arc::new(FaultyLog::new(Arc::clone(&inner)));
    log.fail_fetches(u32::MAX);

    let trips = Arc::new(RecordingProjection::new("Trips"));
    let mut daemon = ProjectionDaemon::new(fast_config(), Arc::clone(&log));
    daemon.add_projection(trips.clone()).unwrap();
    daemon
        .exception_policy_mut()
        .unwrap()
        .on(ErrorCategory::EventFetch)
        .retry_later([Duration::from_millis(5)]);

    daemon.start().await.unwrap();

    let shard = ShardName::all("Trips");
    assert!(wait_for(|| matches!(daemon.shard_status(&shard), Ok(ShardStatus::Stopped))).await);
    assert!(trips.applied().is_empty());

    let progress = daemon.all_progress().await.unwrap();
    assert!(progress.iter().all(|p| p.shard != shard.identity()));
    assert!(!daemon.health_check().await.healthy);

    daemon.shutdown().await;
}

/// Test: a progress write that fails without a matching rule stops the
/// shard for good, even when the apply failure itself would be skipped.
#[tokio::test]
async fn failed_progress_write_stops_before_skip() {
    let log = log_with(&[1, 2, 3, 4, 5]).await;
    log.fail_persists(u32::MAX);

    let trips = Arc::new(RecordingProjection::new("Trips"));
    trips.fail_always(2, arithmetic());

    let mut daemon = ProjectionDaemon::new(fast_config(), Arc::clone(&log));
    daemon.add_projection(trips.clone()).unwrap();
    daemon
        .exception_policy_mut()
        .unwrap()
        .on(ErrorCategory::ApplyEvent)
        .and_inner(ErrorCategory::Arithmetic)
        .skip_event();
    daemon.start().await.unwrap();

    let shard = ShardName::all("Trips");
    assert!(wait_for(|| matches!(daemon.shard_status(&shard), Ok(ShardStatus::Stopped))).await);
    sleep(Duration::from_millis(50)).await;

    assert_eq!(trips.applied(), vec![1]);
    assert_eq!(trips.attempts(3), 0);
    let health = daemon.health_check().await;
    assert_eq!(health.shards[0].position, 0);
    assert_eq!(health.shards[0].failed_attempts, 1);

    daemon.shutdown().await;
}

// =============================================================================
// Shutdown
// =============================================================================

/// Test: shutdown is prompt even when every sleep is long.
#[tokio::test]
async fn shutdown_interrupts_long_polling() {
    let mut config = DaemonConfig::for_testing();
    config.settings.high_water = HighWaterConfig {
        fast_polling_time: "30s".to_string(),
        slow_polling_time: "60s".to_string(),
        health_check_polling_time: "60s".to_string(),
        leading_edge_buffer: "60s".to_string(),
    };

    let log = log_with(&[1, 2]).await;
    let mut daemon = ProjectionDaemon::new(config, Arc::clone(&log));
    daemon
        .add_projection(Arc::new(RecordingProjection::new("Trips")))
        .unwrap();
    daemon
        .add_projection(Arc::new(RecordingProjection::new("Drivers")))
        .unwrap();
    daemon.start().await.unwrap();

    let started = Instant::now();
    timeout(Duration::from_secs(2), daemon.shutdown())
        .await
        .expect("shutdown should not wait out the polling interval");

    assert!(started.elapsed() < Duration::from_secs(2));
    assert_eq!(daemon.state(), DaemonState::Stopped);
}

/// Test: shutdown while a shard is paused does not wait for the pause.
#[tokio::test]
async fn shutdown_during_pause() {
    let log = log_with(&[1, 2, 3]).await;
    let trips = Arc::new(RecordingProjection::new("Trips"));
    trips.fail_always(2, timeout_error());

    let mut daemon = ProjectionDaemon::new(fast_config(), Arc::clone(&log));
    daemon.add_projection(trips.clone()).unwrap();
    daemon
        .exception_policy_mut()
        .unwrap()
        .on(ErrorCategory::ApplyEvent)
        .and_inner(ErrorCategory::Timeout)
        .pause(Duration::from_secs(60));
    daemon.start().await.unwrap();

    let shard = ShardName::all("Trips");
    assert!(wait_for(|| matches!(daemon.shard_status(&shard), Ok(ShardStatus::Paused))).await);

    timeout(Duration::from_secs(2), daemon.shutdown())
        .await
        .expect("shutdown should interrupt the pause");
    assert_eq!(trips.applied(), vec![1]);
}

/// Test: shutting down twice, or before start, is harmless.
#[tokio::test]
async fn shutdown_is_idempotent() {
    let log = Arc::new(InMemoryEventLog::new());
    let mut daemon = ProjectionDaemon::new(fast_config(), Arc::clone(&log));
    daemon.shutdown().await;
    assert_eq!(daemon.state(), DaemonState::Stopped);
    daemon.shutdown().await;
    assert_eq!(daemon.state(), DaemonState::Stopped);
    assert!(daemon.start().await.is_err());
}

// =============================================================================
// Concurrency
// =============================================================================

/// Test: many writers committing out of order still reach the shard in
/// sequence order.
#[tokio::test]
async fn concurrent_writers_apply_in_order() {
    let log = Arc::new(InMemoryEventLog::new());
    let trips = Arc::new(RecordingProjection::new("Trips"));

    let mut daemon = ProjectionDaemon::new(fast_config(), Arc::clone(&log));
    daemon.add_projection(trips.clone()).unwrap();
    daemon.start().await.unwrap();

    let mut writers = Vec::new();
    for _ in 0..8 {
        let log = Arc::clone(&log);
        writers.push(tokio::spawn(async move {
            for _ in 0..10 {
                let position = log.reserve().await;
                tokio::task::yield_now().await;
                log.commit(position, "TripRecorded", b"").await;
            }
        }));
    }
    for writer in writers {
        writer.await.unwrap();
    }

    assert!(wait_for(|| trips.applied().len() == 80).await);
    let applied = trips.applied();
    assert!(applied.windows(2).all(|w| w[0] < w[1]), "shard must apply in order");
    assert_eq!(applied.first(), Some(&1));
    assert_eq!(applied.last(), Some(&80));

    daemon.shutdown().await;
}
