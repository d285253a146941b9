//! Shared test utilities for scenario and chaos tests.
//!
//! This module provides:
//! - A recording projection with scripted failures
//! - An event log wrapper that fails or panics on demand
//! - Polling helpers

#![allow(dead_code)]

pub mod logs;
pub mod projections;

pub use logs::*;
pub use projections::*;

use projection_progress::config::DaemonConfig;
use projection_progress::store::InMemoryEventLog;
use projection_progress::SequencePosition;
use std::sync::Arc;
use std::time::Duration;

/// Poll `check` every 5ms for up to 2s.
pub async fn wait_for(mut check: impl FnMut() -> bool) -> bool {
    for _ in 0..400 {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    false
}

/// An in-memory log with `positions` committed now.
pub async fn log_with(positions: &[SequencePosition]) -> Arc<InMemoryEventLog> {
    let log = Arc::new(InMemoryEventLog::new());
    for &position in positions {
        log.commit(position, "TripRecorded", position.to_string().as_bytes())
            .await;
    }
    log
}

/// Daemon config with short polling intervals.
pub fn fast_config() -> DaemonConfig {
    DaemonConfig::for_testing()
}
