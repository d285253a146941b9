//! Metrics for observability.
//!
//! Exports Prometheus-compatible metrics for:
//! - High water mark position, detection outcomes and latency
//! - Agent liveness and restarts
//! - Shard progress, lag and recovery decisions
//! - Retry block attempts and exhaustion
//! - Event log busy retries
//!
//! # Metric Naming Convention
//!
//! All metrics are prefixed with `projection_` and follow Prometheus conventions:
//! - Counters end in `_total`
//! - Gauges represent current state
//! - Histograms track distributions (duration, size)
//!
//! # Usage
//!
//! ```rust,no_run
//! use projection_progress::metrics;
//! use std::time::Duration;
//!
//! metrics::set_high_water_mark(42, 45);
//! metrics::record_events_applied("Trips:All", 10, Duration::from_millis(3));
//! ```

use crate::high_water::HighWaterStatus;
use crate::types::SequencePosition;
use metrics::{counter, gauge, histogram};
use std::time::Duration;

// =============================================================================
// High Water Metrics
// =============================================================================

/// Set the published high water mark and highest assigned position.
pub fn set_high_water_mark(mark: SequencePosition, highest: SequencePosition) {
    gauge!("projection_high_water_mark").set(mark as f64);
    gauge!("projection_highest_sequence").set(highest as f64);
    gauge!("projection_high_water_lag_events").set((highest - mark).max(0) as f64);
}

/// Record the status of one detection pass.
pub fn record_detection(status: HighWaterStatus) {
    counter!("projection_detections_total", "status" => status.as_str()).increment(1);
}

/// Record a failed detection pass.
pub fn record_detection_error(error_type: &str) {
    counter!("projection_detection_errors_total", "error_type" => error_type.to_string()).increment(1);
}

/// Record detection latency by operation (`detect`, `detect_in_safe_zone`).
pub fn record_detection_latency(operation: &str, duration: Duration) {
    histogram!("projection_detection_duration_seconds", "operation" => operation.to_string())
        .record(duration.as_secs_f64());
}

/// Record a stale mark that triggered a safe-zone rescan.
pub fn record_stale_recheck() {
    counter!("projection_stale_rechecks_total").increment(1);
}

/// Record a heartbeat restart of the detection loop.
pub fn record_agent_restart() {
    counter!("projection_agent_restarts_total").increment(1);
}

/// Gauge for agent liveness (1 = running).
pub fn set_agent_running(running: bool) {
    gauge!("projection_agent_running").set(if running { 1.0 } else { 0.0 });
}

// =============================================================================
// Daemon & Shard Metrics
// =============================================================================

/// Gauge for daemon state.
pub fn set_daemon_state(state: &str) {
    let value = match state {
        "Created" => 0.0,
        "Starting" => 1.0,
        "Running" => 2.0,
        "ShuttingDown" => 3.0,
        "Stopped" => 4.0,
        "Failed" => 5.0,
        _ => -1.0,
    };
    gauge!("projection_daemon_state").set(value);
}

/// Gauge for shard status (0 = running, 1 = paused, 2 = stopped).
pub fn set_shard_status(shard: &str, status: &str) {
    let value = match status {
        "Running" => 0.0,
        "Paused" => 1.0,
        "Stopped" => 2.0,
        _ => -1.0,
    };
    gauge!("projection_shard_status", "shard" => shard.to_string()).set(value);
}

/// Set a shard's committed position and its lag behind the high water mark.
pub fn set_shard_progress(shard: &str, position: SequencePosition, high_water: SequencePosition) {
    gauge!("projection_shard_position", "shard" => shard.to_string()).set(position as f64);
    gauge!("projection_shard_lag_events", "shard" => shard.to_string())
        .set((high_water - position).max(0) as f64);
}

/// Record events applied by a shard in one batch.
pub fn record_events_applied(shard: &str, count: usize, duration: Duration) {
    counter!("projection_events_applied_total", "shard" => shard.to_string()).increment(count as u64);
    histogram!("projection_batch_duration_seconds", "shard" => shard.to_string())
        .record(duration.as_secs_f64());
}

/// Record a poison event skipped by policy.
pub fn record_event_skipped(shard: &str) {
    counter!("projection_events_skipped_total", "shard" => shard.to_string()).increment(1);
}

/// Record a continuation chosen by the exception policy.
pub fn record_continuation(shard: &str, kind: &str) {
    counter!(
        "projection_continuations_total",
        "shard" => shard.to_string(),
        "continuation" => kind.to_string()
    )
    .increment(1);
}

// =============================================================================
// Retry Block Metrics
// =============================================================================

/// Record one retry block attempt.
pub fn record_retry_attempt(block: &str, success: bool) {
    let status = if success { "success" } else { "failure" };
    counter!("projection_retry_attempts_total", "block" => block.to_string(), "status" => status).increment(1);
}

/// Record an item discarded after exhausting its attempts.
pub fn record_retry_exhausted(block: &str) {
    counter!("projection_retry_exhausted_total", "block" => block.to_string()).increment(1);
}

// =============================================================================
// Store Metrics
// =============================================================================

/// Record event log SQLite retry (for SQLITE_BUSY/SQLITE_LOCKED).
pub fn record_store_retry(operation: &str) {
    counter!("projection_store_retries_total", "operation" => operation.to_string()).increment(1);
}
