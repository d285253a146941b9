// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Configuration for the projection daemon.
//!
//! Configuration is passed to
//! [`ProjectionDaemon::new()`](crate::ProjectionDaemon::new) and can be
//! constructed programmatically or deserialized from YAML/JSON.
//!
//! # Quick Start
//!
//! ```rust
//! use projection_progress::config::{DaemonConfig, HighWaterConfig};
//!
//! let mut config = DaemonConfig::default();
//! config.settings.high_water = HighWaterConfig {
//!     fast_polling_time: "100ms".into(),
//!     ..Default::default()
//! };
//! ```
//!
//! # Configuration Structure
//!
//! ```text
//! DaemonConfig
//! ├── settings: DaemonSettings
//! │   ├── high_water: HighWaterConfig   # polling cadence, leading edge buffer
//! │   ├── retry: RetryBlockConfig       # attempts, backoff schedule, concurrency
//! │   └── shards: ShardConfig           # batch size per fetch
//! └── store: StoreConfig                # SQLite event log
//! ```
//!
//! # YAML Example
//!
//! ```yaml
//! settings:
//!   high_water:
//!     fast_polling_time: "250ms"
//!     slow_polling_time: "1s"
//!     health_check_polling_time: "5s"
//!     leading_edge_buffer: "1s"
//!   retry:
//!     maximum_attempts: 3
//!     backoff: ["50ms", "100ms", "250ms"]
//!
//! store:
//!   sqlite_path: "/var/lib/app/events.db"
//! ```

use serde::{Deserialize, Serialize};
use std::time::Duration;

// ═══════════════════════════════════════════════════════════════════════════════
// Top-level config
// ═══════════════════════════════════════════════════════════════════════════════

/// The top-level config object passed to `ProjectionDaemon::new()`.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct DaemonConfig {
    /// Polling, retry and shard settings.
    #[serde(default)]
    pub settings: DaemonSettings,

    /// Event log persistence settings.
    #[serde(default)]
    pub store: StoreConfig,
}

impl DaemonConfig {
    /// Create a config with short intervals for testing.
    pub fn for_testing() -> Self {
        Self {
            settings: DaemonSettings {
                high_water: HighWaterConfig::for_testing(),
                retry: RetryBlockConfig::for_testing(),
                shards: ShardConfig::default(),
            },
            store: StoreConfig::in_memory(),
        }
    }
}

/// General settings for detection, retries and shards.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct DaemonSettings {
    #[serde(default)]
    pub high_water: HighWaterConfig,
    #[serde(default)]
    pub retry: RetryBlockConfig,
    #[serde(default)]
    pub shards: ShardConfig,
}

fn parse_or(value: &str, fallback: Duration) -> Duration {
    humantime::parse_duration(value).unwrap_or(fallback)
}

// ═══════════════════════════════════════════════════════════════════════════════
// HighWaterConfig: polling cadence
// ═══════════════════════════════════════════════════════════════════════════════

/// High water agent polling configuration.
///
/// Durations are strings (e.g. `"250ms"`, `"5s"`) parsed with `humantime`;
/// unparseable values fall back to the defaults.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HighWaterConfig {
    /// Delay after a poll that moved the mark (more work is likely imminent).
    #[serde(default = "default_fast_polling_time")]
    pub fast_polling_time: String,

    /// Delay after a poll that found the log quiescent, and after a failed poll.
    #[serde(default = "default_slow_polling_time")]
    pub slow_polling_time: String,

    /// How often the heartbeat checks whether the detection loop died.
    #[serde(default = "default_health_check_polling_time")]
    pub health_check_polling_time: String,

    /// Time given to in-flight transactions to commit or abort before a
    /// stale gap is treated as permanent.
    #[serde(default = "default_leading_edge_buffer")]
    pub leading_edge_buffer: String,
}

fn default_fast_polling_time() -> String {
    "250ms".to_string()
}

fn default_slow_polling_time() -> String {
    "1s".to_string()
}

fn default_health_check_polling_time() -> String {
    "5s".to_string()
}

fn default_leading_edge_buffer() -> String {
    "1s".to_string()
}

impl Default for HighWaterConfig {
    fn default() -> Self {
        Self {
            fast_polling_time: default_fast_polling_time(),
            slow_polling_time: default_slow_polling_time(),
            health_check_polling_time: default_health_check_polling_time(),
            leading_edge_buffer: default_leading_edge_buffer(),
        }
    }
}

impl HighWaterConfig {
    /// Short intervals so tests observe several polls quickly.
    pub fn for_testing() -> Self {
        Self {
            fast_polling_time: "10ms".to_string(),
            slow_polling_time: "20ms".to_string(),
            health_check_polling_time: "25ms".to_string(),
            leading_edge_buffer: "30ms".to_string(),
        }
    }

    pub fn fast_polling(&self) -> Duration {
        parse_or(&self.fast_polling_time, Duration::from_millis(250))
    }

    pub fn slow_polling(&self) -> Duration {
        parse_or(&self.slow_polling_time, Duration::from_secs(1))
    }

    pub fn health_check_polling(&self) -> Duration {
        parse_or(&self.health_check_polling_time, Duration::from_secs(5))
    }

    pub fn leading_edge(&self) -> Duration {
        parse_or(&self.leading_edge_buffer, Duration::from_secs(1))
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// RetryBlockConfig: bounded retry executor
// ═══════════════════════════════════════════════════════════════════════════════

/// Retry block configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryBlockConfig {
    /// Attempts before an item is discarded.
    #[serde(default = "default_maximum_attempts")]
    pub maximum_attempts: u32,

    /// Delay before each retry, indexed by failed attempt. The last entry
    /// is reused for any further attempt.
    #[serde(default = "default_backoff")]
    pub backoff: Vec<String>,

    /// Items processed concurrently.
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,

    /// Queue capacity before `post()` applies back-pressure.
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
}

fn default_maximum_attempts() -> u32 {
    3
}

fn default_backoff() -> Vec<String> {
    vec!["50ms".to_string(), "100ms".to_string(), "250ms".to_string()]
}

fn default_max_concurrency() -> usize {
    1
}

fn default_queue_capacity() -> usize {
    1000
}

impl Default for RetryBlockConfig {
    fn default() -> Self {
        Self {
            maximum_attempts: default_maximum_attempts(),
            backoff: default_backoff(),
            max_concurrency: default_max_concurrency(),
            queue_capacity: default_queue_capacity(),
        }
    }
}

impl RetryBlockConfig {
    /// Fast backoff for tests.
    pub fn for_testing() -> Self {
        Self {
            maximum_attempts: 3,
            backoff: vec!["1ms".to_string(), "2ms".to_string(), "5ms".to_string()],
            max_concurrency: 2,
            queue_capacity: 64,
        }
    }

    /// Build the backoff schedule from the configured strings.
    ///
    /// Unparseable entries are skipped; an empty result falls back to the
    /// default schedule.
    pub fn schedule(&self) -> crate::resilience::RetrySchedule {
        let delays: Vec<Duration> = self
            .backoff
            .iter()
            .filter_map(|s| humantime::parse_duration(s).ok())
            .collect();
        if delays.is_empty() {
            crate::resilience::RetrySchedule::default()
        } else {
            crate::resilience::RetrySchedule::new(delays)
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// ShardConfig
// ═══════════════════════════════════════════════════════════════════════════════

/// Projection shard settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShardConfig {
    /// Maximum events fetched per batch.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
}

fn default_batch_size() -> usize {
    500
}

impl Default for ShardConfig {
    fn default() -> Self {
        Self {
            batch_size: default_batch_size(),
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// StoreConfig: SQLite event log
// ═══════════════════════════════════════════════════════════════════════════════

/// Event log persistence configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Path to the SQLite database.
    pub sqlite_path: String,

    /// Whether to use WAL mode for SQLite (recommended).
    #[serde(default = "default_true")]
    pub wal_mode: bool,
}

fn default_true() -> bool {
    true
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            sqlite_path: "events.db".to_string(),
            wal_mode: true,
        }
    }
}

impl StoreConfig {
    /// Create an in-memory config for testing.
    pub fn in_memory() -> Self {
        Self {
            sqlite_path: ":memory:".to_string(),
            wal_mode: false,
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════════════════════════
