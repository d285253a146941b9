//! Daemon and shard state types.
//!
//! # Daemon State Transitions
//!
//! ```text
//!                  start()
//! Created ───────────────────→ Starting
//!    │                            │
//!    │ shutdown()                 │ bootstrap detection ok
//!    ↓                            ↓
//! Stopped ←── ShuttingDown ←── Running
//!
//! Starting ── bootstrap detection failed ──→ Failed
//! ```
//!
//! - **Created**: after `ProjectionDaemon::new()`. Projections and policy
//!   rules may still be registered.
//! - **Starting**: bootstrap detection in progress.
//! - **Running**: high water agent polling, shards consuming.
//! - **ShuttingDown**: tasks signalled, retry block draining.
//! - **Stopped**: all tasks joined and the event log closed.
//! - **Failed**: bootstrap detection failed. Check logs.

use crate::types::SequencePosition;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use tokio::time::Instant;

/// State of the projection daemon.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DaemonState {
    Created,
    Starting,
    Running,
    ShuttingDown,
    Stopped,
    Failed,
}

impl fmt::Display for DaemonState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DaemonState::Created => write!(f, "Created"),
            DaemonState::Starting => write!(f, "Starting"),
            DaemonState::Running => write!(f, "Running"),
            DaemonState::ShuttingDown => write!(f, "ShuttingDown"),
            DaemonState::Stopped => write!(f, "Stopped"),
            DaemonState::Failed => write!(f, "Failed"),
        }
    }
}

/// Observable status of one shard.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ShardStatus {
    Running,
    Paused,
    Stopped,
}

impl ShardStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ShardStatus::Running => "Running",
            ShardStatus::Paused => "Paused",
            ShardStatus::Stopped => "Stopped",
        }
    }
}

impl fmt::Display for ShardStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Instruction a shard task reads from its control channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ShardControl {
    Run,
    Pause { until: Instant },
    Stop,
}

impl ShardControl {
    pub(crate) fn pause_for(delay: Duration) -> Self {
        ShardControl::Pause {
            until: Instant::now() + delay,
        }
    }
}

/// Daemon-wide recovery action, fanned out to every shard through the
/// command retry block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DaemonCommand {
    PauseAll(Duration),
    StopAll,
}

impl fmt::Display for DaemonCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DaemonCommand::PauseAll(d) => write!(f, "PauseAll({:?})", d),
            DaemonCommand::StopAll => write!(f, "StopAll"),
        }
    }
}

/// Health of one shard, as reported by
/// [`ProjectionDaemon::health_check()`](super::ProjectionDaemon::health_check).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShardHealth {
    /// Shard identity (`"Projection:Key"`).
    pub shard: String,
    pub status: ShardStatus,
    /// Last position the shard durably recorded.
    pub position: SequencePosition,
    /// Events between the shard's position and the high water mark.
    pub lag: i64,
    /// Consecutive failures since the last successful batch.
    pub failed_attempts: u32,
}

/// Point-in-time health of the daemon.
///
/// Collected from in-memory state only; building it never touches the
/// event log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthCheck {
    pub state: DaemonState,
    /// Running with a live high water agent.
    pub ready: bool,
    /// Ready and no shard has stopped.
    pub healthy: bool,
    pub high_water_mark: SequencePosition,
    /// Highest assigned position at the last detection, if any ran.
    pub highest_sequence: Option<SequencePosition>,
    /// Database time of the last detection.
    pub last_detection: Option<DateTime<Utc>>,
    pub agent_restarts: u64,
    pub shards_running: usize,
    pub shards_paused: usize,
    pub shards_stopped: usize,
    pub shards: Vec<ShardHealth>,
}
