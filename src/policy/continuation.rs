//! Recovery actions for a failed shard.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// What a shard does after an apply failure.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Continuation {
    /// Stop consuming for the delay, then resume from committed progress.
    PauseShard(Duration),
    /// Pause every shard of the daemon.
    PauseAllShards(Duration),
    /// Stop this shard until the daemon restarts.
    StopShard,
    /// Stop every shard.
    StopAllShards,
    /// Wait, then re-attempt from the failed event.
    RetryLater(Duration),
    /// Drop the offending event and continue with the next one.
    SkipEvent,
    /// Ignore the failure and continue.
    DoNothing,
}

impl Continuation {
    /// Label used in logs and metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            Continuation::PauseShard(_) => "pause_shard",
            Continuation::PauseAllShards(_) => "pause_all_shards",
            Continuation::StopShard => "stop_shard",
            Continuation::StopAllShards => "stop_all_shards",
            Continuation::RetryLater(_) => "retry_later",
            Continuation::SkipEvent => "skip_event",
            Continuation::DoNothing => "do_nothing",
        }
    }

    /// True for actions that affect every shard of the daemon.
    pub fn is_daemon_wide(&self) -> bool {
        matches!(self, Continuation::PauseAllShards(_) | Continuation::StopAllShards)
    }
}

impl fmt::Display for Continuation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Continuation::PauseShard(d) => write!(f, "PauseShard({:?})", d),
            Continuation::PauseAllShards(d) => write!(f, "PauseAllShards({:?})", d),
            Continuation::StopShard => write!(f, "StopShard"),
            Continuation::StopAllShards => write!(f, "StopAllShards"),
            Continuation::RetryLater(d) => write!(f, "RetryLater({:?})", d),
            Continuation::SkipEvent => write!(f, "SkipEvent"),
            Continuation::DoNothing => write!(f, "DoNothing"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_labels() {
        assert_eq!(Continuation::SkipEvent.kind(), "skip_event");
        assert_eq!(Continuation::RetryLater(Duration::from_secs(1)).kind(), "retry_later");
    }

    #[test]
    fn test_daemon_wide() {
        assert!(Continuation::StopAllShards.is_daemon_wide());
        assert!(Continuation::PauseAllShards(Duration::from_secs(1)).is_daemon_wide());
        assert!(!Continuation::StopShard.is_daemon_wide());
    }

    #[test]
    fn test_display() {
        assert_eq!(
            Continuation::PauseShard(Duration::from_millis(500)).to_string(),
            "PauseShard(500ms)"
        );
        assert_eq!(Continuation::DoNothing.to_string(), "DoNothing");
    }
}
