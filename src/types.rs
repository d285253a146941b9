// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Core value types shared by the store, detector and daemon.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Position assigned by the event log at append time.
///
/// Non-decreasing, but the set of *committed* positions may contain gaps.
pub type SequencePosition = i64;

/// Identity of the distinguished high water cursor.
pub const HIGH_WATER_MARK: &str = "HighWaterMark";

/// Key used for shards that consume the whole event sequence.
pub const ALL_PARTITIONS: &str = "All";

/// Stable identity of a progress cursor.
///
/// Either a projection shard (`"Projection:Key"`) or the distinguished
/// [`HIGH_WATER_MARK`] cursor.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ShardName {
    projection: String,
    key: String,
}

impl ShardName {
    /// Create a shard name for a projection partition.
    pub fn new(projection: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            projection: projection.into(),
            key: key.into(),
        }
    }

    /// Shard consuming every event of `projection`.
    pub fn all(projection: impl Into<String>) -> Self {
        Self::new(projection, ALL_PARTITIONS)
    }

    /// The high water mark cursor.
    pub fn high_water() -> Self {
        Self::new(HIGH_WATER_MARK, "")
    }

    pub fn is_high_water(&self) -> bool {
        self.projection == HIGH_WATER_MARK && self.key.is_empty()
    }

    pub fn projection(&self) -> &str {
        &self.projection
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    /// The string stored in the progress table.
    pub fn identity(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for ShardName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.key.is_empty() {
            write!(f, "{}", self.projection)
        } else {
            write!(f, "{}:{}", self.projection, self.key)
        }
    }
}

impl FromStr for ShardName {
    type Err = crate::error::ProgressError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.is_empty() {
            return Err(crate::error::ProgressError::Config(
                "shard name cannot be empty".to_string(),
            ));
        }
        match s.split_once(':') {
            Some((projection, key)) if !projection.is_empty() => Ok(Self::new(projection, key)),
            Some(_) => Err(crate::error::ProgressError::Config(format!(
                "shard name '{}' has no projection",
                s
            ))),
            None => Ok(Self::new(s, "")),
        }
    }
}

/// Durable progress of one shard.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShardProgress {
    /// Shard identity as stored (`"Projection:Key"` or `"HighWaterMark"`).
    pub shard: String,
    /// Last position durably recorded for the shard.
    pub sequence: SequencePosition,
    /// When the row was last written, if the store tracks it.
    pub last_updated: Option<DateTime<Utc>>,
}

/// A committed event as handed to projections.
///
/// The payload format belongs to the event store; the engine treats it as
/// opaque bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventRecord {
    pub sequence: SequencePosition,
    pub event_type: String,
    pub data: Vec<u8>,
    pub timestamp: DateTime<Utc>,
}
