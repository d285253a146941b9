// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! High water mark detection.
//!
//! The high water mark is the highest position `P` such that every position
//! `<= P` is either committed or permanently abandoned. Projections never
//! read past it.
//!
//! # Components
//!
//! ```text
//! HighWaterAgent ──polls──→ HighWaterDetector
//!       │                      ├── StatisticsSource   (highest, last mark, db time)
//!       │                      ├── GapDetector        (first hole at/after start)
//!       │                      └── SafeSequenceFinder (first position at/after time)
//!       └──publishes──→ ShardStateTracker
//! ```
//!
//! # Status
//!
//! Each poll is classified against the previous one:
//!
//! | Condition | Status |
//! |-----------|--------|
//! | `highest == 1 && current == 0` | `CaughtUp` (empty log) |
//! | `current == highest` | `CaughtUp` |
//! | `current > previous.current` | `Changed` |
//! | otherwise | `Stale` (a gap is holding the mark back) |

pub mod agent;
pub mod detector;
pub mod gap;
pub mod statistics;

pub use agent::HighWaterAgent;
pub use detector::HighWaterDetector;
pub use gap::{GapDetector, SafeSequenceFinder};
pub use statistics::StatisticsSource;

use crate::types::SequencePosition;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Snapshot produced by one detection pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct HighWaterStatistics {
    /// Mark durably persisted before this pass.
    pub last_mark: SequencePosition,
    /// Highest position ever assigned (committed or not).
    pub highest_sequence: SequencePosition,
    /// Mark computed by this pass.
    pub current_mark: SequencePosition,
    /// Lower bound the gap scan started from.
    pub safe_start_mark: SequencePosition,
    /// Database time at which the statistics were read.
    pub timestamp: DateTime<Utc>,
    /// When the persisted mark was last written.
    pub last_updated: Option<DateTime<Utc>>,
}

impl HighWaterStatistics {
    /// Statistics of an empty log read at `timestamp`.
    pub fn empty(timestamp: DateTime<Utc>) -> Self {
        Self {
            last_mark: 0,
            highest_sequence: 0,
            current_mark: 0,
            safe_start_mark: 0,
            timestamp,
            last_updated: None,
        }
    }

    /// True when this pass moved the mark past the persisted one.
    pub fn has_changed(&self) -> bool {
        self.current_mark > self.last_mark
    }

    /// Positions assigned but not yet safe to read.
    pub fn lag(&self) -> i64 {
        (self.highest_sequence - self.current_mark).max(0)
    }

    /// Classify this pass relative to the previous one.
    pub fn interpret_status(&self, previous: &HighWaterStatistics) -> HighWaterStatus {
        // Sequence generators that start at 1 report it before anything commits.
        if self.highest_sequence == 1 && self.current_mark == 0 {
            return HighWaterStatus::CaughtUp;
        }

        if self.current_mark == self.highest_sequence {
            return HighWaterStatus::CaughtUp;
        }

        if self.current_mark > previous.current_mark {
            return HighWaterStatus::Changed;
        }

        HighWaterStatus::Stale
    }
}

/// Outcome of comparing two consecutive detection passes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum HighWaterStatus {
    /// The mark equals the highest assigned position.
    CaughtUp,
    /// The mark advanced since the previous pass.
    Changed,
    /// The mark is behind the highest position and did not move.
    Stale,
}

impl HighWaterStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            HighWaterStatus::CaughtUp => "caught_up",
            HighWaterStatus::Changed => "changed",
            HighWaterStatus::Stale => "stale",
        }
    }
}

impl fmt::Display for HighWaterStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HighWaterStatus::CaughtUp => write!(f, "CaughtUp"),
            HighWaterStatus::Changed => write!(f, "Changed"),
            HighWaterStatus::Stale => write!(f, "Stale"),
        }
    }
}
