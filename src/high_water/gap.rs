// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Gap detection and safe-zone lookup.
//!
//! ```text
//! committed:  1 2 3 _ 5 6 _ 8
//!                 ^
//!                 find_gap(1) = 3   (first hole wins; the hole at 7 is
//!                                    invisible until 4 is resolved)
//! ```

use crate::error::Result;
use crate::store::EventLog;
use crate::types::SequencePosition;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use tracing::trace;

/// Finds the first hole in the committed sequence.
pub struct GapDetector<L: EventLog> {
    log: Arc<L>,
}

impl<L: EventLog> GapDetector<L> {
    pub fn new(log: Arc<L>) -> Self {
        Self { log }
    }

    /// First committed position `>= start` followed by a hole.
    ///
    /// Without a hole this is the maximum committed position `>= start`,
    /// and `None` when nothing is committed at or after `start`.
    pub async fn find_gap(&self, start: SequencePosition) -> Result<Option<SequencePosition>> {
        if let Some(gap) = self.log.find_first_gap_at_or_after(start).await? {
            trace!(start, gap, "Found gap");
            return Ok(Some(gap));
        }
        self.log.find_max_committed_at_or_after(start).await
    }
}

/// Maps a wall-clock time to the earliest position committed at or after it.
pub struct SafeSequenceFinder<L: EventLog> {
    log: Arc<L>,
}

impl<L: EventLog> SafeSequenceFinder<L> {
    pub fn new(log: Arc<L>) -> Self {
        Self { log }
    }

    pub async fn find_min_sequence_at_or_after(
        &self,
        timestamp: DateTime<Utc>,
    ) -> Result<Option<SequencePosition>> {
        self.log.find_earliest_committed_at_or_after(timestamp).await
    }
}
