//! Read-only statistics over the event log.

use super::HighWaterStatistics;
use crate::error::Result;
use crate::store::EventLog;
use crate::types::ShardName;
use std::sync::Arc;

/// Loads the raw inputs of a detection pass for one shard.
pub struct StatisticsSource<L: EventLog> {
    log: Arc<L>,
    shard: ShardName,
}

impl<L: EventLog> StatisticsSource<L> {
    /// Statistics for the high water mark cursor.
    pub fn new(log: Arc<L>) -> Self {
        Self::for_shard(log, ShardName::high_water())
    }

    pub fn for_shard(log: Arc<L>, shard: ShardName) -> Self {
        Self { log, shard }
    }

    pub fn shard(&self) -> &ShardName {
        &self.shard
    }

    /// Read highest position, last mark and database time in one round trip.
    ///
    /// The returned snapshot has `current_mark = 0` and
    /// `safe_start_mark = last_mark`; the detector fills in the rest.
    pub async fn load(&self) -> Result<HighWaterStatistics> {
        let raw = self.log.fetch_statistics(&self.shard).await?;
        Ok(HighWaterStatistics {
            last_mark: raw.last_mark,
            highest_sequence: raw.highest_sequence,
            current_mark: 0,
            safe_start_mark: raw.last_mark,
            timestamp: raw.timestamp,
            last_updated: raw.last_updated,
        })
    }
}
