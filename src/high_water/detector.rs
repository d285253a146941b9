// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! One detection pass: load statistics, find the mark, persist it.
//!
//! The detector performs no retries. Every data-access failure goes back to
//! the caller, and the agent decides when to try again.

use super::{GapDetector, HighWaterStatistics, SafeSequenceFinder, StatisticsSource};
use crate::error::Result;
use crate::metrics;
use crate::store::EventLog;
use crate::types::ShardName;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, instrument};

/// Computes and persists the high water mark.
pub struct HighWaterDetector<L: EventLog> {
    log: Arc<L>,
    statistics: StatisticsSource<L>,
    gaps: GapDetector<L>,
    safe_sequences: SafeSequenceFinder<L>,
    shard: ShardName,
}

impl<L: EventLog> HighWaterDetector<L> {
    pub fn new(log: Arc<L>) -> Self {
        let shard = ShardName::high_water();
        Self {
            statistics: StatisticsSource::for_shard(Arc::clone(&log), shard.clone()),
            gaps: GapDetector::new(Arc::clone(&log)),
            safe_sequences: SafeSequenceFinder::new(Arc::clone(&log)),
            log,
            shard,
        }
    }

    /// Detect the mark, scanning from the last persisted mark.
    #[instrument(skip(self), level = "debug")]
    pub async fn detect(&self) -> Result<HighWaterStatistics> {
        let started = Instant::now();
        let statistics = self.statistics.load().await?;
        let result = self.calculate(statistics).await;
        metrics::record_detection_latency("detect", started.elapsed());
        result
    }

    /// Detect the mark, scanning from the first position committed at or
    /// after `safe_timestamp` when there is one.
    #[instrument(skip(self), level = "debug")]
    pub async fn detect_in_safe_zone(
        &self,
        safe_timestamp: DateTime<Utc>,
    ) -> Result<HighWaterStatistics> {
        let started = Instant::now();
        let mut statistics = self.statistics.load().await?;

        if let Some(safe_start) = self
            .safe_sequences
            .find_min_sequence_at_or_after(safe_timestamp)
            .await?
        {
            // A late commit below the persisted mark must not pull it back.
            let safe_start = safe_start.max(statistics.last_mark);
            debug!(safe_start, last_mark = statistics.last_mark, "Narrowed scan to safe zone");
            statistics.safe_start_mark = safe_start;
        }

        let result = self.calculate(statistics).await;
        metrics::record_detection_latency("detect_in_safe_zone", started.elapsed());
        result
    }

    async fn calculate(&self, mut statistics: HighWaterStatistics) -> Result<HighWaterStatistics> {
        if statistics.last_mark == statistics.highest_sequence {
            statistics.current_mark = statistics.last_mark;
        } else if statistics.highest_sequence == 0 {
            statistics.current_mark = 0;
            statistics.last_mark = 0;
        } else {
            match self.gaps.find_gap(statistics.safe_start_mark).await? {
                Some(mark) => statistics.current_mark = mark,
                // Restart recovery: nothing found past the persisted mark.
                None if statistics.current_mark == 0 && statistics.last_mark > 0 => {
                    statistics.current_mark = statistics.last_mark;
                }
                None => {}
            }
        }

        if statistics.has_changed() {
            statistics.last_updated = self
                .log
                .persist_mark(&self.shard, statistics.current_mark)
                .await?;
            debug!(
                from = statistics.last_mark,
                to = statistics.current_mark,
                highest = statistics.highest_sequence,
                "High water mark advanced"
            );
        }

        Ok(statistics)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::high_water::HighWaterStatus;
    use crate::store::InMemoryEventLog;

    async fn log_with(positions: &[i64]) -> Arc<InMemoryEventLog> {
        let log = Arc::new(InMemoryEventLog::new());
        for &p in positions {
            log.commit(p, "E", b"").await;
        }
        log
    }

    #[tokio::test]
    async fn test_empty_log() {
        let detector = HighWaterDetector::new(Arc::new(InMemoryEventLog::new()));
        let stats = detector.detect().await.unwrap();
        assert_eq!(stats.current_mark, 0);
        assert_eq!(stats.highest_sequence, 0);
        assert!(!stats.has_changed());
    }

    #[tokio::test]
    async fn test_contiguous_log_advances_to_max() {
        let log = log_with(&[1, 2, 3]).await;
        let detector = HighWaterDetector::new(Arc::clone(&log));

        let stats = detector.detect().await.unwrap();
        assert_eq!(stats.current_mark, 3);
        assert!(stats.has_changed());
        assert!(stats.last_updated.is_some());

        let (mark, _) = log.last_persisted_mark(&ShardName::high_water()).await.unwrap();
        assert_eq!(mark, 3);
    }

    #[tokio::test]
    async fn test_stops_at_first_gap() {
        let log = log_with(&[1, 2, 3, 5, 6]).await;
        let detector = HighWaterDetector::new(Arc::clone(&log));

        assert_eq!(detector.detect().await.unwrap().current_mark, 3);

        let again = detector.detect().await.unwrap();
        assert_eq!(again.last_mark, 3);
        assert_eq!(again.current_mark, 3);
        assert!(!again.has_changed());
    }

    #[tokio::test]
    async fn test_fast_path_when_mark_equals_highest() {
        let log = log_with(&[1, 2]).await;
        let detector = HighWaterDetector::new(Arc::clone(&log));
        detector.detect().await.unwrap();

        let calls = log.call_count();
        let stats = detector.detect().await.unwrap();
        assert_eq!(stats.current_mark, 2);
        // statistics only, no gap scan
        assert_eq!(log.call_count(), calls + 1);
    }

    #[tokio::test]
    async fn test_restart_recovery_keeps_last_mark() {
        // Persisted mark 4, but nothing is committed at or after it.
        let log = Arc::new(InMemoryEventLog::new());
        log.set_highest(6).await;
        log.persist_mark(&ShardName::high_water(), 4).await.unwrap();

        let stats = HighWaterDetector::new(Arc::clone(&log)).detect().await.unwrap();
        assert_eq!(stats.current_mark, 4);
        assert!(!stats.has_changed());
    }

    #[tokio::test]
    async fn test_safe_zone_skips_old_gap() {
        let log = Arc::new(InMemoryEventLog::new());
        let t0 = Utc::now() - chrono::Duration::seconds(60);
        log.commit_at(1, "E", b"", t0).await;
        log.commit_at(2, "E", b"", t0).await;
        log.commit_at(4, "E", b"", t0 + chrono::Duration::seconds(30)).await;
        log.commit_at(5, "E", b"", t0 + chrono::Duration::seconds(30)).await;

        let detector = HighWaterDetector::new(Arc::clone(&log));
        assert_eq!(detector.detect().await.unwrap().current_mark, 2);

        let harbor = t0 + chrono::Duration::seconds(10);
        let stats = detector.detect_in_safe_zone(harbor).await.unwrap();
        assert_eq!(stats.safe_start_mark, 4);
        assert_eq!(stats.current_mark, 5);
        assert!(stats.has_changed());
    }

    #[tokio::test]
    async fn test_safe_zone_without_newer_commits_scans_from_last_mark() {
        let log = log_with(&[1, 2, 4]).await;
        let detector = HighWaterDetector::new(Arc::clone(&log));
        detector.detect().await.unwrap();

        let future = Utc::now() + chrono::Duration::hours(1);
        let stats = detector.detect_in_safe_zone(future).await.unwrap();
        assert_eq!(stats.safe_start_mark, 2);
        assert_eq!(stats.current_mark, 2);
    }

    #[tokio::test]
    async fn test_safe_zone_never_moves_below_last_mark() {
        let log = Arc::new(InMemoryEventLog::new());
        let t0 = Utc::now() - chrono::Duration::seconds(60);
        log.commit_at(1, "E", b"", t0).await;
        log.commit_at(3, "E", b"", t0).await;
        log.commit_at(5, "E", b"", t0).await;
        log.set_highest(6).await;
        log.persist_mark(&ShardName::high_water(), 5).await.unwrap();

        // 2 shows up long after the mark already moved past it
        log.commit_at(2, "E", b"", t0 + chrono::Duration::seconds(30)).await;

        let detector = HighWaterDetector::new(Arc::clone(&log));
        let harbor = t0 + chrono::Duration::seconds(10);
        let stats = detector.detect_in_safe_zone(harbor).await.unwrap();
        assert_eq!(stats.safe_start_mark, 5);
        assert_eq!(stats.current_mark, 5);
        assert!(!stats.has_changed());

        let next = detector.detect().await.unwrap();
        assert_eq!(next.interpret_status(&stats), HighWaterStatus::Stale);
    }

    #[tokio::test]
    async fn test_errors_propagate() {
        let log = log_with(&[1]).await;
        log.fail_next(1);
        let detector = HighWaterDetector::new(log);
        assert!(detector.detect().await.is_err());
        assert!(detector.detect().await.is_ok());
    }
}
