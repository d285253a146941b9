// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Fan-out of the high water mark to projection shards.
//!
//! Delivery is last-value: a slow subscriber may skip intermediate marks but
//! always observes the latest one, and the values it sees never decrease.
//!
//! Shard lifecycle changes (started, paused, stopped, ...) are published on a
//! separate broadcast channel for operational tooling.

use crate::types::{SequencePosition, ShardName};
use futures::Stream;
use serde::{Deserialize, Serialize};
use std::fmt;
use tokio::sync::{broadcast, watch};
use tracing::{debug, trace};

/// Capacity of the shard state broadcast channel.
const STATE_CHANNEL_CAPACITY: usize = 256;

/// What happened to a shard.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ShardAction {
    Started,
    Updated,
    Paused,
    Resumed,
    Skipped,
    Stopped,
}

impl fmt::Display for ShardAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ShardAction::Started => "Started",
            ShardAction::Updated => "Updated",
            ShardAction::Paused => "Paused",
            ShardAction::Resumed => "Resumed",
            ShardAction::Skipped => "Skipped",
            ShardAction::Stopped => "Stopped",
        };
        write!(f, "{}", s)
    }
}

/// A shard lifecycle event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShardState {
    pub shard: String,
    pub sequence: SequencePosition,
    pub action: ShardAction,
}

impl ShardState {
    pub fn new(shard: &ShardName, sequence: SequencePosition, action: ShardAction) -> Self {
        Self {
            shard: shard.identity(),
            sequence,
            action,
        }
    }
}

/// Publishes the high water mark and shard lifecycle events.
pub struct ShardStateTracker {
    high_water_tx: watch::Sender<SequencePosition>,
    states_tx: broadcast::Sender<ShardState>,
}

impl Default for ShardStateTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl ShardStateTracker {
    pub fn new() -> Self {
        let (high_water_tx, _) = watch::channel(0);
        let (states_tx, _) = broadcast::channel(STATE_CHANNEL_CAPACITY);
        Self {
            high_water_tx,
            states_tx,
        }
    }

    /// Publish a new high water mark.
    ///
    /// Values lower than or equal to the current mark are ignored. Returns
    /// whether subscribers were notified.
    pub fn mark_high_water(&self, position: SequencePosition) -> bool {
        let advanced = self.high_water_tx.send_if_modified(|current| {
            if position > *current {
                *current = position;
                true
            } else {
                false
            }
        });
        if advanced {
            trace!(position, "High water mark published");
        }
        advanced
    }

    /// The latest published mark.
    pub fn high_water_mark(&self) -> SequencePosition {
        *self.high_water_tx.borrow()
    }

    /// Subscribe a shard to high water mark changes.
    pub fn subscribe(&self, shard: &ShardName) -> HighWaterSubscription {
        debug!(shard = %shard, "Shard subscribed to high water mark");
        HighWaterSubscription {
            shard: shard.clone(),
            rx: self.high_water_tx.subscribe(),
        }
    }

    /// Publish a shard lifecycle event. Dropped if nobody listens.
    pub fn publish(&self, state: ShardState) {
        trace!(shard = %state.shard, sequence = state.sequence, action = %state.action, "Shard state");
        let _ = self.states_tx.send(state);
    }

    /// Receive shard lifecycle events published from now on.
    pub fn subscribe_states(&self) -> broadcast::Receiver<ShardState> {
        self.states_tx.subscribe()
    }

    /// Number of live high water subscriptions.
    pub fn subscriber_count(&self) -> usize {
        self.high_water_tx.receiver_count()
    }
}

/// A shard's view of the high water mark.
pub struct HighWaterSubscription {
    shard: ShardName,
    rx: watch::Receiver<SequencePosition>,
}

impl HighWaterSubscription {
    pub fn shard(&self) -> &ShardName {
        &self.shard
    }

    /// The latest mark, marking it as seen.
    pub fn current(&mut self) -> SequencePosition {
        *self.rx.borrow_and_update()
    }

    /// Wait for a mark newer than the last one seen.
    ///
    /// Returns `None` once the tracker is gone.
    pub async fn changed(&mut self) -> Option<SequencePosition> {
        self.rx.changed().await.ok()?;
        Some(*self.rx.borrow_and_update())
    }

    /// Turn the subscription into a stream of marks, starting with the
    /// current one.
    pub fn into_stream(self) -> impl Stream<Item = SequencePosition> {
        futures::stream::unfold((self, true), |(mut sub, first)| async move {
            let next = if first {
                Some(sub.current())
            } else {
                sub.changed().await
            };
            next.map(|position| (position, (sub, false)))
        })
    }
}
