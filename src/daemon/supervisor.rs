// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Shard registry and continuation resolution.
//!
//! The supervisor owns one [`ShardHandle`] per registered shard. A handle
//! carries the shard's control channel (run / pause / stop), its observable
//! status, its committed position and the number of consecutive failures.
//!
//! Failures reported by a shard are resolved against the frozen
//! [`ExceptionPolicy`]. Daemon-wide continuations are posted to a command
//! [`RetryBlock`] which applies them to every handle.

use super::types::{DaemonCommand, ShardControl, ShardStatus};
use crate::config::RetryBlockConfig;
use crate::error::{ProgressError, Result};
use crate::metrics;
use crate::policy::{Continuation, ExceptionPolicy, ShardError};
use crate::retry::RetryBlock;
use crate::types::{SequencePosition, ShardName};
use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// Runtime state of one shard, shared between its task and the daemon.
pub(crate) struct ShardHandle {
    name: ShardName,
    control_tx: watch::Sender<ShardControl>,
    status_tx: watch::Sender<ShardStatus>,
    position: AtomicI64,
    attempts: AtomicU32,
}

impl ShardHandle {
    pub(crate) fn new(name: ShardName) -> Self {
        let (control_tx, _) = watch::channel(ShardControl::Run);
        let (status_tx, _) = watch::channel(ShardStatus::Running);
        Self {
            name,
            control_tx,
            status_tx,
            position: AtomicI64::new(0),
            attempts: AtomicU32::new(0),
        }
    }

    pub(crate) fn name(&self) -> &ShardName {
        &self.name
    }

    pub(crate) fn control(&self) -> watch::Receiver<ShardControl> {
        self.control_tx.subscribe()
    }

    pub(crate) fn pause(&self, delay: Duration) {
        self.control_tx.send_replace(ShardControl::pause_for(delay));
    }

    pub(crate) fn stop(&self) {
        self.control_tx.send_replace(ShardControl::Stop);
    }

    /// Clear a pause once it has elapsed. A newer pause or a stop is kept.
    pub(crate) fn resume_after(&self, elapsed: ShardControl) {
        self.control_tx.send_if_modified(|current| {
            if *current == elapsed {
                *current = ShardControl::Run;
                true
            } else {
                false
            }
        });
    }

    pub(crate) fn status(&self) -> ShardStatus {
        *self.status_tx.borrow()
    }

    pub(crate) fn set_status(&self, status: ShardStatus) {
        self.status_tx.send_replace(status);
        metrics::set_shard_status(&self.name.identity(), status.as_str());
    }

    pub(crate) fn position(&self) -> SequencePosition {
        self.position.load(Ordering::Acquire)
    }

    pub(crate) fn set_position(&self, position: SequencePosition) {
        self.position.store(position, Ordering::Release);
    }

    pub(crate) fn attempts(&self) -> u32 {
        self.attempts.load(Ordering::Relaxed)
    }

    pub(crate) fn reset_attempts(&self) {
        self.attempts.store(0, Ordering::Relaxed);
    }

    fn next_attempt(&self) -> u32 {
        self.attempts.fetch_add(1, Ordering::Relaxed).saturating_add(1)
    }
}

type Registry = HashMap<String, Arc<ShardHandle>>;

fn apply_command(shards: &Registry, command: DaemonCommand) {
    info!(command = %command, shards = shards.len(), "Applying daemon-wide continuation");
    for handle in shards.values() {
        match command {
            DaemonCommand::PauseAll(delay) => {
                if handle.status() != ShardStatus::Stopped {
                    handle.pause(delay);
                }
            }
            DaemonCommand::StopAll => handle.stop(),
        }
    }
}

/// Resolves shard failures into continuations and fans out daemon-wide ones.
pub(crate) struct ShardSupervisor {
    policy: Arc<ExceptionPolicy>,
    shards: Arc<Registry>,
    commands: RetryBlock<DaemonCommand>,
}

impl ShardSupervisor {
    /// Build the registry and spawn the command block.
    ///
    /// Must be called from within a Tokio runtime.
    pub(crate) fn new(
        policy: ExceptionPolicy,
        shards: impl IntoIterator<Item = ShardName>,
        retry: &RetryBlockConfig,
    ) -> Self {
        let shards: Arc<Registry> = Arc::new(
            shards
                .into_iter()
                .map(|name| (name.identity(), Arc::new(ShardHandle::new(name))))
                .collect(),
        );

        let registry = Arc::clone(&shards);
        let commands = RetryBlock::new("daemon_commands", retry, move |command: DaemonCommand| {
            let registry = Arc::clone(&registry);
            async move {
                apply_command(&registry, command);
                Ok(())
            }
        });

        Self {
            policy: Arc::new(policy),
            shards,
            commands,
        }
    }

    pub(crate) fn policy(&self) -> &ExceptionPolicy {
        &self.policy
    }

    pub(crate) fn handle(&self, shard: &str) -> Result<&Arc<ShardHandle>> {
        self.shards
            .get(shard)
            .ok_or_else(|| ProgressError::ShardNotFound(shard.to_string()))
    }

    /// Handles in identity order.
    pub(crate) fn handles(&self) -> Vec<Arc<ShardHandle>> {
        let mut handles: Vec<_> = self.shards.values().cloned().collect();
        handles.sort_by(|a, b| a.name().cmp(b.name()));
        handles
    }

    /// Count the failure against the shard and resolve its continuation.
    ///
    /// Daemon-wide continuations are queued for every shard before this
    /// returns; the reporting shard applies the effect to itself.
    pub(crate) async fn report_failure(&self, shard: &str, error: &ShardError) -> Result<Continuation> {
        let handle = self.handle(shard)?;
        let attempt = handle.next_attempt();
        let continuation = self.policy.determine(error, attempt);

        warn!(
            shard,
            attempt,
            error = %error,
            continuation = %continuation,
            "Shard failure"
        );
        metrics::record_continuation(shard, continuation.kind());

        let command = match &continuation {
            Continuation::PauseAllShards(delay) => Some(DaemonCommand::PauseAll(*delay)),
            Continuation::StopAllShards => Some(DaemonCommand::StopAll),
            Continuation::SkipEvent | Continuation::DoNothing => {
                handle.reset_attempts();
                None
            }
            _ => None,
        };
        if let Some(command) = command {
            if let Err(e) = self.commands.post(command).await {
                debug!(error = %e, command = %command, "Daemon command dropped");
            }
        }
        Ok(continuation)
    }

    /// Stop accepting commands and wait for queued ones.
    pub(crate) async fn shutdown(&self) {
        self.commands.shutdown().await;
    }
}
