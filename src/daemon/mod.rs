// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Projection daemon.
//!
//! The orchestrator that ties together:
//! - High water detection via [`HighWaterAgent`]
//! - Mark fan-out via [`ShardStateTracker`]
//! - One consumer task per registered [`Projection`]
//! - Failure recovery via the [`ExceptionPolicy`]
//!
//! # Lifecycle
//!
//! 1. Register projections and policy rules while `Created`
//! 2. [`start()`](ProjectionDaemon::start) runs the bootstrap detection,
//!    freezes the policy and spawns shard tasks
//! 3. [`shutdown()`](ProjectionDaemon::shutdown) stops the agent, signals
//!    shards, drains daemon-wide commands and closes the event log

mod shard;
mod supervisor;
mod types;

pub use shard::{ApplyFuture, Projection};
pub use types::{DaemonCommand, DaemonState, HealthCheck, ShardHealth, ShardStatus};

use crate::config::DaemonConfig;
use crate::error::{ProgressError, Result};
use crate::high_water::{HighWaterAgent, HighWaterStatistics};
use crate::metrics;
use crate::policy::{Continuation, ExceptionPolicy, FailureFilter, ShardError};
use crate::store::{EventLog, SqliteEventLog};
use crate::tracker::{HighWaterSubscription, ShardState, ShardStateTracker};
use crate::types::{SequencePosition, ShardName, ShardProgress};
use shard::ShardRunner;
use std::sync::Arc;
use std::time::Duration;
use supervisor::ShardSupervisor;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Time shard tasks get to finish after the shutdown signal.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(10);

/// Runs projections against an event log, gated by the high water mark.
pub struct ProjectionDaemon<L: EventLog> {
    config: DaemonConfig,
    log: Arc<L>,

    state_tx: watch::Sender<DaemonState>,
    state_rx: watch::Receiver<DaemonState>,

    tracker: Arc<ShardStateTracker>,
    agent: HighWaterAgent<L>,

    /// Mutable until start; moved into the supervisor afterwards.
    policy: ExceptionPolicy,
    projections: Vec<Arc<dyn Projection>>,
    supervisor: Option<Arc<ShardSupervisor>>,

    shutdown_tx: watch::Sender<bool>,
    shard_tasks: Vec<JoinHandle<()>>,
}

impl ProjectionDaemon<SqliteEventLog> {
    /// Open the SQLite event log named by `config.store` and build a daemon
    /// over it.
    pub async fn open(config: DaemonConfig) -> Result<Self> {
        let log = SqliteEventLog::open(&config.store).await?;
        info!(path = %config.store.sqlite_path, "Event log opened");
        Ok(Self::new(config, Arc::new(log)))
    }
}

impl<L: EventLog> ProjectionDaemon<L> {
    /// Create a daemon in the `Created` state.
    pub fn new(config: DaemonConfig, log: Arc<L>) -> Self {
        let (state_tx, state_rx) = watch::channel(DaemonState::Created);
        let (shutdown_tx, _) = watch::channel(false);
        let tracker = Arc::new(ShardStateTracker::new());
        let agent = HighWaterAgent::new(
            Arc::clone(&log),
            Arc::clone(&tracker),
            config.settings.high_water.clone(),
        );

        Self {
            config,
            log,
            state_tx,
            state_rx,
            tracker,
            agent,
            policy: ExceptionPolicy::new(),
            projections: Vec::new(),
            supervisor: None,
            shutdown_tx,
            shard_tasks: Vec::new(),
        }
    }

    pub fn state(&self) -> DaemonState {
        *self.state_rx.borrow()
    }

    pub fn state_receiver(&self) -> watch::Receiver<DaemonState> {
        self.state_rx.clone()
    }

    pub fn is_running(&self) -> bool {
        self.state() == DaemonState::Running
    }

    pub fn log(&self) -> &Arc<L> {
        &self.log
    }

    pub fn tracker(&self) -> &Arc<ShardStateTracker> {
        &self.tracker
    }

    /// The latest published high water mark.
    pub fn high_water_mark(&self) -> SequencePosition {
        self.tracker.high_water_mark()
    }

    fn set_state(&self, state: DaemonState) {
        self.state_tx.send_replace(state);
        metrics::set_daemon_state(&state.to_string());
    }

    fn require_created(&self) -> Result<()> {
        match self.state() {
            DaemonState::Created => Ok(()),
            other => Err(ProgressError::InvalidState {
                expected: DaemonState::Created.to_string(),
                actual: other.to_string(),
            }),
        }
    }

    fn running_supervisor(&self) -> Result<&Arc<ShardSupervisor>> {
        self.supervisor.as_ref().ok_or_else(|| ProgressError::InvalidState {
            expected: DaemonState::Running.to_string(),
            actual: self.state().to_string(),
        })
    }

    /// Register a projection. Shard identities must be unique.
    pub fn add_projection(&mut self, projection: Arc<dyn Projection>) -> Result<()> {
        self.require_created()?;
        let shard = projection.shard_name();
        if shard.is_high_water() {
            return Err(ProgressError::Config(format!(
                "shard name '{}' is reserved",
                shard
            )));
        }
        if self.projections.iter().any(|p| p.shard_name() == shard) {
            return Err(ProgressError::Config(format!(
                "shard '{}' is already registered",
                shard
            )));
        }
        debug!(shard = %shard, "Projection registered");
        self.projections.push(projection);
        Ok(())
    }

    /// Append an exception policy rule. Rules are matched in registration
    /// order.
    pub fn register_exception_policy(
        &mut self,
        filter: FailureFilter,
        continuations: Vec<Continuation>,
    ) -> Result<()> {
        self.require_created()?;
        self.policy.add(filter, continuations);
        Ok(())
    }

    /// Builder access to the policy. Only available before start.
    ///
    /// ```rust
    /// use projection_progress::config::DaemonConfig;
    /// use projection_progress::policy::ErrorCategory;
    /// use projection_progress::store::InMemoryEventLog;
    /// use projection_progress::ProjectionDaemon;
    /// use std::sync::Arc;
    /// use std::time::Duration;
    ///
    /// let mut daemon = ProjectionDaemon::new(DaemonConfig::default(), Arc::new(InMemoryEventLog::new()));
    /// daemon
    ///     .exception_policy_mut()
    ///     .unwrap()
    ///     .on(ErrorCategory::Timeout)
    ///     .retry_later([Duration::from_millis(100)])
    ///     .then()
    ///     .pause(Duration::from_secs(10));
    /// ```
    pub fn exception_policy_mut(&mut self) -> Result<&mut ExceptionPolicy> {
        self.require_created()?;
        Ok(&mut self.policy)
    }

    /// The policy in effect (frozen once running).
    pub fn exception_policy(&self) -> &ExceptionPolicy {
        match &self.supervisor {
            Some(supervisor) => supervisor.policy(),
            None => &self.policy,
        }
    }

    /// Start the daemon.
    ///
    /// 1. Runs the bootstrap detection (errors fail the daemon)
    /// 2. Freezes the exception policy
    /// 3. Spawns one consumer task per projection
    pub async fn start(&mut self) -> Result<HighWaterStatistics> {
        self.require_created()?;

        info!(projections = self.projections.len(), "Starting projection daemon");
        self.set_state(DaemonState::Starting);

        let bootstrap = match self.agent.start().await {
            Ok(statistics) => statistics,
            Err(e) => {
                error!(error = %e, "Bootstrap high water detection failed");
                self.set_state(DaemonState::Failed);
                return Err(e);
            }
        };

        let policy = std::mem::take(&mut self.policy);
        let shards = self.projections.iter().map(|p| p.shard_name());
        let supervisor = Arc::new(ShardSupervisor::new(policy, shards, &self.config.settings.retry));

        for projection in &self.projections {
            let shard = projection.shard_name();
            let handle = Arc::clone(supervisor.handle(&shard.identity())?);
            let runner = ShardRunner {
                log: Arc::clone(&self.log),
                projection: Arc::clone(projection),
                handle,
                supervisor: Arc::clone(&supervisor),
                tracker: Arc::clone(&self.tracker),
                batch_size: self.config.settings.shards.batch_size,
                shutdown_rx: self.shutdown_tx.subscribe(),
            };
            self.shard_tasks.push(tokio::spawn(runner.run()));
            debug!(shard = %shard, "Spawned shard task");
        }
        self.supervisor = Some(supervisor);

        self.set_state(DaemonState::Running);
        info!(
            mark = bootstrap.current_mark,
            highest = bootstrap.highest_sequence,
            shards = self.shard_tasks.len(),
            "Projection daemon running"
        );
        Ok(bootstrap)
    }

    /// Shut the daemon down gracefully.
    ///
    /// 1. Stop the high water agent (no mark is published afterwards)
    /// 2. Signal shard tasks and wait for them, with a timeout
    /// 3. Drain daemon-wide commands
    /// 4. Close the event log
    pub async fn shutdown(&mut self) {
        match self.state() {
            DaemonState::Stopped => return,
            DaemonState::Created => {
                self.set_state(DaemonState::Stopped);
                return;
            }
            _ => {}
        }

        info!("Shutting down projection daemon");
        self.set_state(DaemonState::ShuttingDown);

        self.agent.stop().await;
        self.shutdown_tx.send_replace(true);

        let tasks = std::mem::take(&mut self.shard_tasks);
        if !tasks.is_empty() {
            info!(task_count = tasks.len(), "Waiting for shard tasks");
        }
        for (i, task) in tasks.into_iter().enumerate() {
            match tokio::time::timeout(DRAIN_TIMEOUT, task).await {
                Ok(Ok(())) => debug!(task = i + 1, "Shard task completed"),
                Ok(Err(e)) => warn!(task = i + 1, error = %e, "Shard task panicked"),
                Err(_) => warn!(task = i + 1, "Shard task timed out during shutdown"),
            }
        }

        if let Some(supervisor) = &self.supervisor {
            supervisor.shutdown().await;
        }

        self.log.close().await;

        self.set_state(DaemonState::Stopped);
        info!("Projection daemon stopped");
    }

    /// Subscribe to the high water mark as `shard`.
    pub fn subscribe(&self, shard: &ShardName) -> HighWaterSubscription {
        self.tracker.subscribe(shard)
    }

    /// Shard lifecycle events published from now on.
    pub fn subscribe_states(&self) -> broadcast::Receiver<ShardState> {
        self.tracker.subscribe_states()
    }

    /// Resolve a failure for `shard` against the policy and count it.
    ///
    /// Daemon-wide continuations are applied to every shard; the returned
    /// continuation is for the caller to act on.
    pub async fn report_failure(&self, shard: &ShardName, error: &ShardError) -> Result<Continuation> {
        self.running_supervisor()?
            .report_failure(&shard.identity(), error)
            .await
    }

    /// Every durable progress row, including the high water mark.
    pub async fn all_progress(&self) -> Result<Vec<ShardProgress>> {
        self.log.all_progress().await
    }

    pub fn shard_status(&self, shard: &ShardName) -> Result<ShardStatus> {
        let identity = shard.identity();
        match &self.supervisor {
            Some(supervisor) => Ok(supervisor.handle(&identity)?.status()),
            None if self.projections.iter().any(|p| &p.shard_name() == shard) => {
                Err(ProgressError::InvalidState {
                    expected: DaemonState::Running.to_string(),
                    actual: self.state().to_string(),
                })
            }
            None => Err(ProgressError::ShardNotFound(identity)),
        }
    }

    /// Health snapshot for monitoring endpoints.
    ///
    /// Reads in-memory state only; never queries the event log.
    ///
    /// ```rust,ignore
    /// let health = daemon.health_check().await;
    /// if health.ready {
    ///     HttpResponse::Ok().json(&health)
    /// } else {
    ///     HttpResponse::ServiceUnavailable().json(&health)
    /// }
    /// ```
    pub async fn health_check(&self) -> HealthCheck {
        let state = self.state();
        let mark = self.tracker.high_water_mark();
        let latest = self.agent.latest().await;

        let shards: Vec<ShardHealth> = self
            .supervisor
            .as_ref()
            .map(|supervisor| {
                supervisor
                    .handles()
                    .iter()
                    .map(|handle| {
                        let position = handle.position();
                        ShardHealth {
                            shard: handle.name().identity(),
                            status: handle.status(),
                            position,
                            lag: (mark - position).max(0),
                            failed_attempts: handle.attempts(),
                        }
                    })
                    .collect()
            })
            .unwrap_or_default();

        let count = |status: ShardStatus| shards.iter().filter(|s| s.status == status).count();
        let shards_running = count(ShardStatus::Running);
        let shards_paused = count(ShardStatus::Paused);
        let shards_stopped = count(ShardStatus::Stopped);

        let ready = state == DaemonState::Running && self.agent.is_running();
        let healthy = ready && shards_stopped == 0;

        HealthCheck {
            state,
            ready,
            healthy,
            high_water_mark: mark,
            highest_sequence: latest.map(|s| s.highest_sequence),
            last_detection: latest.map(|s| s.timestamp),
            agent_restarts: self.agent.restart_count(),
            shards_running,
            shards_paused,
            shards_stopped,
            shards,
        }
    }
}
