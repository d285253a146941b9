//! # Projection Progress
//!
//! Continuous progress tracking for event projections: detects how far the
//! event log can safely be read, feeds that mark to projection shards, and
//! decides how shards recover from failures.
//!
//! ## Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────────────────────┐
//! │                          ProjectionDaemon                                 │
//! │                                                                           │
//! │  ┌──────────────────┐   ┌──────────────────┐   ┌───────────────────────┐  │
//! │  │ HighWaterAgent   │──►│ ShardStateTracker│──►│ Shard tasks           │  │
//! │  │ (detect + poll)  │   │ (watch fan-out)  │   │ (fetch, apply, save)  │  │
//! │  └──────────────────┘   └──────────────────┘   └───────────────────────┘  │
//! │         │                                               │ failure         │
//! │         ▼                                               ▼                 │
//! │  ┌──────────────────┐                        ┌───────────────────────┐    │
//! │  │ EventLog         │                        │ ExceptionPolicy       │    │
//! │  │ (SQLite/memory)  │                        │ + RetryBlock commands │    │
//! │  └──────────────────┘                        └───────────────────────┘    │
//! └───────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## High Water Mark
//!
//! Positions are assigned when a write begins but committed in any order, so
//! the committed set can have holes. The high water mark is the highest
//! position below which no hole can still fill. Holes left by rolled-back
//! writes are skipped once they are older than the leading edge buffer.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use projection_progress::{DaemonConfig, ProjectionDaemon};
//!
//! #[tokio::main]
//! async fn main() {
//!     let mut daemon = ProjectionDaemon::open(DaemonConfig::default())
//!         .await
//!         .expect("Failed to open event log");
//!     daemon.start().await.expect("Failed to start");
//!
//!     // Daemon runs until shutdown signal
//!     daemon.shutdown().await;
//! }
//! ```

pub mod config;
pub mod daemon;
pub mod error;
pub mod high_water;
pub mod metrics;
pub mod policy;
pub mod resilience;
pub mod retry;
pub mod store;
pub mod tracker;
pub mod types;

// Re-exports for convenience
pub use config::{DaemonConfig, DaemonSettings, HighWaterConfig, RetryBlockConfig, ShardConfig, StoreConfig};
pub use daemon::{DaemonState, HealthCheck, Projection, ProjectionDaemon, ShardStatus};
pub use error::{ProgressError, Result};
pub use high_water::{HighWaterAgent, HighWaterDetector, HighWaterStatistics, HighWaterStatus};
pub use policy::{Continuation, ErrorCategory, ExceptionPolicy, FailureFilter, ShardError};
pub use retry::RetryBlock;
pub use store::{EventLog, InMemoryEventLog, SqliteEventLog};
pub use tracker::{HighWaterSubscription, ShardStateTracker};
pub use types::{EventRecord, SequencePosition, ShardName, ShardProgress};
