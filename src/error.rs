// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Error types for the progress engine.
//!
//! This module defines the errors raised by the event log, the high water
//! detector and the daemon supervisor. Failures raised by a projection while
//! applying events are *not* represented here: they are
//! [`ShardError`](crate::policy::ShardError) values and are routed through the
//! [`ExceptionPolicy`](crate::policy::ExceptionPolicy) instead.
//!
//! # Error Categories
//!
//! | Error Type | Description |
//! |------------|-------------|
//! | `Store` | SQLite errors from the event log |
//! | `Config` | Configuration invalid |
//! | `InvalidState` | Daemon state machine violation |
//! | `ShardNotFound` | Operation on an unregistered shard |
//! | `InjectedFailure` | Failure injected by the in-memory log |
//! | `Shutdown` | Daemon is shutting down |
//! | `Internal` | Unexpected internal error |
//!
//! # Retry Behavior
//!
//! SQLite busy/locked errors are retried inside the store before they ever
//! become a `Store` error. Past that point nothing is retried by error type:
//! the high water agent logs and polls again, and shards hand the failure to
//! the exception policy.

use thiserror::Error;

/// Result type alias for progress engine operations.
pub type Result<T> = std::result::Result<T, ProgressError>;

/// Errors that can occur while detecting or tracking progress.
#[derive(Error, Debug)]
pub enum ProgressError {
    /// SQLite error from the event log, after busy retries ran out.
    #[error("Event store error: {0}")]
    Store(#[from] sqlx::Error),

    /// Invalid or missing configuration.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Daemon state machine violation.
    ///
    /// Occurs when an operation is attempted in the wrong state
    /// (e.g., registering a policy after the daemon started).
    #[error("Invalid state: expected {expected}, got {actual}")]
    InvalidState { expected: String, actual: String },

    /// The named shard is not registered with the daemon.
    #[error("Unknown shard: {0}")]
    ShardNotFound(String),

    /// Failure injected by [`InMemoryEventLog`](crate::store::InMemoryEventLog).
    #[error("Injected failure during {operation}")]
    InjectedFailure { operation: String },

    /// Shutdown in progress.
    #[error("Shutdown in progress")]
    Shutdown,

    /// Unexpected internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl ProgressError {
    /// Short label used for the `error_type` metric label.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Store(_) => "store",
            Self::Config(_) => "config",
            Self::InvalidState { .. } => "invalid_state",
            Self::ShardNotFound(_) => "shard_not_found",
            Self::InjectedFailure { .. } => "injected",
            Self::Shutdown => "shutdown",
            Self::Internal(_) => "internal",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_store_error_formatting() {
        let err = ProgressError::Store(sqlx::Error::RowNotFound);
        assert!(err.to_string().contains("Event store error"));
        assert_eq!(err.kind(), "store");
    }

    #[test]
    fn test_injected_failure_names_operation() {
        let err = ProgressError::InjectedFailure {
            operation: "fetch_statistics".to_string(),
        };
        assert!(err.to_string().contains("fetch_statistics"));
        assert_eq!(err.kind(), "injected");
    }

    #[test]
    fn test_config_kind() {
        let err = ProgressError::Config("bad duration".to_string());
        assert_eq!(err.kind(), "config");
    }

    #[test]
    fn test_invalid_state_formatting() {
        let err = ProgressError::InvalidState {
            expected: "Created".to_string(),
            actual: "Running".to_string(),
        };
        assert!(err.to_string().contains("Created"));
        assert!(err.to_string().contains("Running"));
    }

    #[test]
    fn test_shard_not_found_formatting() {
        let err = ProgressError::ShardNotFound("Trips:All".to_string());
        assert_eq!(err.to_string(), "Unknown shard: Trips:All");
        assert_eq!(err.kind(), "shard_not_found");
    }

    #[test]
    fn test_shutdown_and_internal_kinds() {
        assert_eq!(ProgressError::Shutdown.kind(), "shutdown");
        assert_eq!(ProgressError::Internal("boom".to_string()).kind(), "internal");
    }
}
