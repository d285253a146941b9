//! Recording projection for daemon tests.
//!
//! Records every applied sequence and fails on scripted positions.

use projection_progress::daemon::{ApplyFuture, Projection};
use projection_progress::policy::{ErrorCategory, ShardError};
use projection_progress::{EventRecord, SequencePosition};
use std::collections::HashMap;
use std::sync::Mutex;

/// A failure to raise when applying a given sequence.
#[derive(Debug, Clone)]
pub struct ScriptedFailure {
    pub error: ShardError,
    /// Remaining times to fail; `None` fails forever.
    pub remaining: Option<u32>,
}

/// Projection that records applied sequences.
///
/// # Example
/// ```rust,ignore
/// let trips = Arc::new(RecordingProjection::new("Trips"));
/// trips.fail_always(3, arithmetic());
///
/// daemon.add_projection(trips.clone())?;
/// // ...
/// assert_eq!(trips.applied(), vec![1, 2, 4]);
/// ```
pub struct RecordingProjection {
    name: String,
    applied: Mutex<Vec<SequencePosition>>,
    failures: Mutex<HashMap<SequencePosition, ScriptedFailure>>,
    attempts: Mutex<HashMap<SequencePosition, u32>>,
}

impl RecordingProjection {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            applied: Mutex::new(Vec::new()),
            failures: Mutex::new(HashMap::new()),
            attempts: Mutex::new(HashMap::new()),
        }
    }

    /// Fail on `sequence` every time.
    pub fn fail_always(&self, sequence: SequencePosition, error: ShardError) {
        self.failures.lock().unwrap().insert(
            sequence,
            ScriptedFailure {
                error,
                remaining: None,
            },
        );
    }

    /// Fail on `sequence` the next `times` attempts, then succeed.
    pub fn fail_times(&self, sequence: SequencePosition, times: u32, error: ShardError) {
        self.failures.lock().unwrap().insert(
            sequence,
            ScriptedFailure {
                error,
                remaining: Some(times),
            },
        );
    }

    /// Sequences applied successfully, in order.
    pub fn applied(&self) -> Vec<SequencePosition> {
        self.applied.lock().unwrap().clone()
    }

    /// Times `apply` was called for `sequence`.
    pub fn attempts(&self, sequence: SequencePosition) -> u32 {
        self.attempts.lock().unwrap().get(&sequence).copied().unwrap_or(0)
    }

    fn scripted(&self, sequence: SequencePosition) -> Option<ShardError> {
        let mut failures = self.failures.lock().unwrap();
        let failure = failures.get_mut(&sequence)?;
        match &mut failure.remaining {
            None => Some(failure.error.clone()),
            Some(0) => None,
            Some(n) => {
                *n -= 1;
                Some(failure.error.clone())
            }
        }
    }
}

impl Projection for RecordingProjection {
    fn name(&self) -> &str {
        &self.name
    }

    fn apply<'a>(&'a self, event: &'a EventRecord) -> ApplyFuture<'a> {
        Box::pin(async move {
            *self.attempts.lock().unwrap().entry(event.sequence).or_insert(0) += 1;
            if let Some(error) = self.scripted(event.sequence) {
                return Err(error);
            }
            self.applied.lock().unwrap().push(event.sequence);
            Ok(())
        })
    }
}

/// `ApplyEvent` wrapping an `Arithmetic` cause.
pub fn arithmetic() -> ShardError {
    ShardError::apply(ShardError::new(ErrorCategory::Arithmetic, "fare total overflowed"))
}

/// A category no test policy registers.
pub fn unregistered() -> ShardError {
    ShardError::new(ErrorCategory::Custom("GeoLookup".to_string()), "unknown zone")
}

pub fn timeout_error() -> ShardError {
    ShardError::new(ErrorCategory::Timeout, "read model timed out")
}
