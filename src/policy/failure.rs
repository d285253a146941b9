// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Typed shard failures and the filters that match them.

use std::fmt;
use std::sync::Arc;

/// Category of a shard failure.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ErrorCategory {
    /// A projection failed while applying an event.
    ApplyEvent,
    /// Numeric overflow, division by zero and the like.
    Arithmetic,
    /// Event payload could not be decoded.
    Deserialization,
    /// Events could not be loaded from the log.
    EventFetch,
    /// Shard progress could not be persisted.
    ProgressUpdate,
    /// An operation exceeded its deadline.
    Timeout,
    /// Application-defined category.
    Custom(String),
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorCategory::ApplyEvent => write!(f, "ApplyEvent"),
            ErrorCategory::Arithmetic => write!(f, "Arithmetic"),
            ErrorCategory::Deserialization => write!(f, "Deserialization"),
            ErrorCategory::EventFetch => write!(f, "EventFetch"),
            ErrorCategory::ProgressUpdate => write!(f, "ProgressUpdate"),
            ErrorCategory::Timeout => write!(f, "Timeout"),
            ErrorCategory::Custom(name) => write!(f, "{}", name),
        }
    }
}

/// A failure raised by a projection shard.
///
/// Failures nest: an apply failure typically wraps the cause that
/// triggered it.
///
/// ```rust
/// use projection_progress::policy::{ErrorCategory, ShardError};
///
/// let err = ShardError::apply(ShardError::new(ErrorCategory::Arithmetic, "divide by zero"));
/// assert_eq!(err.category, ErrorCategory::ApplyEvent);
/// assert_eq!(err.inner_category(), Some(&ErrorCategory::Arithmetic));
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShardError {
    pub category: ErrorCategory,
    pub message: String,
    pub inner: Option<Box<ShardError>>,
}

impl ShardError {
    pub fn new(category: ErrorCategory, message: impl Into<String>) -> Self {
        Self {
            category,
            message: message.into(),
            inner: None,
        }
    }

    /// Wrap `cause` in an apply failure.
    pub fn apply(cause: ShardError) -> Self {
        let message = format!("apply failed: {}", cause.message);
        Self::new(ErrorCategory::ApplyEvent, message).with_inner(cause)
    }

    pub fn with_inner(mut self, inner: ShardError) -> Self {
        self.inner = Some(Box::new(inner));
        self
    }

    pub fn inner_category(&self) -> Option<&ErrorCategory> {
        self.inner.as_ref().map(|inner| &inner.category)
    }
}

impl fmt::Display for ShardError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.category, self.message)
    }
}

impl std::error::Error for ShardError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.inner
            .as_deref()
            .map(|inner| inner as &(dyn std::error::Error + 'static))
    }
}

type Predicate = Arc<dyn Fn(&ShardError) -> bool + Send + Sync>;

/// Conjunction of conditions over a [`ShardError`].
///
/// An empty filter matches every failure.
#[derive(Clone, Default)]
pub struct FailureFilter {
    category: Option<ErrorCategory>,
    inner_category: Option<ErrorCategory>,
    message_contains: Option<String>,
    predicates: Vec<Predicate>,
}

impl FailureFilter {
    /// Matches any failure.
    pub fn any() -> Self {
        Self::default()
    }

    /// Matches failures of `category`.
    pub fn category(category: ErrorCategory) -> Self {
        Self {
            category: Some(category),
            ..Self::default()
        }
    }

    /// Additionally require the directly wrapped failure to be `category`.
    pub fn and_inner(mut self, category: ErrorCategory) -> Self {
        self.inner_category = Some(category);
        self
    }

    /// Additionally require the message to contain `needle`.
    pub fn and_message_contains(mut self, needle: impl Into<String>) -> Self {
        self.message_contains = Some(needle.into());
        self
    }

    /// Additionally require an arbitrary predicate.
    pub fn and_matching<F>(mut self, predicate: F) -> Self
    where
        F: Fn(&ShardError) -> bool + Send + Sync + 'static,
    {
        self.predicates.push(Arc::new(predicate));
        self
    }

    pub fn matches(&self, error: &ShardError) -> bool {
        if let Some(category) = &self.category {
            if &error.category != category {
                return false;
            }
        }
        if let Some(inner) = &self.inner_category {
            if error.inner_category() != Some(inner) {
                return false;
            }
        }
        if let Some(needle) = &self.message_contains {
            if !error.message.contains(needle.as_str()) {
                return false;
            }
        }
        self.predicates.iter().all(|predicate| predicate(error))
    }
}

impl fmt::Debug for FailureFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FailureFilter")
            .field("category", &self.category)
            .field("inner_category", &self.inner_category)
            .field("message_contains", &self.message_contains)
            .field("predicates", &self.predicates.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::error::Error;

    fn arithmetic_apply() -> ShardError {
        ShardError::apply(ShardError::new(ErrorCategory::Arithmetic, "overflow in fare total"))
    }

    #[test]
    fn test_apply_wraps_cause() {
        let err = arithmetic_apply();
        assert_eq!(err.category, ErrorCategory::ApplyEvent);
        assert_eq!(err.inner_category(), Some(&ErrorCategory::Arithmetic));
        assert!(err.source().is_some());
        assert_eq!(err.to_string(), "ApplyEvent: apply failed: overflow in fare total");
    }

    #[test]
    fn test_empty_filter_matches_everything() {
        assert!(FailureFilter::any().matches(&arithmetic_apply()));
        assert!(FailureFilter::any().matches(&ShardError::new(ErrorCategory::Timeout, "")));
    }

    #[test]
    fn test_category_and_inner_are_anded() {
        let filter = FailureFilter::category(ErrorCategory::ApplyEvent).and_inner(ErrorCategory::Arithmetic);
        assert!(filter.matches(&arithmetic_apply()));

        let plain = ShardError::new(ErrorCategory::ApplyEvent, "boom");
        assert!(!filter.matches(&plain));

        let other_inner =
            ShardError::apply(ShardError::new(ErrorCategory::Deserialization, "bad json"));
        assert!(!filter.matches(&other_inner));
    }

    #[test]
    fn test_message_filter() {
        let filter = FailureFilter::any().and_message_contains("fare");
        assert!(filter.matches(&arithmetic_apply()));
        assert!(!filter.matches(&ShardError::new(ErrorCategory::Timeout, "slow")));
    }

    #[test]
    fn test_custom_predicate() {
        let filter = FailureFilter::category(ErrorCategory::Custom("Geo".to_string()))
            .and_matching(|e| e.message.len() > 3);
        assert!(filter.matches(&ShardError::new(ErrorCategory::Custom("Geo".to_string()), "bad polygon")));
        assert!(!filter.matches(&ShardError::new(ErrorCategory::Custom("Geo".to_string()), "x")));
        assert!(!filter.matches(&ShardError::new(ErrorCategory::Custom("Map".to_string()), "bad polygon")));
    }
}
