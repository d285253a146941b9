// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Exception policy: how a shard recovers from an apply failure.
//!
//! A policy is an ordered list of rules. Each rule pairs a
//! [`FailureFilter`] with a chain of [`Continuation`]s. Rules are tested in
//! registration order and the first match wins; there is no "most specific"
//! ranking. A failure that matches no rule stops the shard.
//!
//! Within a rule, the continuation is picked by attempt number:
//!
//! ```text
//! chain:    [RetryLater(1s), RetryLater(5s), PauseShard(1m)]
//! attempt:   1               2               3, 4, 5, ...
//! ```
//!
//! Past the end of the chain the last continuation repeats, unless it is a
//! `RetryLater`, in which case retries are exhausted and the shard stops.
//!
//! # Example
//!
//! ```rust
//! use projection_progress::policy::{Continuation, ErrorCategory, ExceptionPolicy, ShardError};
//! use std::time::Duration;
//!
//! let mut policy = ExceptionPolicy::new();
//! policy
//!     .on(ErrorCategory::ApplyEvent)
//!     .and_inner(ErrorCategory::Arithmetic)
//!     .skip_event();
//! policy
//!     .on(ErrorCategory::Timeout)
//!     .retry_later([Duration::from_millis(100), Duration::from_secs(1)])
//!     .then()
//!     .pause(Duration::from_secs(30));
//!
//! let poison = ShardError::apply(ShardError::new(ErrorCategory::Arithmetic, "overflow"));
//! assert_eq!(policy.determine(&poison, 1), Continuation::SkipEvent);
//!
//! let timeout = ShardError::new(ErrorCategory::Timeout, "slow read model");
//! assert_eq!(policy.determine(&timeout, 3), Continuation::PauseShard(Duration::from_secs(30)));
//! ```

mod continuation;
mod failure;

pub use continuation::Continuation;
pub use failure::{ErrorCategory, FailureFilter, ShardError};

use std::time::Duration;

/// A filter and the continuations it resolves to.
#[derive(Debug, Clone)]
pub struct PolicyRule {
    filter: FailureFilter,
    continuations: Vec<Continuation>,
}

impl PolicyRule {
    pub fn new(filter: FailureFilter, continuations: Vec<Continuation>) -> Self {
        Self {
            filter,
            continuations,
        }
    }

    pub fn matches(&self, error: &ShardError) -> bool {
        self.filter.matches(error)
    }

    pub fn continuations(&self) -> &[Continuation] {
        &self.continuations
    }

    /// Continuation for the given attempt (1-indexed).
    pub fn continuation_for(&self, attempt: u32) -> Continuation {
        let index = attempt.max(1) as usize - 1;
        if let Some(continuation) = self.continuations.get(index) {
            return continuation.clone();
        }
        match self.continuations.last() {
            Some(Continuation::RetryLater(_)) | None => Continuation::StopShard,
            Some(last) => last.clone(),
        }
    }
}

/// Ordered recovery rules. Immutable once handed to a running daemon.
#[derive(Debug, Clone, Default)]
pub struct ExceptionPolicy {
    rules: Vec<PolicyRule>,
}

impl ExceptionPolicy {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a rule.
    pub fn add(&mut self, filter: FailureFilter, continuations: Vec<Continuation>) {
        self.rules.push(PolicyRule::new(filter, continuations));
    }

    /// Start a rule matching failures of `category`.
    pub fn on(&mut self, category: ErrorCategory) -> RuleBuilder<'_> {
        RuleBuilder {
            policy: self,
            filter: FailureFilter::category(category),
        }
    }

    /// Start a rule matching every failure.
    pub fn on_any(&mut self) -> RuleBuilder<'_> {
        RuleBuilder {
            policy: self,
            filter: FailureFilter::any(),
        }
    }

    pub fn rules(&self) -> &[PolicyRule] {
        &self.rules
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// Resolve the continuation for `error` on the given attempt.
    pub fn determine(&self, error: &ShardError, attempt: u32) -> Continuation {
        self.rules
            .iter()
            .find(|rule| rule.matches(error))
            .map(|rule| rule.continuation_for(attempt))
            .unwrap_or(Continuation::StopShard)
    }
}

/// Builds one rule; finished by a terminal action or `retry_later`.
pub struct RuleBuilder<'a> {
    policy: &'a mut ExceptionPolicy,
    filter: FailureFilter,
}

impl<'a> RuleBuilder<'a> {
    pub fn and_inner(mut self, category: ErrorCategory) -> Self {
        self.filter = self.filter.and_inner(category);
        self
    }

    pub fn and_message_contains(mut self, needle: impl Into<String>) -> Self {
        self.filter = self.filter.and_message_contains(needle);
        self
    }

    pub fn and_matching<F>(mut self, predicate: F) -> Self
    where
        F: Fn(&ShardError) -> bool + Send + Sync + 'static,
    {
        self.filter = self.filter.and_matching(predicate);
        self
    }

    fn finish(self, continuation: Continuation) {
        self.policy.add(self.filter, vec![continuation]);
    }

    pub fn skip_event(self) {
        self.finish(Continuation::SkipEvent)
    }

    pub fn stop(self) {
        self.finish(Continuation::StopShard)
    }

    pub fn stop_all(self) {
        self.finish(Continuation::StopAllShards)
    }

    pub fn pause(self, delay: Duration) {
        self.finish(Continuation::PauseShard(delay))
    }

    pub fn pause_all(self, delay: Duration) {
        self.finish(Continuation::PauseAllShards(delay))
    }

    pub fn do_nothing(self) {
        self.finish(Continuation::DoNothing)
    }

    /// Retry after each delay in turn. The rule is registered immediately;
    /// use [`then()`](RetryChain::then) to choose what happens after the
    /// last retry (the shard stops otherwise).
    pub fn retry_later<I>(self, delays: I) -> RetryChain<'a>
    where
        I: IntoIterator<Item = Duration>,
    {
        let RuleBuilder { policy, filter } = self;
        let continuations = delays.into_iter().map(Continuation::RetryLater).collect();
        policy.add(filter, continuations);
        let index = policy.rules.len() - 1;
        RetryChain {
            rule: &mut policy.rules[index],
        }
    }
}

/// A registered retry chain awaiting an optional final continuation.
pub struct RetryChain<'a> {
    rule: &'a mut PolicyRule,
}

impl<'a> RetryChain<'a> {
    pub fn then(self) -> ThenBuilder<'a> {
        ThenBuilder { rule: self.rule }
    }
}

/// Chooses the continuation applied once retries are exhausted.
pub struct ThenBuilder<'a> {
    rule: &'a mut PolicyRule,
}

impl ThenBuilder<'_> {
    fn finish(self, continuation: Continuation) {
        self.rule.continuations.push(continuation);
    }

    pub fn pause(self, delay: Duration) {
        self.finish(Continuation::PauseShard(delay))
    }

    pub fn pause_all(self, delay: Duration) {
        self.finish(Continuation::PauseAllShards(delay))
    }

    pub fn stop(self) {
        self.finish(Continuation::StopShard)
    }

    pub fn stop_all(self) {
        self.finish(Continuation::StopAllShards)
    }

    pub fn skip_event(self) {
        self.finish(Continuation::SkipEvent)
    }

    pub fn do_nothing(self) {
        self.finish(Continuation::DoNothing)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn timeout() -> ShardError {
        ShardError::new(ErrorCategory::Timeout, "read model timed out")
    }

    #[test]
    fn test_unmatched_defaults_to_stop() {
        let policy = ExceptionPolicy::new();
        assert!(policy.is_empty());
        assert_eq!(policy.determine(&timeout(), 1), Continuation::StopShard);
    }

    #[test]
    fn test_first_match_wins() {
        let mut policy = ExceptionPolicy::new();
        policy.on(ErrorCategory::Timeout).skip_event();
        policy.on_any().pause(Duration::from_secs(1));

        assert_eq!(policy.len(), 2);
        assert_eq!(policy.determine(&timeout(), 1), Continuation::SkipEvent);
        assert_eq!(
            policy.determine(&ShardError::new(ErrorCategory::EventFetch, "io"), 1),
            Continuation::PauseShard(Duration::from_secs(1))
        );
    }

    #[test]
    fn test_retry_chain_then_pause() {
        let mut policy = ExceptionPolicy::new();
        policy
            .on(ErrorCategory::Timeout)
            .retry_later([Duration::from_millis(10), Duration::from_millis(20)])
            .then()
            .pause(Duration::from_secs(5));

        let err = timeout();
        assert_eq!(policy.determine(&err, 1), Continuation::RetryLater(Duration::from_millis(10)));
        assert_eq!(policy.determine(&err, 2), Continuation::RetryLater(Duration::from_millis(20)));
        assert_eq!(policy.determine(&err, 3), Continuation::PauseShard(Duration::from_secs(5)));
        assert_eq!(policy.determine(&err, 9), Continuation::PauseShard(Duration::from_secs(5)));
    }

    #[test]
    fn test_retry_chain_without_then_stops() {
        let mut policy = ExceptionPolicy::new();
        policy
            .on(ErrorCategory::Timeout)
            .retry_later([Duration::from_millis(10)]);

        assert_eq!(policy.determine(&timeout(), 1), Continuation::RetryLater(Duration::from_millis(10)));
        assert_eq!(policy.determine(&timeout(), 2), Continuation::StopShard);
    }

    #[test]
    fn test_attempt_zero_treated_as_first() {
        let mut policy = ExceptionPolicy::new();
        policy.on_any().retry_later([Duration::from_millis(10)]).then().stop_all();
        assert_eq!(policy.determine(&timeout(), 0), Continuation::RetryLater(Duration::from_millis(10)));
        assert_eq!(policy.determine(&timeout(), 2), Continuation::StopAllShards);
    }

    #[test]
    fn test_add_with_explicit_filter() {
        let mut policy = ExceptionPolicy::new();
        policy.add(
            FailureFilter::any().and_message_contains("benign"),
            vec![Continuation::DoNothing],
        );
        let benign = ShardError::new(ErrorCategory::ApplyEvent, "benign duplicate");
        assert_eq!(policy.determine(&benign, 1), Continuation::DoNothing);
        assert_eq!(policy.determine(&timeout(), 1), Continuation::StopShard);
    }

    #[test]
    fn test_empty_rule_stops() {
        let mut policy = ExceptionPolicy::new();
        policy.add(FailureFilter::any(), vec![]);
        assert_eq!(policy.determine(&timeout(), 1), Continuation::StopShard);
    }

    #[test]
    fn test_builder_filters() {
        let mut policy = ExceptionPolicy::new();
        policy
            .on(ErrorCategory::ApplyEvent)
            .and_message_contains("fare")
            .and_matching(|e| e.inner.is_some())
            .pause_all(Duration::from_secs(2));

        let matching = ShardError::apply(ShardError::new(ErrorCategory::Arithmetic, "fare overflow"));
        assert_eq!(
            policy.determine(&matching, 1),
            Continuation::PauseAllShards(Duration::from_secs(2))
        );
        let no_inner = ShardError::new(ErrorCategory::ApplyEvent, "fare");
        assert_eq!(policy.determine(&no_inner, 1), Continuation::StopShard);
    }
}
