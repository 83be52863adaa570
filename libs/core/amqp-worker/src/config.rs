//! Worker configuration
//!
//! This module provides `WorkerConfig` for tuning the consumer and `RejectPolicy`
//! for deciding what happens to messages that could not be persisted.

use crate::error::{ErrorCategory, WorkerError};
use std::time::Duration;
use strum::{Display, EnumString};
use uuid::Uuid;

/// What to do with a delivery whose processing failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Display, EnumString)]
#[strum(serialize_all = "snake_case")]
pub enum RejectPolicy {
    /// Reject every failure without requeue. The broker drops the message or
    /// routes it to the queue's dead-letter exchange.
    #[default]
    DeadLetter,
    /// Requeue transient failures (sink unreachable), dead-letter the rest.
    ///
    /// A requeued message goes back to the head of its queue and, with a
    /// prefetch of 1, is redelivered straight away. While a backend stays
    /// down the same message cycles until it recovers, paced only by
    /// [`WorkerConfig::requeue_delay`]. Other messages on that queue wait.
    RequeueTransient,
}

impl RejectPolicy {
    pub fn should_requeue(&self, error: &WorkerError) -> bool {
        match self {
            RejectPolicy::DeadLetter => false,
            RejectPolicy::RequeueTransient => error.category() == ErrorCategory::Transient,
        }
    }
}

/// Configuration for the AMQP worker
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Prefix for consumer tags; the queue name is appended per consumer
    pub consumer_tag: String,

    /// Maximum unacknowledged deliveries on the shared channel
    pub prefetch: u16,

    /// Connection attempts per (re)connect cycle before giving up
    pub max_reconnect_attempts: u32,

    /// Fixed delay between connection attempts
    pub reconnect_delay: Duration,

    /// Liveness log interval
    pub heartbeat_interval: Duration,

    /// Declare exchanges (durable topic) instead of asserting they exist
    pub declare_exchanges: bool,

    /// Requeue decision for failed deliveries
    pub reject_policy: RejectPolicy,

    /// Pause before a requeueing reject is sent to the broker
    pub requeue_delay: Duration,
}

impl WorkerConfig {
    pub fn new() -> Self {
        Self {
            consumer_tag: format!("metrics-worker-{}", Uuid::new_v4()),
            prefetch: 1,
            max_reconnect_attempts: 3,
            reconnect_delay: Duration::from_secs(3),
            heartbeat_interval: Duration::from_secs(5),
            declare_exchanges: false,
            reject_policy: RejectPolicy::DeadLetter,
            requeue_delay: Duration::from_secs(1),
        }
    }

    /// Set the consumer tag prefix
    pub fn with_consumer_tag(mut self, tag: impl Into<String>) -> Self {
        self.consumer_tag = tag.into();
        self
    }

    /// Set the prefetch count (at least 1)
    pub fn with_prefetch(mut self, prefetch: u16) -> Self {
        self.prefetch = prefetch.max(1);
        self
    }

    /// Set the bounded reconnection parameters
    pub fn with_reconnect(mut self, max_attempts: u32, delay: Duration) -> Self {
        self.max_reconnect_attempts = max_attempts.max(1);
        self.reconnect_delay = delay;
        self
    }

    /// Set the heartbeat interval
    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }

    /// Declare exchanges instead of asserting them
    pub fn with_declare_exchanges(mut self, declare: bool) -> Self {
        self.declare_exchanges = declare;
        self
    }

    /// Set the reject policy
    pub fn with_reject_policy(mut self, policy: RejectPolicy) -> Self {
        self.reject_policy = policy;
        self
    }

    /// Set the pause before requeueing. Zero requeues immediately.
    pub fn with_requeue_delay(mut self, delay: Duration) -> Self {
        self.requeue_delay = delay;
        self
    }

    /// Consumer tag for one queue
    pub fn consumer_tag_for(&self, queue: &str) -> String {
        format!("{}-{}", self.consumer_tag, queue)
    }

    /// Capacity of the in-process delivery buffer. Matches prefetch so the
    /// broker's flow control stays the only buffering bound.
    pub fn delivery_buffer(&self) -> usize {
        usize::from(self.prefetch.max(1))
    }
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::SinkError;

    #[test]
    fn test_defaults() {
        let config = WorkerConfig::default();
        assert_eq!(config.prefetch, 1);
        assert_eq!(config.max_reconnect_attempts, 3);
        assert_eq!(config.reconnect_delay, Duration::from_secs(3));
        assert_eq!(config.reject_policy, RejectPolicy::DeadLetter);
        assert_eq!(config.requeue_delay, Duration::from_secs(1));
        assert!(!config.declare_exchanges);
        assert!(config.consumer_tag.starts_with("metrics-worker-"));
    }

    #[test]
    fn test_builder_pattern() {
        let config = WorkerConfig::new()
            .with_consumer_tag("worker-1")
            .with_prefetch(0)
            .with_reconnect(0, Duration::from_millis(10))
            .with_reject_policy(RejectPolicy::RequeueTransient);

        assert_eq!(config.prefetch, 1);
        assert_eq!(config.max_reconnect_attempts, 1);
        assert_eq!(config.consumer_tag_for("link-created-queue"), "worker-1-link-created-queue");
        assert_eq!(config.delivery_buffer(), 1);
    }

    #[test]
    fn test_reject_policy_parse() {
        assert_eq!("dead_letter".parse::<RejectPolicy>().unwrap(), RejectPolicy::DeadLetter);
        assert_eq!(
            "requeue_transient".parse::<RejectPolicy>().unwrap(),
            RejectPolicy::RequeueTransient
        );
        assert!("sometimes".parse::<RejectPolicy>().is_err());
    }

    #[test]
    fn test_reject_policy_requeue_decision() {
        let transient = WorkerError::from(SinkError::unavailable("connection refused"));
        let permanent = WorkerError::Decode("expected value".into());

        assert!(!RejectPolicy::DeadLetter.should_requeue(&transient));
        assert!(RejectPolicy::RequeueTransient.should_requeue(&transient));
        assert!(!RejectPolicy::RequeueTransient.should_requeue(&permanent));
    }
}
