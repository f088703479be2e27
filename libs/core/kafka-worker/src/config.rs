//! Worker configuration
//!
//! This module provides `WorkerConfig` for configuring the supervisor and its partition workers.

use crate::error::WorkerError;
use crate::registry::ConsumerGroupDef;
use crate::retry::{Backoff, RetryPolicy};
use std::time::Duration;

/// Longest group id the broker accepts
pub const MAX_GROUP_ID_LEN: usize = 255;

/// Configuration for the consumer supervisor and partition workers
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Consumer group id
    pub group_id: String,

    /// Subscribed topics
    pub topics: Vec<String>,

    /// Dead-letter topic (None = park degrades to skip)
    pub dlq_topic: Option<String>,

    /// Maximum messages per fetch
    pub batch_size: usize,

    /// How long one fetch (or group poll) may wait for data
    pub fetch_timeout: Duration,

    /// Bound on a single offset commit or dead-letter publish
    pub commit_timeout: Duration,

    /// Bound on a single processor call
    pub handler_timeout: Duration,

    /// How long revoked workers get to stop before they are aborted
    pub drain_deadline: Duration,

    /// Per-message retry policy
    pub retry: RetryPolicy,

    /// Backoff between reconnect attempts
    pub reconnect_backoff: Backoff,

    /// Reconnect budget (None = unbounded)
    pub max_connect_retries: Option<u32>,

    /// Stop the supervisor once the reconnect budget is spent
    pub exit_on_connect_exhausted: bool,
}

impl WorkerConfig {
    /// Create a new WorkerConfig from a ConsumerGroupDef
    pub fn from_group_def<G: ConsumerGroupDef>() -> Self {
        Self {
            dlq_topic: G::DLQ_TOPIC.map(String::from),
            batch_size: G::BATCH_SIZE,
            ..Self::new(G::GROUP_ID, G::topics())
        }
    }

    /// Create a new WorkerConfig with explicit values
    pub fn new(group_id: impl Into<String>, topics: Vec<String>) -> Self {
        Self {
            group_id: group_id.into(),
            topics,
            dlq_topic: None,
            batch_size: 16,
            fetch_timeout: Duration::from_secs(5),
            commit_timeout: Duration::from_secs(10),
            handler_timeout: Duration::from_secs(30),
            drain_deadline: Duration::from_secs(30),
            retry: RetryPolicy::default(),
            reconnect_backoff: Backoff::new(Duration::from_secs(1), Duration::from_secs(30)),
            max_connect_retries: None,
            exit_on_connect_exhausted: false,
        }
    }

    /// Set the dead-letter topic
    pub fn with_dlq_topic(mut self, topic: Option<String>) -> Self {
        self.dlq_topic = topic.filter(|t| !t.trim().is_empty());
        self
    }

    /// Set the batch size
    pub fn with_batch_size(mut self, size: usize) -> Self {
        self.batch_size = size.max(1);
        self
    }

    /// Set the processor call timeout
    pub fn with_handler_timeout(mut self, timeout: Duration) -> Self {
        self.handler_timeout = timeout;
        self
    }

    /// Set the rebalance drain deadline
    pub fn with_drain_deadline(mut self, deadline: Duration) -> Self {
        self.drain_deadline = deadline;
        self
    }

    /// Set the retry policy
    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Set the reconnect backoff
    pub fn with_reconnect_backoff(mut self, backoff: Backoff) -> Self {
        self.reconnect_backoff = backoff;
        self
    }

    /// Bound the number of reconnect attempts
    pub fn with_max_connect_retries(mut self, retries: Option<u32>, exit_when_exhausted: bool) -> Self {
        self.max_connect_retries = retries;
        self.exit_on_connect_exhausted = exit_when_exhausted;
        self
    }

    /// Reject configurations the broker would refuse or that cannot consume anything
    pub fn validate(&self) -> Result<(), WorkerError> {
        if self.topics.is_empty() {
            return Err(WorkerError::Config("topic list is empty".into()));
        }
        if let Some(blank) = self.topics.iter().position(|t| t.trim().is_empty()) {
            return Err(WorkerError::Config(format!("topic #{blank} is blank")));
        }
        validate_group_id(&self.group_id)
    }
}

/// Group ids must be 1..=255 characters of `[A-Za-z0-9._-]`
pub fn validate_group_id(group_id: &str) -> Result<(), WorkerError> {
    if group_id.is_empty() {
        return Err(WorkerError::Config("group id is empty".into()));
    }
    if group_id.len() > MAX_GROUP_ID_LEN {
        return Err(WorkerError::Config(format!(
            "group id is {} characters, limit is {MAX_GROUP_ID_LEN}",
            group_id.len()
        )));
    }
    if let Some(bad) = group_id
        .chars()
        .find(|c| !(c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-')))
    {
        return Err(WorkerError::Config(format!(
            "group id '{group_id}' contains illegal character {bad:?}"
        )));
    }
    Ok(())
}
