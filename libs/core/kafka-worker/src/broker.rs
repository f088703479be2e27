//! Broker contract
//!
//! A [`Broker`] joins a consumer group and hands back a shared [`BrokerSession`].
//! The supervisor polls the session for group events; each partition worker
//! fetches and commits for its own partition only.

use crate::dlq::DeadLetter;
use crate::error::BrokerError;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

/// A `(topic, partition)` pair
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TopicPartition {
    pub topic: String,
    pub partition: i32,
}

impl TopicPartition {
    pub fn new(topic: impl Into<String>, partition: i32) -> Self {
        Self {
            topic: topic.into(),
            partition,
        }
    }
}

impl fmt::Display for TopicPartition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}[{}]", self.topic, self.partition)
    }
}

/// A record fetched from a partition
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokerMessage {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
    pub key: Option<Vec<u8>>,
    pub value: Vec<u8>,
    pub timestamp: Option<DateTime<Utc>>,
}

impl BrokerMessage {
    pub fn new(topic: impl Into<String>, partition: i32, offset: i64, value: Vec<u8>) -> Self {
        Self {
            topic: topic.into(),
            partition,
            offset,
            key: None,
            value,
            timestamp: None,
        }
    }

    pub fn with_key(mut self, key: Vec<u8>) -> Self {
        self.key = Some(key);
        self
    }

    pub fn with_timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = Some(timestamp);
        self
    }

    pub fn topic_partition(&self) -> TopicPartition {
        TopicPartition::new(self.topic.clone(), self.partition)
    }
}

/// Partitions handed to this member for one group generation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Assignment {
    /// Opaque token, fresh for every generation
    pub token: String,
    pub partitions: Vec<TopicPartition>,
}

impl Assignment {
    pub fn new(mut partitions: Vec<TopicPartition>) -> Self {
        partitions.sort();
        partitions.dedup();
        Self {
            token: Uuid::new_v4().to_string(),
            partitions,
        }
    }

    pub fn contains(&self, tp: &TopicPartition) -> bool {
        self.partitions.binary_search(tp).is_ok()
    }
}

/// Membership change reported by a session
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GroupEvent {
    /// Full replacement of the current assignment
    Assigned(Assignment),
    /// These partitions must be released before the rebalance can complete
    Revoked(Vec<TopicPartition>),
}

/// A live group membership
#[async_trait]
pub trait BrokerSession: Send + Sync + 'static {
    /// Wait up to `timeout` for the next membership change.
    ///
    /// The supervisor calls it in a loop.
    async fn next_group_event(&self, timeout: Duration) -> Result<Option<GroupEvent>, BrokerError>;

    /// The workers of a [`GroupEvent::Revoked`] batch have stopped.
    ///
    /// Sessions that hold the rebalance open until then release it here.
    fn revoke_complete(&self, _partitions: &[TopicPartition]) {}

    /// Fetch up to `max` messages from one partition, in offset order.
    ///
    /// Returns an empty batch when nothing arrives within `timeout`.
    async fn fetch(
        &self,
        tp: &TopicPartition,
        max: usize,
        timeout: Duration,
    ) -> Result<Vec<BrokerMessage>, BrokerError>;

    /// Commit `next_offset` (last handled offset + 1) for one partition
    async fn commit(&self, tp: &TopicPartition, next_offset: i64) -> Result<(), BrokerError>;

    /// Publish a record to the dead-letter topic
    async fn publish(&self, letter: &DeadLetter) -> Result<(), BrokerError>;

    /// Leave the group
    async fn leave(&self) -> Result<(), BrokerError>;
}

/// Factory for group sessions
#[async_trait]
pub trait Broker: Send + Sync + 'static {
    type Session: BrokerSession;

    /// Join `group_id` subscribed to `topics`
    async fn connect(&self, group_id: &str, topics: &[String]) -> Result<Arc<Self::Session>, BrokerError>;
}
