//! In-memory broker
//!
//! A single-process stand-in for a Kafka cluster: partition logs, committed
//! offsets, a dead-letter sink and a scripted stream of group events. Used by the
//! integration suites and for running the service without a cluster.
//!
//! Differences from Kafka worth knowing:
//! - a partition without a committed offset starts from the earliest retained message;
//! - every `connect` starts a new generation, fences older sessions and assigns
//!   every known partition of the subscribed topics.

use crate::broker::{Assignment, Broker, BrokerMessage, BrokerSession, GroupEvent, TopicPartition};
use crate::dlq::DeadLetter;
use crate::error::BrokerError;
use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::pin::pin;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;

#[derive(Debug, Default)]
struct PartitionLog {
    /// Offset the next produced message gets
    next_offset: i64,
    messages: Vec<BrokerMessage>,
}

#[derive(Debug, Default)]
struct State {
    logs: BTreeMap<TopicPartition, PartitionLog>,
    committed: HashMap<TopicPartition, i64>,
    commits: Vec<(TopicPartition, i64)>,
    dead_letters: Vec<DeadLetter>,
    revocations_completed: Vec<Vec<TopicPartition>>,
    events: VecDeque<GroupEvent>,
    subscribed: Vec<String>,
    generation: u64,
    connects: u32,
    leaves: u32,
    fetches: u64,
    fail_connects: u32,
    fail_fetches: u32,
    fail_publishes: u32,
    reject_auth: bool,
}

#[derive(Debug, Default)]
struct Shared {
    state: Mutex<State>,
    changed: Notify,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn mutate<T>(&self, f: impl FnOnce(&mut State) -> T) -> T {
        let out = f(&mut self.lock());
        self.changed.notify_waiters();
        out
    }

    /// Re-evaluate `poll` whenever the state changes, until it yields or `deadline` passes
    async fn wait_until<T>(&self, deadline: Option<Instant>, mut poll: impl FnMut(&mut State) -> Option<T>) -> Option<T> {
        loop {
            let mut notified = pin!(self.changed.notified());
            notified.as_mut().enable();

            let polled = poll(&mut self.lock());
            if polled.is_some() {
                return polled;
            }

            match deadline {
                Some(deadline) => {
                    if tokio::time::timeout_at(deadline, notified).await.is_err() {
                        return None;
                    }
                }
                None => notified.await,
            }
        }
    }
}

/// In-memory [`Broker`]. Clones share the same cluster.
#[derive(Debug, Clone, Default)]
pub struct MemoryBroker {
    shared: Arc<Shared>,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make sure `partitions` partitions exist for `topic`
    pub fn create_topic(&self, topic: &str, partitions: i32) {
        self.shared.mutate(|s| {
            for p in 0..partitions {
                s.logs.entry(TopicPartition::new(topic, p)).or_default();
            }
        });
    }

    /// Append a message and return its offset
    pub fn produce(&self, topic: &str, partition: i32, value: impl Into<Vec<u8>>) -> i64 {
        self.append(topic, partition, None, None, value.into())
    }

    /// Append a keyed message and return its offset
    pub fn produce_keyed(&self, topic: &str, partition: i32, key: impl Into<Vec<u8>>, value: impl Into<Vec<u8>>) -> i64 {
        self.append(topic, partition, None, Some(key.into()), value.into())
    }

    /// Append a message at an explicit offset, leaving a gap like a compacted log.
    ///
    /// Offsets below the partition's next offset are moved up to it.
    pub fn produce_at(&self, topic: &str, partition: i32, offset: i64, value: impl Into<Vec<u8>>) -> i64 {
        self.append(topic, partition, Some(offset), None, value.into())
    }

    fn append(&self, topic: &str, partition: i32, at: Option<i64>, key: Option<Vec<u8>>, value: Vec<u8>) -> i64 {
        self.shared.mutate(|s| {
            let log = s.logs.entry(TopicPartition::new(topic, partition)).or_default();
            let offset = at.map_or(log.next_offset, |o| o.max(log.next_offset));
            let mut message = BrokerMessage::new(topic, partition, offset, value).with_timestamp(chrono::Utc::now());
            message.key = key;
            log.messages.push(message);
            log.next_offset = offset + 1;
            offset
        })
    }

    /// Queue a full reassignment for the current session
    pub fn assign(&self, partitions: Vec<TopicPartition>) {
        self.shared
            .mutate(|s| s.events.push_back(GroupEvent::Assigned(Assignment::new(partitions))));
    }

    /// Queue a revocation for the current session
    pub fn revoke(&self, partitions: Vec<TopicPartition>) {
        self.shared.mutate(|s| s.events.push_back(GroupEvent::Revoked(partitions)));
    }

    /// Make the next `n` connects fail with a transport error
    pub fn fail_next_connects(&self, n: u32) {
        self.shared.mutate(|s| s.fail_connects = n);
    }

    /// Make the next `n` fetches fail with a transport error
    pub fn fail_next_fetches(&self, n: u32) {
        self.shared.mutate(|s| s.fail_fetches = n);
    }

    /// Make the next `n` dead-letter publishes fail with a transport error
    pub fn fail_next_publishes(&self, n: u32) {
        self.shared.mutate(|s| s.fail_publishes = n);
    }

    /// Refuse every connect with an authentication error
    pub fn reject_authentication(&self) {
        self.shared.mutate(|s| s.reject_auth = true);
    }

    pub fn committed(&self, tp: &TopicPartition) -> Option<i64> {
        self.shared.lock().committed.get(tp).copied()
    }

    /// Every commit in order
    pub fn commits(&self) -> Vec<(TopicPartition, i64)> {
        self.shared.lock().commits.clone()
    }

    pub fn dead_letters(&self) -> Vec<DeadLetter> {
        self.shared.lock().dead_letters.clone()
    }

    /// Revocations the consumer reported drained, in order
    pub fn revocations_completed(&self) -> Vec<Vec<TopicPartition>> {
        self.shared.lock().revocations_completed.clone()
    }

    /// Successful connects so far
    pub fn connects(&self) -> u32 {
        self.shared.lock().connects
    }

    pub fn leaves(&self) -> u32 {
        self.shared.lock().leaves
    }

    /// Fetch calls so far, empty ones included
    pub fn fetches(&self) -> u64 {
        self.shared.lock().fetches
    }

    /// Wait until the committed offset of `tp` reaches `at_least`
    pub async fn wait_for_commit(&self, tp: &TopicPartition, at_least: i64) {
        self.shared
            .wait_until(None, |s| s.committed.get(tp).filter(|c| **c >= at_least).map(|_| ()))
            .await;
    }

    /// Wait until `n` dead letters were published
    pub async fn wait_for_dead_letters(&self, n: usize) {
        self.shared
            .wait_until(None, |s| (s.dead_letters.len() >= n).then_some(()))
            .await;
    }
}

#[async_trait]
impl Broker for MemoryBroker {
    type Session = MemorySession;

    async fn connect(&self, _group_id: &str, topics: &[String]) -> Result<Arc<MemorySession>, BrokerError> {
        let generation = self.shared.mutate(|s| {
            if s.reject_auth {
                return Err(BrokerError::Authentication("SASL authentication failed".into()));
            }
            if s.fail_connects > 0 {
                s.fail_connects -= 1;
                return Err(BrokerError::Transport("connection refused".into()));
            }

            s.connects += 1;
            s.generation += 1;
            s.subscribed = topics.to_vec();
            s.events.clear();

            let partitions: Vec<TopicPartition> = s
                .logs
                .keys()
                .filter(|tp| topics.contains(&tp.topic))
                .cloned()
                .collect();
            s.events.push_back(GroupEvent::Assigned(Assignment::new(partitions)));
            Ok(s.generation)
        })?;

        Ok(Arc::new(MemorySession {
            shared: self.shared.clone(),
            generation,
            positions: Mutex::new(HashMap::new()),
        }))
    }
}

/// Session handed out by [`MemoryBroker`]
#[derive(Debug)]
pub struct MemorySession {
    shared: Arc<Shared>,
    generation: u64,
    /// Fetch position per partition, reset whenever the partition changes hands
    positions: Mutex<HashMap<TopicPartition, i64>>,
}

impl MemorySession {
    fn positions(&self) -> MutexGuard<'_, HashMap<TopicPartition, i64>> {
        self.positions.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn check_generation(&self, state: &State) -> Result<(), BrokerError> {
        if state.generation == self.generation {
            Ok(())
        } else {
            Err(BrokerError::Transport(format!(
                "session generation {} was fenced by {}",
                self.generation, state.generation
            )))
        }
    }
}

#[async_trait]
impl BrokerSession for MemorySession {
    async fn next_group_event(&self, timeout: Duration) -> Result<Option<GroupEvent>, BrokerError> {
        let deadline = Instant::now() + timeout;
        let polled = self
            .shared
            .wait_until(Some(deadline), |s| match self.check_generation(s) {
                Err(e) => Some(Err(e)),
                Ok(()) => s.events.pop_front().map(Ok),
            })
            .await;

        let Some(event) = polled.transpose()? else {
            return Ok(None);
        };

        let mut positions = self.positions();
        match &event {
            GroupEvent::Assigned(assignment) => {
                let keep: HashSet<&TopicPartition> = assignment.partitions.iter().collect();
                positions.retain(|tp, _| keep.contains(tp));
            }
            GroupEvent::Revoked(partitions) => {
                for tp in partitions {
                    positions.remove(tp);
                }
            }
        }
        Ok(Some(event))
    }

    async fn fetch(&self, tp: &TopicPartition, max: usize, timeout: Duration) -> Result<Vec<BrokerMessage>, BrokerError> {
        {
            let mut s = self.shared.lock();
            self.check_generation(&s)?;
            s.fetches += 1;
            if s.fail_fetches > 0 {
                s.fail_fetches -= 1;
                return Err(BrokerError::Transport("fetch failed: broker connection reset".into()));
            }
        }

        let deadline = Instant::now() + timeout;
        let batch = self
            .shared
            .wait_until(Some(deadline), |s| {
                if let Err(e) = self.check_generation(s) {
                    return Some(Err(e));
                }
                let log = s.logs.get(tp)?;
                let mut positions = self.positions();
                let position = positions
                    .get(tp)
                    .copied()
                    .or_else(|| s.committed.get(tp).copied())
                    .unwrap_or(0);

                let batch: Vec<BrokerMessage> = log
                    .messages
                    .iter()
                    .filter(|m| m.offset >= position)
                    .take(max)
                    .cloned()
                    .collect();
                let last = batch.last()?;
                positions.insert(tp.clone(), last.offset + 1);
                Some(Ok(batch))
            })
            .await;

        batch.unwrap_or_else(|| Ok(Vec::new()))
    }

    async fn commit(&self, tp: &TopicPartition, next_offset: i64) -> Result<(), BrokerError> {
        self.shared.mutate(|s| {
            self.check_generation(s)?;
            s.committed.insert(tp.clone(), next_offset);
            s.commits.push((tp.clone(), next_offset));
            Ok(())
        })
    }

    fn revoke_complete(&self, partitions: &[TopicPartition]) {
        self.shared.mutate(|s| s.revocations_completed.push(partitions.to_vec()));
    }

    async fn publish(&self, letter: &DeadLetter) -> Result<(), BrokerError> {
        self.shared.mutate(|s| {
            if s.fail_publishes > 0 {
                s.fail_publishes -= 1;
                return Err(BrokerError::Transport("dead-letter publish failed".into()));
            }
            s.dead_letters.push(letter.clone());
            Ok(())
        })
    }

    async fn leave(&self) -> Result<(), BrokerError> {
        self.shared.mutate(|s| {
            s.leaves += 1;
            if s.generation == self.generation {
                s.subscribed.clear();
                s.events.clear();
            }
        });
        Ok(())
    }
}
