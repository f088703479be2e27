//! Kafka broker over rdkafka
//!
//! The session owns one `StreamConsumer` and one `FutureProducer` (dead letters).
//! The main queue is polled on a dedicated blocking thread, so rebalance callbacks
//! run there. They are forwarded into a channel that the supervisor drains via
//! [`BrokerSession::next_group_event`]; every assigned partition gets its own split
//! queue so each partition worker fetches independently.
//!
//! A revocation holds the rebalance open: the callback blocks until the supervisor
//! reports the revoked workers drained ([`BrokerSession::revoke_complete`]) or
//! the drain deadline plus a grace period passes.
//!
//! Offsets: auto commit and auto offset store are off, new groups start at the
//! newest offset and every commit is an explicit synchronous partition commit.

use crate::broker::{Assignment, Broker, BrokerMessage, BrokerSession, GroupEvent, TopicPartition};
use crate::dlq::DeadLetter;
use crate::error::BrokerError;
use async_trait::async_trait;
use chrono::DateTime;
use futures::FutureExt;
use rdkafka::config::ClientConfig;
use rdkafka::consumer::{BaseConsumer, CommitMode, Consumer, ConsumerContext, Rebalance, StreamConsumer};
use rdkafka::consumer::stream_consumer::StreamPartitionQueue;
use rdkafka::error::KafkaError;
use rdkafka::message::{Header, Message, OwnedHeaders};
use rdkafka::producer::{FutureProducer, FutureRecord, Producer};
use rdkafka::util::Timeout;
use rdkafka::{ClientContext, Offset, TopicPartitionList};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{RecvTimeoutError, SyncSender, sync_channel};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Connection settings shared by the consumer and the dead-letter producer
#[derive(Debug, Clone)]
pub struct KafkaSettings {
    pub brokers: Vec<String>,
    pub client_id: String,
    /// `plaintext`, `ssl`, `sasl_plaintext` or `sasl_ssl`; derived from the SASL settings when unset
    pub security_protocol: Option<String>,
    pub sasl_mechanism: Option<String>,
    pub sasl_username: Option<String>,
    pub sasl_password: Option<String>,
    /// Bound on the metadata probe made while joining
    pub connect_timeout: Duration,
    /// Bound on a dead-letter publish, including producer queueing
    pub publish_timeout: Duration,
    /// How long revoked partitions may take to drain before the rebalance completes anyway
    pub rebalance_drain_deadline: Duration,
}

impl KafkaSettings {
    pub fn new(brokers: Vec<String>, client_id: impl Into<String>) -> Self {
        Self {
            brokers,
            client_id: client_id.into(),
            security_protocol: None,
            sasl_mechanism: None,
            sasl_username: None,
            sasl_password: None,
            connect_timeout: Duration::from_secs(10),
            publish_timeout: Duration::from_secs(10),
            rebalance_drain_deadline: Duration::from_secs(30),
        }
    }

    /// Base client configuration: bootstrap servers, security protocol and SASL
    pub fn client_config(&self) -> ClientConfig {
        let mut config = ClientConfig::new();
        config
            .set("bootstrap.servers", self.brokers.join(","))
            .set("client.id", &self.client_id);

        let sasl = match (&self.sasl_username, &self.sasl_password) {
            (Some(username), Some(password)) => {
                let mechanism = self.sasl_mechanism.as_deref().unwrap_or("PLAIN");
                info!(sasl_mechanism = mechanism, "Configuring SASL authentication");
                config
                    .set("sasl.mechanism", mechanism)
                    .set("sasl.username", username)
                    .set("sasl.password", password);
                true
            }
            _ => false,
        };

        let protocol = match (&self.security_protocol, sasl) {
            (Some(protocol), _) => protocol.as_str(),
            (None, true) => "sasl_plaintext",
            (None, false) => "plaintext",
        };
        config.set("security.protocol", protocol);
        config
    }
}

/// Extra time the revoke callback waits past the drain deadline, covering the
/// supervisor's own abort of late workers
const REVOKE_ACK_GRACE: Duration = Duration::from_secs(5);

/// What the client callbacks and the poll thread report to the session
#[derive(Debug)]
enum Signal {
    Assigned(Vec<TopicPartition>),
    /// Carries the ack the blocked revoke callback waits on
    Revoked(Vec<TopicPartition>, SyncSender<()>),
    Error(BrokerError),
}

/// Consumer context forwarding rebalances and fatal client errors
pub struct GroupContext {
    signals: mpsc::UnboundedSender<Signal>,
    revoke_wait: Duration,
    /// Set once the session leaves or is dropped; revocations then complete at once
    closing: Arc<AtomicBool>,
}

impl GroupContext {
    /// Forward a revocation and block until it is acknowledged
    fn hold_revocation(&self, revoked: Vec<TopicPartition>) {
        if self.closing.load(Ordering::Acquire) {
            return;
        }
        let (ack, drained) = sync_channel(1);
        if self.signals.send(Signal::Revoked(revoked.clone(), ack)).is_err() {
            return;
        }
        match drained.recv_timeout(self.revoke_wait) {
            Ok(()) => debug!(partitions = ?revoked, "Revoked partitions drained"),
            Err(RecvTimeoutError::Timeout) => warn!(
                partitions = ?revoked,
                wait_ms = self.revoke_wait.as_millis() as u64,
                "Revoked partitions not drained in time, completing rebalance"
            ),
            Err(RecvTimeoutError::Disconnected) => debug!(partitions = ?revoked, "Session closed during revocation"),
        }
    }
}

fn partitions(tpl: &TopicPartitionList) -> Vec<TopicPartition> {
    tpl.elements()
        .iter()
        .map(|e| TopicPartition::new(e.topic(), e.partition()))
        .collect()
}

impl ClientContext for GroupContext {
    fn error(&self, error: KafkaError, reason: &str) {
        let mapped = BrokerError::from(error);
        if mapped.is_recoverable() {
            warn!(error = %mapped, reason, "Kafka client error");
        } else {
            error!(error = %mapped, reason, "Fatal Kafka client error");
            let _ = self.signals.send(Signal::Error(mapped));
        }
    }
}

impl ConsumerContext for GroupContext {
    fn pre_rebalance(&self, _consumer: &BaseConsumer<Self>, rebalance: &Rebalance<'_>) {
        if let Rebalance::Revoke(tpl) = rebalance {
            self.hold_revocation(partitions(tpl));
        }
    }

    fn post_rebalance(&self, _consumer: &BaseConsumer<Self>, rebalance: &Rebalance<'_>) {
        match rebalance {
            Rebalance::Assign(tpl) => {
                let _ = self.signals.send(Signal::Assigned(partitions(tpl)));
            }
            Rebalance::Error(e) => warn!(error = %e, "Rebalance failed"),
            Rebalance::Revoke(_) => {}
        }
    }
}

type GroupConsumer = StreamConsumer<GroupContext>;
type PartitionQueue = StreamPartitionQueue<GroupContext>;
type StrayMessages = HashMap<TopicPartition, VecDeque<BrokerMessage>>;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Poll the main queue on a blocking thread until `stop` fires.
///
/// Rebalance callbacks are served from this poll, so a held revocation blocks
/// this thread and never a runtime worker.
fn spawn_poll_thread(
    consumer: Arc<GroupConsumer>,
    stray: Arc<Mutex<StrayMessages>>,
    signals: mpsc::UnboundedSender<Signal>,
    stop: CancellationToken,
) {
    let runtime = tokio::runtime::Handle::current();
    tokio::task::spawn_blocking(move || {
        loop {
            let received = runtime.block_on(async {
                tokio::select! {
                    biased;
                    _ = stop.cancelled() => None,
                    received = consumer.recv() => Some(received.map(|m| to_message(&m))),
                }
            });
            match received {
                None => break,
                // Only before the partition queue is split
                Some(Ok(message)) => {
                    debug!(partition = %message.topic_partition(), offset = message.offset, "Message on main queue");
                    lock(&stray).entry(message.topic_partition()).or_default().push_back(message);
                }
                Some(Err(e)) => {
                    let _ = signals.send(Signal::Error(e.into()));
                    break;
                }
            }
        }
        debug!("Kafka poll thread stopped");
    });
}

fn to_message<M: Message>(m: &M) -> BrokerMessage {
    BrokerMessage {
        topic: m.topic().to_string(),
        partition: m.partition(),
        offset: m.offset(),
        key: m.key().map(<[u8]>::to_vec),
        value: m.payload().map(<[u8]>::to_vec).unwrap_or_default(),
        timestamp: m.timestamp().to_millis().and_then(DateTime::from_timestamp_millis),
    }
}

/// Kafka-backed [`Broker`]
#[derive(Debug, Clone)]
pub struct KafkaBroker {
    settings: KafkaSettings,
}

impl KafkaBroker {
    pub fn new(settings: KafkaSettings) -> Self {
        Self { settings }
    }
}

#[async_trait]
impl Broker for KafkaBroker {
    type Session = KafkaSession;

    async fn connect(&self, group_id: &str, topics: &[String]) -> Result<Arc<KafkaSession>, BrokerError> {
        let (signals, signal_rx) = mpsc::unbounded_channel();
        let closing = Arc::new(AtomicBool::new(false));
        let context = GroupContext {
            signals: signals.clone(),
            revoke_wait: self.settings.rebalance_drain_deadline + REVOKE_ACK_GRACE,
            closing: closing.clone(),
        };

        let consumer: GroupConsumer = self
            .settings
            .client_config()
            .set("group.id", group_id)
            .set("enable.auto.commit", "false")
            .set("enable.auto.offset.store", "false")
            .set("auto.offset.reset", "latest")
            .set("session.timeout.ms", "30000")
            .set("heartbeat.interval.ms", "3000")
            .set("max.poll.interval.ms", "300000")
            .create_with_context(context)?;
        let consumer = Arc::new(consumer);

        let topic_refs: Vec<&str> = topics.iter().map(String::as_str).collect();
        consumer.subscribe(&topic_refs)?;

        // Unreachable brokers or rejected credentials surface here rather than in the first poll
        let probe = consumer.clone();
        let timeout = self.settings.connect_timeout;
        tokio::task::spawn_blocking(move || probe.fetch_metadata(None, timeout).map(|_| ()))
            .await
            .map_err(|e| BrokerError::Transport(format!("metadata probe failed: {e}")))??;

        let producer: FutureProducer = self
            .settings
            .client_config()
            .set("acks", "all")
            .set("enable.idempotence", "true")
            .set("message.timeout.ms", self.settings.publish_timeout.as_millis().to_string())
            .create()?;

        let stray = Arc::new(Mutex::new(HashMap::new()));
        let poll_stop = CancellationToken::new();
        spawn_poll_thread(consumer.clone(), stray.clone(), signals, poll_stop.clone());

        info!(group_id, topics = ?topics, brokers = ?self.settings.brokers, "Kafka session established");

        Ok(Arc::new(KafkaSession {
            consumer,
            producer,
            signals: tokio::sync::Mutex::new(signal_rx),
            queues: Mutex::new(HashMap::new()),
            stray,
            pending_revoke: Mutex::new(None),
            closing,
            poll_stop,
            publish_timeout: self.settings.publish_timeout,
        }))
    }
}

/// One consumer group membership
pub struct KafkaSession {
    consumer: Arc<GroupConsumer>,
    producer: FutureProducer,
    signals: tokio::sync::Mutex<mpsc::UnboundedReceiver<Signal>>,
    queues: Mutex<HashMap<TopicPartition, Arc<PartitionQueue>>>,
    /// Messages that reached the main queue before their partition queue was split
    stray: Arc<Mutex<StrayMessages>>,
    /// Ack for the revocation the poll thread is holding open
    pending_revoke: Mutex<Option<SyncSender<()>>>,
    closing: Arc<AtomicBool>,
    poll_stop: CancellationToken,
    publish_timeout: Duration,
}

impl KafkaSession {
    fn queues(&self) -> MutexGuard<'_, HashMap<TopicPartition, Arc<PartitionQueue>>> {
        lock(&self.queues)
    }

    fn stray(&self) -> MutexGuard<'_, StrayMessages> {
        lock(&self.stray)
    }

    /// Release a held revocation, if any
    fn release_revocation(&self) {
        if let Some(ack) = lock(&self.pending_revoke).take() {
            let _ = ack.try_send(());
        }
    }

    /// Stop holding revocations and stop the poll thread
    fn close(&self) {
        self.closing.store(true, Ordering::Release);
        self.release_revocation();
        self.poll_stop.cancel();
    }

    fn split_queues(&self, assigned: &[TopicPartition]) {
        let mut queues = self.queues();
        for tp in assigned {
            if queues.contains_key(tp) {
                continue;
            }
            match self.consumer.split_partition_queue(&tp.topic, tp.partition) {
                Some(queue) => {
                    queues.insert(tp.clone(), Arc::new(queue));
                }
                None => warn!(partition = %tp, "Could not split partition queue"),
            }
        }
    }

    fn take_stray(&self, tp: &TopicPartition, max: usize) -> Vec<BrokerMessage> {
        let mut stray = self.stray();
        let Some(pending) = stray.get_mut(tp) else {
            return Vec::new();
        };
        let n = pending.len().min(max);
        pending.drain(..n).collect()
    }
}

#[async_trait]
impl BrokerSession for KafkaSession {
    async fn next_group_event(&self, timeout: Duration) -> Result<Option<GroupEvent>, BrokerError> {
        let mut signals = self.signals.lock().await;

        let signal = match tokio::time::timeout(timeout, signals.recv()).await {
            Err(_) => return Ok(None),
            Ok(signal) => signal,
        };
        match signal {
            Some(Signal::Assigned(assigned)) => {
                self.split_queues(&assigned);
                Ok(Some(GroupEvent::Assigned(Assignment::new(assigned))))
            }
            Some(Signal::Revoked(revoked, ack)) => {
                let mut stray = self.stray();
                for tp in &revoked {
                    stray.remove(tp);
                }
                // A newer revocation supersedes an unacknowledged one
                if let Some(previous) = lock(&self.pending_revoke).replace(ack) {
                    let _ = previous.try_send(());
                }
                Ok(Some(GroupEvent::Revoked(revoked)))
            }
            Some(Signal::Error(e)) => Err(e),
            None => Err(BrokerError::Transport("rebalance channel closed".into())),
        }
    }

    fn revoke_complete(&self, partitions: &[TopicPartition]) {
        {
            let mut queues = self.queues();
            for tp in partitions {
                queues.remove(tp);
            }
        }
        self.release_revocation();
    }

    async fn fetch(&self, tp: &TopicPartition, max: usize, timeout: Duration) -> Result<Vec<BrokerMessage>, BrokerError> {
        let stray = self.take_stray(tp, max);
        if !stray.is_empty() {
            return Ok(stray);
        }

        let queue = self.queues().get(tp).cloned();
        let Some(queue) = queue else {
            tokio::time::sleep(timeout).await;
            return Ok(Vec::new());
        };

        let first = match tokio::time::timeout(timeout, queue.recv()).await {
            Err(_) => return Ok(Vec::new()),
            Ok(received) => to_message(&received?),
        };

        let mut batch = vec![first];
        while batch.len() < max {
            match queue.recv().now_or_never() {
                Some(Ok(m)) => batch.push(to_message(&m)),
                Some(Err(e)) => {
                    warn!(partition = %tp, error = %e, "Fetch error after partial batch");
                    break;
                }
                None => break,
            }
        }
        Ok(batch)
    }

    async fn commit(&self, tp: &TopicPartition, next_offset: i64) -> Result<(), BrokerError> {
        let mut tpl = TopicPartitionList::new();
        tpl.add_partition_offset(&tp.topic, tp.partition, Offset::Offset(next_offset))?;

        let consumer = self.consumer.clone();
        tokio::task::spawn_blocking(move || consumer.commit(&tpl, CommitMode::Sync))
            .await
            .map_err(|e| BrokerError::Transport(format!("commit task failed: {e}")))??;
        Ok(())
    }

    async fn publish(&self, letter: &DeadLetter) -> Result<(), BrokerError> {
        let headers = letter
            .headers()
            .into_iter()
            .fold(OwnedHeaders::new(), |headers, (key, value)| {
                headers.insert(Header {
                    key,
                    value: Some(value.as_str()),
                })
            });

        let mut record = FutureRecord::<[u8], [u8]>::to(&letter.topic)
            .payload(&letter.value[..])
            .headers(headers);
        if let Some(key) = &letter.key {
            record = record.key(&key[..]);
        }

        self.producer
            .send(record, Timeout::After(self.publish_timeout))
            .await
            .map(|_| ())
            .map_err(|(e, _)| e.into())
    }

    async fn leave(&self) -> Result<(), BrokerError> {
        self.close();
        self.consumer.unsubscribe();

        let producer = self.producer.clone();
        let timeout = self.publish_timeout;
        tokio::task::spawn_blocking(move || producer.flush(Timeout::After(timeout)))
            .await
            .map_err(|e| BrokerError::Transport(format!("producer flush failed: {e}")))??;
        info!("Left consumer group");
        Ok(())
    }
}

impl Drop for KafkaSession {
    fn drop(&mut self) {
        self.close();
    }
}
