//! Partition worker
//!
//! One worker drives one partition: fetch a batch, hand each message to the
//! [`MessageProcessor`], apply the retry policy, commit `offset + 1` after every
//! handled message. At most one message is in flight per worker.

use crate::broker::{BrokerMessage, BrokerSession, TopicPartition};
use crate::config::WorkerConfig;
use crate::dlq::{DeadLetter, DlqReason};
use crate::error::{BrokerError, ProcessingError, WorkerError};
use crate::metrics::PipelineMetrics;
use crate::retry::Action;
use async_trait::async_trait;
use std::sync::Arc;
use strum::{AsRefStr, Display, EnumString};
use tokio::sync::watch;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

/// Handles one message.
///
/// Errors carry an [`ErrorCategory`](crate::ErrorCategory) that drives the retry policy.
#[async_trait]
pub trait MessageProcessor: Send + Sync + 'static {
    async fn process(&self, message: &BrokerMessage) -> Result<(), ProcessingError>;

    /// Processor name for logs
    fn name(&self) -> &'static str;
}

/// Lifecycle of a partition worker
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, AsRefStr, EnumString)]
#[strum(serialize_all = "snake_case")]
pub enum WorkerState {
    /// Created, not yet started
    Idle,
    /// Fetching and handling messages
    Running,
    /// Cancellation observed, finishing the current message
    Draining,
    /// Terminal
    Stopped,
}

/// Delivery attempts for the message currently in flight
#[derive(Debug, Clone)]
pub struct AttemptRecord {
    pub offset: i64,
    pub attempts: u32,
    pub first_seen: Instant,
    pub last_error: Option<String>,
}

impl AttemptRecord {
    fn new(offset: i64) -> Self {
        Self {
            offset,
            attempts: 0,
            first_seen: Instant::now(),
            last_error: None,
        }
    }
}

/// Drives a single partition
pub struct PartitionWorker<S: BrokerSession, P: MessageProcessor + ?Sized> {
    partition: TopicPartition,
    session: Arc<S>,
    processor: Arc<P>,
    config: WorkerConfig,
    metrics: PipelineMetrics,
    state: watch::Sender<WorkerState>,
    /// Next offset to handle, known once something was committed
    committed: Option<i64>,
}

impl<S: BrokerSession, P: MessageProcessor + ?Sized> PartitionWorker<S, P> {
    pub fn new(
        partition: TopicPartition,
        session: Arc<S>,
        processor: Arc<P>,
        config: WorkerConfig,
        metrics: PipelineMetrics,
    ) -> Self {
        let (state, _) = watch::channel(WorkerState::Idle);
        Self {
            partition,
            session,
            processor,
            config,
            metrics,
            state,
            committed: None,
        }
    }

    /// Observe the worker state
    pub fn state(&self) -> watch::Receiver<WorkerState> {
        self.state.subscribe()
    }

    /// Run until cancelled or until a broker or fatal processing error.
    ///
    /// Cancellation is a clean stop: everything handled so far is already committed.
    pub async fn run(mut self, cancel: CancellationToken) -> Result<(), WorkerError> {
        self.state.send_replace(WorkerState::Running);
        info!(
            partition = %self.partition,
            processor = self.processor.name(),
            "Partition worker started"
        );

        let result = self.run_loop(&cancel).await;
        self.state.send_replace(WorkerState::Stopped);

        match result {
            Err(WorkerError::Cancelled) => {
                info!(partition = %self.partition, committed = ?self.committed, "Partition worker stopped");
                Ok(())
            }
            Err(e) => {
                error!(partition = %self.partition, error = %e, "Partition worker failed");
                Err(e)
            }
            Ok(()) => Ok(()),
        }
    }

    async fn run_loop(&mut self, cancel: &CancellationToken) -> Result<(), WorkerError> {
        loop {
            let batch = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(self.draining()),
                batch = self.session.fetch(&self.partition, self.config.batch_size, self.config.fetch_timeout) => batch?,
            };

            if batch.is_empty() {
                trace!(partition = %self.partition, "Idle tick");
                continue;
            }

            for message in batch {
                if cancel.is_cancelled() {
                    return Err(self.draining());
                }
                if let Some(next) = self.committed
                    && message.offset < next
                {
                    debug!(partition = %self.partition, offset = message.offset, next, "Ignoring already committed offset");
                    continue;
                }
                self.handle(&message, cancel).await?;
            }
        }
    }

    /// Deliver one message until it reaches a terminal action
    async fn handle(&mut self, message: &BrokerMessage, cancel: &CancellationToken) -> Result<(), WorkerError> {
        let mut record = AttemptRecord::new(message.offset);

        loop {
            record.attempts += 1;
            let outcome = match tokio::time::timeout(self.config.handler_timeout, self.processor.process(message)).await {
                Ok(outcome) => outcome,
                Err(_) => Err(ProcessingError::transient(format!(
                    "processor did not finish within {:?}",
                    self.config.handler_timeout
                ))),
            };

            let err = match outcome {
                Ok(()) => {
                    self.metrics.delivered(&message.topic);
                    info!(
                        partition = %self.partition,
                        offset = message.offset,
                        attempts = record.attempts,
                        "Message delivered"
                    );
                    return self.commit(message).await;
                }
                Err(err) => err,
            };

            let category = err.category();
            record.last_error = Some(err.message.clone());

            let Some(action) = self.config.retry.decide(category, record.attempts) else {
                error!(
                    partition = %self.partition,
                    offset = message.offset,
                    error = %err,
                    "Fatal processing error, stopping worker"
                );
                return Err(WorkerError::Config(err.message));
            };

            match action {
                Action::Retry(delay) => {
                    self.metrics.transient_retry(&message.topic);
                    warn!(
                        partition = %self.partition,
                        offset = message.offset,
                        attempt = record.attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %err.message,
                        "Transient failure, backing off"
                    );
                    tokio::select! {
                        biased;
                        _ = cancel.cancelled() => {
                            info!(
                                partition = %self.partition,
                                offset = message.offset,
                                "Cancelled during backoff, leaving message uncommitted"
                            );
                            return Err(self.draining());
                        }
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
                Action::Skip => {
                    self.skip(message, &record, category.as_str());
                    return self.commit(message).await;
                }
                Action::Park(reason) => {
                    self.park(message, &record, reason).await?;
                    return self.commit(message).await;
                }
            }
        }
    }

    fn skip(&self, message: &BrokerMessage, record: &AttemptRecord, category: &'static str) {
        self.metrics.permanent_skip(&message.topic, category);
        error!(
            partition = %self.partition,
            offset = message.offset,
            category,
            attempts = record.attempts,
            error = record.last_error.as_deref().unwrap_or_default(),
            "Skipping message"
        );
    }

    async fn park(&self, message: &BrokerMessage, record: &AttemptRecord, reason: DlqReason) -> Result<(), WorkerError> {
        let Some(topic) = self.config.dlq_topic.as_deref() else {
            warn!(
                partition = %self.partition,
                offset = message.offset,
                reason = %reason,
                "No dead-letter topic configured, skipping instead of parking"
            );
            self.skip(message, record, reason.into());
            return Ok(());
        };

        let letter = DeadLetter::from_message(topic, message, reason);
        tokio::time::timeout(self.config.commit_timeout, self.session.publish(&letter))
            .await
            .map_err(|_| BrokerError::Timeout("dead-letter publish"))??;

        self.metrics.parked(&message.topic, reason.as_ref());
        error!(
            partition = %self.partition,
            offset = message.offset,
            reason = %reason,
            dlq_topic = topic,
            attempts = record.attempts,
            elapsed_ms = record.first_seen.elapsed().as_millis() as u64,
            error = record.last_error.as_deref().unwrap_or_default(),
            "Message parked"
        );
        Ok(())
    }

    /// Commit past `message`; not interruptible so progress is never lost on shutdown
    async fn commit(&mut self, message: &BrokerMessage) -> Result<(), WorkerError> {
        let next = message.offset + 1;
        tokio::time::timeout(self.config.commit_timeout, self.session.commit(&self.partition, next))
            .await
            .map_err(|_| BrokerError::Timeout("offset commit"))??;
        self.committed = Some(next);
        trace!(partition = %self.partition, next, "Offset committed");
        Ok(())
    }

    fn draining(&self) -> WorkerError {
        self.state.send_replace(WorkerState::Draining);
        WorkerError::Cancelled
    }
}
