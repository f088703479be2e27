//! Consumer supervisor
//!
//! Owns group membership. Joins through a [`Broker`], spawns one
//! [`PartitionWorker`] task per assigned partition, drains workers on revocation
//! and reconnects with backoff when the session breaks.
//!
//! ```text
//! Disconnected -> Joining -> Assigned <-> Rebalancing
//!                               |
//!                            Leaving -> Disconnected
//! ```

use crate::broker::{Broker, BrokerSession, GroupEvent, TopicPartition};
use crate::config::WorkerConfig;
use crate::error::{BrokerError, WorkerError};
use crate::metrics::PipelineMetrics;
use crate::worker::{MessageProcessor, PartitionWorker, WorkerState};
use std::collections::HashMap;
use std::sync::Arc;
use strum::{AsRefStr, Display, EnumString};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, error, info, info_span, warn};

/// Group membership state of the supervisor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, AsRefStr, EnumString)]
#[strum(serialize_all = "snake_case")]
pub enum SupervisorState {
    Disconnected,
    Joining,
    Assigned,
    Rebalancing,
    Leaving,
}

impl SupervisorState {
    /// Readiness probes only pass while partitions are being consumed
    pub fn is_ready(&self) -> bool {
        matches!(self, SupervisorState::Assigned)
    }
}

type WorkerExit = (TopicPartition, u64, Result<(), WorkerError>);

struct WorkerHandle {
    id: u64,
    cancel: CancellationToken,
    join: JoinHandle<()>,
    state: watch::Receiver<WorkerState>,
}

/// Runs partition workers for one consumer group
pub struct Supervisor<B: Broker, P: MessageProcessor + ?Sized> {
    broker: B,
    processor: Arc<P>,
    config: WorkerConfig,
    metrics: PipelineMetrics,
    state: watch::Sender<SupervisorState>,
    worker_states: watch::Sender<HashMap<TopicPartition, watch::Receiver<WorkerState>>>,
}

impl<B: Broker, P: MessageProcessor + ?Sized> Supervisor<B, P> {
    pub fn new(broker: B, processor: Arc<P>, config: WorkerConfig, metrics: PipelineMetrics) -> Self {
        let (state, _) = watch::channel(SupervisorState::Disconnected);
        let (worker_states, _) = watch::channel(HashMap::new());
        Self {
            broker,
            processor,
            config,
            metrics,
            state,
            worker_states,
        }
    }

    /// Observe membership state
    pub fn state(&self) -> watch::Receiver<SupervisorState> {
        self.state.subscribe()
    }

    /// Observe the state of every live worker, keyed by partition
    pub fn workers(&self) -> watch::Receiver<HashMap<TopicPartition, watch::Receiver<WorkerState>>> {
        self.worker_states.subscribe()
    }

    pub fn config(&self) -> &WorkerConfig {
        &self.config
    }

    /// Run until `cancel` fires (returns `Ok`) or an unrecoverable error occurs.
    pub async fn run(&self, cancel: CancellationToken) -> Result<(), WorkerError> {
        self.config.validate()?;

        info!(
            group_id = %self.config.group_id,
            topics = ?self.config.topics,
            dlq_topic = ?self.config.dlq_topic,
            processor = self.processor.name(),
            "Starting consumer supervisor"
        );

        let result = self.reconnect_loop(&cancel).await;
        self.set_state(SupervisorState::Disconnected);

        match result {
            Err(WorkerError::Cancelled) => Ok(()),
            other => other,
        }
    }

    async fn reconnect_loop(&self, cancel: &CancellationToken) -> Result<(), WorkerError> {
        let mut failures: u32 = 0;

        loop {
            self.set_state(SupervisorState::Joining);
            let connected = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(WorkerError::Cancelled),
                connected = self.broker.connect(&self.config.group_id, &self.config.topics) => connected,
            };

            let last_error = match connected {
                Ok(session) => {
                    info!(group_id = %self.config.group_id, "Joined consumer group");
                    failures = 0;
                    match self.run_session(session, cancel).await {
                        Err(WorkerError::Broker(e)) if e.is_recoverable() => {
                            warn!(error = %e, "Broker session lost, reconnecting");
                            e
                        }
                        other => return other,
                    }
                }
                Err(e) if e.is_recoverable() => {
                    warn!(error = %e, attempt = failures + 1, "Failed to join consumer group");
                    e
                }
                Err(e) => {
                    error!(error = %e, "Broker rejected the consumer");
                    return Err(e.into());
                }
            };

            self.set_state(SupervisorState::Disconnected);
            failures = failures.saturating_add(1);

            if let Some(max) = self.config.max_connect_retries
                && failures > max
            {
                if failures == max + 1 {
                    error!(
                        attempts = failures,
                        error = %last_error,
                        "FATAL: broker connect retries exhausted"
                    );
                }
                if self.config.exit_on_connect_exhausted {
                    return Err(BrokerError::ConnectRetriesExhausted {
                        attempts: failures,
                        last: last_error.to_string(),
                    }
                    .into());
                }
            }

            let delay = self.config.reconnect_backoff.delay(failures);
            debug!(delay_ms = delay.as_millis() as u64, "Waiting before reconnect");
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(WorkerError::Cancelled),
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }

    /// Serve one group session. `Ok` only after leaving on cancellation.
    async fn run_session(&self, session: Arc<B::Session>, cancel: &CancellationToken) -> Result<(), WorkerError> {
        let session_cancel = cancel.child_token();
        let (exit_tx, mut exit_rx) = mpsc::unbounded_channel::<WorkerExit>();
        let mut workers: HashMap<TopicPartition, WorkerHandle> = HashMap::new();
        let mut next_id: u64 = 0;

        let failure = loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    self.set_state(SupervisorState::Leaving);
                    info!(partitions = workers.len(), "Leaving consumer group");
                    self.drain(&mut workers, None).await;
                    if let Err(e) = session.leave().await {
                        warn!(error = %e, "Failed to leave consumer group cleanly");
                    }
                    return Ok(());
                }
                Some((tp, id, result)) = exit_rx.recv() => {
                    let owner = workers.get(&tp).is_some_and(|w| w.id == id);
                    if owner {
                        workers.remove(&tp);
                        self.publish_workers(&workers);
                    }
                    match result {
                        Ok(()) | Err(WorkerError::Cancelled) => {
                            debug!(partition = %tp, "Worker exited");
                        }
                        Err(e) if owner || !matches!(e, WorkerError::Broker(_)) => break e,
                        // Its uncommitted offset goes to the partition's next owner
                        Err(e) => warn!(partition = %tp, error = %e, "Retired worker failed after release"),
                    }
                }
                event = session.next_group_event(self.config.fetch_timeout) => match event {
                    Ok(None) => {}
                    Ok(Some(GroupEvent::Assigned(assignment))) => {
                        if !workers.is_empty() {
                            self.set_state(SupervisorState::Rebalancing);
                        }
                        let released: Vec<TopicPartition> = workers
                            .keys()
                            .filter(|tp| !assignment.contains(tp))
                            .cloned()
                            .collect();
                        self.drain(&mut workers, Some(&released)).await;

                        for tp in &assignment.partitions {
                            if !workers.contains_key(tp) {
                                next_id += 1;
                                let handle = self.spawn_worker(tp.clone(), next_id, &session, &session_cancel, &exit_tx);
                                workers.insert(tp.clone(), handle);
                            }
                        }
                        self.publish_workers(&workers);
                        self.set_state(SupervisorState::Assigned);
                        info!(
                            token = %assignment.token,
                            partitions = assignment.partitions.len(),
                            "Partitions assigned"
                        );
                    }
                    Ok(Some(GroupEvent::Revoked(partitions))) => {
                        self.set_state(SupervisorState::Rebalancing);
                        info!(partitions = ?partitions, "Partitions revoked");
                        self.drain(&mut workers, Some(&partitions)).await;
                        self.publish_workers(&workers);
                        session.revoke_complete(&partitions);
                    }
                    Err(e) => break e.into(),
                },
            }
        };

        session_cancel.cancel();
        self.drain(&mut workers, None).await;
        self.publish_workers(&workers);
        Err(failure)
    }

    fn spawn_worker(
        &self,
        tp: TopicPartition,
        id: u64,
        session: &Arc<B::Session>,
        session_cancel: &CancellationToken,
        exit_tx: &mpsc::UnboundedSender<WorkerExit>,
    ) -> WorkerHandle {
        let cancel = session_cancel.child_token();
        let worker = PartitionWorker::new(
            tp.clone(),
            session.clone(),
            self.processor.clone(),
            self.config.clone(),
            self.metrics.clone(),
        );
        let state = worker.state();
        let span = info_span!("partition_worker", topic = %tp.topic, partition = tp.partition);
        let exit_tx = exit_tx.clone();
        let token = cancel.clone();

        let join = tokio::spawn(
            async move {
                let result = worker.run(token).await;
                let _ = exit_tx.send((tp, id, result));
            }
            .instrument(span),
        );

        WorkerHandle { id, cancel, join, state }
    }

    /// Cancel and await the selected workers (all when `only` is None); abort those
    /// still running at the drain deadline.
    async fn drain(&self, workers: &mut HashMap<TopicPartition, WorkerHandle>, only: Option<&[TopicPartition]>) {
        let selected: Vec<TopicPartition> = match only {
            Some(partitions) => partitions.iter().filter(|tp| workers.contains_key(tp)).cloned().collect(),
            None => workers.keys().cloned().collect(),
        };
        if selected.is_empty() {
            return;
        }

        let mut handles: Vec<(TopicPartition, WorkerHandle)> = selected
            .into_iter()
            .filter_map(|tp| workers.remove(&tp).map(|h| (tp, h)))
            .collect();

        for (_, handle) in &handles {
            handle.cancel.cancel();
        }

        let joined = tokio::time::timeout(
            self.config.drain_deadline,
            futures::future::join_all(handles.iter_mut().map(|(_, h)| &mut h.join)),
        )
        .await;

        if joined.is_err() {
            for (tp, handle) in &handles {
                if !handle.join.is_finished() {
                    let state = *handle.state.borrow();
                    warn!(
                        partition = %tp,
                        state = %state,
                        deadline_ms = self.config.drain_deadline.as_millis() as u64,
                        "Worker missed the drain deadline, aborting"
                    );
                    handle.join.abort();
                }
            }
        }
        debug!(drained = handles.len(), "Workers drained");
    }

    fn set_state(&self, next: SupervisorState) {
        let previous = self.state.send_replace(next);
        if previous != next {
            debug!(from = %previous, to = %next, "Supervisor state changed");
        }
    }

    fn publish_workers(&self, workers: &HashMap<TopicPartition, WorkerHandle>) {
        self.worker_states.send_replace(
            workers
                .iter()
                .map(|(tp, handle)| (tp.clone(), handle.state.clone()))
                .collect(),
        );
    }
}
