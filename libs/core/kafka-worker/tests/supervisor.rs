//! Consumer supervisor: membership, rebalancing, reconnects and shutdown

mod common;

use common::{ScriptedProcessor, eventually, within};
use kafka_worker::{
    Backoff, BrokerError, MemoryBroker, PipelineMetrics, ProcessingError, Supervisor, SupervisorState,
    TopicPartition, WorkerConfig, WorkerError, WorkerState,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

const TOPIC: &str = "email-service-topic-merchant-create";

fn tp(partition: i32) -> TopicPartition {
    TopicPartition::new(TOPIC, partition)
}

fn config() -> WorkerConfig {
    WorkerConfig::new("email-service-group", vec![TOPIC.to_string()])
        .with_dlq_topic(Some("email-service-dlq".to_string()))
}

type Running = (
    Arc<Supervisor<MemoryBroker, ScriptedProcessor>>,
    CancellationToken,
    JoinHandle<Result<(), WorkerError>>,
);

fn spawn(broker: &MemoryBroker, processor: Arc<ScriptedProcessor>, config: WorkerConfig) -> Running {
    let supervisor = Arc::new(Supervisor::new(broker.clone(), processor, config, PipelineMetrics::new()));
    let cancel = CancellationToken::new();
    let handle = tokio::spawn({
        let supervisor = supervisor.clone();
        let cancel = cancel.clone();
        async move { supervisor.run(cancel).await }
    });
    (supervisor, cancel, handle)
}

#[tokio::test(start_paused = true)]
async fn test_one_worker_per_assigned_partition() {
    let broker = MemoryBroker::new();
    broker.create_topic(TOPIC, 3);
    for p in 0..3 {
        broker.produce(TOPIC, p, "a");
        broker.produce(TOPIC, p, "b");
    }

    let processor = Arc::new(ScriptedProcessor::new());
    let (supervisor, cancel, handle) = spawn(&broker, processor.clone(), config());

    for p in 0..3 {
        within(Duration::from_secs(10), broker.wait_for_commit(&tp(p), 2)).await;
    }
    assert_eq!(*supervisor.state().borrow(), SupervisorState::Assigned);
    assert_eq!(supervisor.workers().borrow().len(), 3);
    assert_eq!(processor.calls(), 6);

    cancel.cancel();
    within(Duration::from_secs(30), handle).await.unwrap().unwrap();
    assert_eq!(*supervisor.state().borrow(), SupervisorState::Disconnected);
}

#[tokio::test(start_paused = true)]
async fn test_graceful_shutdown_commits_and_leaves() {
    let broker = MemoryBroker::new();
    broker.create_topic(TOPIC, 3);
    for p in 0..3 {
        broker.produce(TOPIC, p, "in-flight");
    }

    let processor = Arc::new(ScriptedProcessor::new().slow(Duration::from_millis(400)));
    let (supervisor, cancel, handle) = spawn(&broker, processor.clone(), config());

    eventually(|| processor.calls() == 3).await;
    cancel.cancel();
    let stopped_at = tokio::time::Instant::now();
    let fetches_at_cancel = broker.fetches();

    within(Duration::from_secs(30), handle).await.unwrap().unwrap();

    // every in-flight message finished and was committed
    for p in 0..3 {
        assert_eq!(broker.committed(&tp(p)), Some(1));
    }
    assert!(stopped_at.elapsed() < Duration::from_secs(1));
    assert_eq!(broker.fetches(), fetches_at_cancel);
    assert_eq!(broker.leaves(), 1);
    assert_eq!(*supervisor.state().borrow(), SupervisorState::Disconnected);
}

#[tokio::test(start_paused = true)]
async fn test_revocation_mid_backoff_stops_worker_without_redelivering_committed() {
    let broker = MemoryBroker::new();
    broker.produce(TOPIC, 0, "delivered");
    broker.produce(TOPIC, 0, "flaky");

    let processor = Arc::new(ScriptedProcessor::with_outcomes(vec![
        Ok(()),
        Err(ProcessingError::transient("connection refused")),
    ]));
    let (supervisor, cancel, handle) = spawn(&broker, processor.clone(), config());

    within(Duration::from_secs(10), broker.wait_for_commit(&tp(0), 1)).await;
    eventually(|| processor.calls() == 2).await;

    let mut worker_state = supervisor.workers().borrow().get(&tp(0)).cloned().unwrap();
    broker.revoke(vec![tp(0)]);
    within(Duration::from_secs(30), worker_state.wait_for(|s| *s == WorkerState::Stopped))
        .await
        .unwrap();
    assert_eq!(broker.committed(&tp(0)), Some(1));
    assert_eq!(*supervisor.state().borrow(), SupervisorState::Rebalancing);

    // the next owner resumes from the committed offset
    broker.assign(vec![tp(0)]);
    within(Duration::from_secs(10), broker.wait_for_commit(&tp(0), 2)).await;
    assert_eq!(processor.offsets(), vec![0, 1, 1]);
    assert_eq!(*supervisor.state().borrow(), SupervisorState::Assigned);

    cancel.cancel();
    within(Duration::from_secs(30), handle).await.unwrap().unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_reassignment_drains_partitions_no_longer_owned() {
    let broker = MemoryBroker::new();
    broker.create_topic(TOPIC, 2);

    let processor = Arc::new(ScriptedProcessor::new());
    let (supervisor, cancel, handle) = spawn(&broker, processor, config());

    let mut workers = supervisor.workers();
    within(Duration::from_secs(10), workers.wait_for(|w| w.len() == 2)).await.unwrap();

    broker.assign(vec![tp(1)]);
    within(Duration::from_secs(40), workers.wait_for(|w| w.len() == 1 && w.contains_key(&tp(1))))
        .await
        .unwrap();

    cancel.cancel();
    within(Duration::from_secs(30), handle).await.unwrap().unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_revocation_completes_only_after_worker_drained() {
    let broker = MemoryBroker::new();
    broker.produce(TOPIC, 0, "in-flight");

    let processor = Arc::new(ScriptedProcessor::new().slow(Duration::from_secs(2)));
    let (_supervisor, cancel, handle) = spawn(&broker, processor.clone(), config());

    eventually(|| processor.calls() == 1).await;
    broker.revoke(vec![tp(0)]);

    tokio::time::sleep(Duration::from_secs(1)).await;
    assert!(broker.revocations_completed().is_empty());
    assert_eq!(broker.committed(&tp(0)), None);

    within(Duration::from_secs(10), eventually(|| !broker.revocations_completed().is_empty())).await;
    assert_eq!(broker.committed(&tp(0)), Some(1));
    assert_eq!(broker.revocations_completed(), vec![vec![tp(0)]]);

    cancel.cancel();
    within(Duration::from_secs(30), handle).await.unwrap().unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_retired_worker_failure_keeps_session() {
    let broker = MemoryBroker::new();
    broker.create_topic(TOPIC, 2);
    broker.produce(TOPIC, 0, "rejected");
    broker.fail_next_publishes(1);

    let processor = Arc::new(
        ScriptedProcessor::failing_with(ProcessingError::permanent("550 no such user")).slow(Duration::from_secs(2)),
    );
    let (supervisor, cancel, handle) = spawn(&broker, processor.clone(), config());

    eventually(|| processor.calls() == 1).await;
    // the revoked worker finishes its message, then its dead-letter publish fails
    broker.revoke(vec![tp(0)]);
    tokio::time::sleep(Duration::from_secs(10)).await;

    assert_eq!(broker.connects(), 1);
    assert_eq!(broker.committed(&tp(0)), None);
    assert_eq!(broker.revocations_completed(), vec![vec![tp(0)]]);
    let workers = supervisor.workers().borrow().clone();
    assert_eq!(workers.len(), 1);
    assert!(workers.contains_key(&tp(1)));

    // the partition still owned keeps consuming on the same session
    broker.produce(TOPIC, 1, "rejected-too");
    within(Duration::from_secs(30), broker.wait_for_commit(&tp(1), 1)).await;
    assert_eq!(broker.dead_letters().len(), 1);
    assert_eq!(broker.connects(), 1);

    cancel.cancel();
    within(Duration::from_secs(30), handle).await.unwrap().unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_worker_past_drain_deadline_is_aborted() {
    let broker = MemoryBroker::new();
    broker.produce(TOPIC, 0, "stuck");

    let processor = Arc::new(ScriptedProcessor::new().slow(Duration::from_secs(10)));
    let config = config().with_drain_deadline(Duration::from_secs(1));
    let (supervisor, cancel, handle) = spawn(&broker, processor.clone(), config);

    eventually(|| processor.calls() == 1).await;
    let revoked_at = tokio::time::Instant::now();
    broker.revoke(vec![tp(0)]);

    within(Duration::from_secs(5), eventually(|| !broker.revocations_completed().is_empty())).await;
    let elapsed = revoked_at.elapsed();
    assert!(elapsed >= Duration::from_secs(1) && elapsed < Duration::from_secs(2), "{elapsed:?}");
    assert_eq!(broker.committed(&tp(0)), None);
    assert!(supervisor.workers().borrow().is_empty());

    // the aborted message goes to the next owner
    broker.assign(vec![tp(0)]);
    within(Duration::from_secs(30), broker.wait_for_commit(&tp(0), 1)).await;
    assert_eq!(processor.offsets(), vec![0, 0]);

    cancel.cancel();
    within(Duration::from_secs(30), handle).await.unwrap().unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_reconnects_after_connect_failures() {
    let broker = MemoryBroker::new();
    broker.produce(TOPIC, 0, "a");
    broker.fail_next_connects(3);

    let processor = Arc::new(ScriptedProcessor::new());
    let (_supervisor, cancel, handle) = spawn(&broker, processor, config());

    within(Duration::from_secs(60), broker.wait_for_commit(&tp(0), 1)).await;
    assert_eq!(broker.connects(), 1);

    cancel.cancel();
    within(Duration::from_secs(30), handle).await.unwrap().unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_fetch_failure_rebuilds_session() {
    let broker = MemoryBroker::new();
    broker.create_topic(TOPIC, 1);
    broker.fail_next_fetches(1);

    let processor = Arc::new(ScriptedProcessor::new());
    let (_supervisor, cancel, handle) = spawn(&broker, processor, config());

    eventually(|| broker.connects() == 2).await;
    broker.produce(TOPIC, 0, "after-reconnect");
    within(Duration::from_secs(30), broker.wait_for_commit(&tp(0), 1)).await;

    cancel.cancel();
    within(Duration::from_secs(30), handle).await.unwrap().unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_failed_dead_letter_publish_redelivers_after_reconnect() {
    let broker = MemoryBroker::new();
    broker.produce(TOPIC, 0, "rejected");
    broker.fail_next_publishes(1);

    let processor = Arc::new(ScriptedProcessor::failing_with(ProcessingError::permanent("550 no such user")));
    let (_supervisor, cancel, handle) = spawn(&broker, processor.clone(), config());

    within(Duration::from_secs(60), broker.wait_for_commit(&tp(0), 1)).await;
    assert_eq!(processor.offsets(), vec![0, 0]);
    assert_eq!(broker.dead_letters().len(), 1);
    assert_eq!(broker.connects(), 2);

    cancel.cancel();
    within(Duration::from_secs(30), handle).await.unwrap().unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_authentication_failure_is_fatal() {
    let broker = MemoryBroker::new();
    broker.reject_authentication();

    let processor = Arc::new(ScriptedProcessor::new());
    let (supervisor, _cancel, handle) = spawn(&broker, processor, config());

    let result = within(Duration::from_secs(10), handle).await.unwrap();
    assert!(matches!(result, Err(WorkerError::Broker(BrokerError::Authentication(_)))));
    assert_eq!(*supervisor.state().borrow(), SupervisorState::Disconnected);
}

#[tokio::test(start_paused = true)]
async fn test_invalid_configuration_is_fatal() {
    let broker = MemoryBroker::new();
    let processor = Arc::new(ScriptedProcessor::new());

    let (_, _, handle) = spawn(&broker, processor.clone(), WorkerConfig::new("email-service-group", vec![]));
    assert!(matches!(handle.await.unwrap(), Err(WorkerError::Config(_))));

    let (_, _, handle) = spawn(&broker, processor, WorkerConfig::new("bad group!", vec![TOPIC.into()]));
    assert!(matches!(handle.await.unwrap(), Err(WorkerError::Config(_))));
    assert_eq!(broker.connects(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_fatal_processing_error_stops_supervisor() {
    let broker = MemoryBroker::new();
    broker.produce(TOPIC, 0, "a");

    let processor = Arc::new(ScriptedProcessor::failing_with(ProcessingError::fatal(
        "server does not advertise AUTH PLAIN",
    )));
    let (_, _, handle) = spawn(&broker, processor, config());

    let result = within(Duration::from_secs(10), handle).await.unwrap();
    assert!(matches!(result, Err(WorkerError::Config(_))));
    assert_eq!(broker.committed(&tp(0)), None);
}

#[tokio::test(start_paused = true)]
async fn test_connect_retries_exhausted_when_opted_in() {
    let broker = MemoryBroker::new();
    broker.fail_next_connects(u32::MAX);

    let processor = Arc::new(ScriptedProcessor::new());
    let config = config()
        .with_reconnect_backoff(Backoff::new(Duration::from_millis(100), Duration::from_secs(1)))
        .with_max_connect_retries(Some(2), true);
    let (_, _, handle) = spawn(&broker, processor, config);

    let result = within(Duration::from_secs(30), handle).await.unwrap();
    assert!(matches!(
        result,
        Err(WorkerError::Broker(BrokerError::ConnectRetriesExhausted { attempts: 3, .. }))
    ));
}

#[tokio::test(start_paused = true)]
async fn test_connect_retries_exhausted_keeps_retrying_by_default() {
    let broker = MemoryBroker::new();
    broker.produce(TOPIC, 0, "a");
    broker.fail_next_connects(5);

    let processor = Arc::new(ScriptedProcessor::new());
    let config = config()
        .with_reconnect_backoff(Backoff::new(Duration::from_millis(100), Duration::from_secs(1)))
        .with_max_connect_retries(Some(2), false);
    let (_, cancel, handle) = spawn(&broker, processor, config);

    within(Duration::from_secs(30), broker.wait_for_commit(&tp(0), 1)).await;

    cancel.cancel();
    within(Duration::from_secs(30), handle).await.unwrap().unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_cancel_while_disconnected_returns_cleanly() {
    let broker = MemoryBroker::new();
    broker.fail_next_connects(u32::MAX);

    let processor = Arc::new(ScriptedProcessor::new());
    let (_, cancel, handle) = spawn(&broker, processor, config());

    tokio::time::sleep(Duration::from_secs(5)).await;
    cancel.cancel();
    within(Duration::from_secs(1), handle).await.unwrap().unwrap();
}
