//! Kafka Worker Framework
//!
//! A partitioned-log consumer framework with at-least-once delivery.
//!
//! ## Features
//!
//! - **Task per partition**: `PartitionWorker` drives one partition with an explicit fetch/commit contract
//! - **Consumer groups**: `Supervisor` joins the group, follows rebalances and reconnects with backoff
//! - **Retry policy**: jittered exponential backoff for transient failures
//! - **Dead-letter topic**: exhausted and rejected messages are parked with an `x-dlq-reason` header
//! - **Prometheus metrics**: delivered / retried / skipped / parked counters and downstream latency
//! - **Health endpoints**: K8s-ready liveness and readiness probes
//! - **In-memory broker**: `MemoryBroker` for tests and cluster-less runs
//!
//! ## Example
//!
//! ```ignore
//! use kafka_worker::{ConsumerGroupDef, KafkaBroker, KafkaSettings, MessageProcessor, Supervisor, WorkerConfig};
//!
//! struct Orders;
//! impl ConsumerGroupDef for Orders {
//!     const GROUP_ID: &'static str = "orders-group";
//!     const TOPICS: &'static [&'static str] = &["orders-created"];
//! }
//!
//! let config = WorkerConfig::from_group_def::<Orders>();
//! let broker = KafkaBroker::new(KafkaSettings::new(brokers, "orders"));
//! let supervisor = Supervisor::new(broker, Arc::new(processor), config, PipelineMetrics::new());
//! supervisor.run(cancel_token).await?;
//! ```

mod broker;
mod config;
mod dlq;
mod error;
mod health;
#[cfg(feature = "kafka")]
mod kafka;
pub mod memory;
pub mod metrics;
mod registry;
mod retry;
mod supervisor;
mod worker;

// Re-export main types
pub use broker::{Assignment, Broker, BrokerMessage, BrokerSession, GroupEvent, TopicPartition};
pub use config::{MAX_GROUP_ID_LEN, WorkerConfig, validate_group_id};
pub use dlq::{DLQ_REASON_HEADER, DeadLetter, DlqReason};
pub use error::{BrokerError, ErrorCategory, ProcessingError, WorkerError};
pub use health::{HealthState, health_router};
#[cfg(feature = "kafka")]
pub use kafka::{KafkaBroker, KafkaSession, KafkaSettings};
pub use memory::MemoryBroker;
pub use metrics::{MetricsSnapshot, PipelineMetrics, init_metrics};
pub use registry::ConsumerGroupDef;
pub use retry::{Action, Backoff, RetryPolicy};
pub use supervisor::{Supervisor, SupervisorState};
pub use worker::{AttemptRecord, MessageProcessor, PartitionWorker, WorkerState};
