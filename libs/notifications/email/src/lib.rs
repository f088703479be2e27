//! Email notification library for the partitioned-log worker
//!
//! Turns broker messages carrying pre-rendered emails into SMTP submissions.
//!
//! ## Components
//!
//! - **Events**: `EmailEvent`, `decode` / `encode` for the wire payload
//! - **Providers**: the `Mailer` trait, `SmtpMailer` (lettre) and `RecordingMailer`
//! - **Processing**: `EmailProcessor` implements `kafka_worker::MessageProcessor`
//! - **Topics**: `EmailTopics`, the consumer group and its subscriptions
//!
//! ## Usage
//!
//! ```ignore
//! use email::{EmailProcessor, EmailTopics, SmtpMailer};
//! use kafka_worker::{PipelineMetrics, Supervisor, WorkerConfig};
//!
//! let metrics = PipelineMetrics::new();
//! let processor = EmailProcessor::new(Arc::new(SmtpMailer::new(smtp_config)?), metrics.clone());
//! let config = WorkerConfig::from_group_def::<EmailTopics>();
//! Supervisor::new(broker, Arc::new(processor), config, metrics).run(cancel).await?;
//! ```

pub mod error;
pub mod event;
pub mod processor;
pub mod provider;
pub mod topics;

pub use error::{DecodeError, MtaError};
pub use event::{DEFAULT_MAX_MESSAGE_BYTES, EmailEvent, decode, encode};
pub use processor::EmailProcessor;
pub use provider::{Mailer, RecordingMailer, SentEmail, SmtpConfig, SmtpMailer, TlsMode};
pub use topics::EmailTopics;
