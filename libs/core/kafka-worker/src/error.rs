//! Worker error types and error categorization
//!
//! Errors are split by the layer that owns them:
//! - [`ProcessingError`]: raised by a [`MessageProcessor`](crate::MessageProcessor) for a
//!   single message; absorbed by the partition worker through the retry policy.
//! - [`BrokerError`]: fetch, commit, publish and group membership failures; bubbles to
//!   the supervisor which reconnects when the error is recoverable.
//! - [`WorkerError`]: what the supervisor hands back to the lifecycle controller.

use thiserror::Error;

/// Category of a processing failure, used by the retry policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCategory {
    /// Temporary downstream failure - retry with exponential backoff
    Transient,
    /// Downstream rejected the message for good - park it
    Permanent,
    /// Payload could not be decoded - skip it, retrying cannot help
    Decode,
    /// Payload exceeds the configured size limit - park without retrying
    Oversized,
    /// Downstream is misconfigured - not a per-message failure, stop the worker
    Fatal,
}

impl ErrorCategory {
    /// Label used for metrics and log fields
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCategory::Transient => "transient",
            ErrorCategory::Permanent => "permanent",
            ErrorCategory::Decode => "decode",
            ErrorCategory::Oversized => "oversized",
            ErrorCategory::Fatal => "fatal",
        }
    }
}

/// Failure raised while processing a single message
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{category:?} processing error: {message}")]
pub struct ProcessingError {
    pub message: String,
    pub category: ErrorCategory,
}

impl ProcessingError {
    pub fn new(category: ErrorCategory, message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            category,
        }
    }

    /// Create a transient processing error
    pub fn transient(message: impl Into<String>) -> Self {
        Self::new(ErrorCategory::Transient, message)
    }

    /// Create a permanent processing error
    pub fn permanent(message: impl Into<String>) -> Self {
        Self::new(ErrorCategory::Permanent, message)
    }

    /// Create a decode error for malformed payloads
    pub fn decode(message: impl Into<String>) -> Self {
        Self::new(ErrorCategory::Decode, message)
    }

    /// Create an error for payloads over the size limit
    pub fn oversized(message: impl Into<String>) -> Self {
        Self::new(ErrorCategory::Oversized, message)
    }

    /// Create an error for a misconfigured downstream
    pub fn fatal(message: impl Into<String>) -> Self {
        Self::new(ErrorCategory::Fatal, message)
    }

    pub fn category(&self) -> ErrorCategory {
        self.category
    }
}

/// Broker-side failures (transport, commit, membership)
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BrokerError {
    /// Connection, fetch or commit failed; the session should be rebuilt
    #[error("Broker transport error: {0}")]
    Transport(String),

    /// A broker operation did not finish in time
    #[error("Broker operation timed out: {0}")]
    Timeout(&'static str),

    /// The broker rejected our credentials
    #[error("Broker authentication failed: {0}")]
    Authentication(String),

    /// The consumer group id was refused
    #[error("Invalid consumer group: {0}")]
    InvalidGroup(String),

    /// Client configuration was rejected before connecting
    #[error("Broker configuration error: {0}")]
    Config(String),

    /// The reconnect budget ran out
    #[error("Gave up connecting after {attempts} attempts: {last}")]
    ConnectRetriesExhausted { attempts: u32, last: String },
}

impl BrokerError {
    /// Whether tearing down the session and reconnecting can fix this error
    pub fn is_recoverable(&self) -> bool {
        matches!(self, BrokerError::Transport(_) | BrokerError::Timeout(_))
    }
}

/// Errors that end a worker or the supervisor
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum WorkerError {
    #[error(transparent)]
    Broker(#[from] BrokerError),

    /// Invalid worker or downstream configuration
    #[error("Configuration error: {0}")]
    Config(String),

    /// Cooperative shutdown; a normal termination, never reported as a failure
    #[error("Shutdown requested")]
    Cancelled,
}

impl WorkerError {
    pub fn is_recoverable(&self) -> bool {
        matches!(self, WorkerError::Broker(e) if e.is_recoverable())
    }
}

#[cfg(feature = "kafka")]
impl From<rdkafka::error::KafkaError> for BrokerError {
    fn from(err: rdkafka::error::KafkaError) -> Self {
        use rdkafka::error::RDKafkaErrorCode;

        match err.rdkafka_error_code() {
            Some(
                RDKafkaErrorCode::SaslAuthenticationFailed
                | RDKafkaErrorCode::Authentication
                | RDKafkaErrorCode::TopicAuthorizationFailed
                | RDKafkaErrorCode::GroupAuthorizationFailed
                | RDKafkaErrorCode::ClusterAuthorizationFailed,
            ) => BrokerError::Authentication(err.to_string()),
            Some(RDKafkaErrorCode::InvalidGroupId) => BrokerError::InvalidGroup(err.to_string()),
            _ => match err {
                rdkafka::error::KafkaError::ClientConfig(..) => BrokerError::Config(err.to_string()),
                other => BrokerError::Transport(other.to_string()),
            },
        }
    }
}
