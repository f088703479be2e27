//! Error types for event decoding and mail submission.
//!
//! Both convert into [`kafka_worker::ProcessingError`] so the partition worker's
//! retry policy can classify them.

use kafka_worker::ProcessingError;
use thiserror::Error;

/// Failure to turn a broker payload into an [`EmailEvent`](crate::EmailEvent).
///
/// Always permanent: redelivering the same bytes cannot succeed.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    /// Payload is larger than the configured limit; rejected before parsing
    #[error("payload of {size} bytes exceeds the {limit} byte limit")]
    Oversized { size: usize, limit: usize },

    /// Not a JSON object, or `subject`/`body` is not a string
    #[error("malformed payload: {0}")]
    Malformed(String),

    /// `email` is absent or null
    #[error("missing recipient field `email`")]
    MissingRecipient,

    /// `email` is not a string, or blank after trimming
    #[error("invalid recipient: {0}")]
    InvalidRecipient(String),
}

impl From<DecodeError> for ProcessingError {
    fn from(err: DecodeError) -> Self {
        match err {
            DecodeError::Oversized { .. } => ProcessingError::oversized(err.to_string()),
            _ => ProcessingError::decode(err.to_string()),
        }
    }
}

/// Outcome class of a failed MTA submission
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MtaError {
    /// 4xx reply, connection refused, DNS failure, timeout or TLS failure
    #[error("transient MTA failure: {0}")]
    Transient(String),

    /// 5xx reply, malformed recipient or rejected credentials
    #[error("permanent MTA failure: {0}")]
    Permanent(String),

    /// The MTA cannot be used as configured (no usable AUTH mechanism, bad sender)
    #[error("MTA configuration error: {0}")]
    Configuration(String),
}

impl MtaError {
    /// Label used for metrics and log fields
    pub fn class(&self) -> &'static str {
        match self {
            MtaError::Transient(_) => "transient",
            MtaError::Permanent(_) => "permanent",
            MtaError::Configuration(_) => "configuration",
        }
    }
}

impl From<MtaError> for ProcessingError {
    fn from(err: MtaError) -> Self {
        match err {
            MtaError::Transient(msg) => ProcessingError::transient(msg),
            MtaError::Permanent(msg) => ProcessingError::permanent(msg),
            MtaError::Configuration(msg) => ProcessingError::fatal(msg),
        }
    }
}
