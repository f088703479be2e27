//! Mail submission backends

pub mod mock;
pub mod smtp;

pub use mock::{RecordingMailer, SentEmail};
pub use smtp::{SmtpConfig, SmtpMailer, TlsMode, compose_message};

use crate::error::MtaError;
use async_trait::async_trait;

/// Submits one message to a mail transfer agent.
///
/// Implementations make a single attempt per call; retrying is the partition
/// worker's job.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Mailer: Send + Sync {
    async fn send(&self, recipient: &str, subject: &str, body: &str) -> Result<(), MtaError>;

    /// Backend name for logs
    fn name(&self) -> &'static str;
}
