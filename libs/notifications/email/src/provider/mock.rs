//! In-process mailer for tests and dry runs

use super::Mailer;
use crate::error::MtaError;
use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::Mutex;

/// One submitted message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SentEmail {
    pub recipient: String,
    pub subject: String,
    pub body: String,
}

/// Mailer that records every call and replays scripted outcomes.
///
/// Once the script runs out every call succeeds, unless a fallback failure was
/// set with [`RecordingMailer::failing`].
#[derive(Clone, Default)]
pub struct RecordingMailer {
    outcomes: Arc<Mutex<VecDeque<Result<(), MtaError>>>>,
    fallback: Option<MtaError>,
    attempts: Arc<Mutex<Vec<SentEmail>>>,
    delivered: Arc<Mutex<Vec<SentEmail>>>,
}

impl RecordingMailer {
    /// Create a mailer that accepts everything
    pub fn new() -> Self {
        Self::default()
    }

    /// Replay `outcomes` in order, then accept
    pub fn with_outcomes(outcomes: impl IntoIterator<Item = Result<(), MtaError>>) -> Self {
        Self {
            outcomes: Arc::new(Mutex::new(outcomes.into_iter().collect())),
            ..Self::default()
        }
    }

    /// Fail every call with `err` once the script is exhausted
    pub fn failing(err: MtaError) -> Self {
        Self {
            fallback: Some(err),
            ..Self::default()
        }
    }

    /// Messages the MTA accepted
    pub async fn delivered(&self) -> Vec<SentEmail> {
        self.delivered.lock().await.clone()
    }

    /// Every call, accepted or not
    pub async fn attempts(&self) -> Vec<SentEmail> {
        self.attempts.lock().await.clone()
    }

    pub async fn attempt_count(&self) -> usize {
        self.attempts.lock().await.len()
    }

    /// Check if a message was accepted for `recipient`
    pub async fn was_sent_to(&self, recipient: &str) -> bool {
        self.delivered.lock().await.iter().any(|e| e.recipient == recipient)
    }
}

#[async_trait]
impl Mailer for RecordingMailer {
    async fn send(&self, recipient: &str, subject: &str, body: &str) -> Result<(), MtaError> {
        let email = SentEmail {
            recipient: recipient.to_string(),
            subject: subject.to_string(),
            body: body.to_string(),
        };
        self.attempts.lock().await.push(email.clone());

        let outcome = match self.outcomes.lock().await.pop_front() {
            Some(outcome) => outcome,
            None => self.fallback.clone().map_or(Ok(()), Err),
        };
        if outcome.is_ok() {
            self.delivered.lock().await.push(email);
        }
        outcome
    }

    fn name(&self) -> &'static str {
        "recording"
    }
}
