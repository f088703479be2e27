//! Inbound email events
//!
//! Producers publish `{"email": "<addr>", "subject": "...", "body": "<html>"}`.
//! Unknown fields are ignored.

use crate::error::DecodeError;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Default upper bound on an event payload (256 KiB)
pub const DEFAULT_MAX_MESSAGE_BYTES: usize = 256 * 1024;

/// A pre-rendered email to deliver to one recipient
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EmailEvent {
    /// Trimmed, non-empty addr-spec
    #[serde(rename = "email")]
    pub recipient: String,
    pub subject: String,
    /// HTML body, sent verbatim
    pub body: String,
}

impl EmailEvent {
    pub fn new(recipient: impl Into<String>, subject: impl Into<String>, body: impl Into<String>) -> Self {
        Self {
            recipient: recipient.into(),
            subject: subject.into(),
            body: body.into(),
        }
    }
}

#[derive(Deserialize)]
struct RawEvent {
    email: Option<Value>,
    subject: Option<String>,
    body: Option<String>,
}

/// Decode a broker payload.
///
/// The size check runs before any parsing. A missing or `null` subject or body
/// becomes the empty string.
pub fn decode(bytes: &[u8], max_bytes: usize) -> Result<EmailEvent, DecodeError> {
    if bytes.len() > max_bytes {
        return Err(DecodeError::Oversized {
            size: bytes.len(),
            limit: max_bytes,
        });
    }

    let raw: RawEvent = serde_json::from_slice(bytes).map_err(|e| DecodeError::Malformed(e.to_string()))?;

    let recipient = match raw.email {
        None | Some(Value::Null) => return Err(DecodeError::MissingRecipient),
        Some(Value::String(addr)) => addr.trim().to_string(),
        Some(other) => return Err(DecodeError::InvalidRecipient(format!("expected a string, got {other}"))),
    };
    if recipient.is_empty() {
        return Err(DecodeError::InvalidRecipient("blank address".to_string()));
    }

    Ok(EmailEvent {
        recipient,
        subject: raw.subject.unwrap_or_default(),
        body: raw.body.unwrap_or_default(),
    })
}

/// Encode an event in its wire form
pub fn encode(event: &EmailEvent) -> Vec<u8> {
    serde_json::json!({
        "email": event.recipient,
        "subject": event.subject,
        "body": event.body,
    })
    .to_string()
    .into_bytes()
}
