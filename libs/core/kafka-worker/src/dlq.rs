//! Dead-letter records
//!
//! Parked messages are republished unchanged (original key and value) to the
//! configured dead-letter topic, tagged with an `x-dlq-reason` header.

use crate::broker::{BrokerMessage, TopicPartition};
use serde::{Deserialize, Serialize};
use strum::{AsRefStr, Display, EnumString, IntoStaticStr};

/// Header carrying the reason a message was parked
pub const DLQ_REASON_HEADER: &str = "x-dlq-reason";

/// Headers identifying where a parked message came from
pub const DLQ_SOURCE_TOPIC_HEADER: &str = "x-dlq-source-topic";
pub const DLQ_SOURCE_PARTITION_HEADER: &str = "x-dlq-source-partition";
pub const DLQ_SOURCE_OFFSET_HEADER: &str = "x-dlq-source-offset";

/// Why a message was parked
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[derive(Display, AsRefStr, EnumString, IntoStaticStr)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum DlqReason {
    /// Transient failures persisted past the attempt limit
    TransientExhausted,
    /// The downstream rejected the message permanently
    #[strum(serialize = "permanent_mta")]
    #[serde(rename = "permanent_mta")]
    PermanentFailure,
    /// The payload exceeded the size limit
    Oversized,
}

/// A message on its way to the dead-letter topic
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeadLetter {
    /// Dead-letter topic name
    pub topic: String,
    /// Original message key
    pub key: Option<Vec<u8>>,
    /// Original message value, byte for byte
    pub value: Vec<u8>,
    pub reason: DlqReason,
    /// Where the message came from
    pub source: TopicPartition,
    pub source_offset: i64,
}

impl DeadLetter {
    pub fn from_message(topic: impl Into<String>, message: &BrokerMessage, reason: DlqReason) -> Self {
        Self {
            topic: topic.into(),
            key: message.key.clone(),
            value: message.value.clone(),
            reason,
            source: message.topic_partition(),
            source_offset: message.offset,
        }
    }

    /// Headers attached to the published record
    pub fn headers(&self) -> Vec<(&'static str, String)> {
        vec![
            (DLQ_REASON_HEADER, self.reason.to_string()),
            (DLQ_SOURCE_TOPIC_HEADER, self.source.topic.clone()),
            (DLQ_SOURCE_PARTITION_HEADER, self.source.partition.to_string()),
            (DLQ_SOURCE_OFFSET_HEADER, self.source_offset.to_string()),
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reason_wire_names() {
        assert_eq!(DlqReason::TransientExhausted.to_string(), "transient_exhausted");
        assert_eq!(DlqReason::PermanentFailure.as_ref(), "permanent_mta");
        assert_eq!(DlqReason::Oversized.to_string(), "oversized");
        // undecodable messages are skipped, never parked
        assert!("permanent_decode".parse::<DlqReason>().is_err());
        assert_eq!("permanent_mta".parse::<DlqReason>().unwrap(), DlqReason::PermanentFailure);
    }

    #[test]
    fn test_dead_letter_keeps_original_payload() {
        let message = BrokerMessage::new("orders", 3, 42, br#"{"email":"a@x.io"}"#.to_vec())
            .with_key(b"user-1".to_vec());
        let dead = DeadLetter::from_message("email-dlq", &message, DlqReason::Oversized);

        assert_eq!(dead.topic, "email-dlq");
        assert_eq!(dead.key.as_deref(), Some(&b"user-1"[..]));
        assert_eq!(dead.value, message.value);
        assert_eq!(dead.source, TopicPartition::new("orders", 3));
        assert_eq!(dead.source_offset, 42);
        assert_eq!(
            dead.headers(),
            vec![
                (DLQ_REASON_HEADER, "oversized".to_string()),
                (DLQ_SOURCE_TOPIC_HEADER, "orders".to_string()),
                (DLQ_SOURCE_PARTITION_HEADER, "3".to_string()),
                (DLQ_SOURCE_OFFSET_HEADER, "42".to_string()),
            ]
        );
    }
}
