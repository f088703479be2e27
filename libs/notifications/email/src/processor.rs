//! EmailProcessor - plugs the event decoder and a mailer into the partition worker

use crate::event::{DEFAULT_MAX_MESSAGE_BYTES, decode};
use crate::provider::Mailer;
use async_trait::async_trait;
use kafka_worker::{BrokerMessage, MessageProcessor, PipelineMetrics, ProcessingError};
use std::sync::Arc;
use tokio::time::Instant;
use tracing::debug;

/// Decodes each message into an [`EmailEvent`](crate::EmailEvent) and submits it.
///
/// Decode failures become skip/park decisions, MTA failures keep their class.
/// Outcome logging is left to the worker.
pub struct EmailProcessor<M: Mailer + ?Sized> {
    mailer: Arc<M>,
    metrics: PipelineMetrics,
    max_message_bytes: usize,
}

impl<M: Mailer + ?Sized> EmailProcessor<M> {
    pub fn new(mailer: Arc<M>, metrics: PipelineMetrics) -> Self {
        Self {
            mailer,
            metrics,
            max_message_bytes: DEFAULT_MAX_MESSAGE_BYTES,
        }
    }

    pub fn with_max_message_bytes(mut self, max: usize) -> Self {
        self.max_message_bytes = max;
        self
    }
}

#[async_trait]
impl<M: Mailer + ?Sized + 'static> MessageProcessor for EmailProcessor<M> {
    async fn process(&self, message: &BrokerMessage) -> Result<(), ProcessingError> {
        let event = decode(&message.value, self.max_message_bytes)?;

        debug!(
            topic = %message.topic,
            offset = message.offset,
            to = %event.recipient,
            mailer = self.mailer.name(),
            "Submitting email"
        );

        let started = Instant::now();
        let result = self.mailer.send(&event.recipient, &event.subject, &event.body).await;
        let outcome = match &result {
            Ok(()) => "ok",
            Err(e) => e.class(),
        };
        self.metrics.downstream_call(started.elapsed(), outcome);

        result.map_err(Into::into)
    }

    fn name(&self) -> &'static str {
        "email_processor"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::MtaError;
    use crate::event::{EmailEvent, encode};
    use crate::provider::MockMailer;
    use kafka_worker::ErrorCategory;

    fn message(value: Vec<u8>) -> BrokerMessage {
        BrokerMessage::new("email-service-topic-auth-register", 0, 17, value)
    }

    fn build(mock: MockMailer) -> (EmailProcessor<MockMailer>, PipelineMetrics) {
        let metrics = PipelineMetrics::new();
        (EmailProcessor::new(Arc::new(mock), metrics.clone()), metrics)
    }

    #[tokio::test]
    async fn test_sends_decoded_event() {
        let mut mock = MockMailer::new();
        mock.expect_name().return_const("mock");
        mock.expect_send()
            .withf(|to, subject, body| to == "a@x.io" && subject == "Hi" && body == "<b>hi</b>")
            .times(1)
            .returning(|_, _, _| Ok(()));

        let (processor, metrics) = build(mock);
        let payload = encode(&EmailEvent::new(" a@x.io ", "Hi", "<b>hi</b>"));
        processor.process(&message(payload)).await.unwrap();

        assert_eq!(metrics.snapshot().downstream_calls, 1);
    }

    #[tokio::test]
    async fn test_decode_failure_never_reaches_the_mailer() {
        let mut mock = MockMailer::new();
        mock.expect_send().never();

        let (processor, metrics) = build(mock);
        let err = processor
            .process(&message(br#"{"subject":"x","body":"y"}"#.to_vec()))
            .await
            .unwrap_err();

        assert_eq!(err.category(), ErrorCategory::Decode);
        assert_eq!(metrics.snapshot().downstream_calls, 0);
    }

    #[tokio::test]
    async fn test_oversized_payload_is_rejected_before_decoding() {
        let mut mock = MockMailer::new();
        mock.expect_send().never();

        let (processor, _) = build(mock);
        let processor = processor.with_max_message_bytes(8);
        let err = processor.process(&message(vec![b'x'; 9])).await.unwrap_err();

        assert_eq!(err.category(), ErrorCategory::Oversized);
    }

    #[tokio::test]
    async fn test_mta_failure_class_is_preserved() {
        let cases = [
            (MtaError::Transient("421 busy".into()), ErrorCategory::Transient),
            (MtaError::Permanent("550 no such user".into()), ErrorCategory::Permanent),
            (MtaError::Configuration("no AUTH PLAIN".into()), ErrorCategory::Fatal),
        ];

        for (failure, expected) in cases {
            let mut mock = MockMailer::new();
            mock.expect_name().return_const("mock");
            mock.expect_send().times(1).returning(move |_, _, _| Err(failure.clone()));

            let (processor, metrics) = build(mock);
            let err = processor
                .process(&message(encode(&EmailEvent::new("a@x.io", "s", "b"))))
                .await
                .unwrap_err();

            assert_eq!(err.category(), expected);
            assert_eq!(metrics.snapshot().downstream_calls, 1);
        }
    }
}
