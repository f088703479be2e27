//! Test binary to publish one email event to Kafka
//!
//! Run with: cargo run -p shop_email_service --bin send_test_email -- a@example.com

use core_config::{env_list, env_optional};
use email::{EmailEvent, EmailTopics, encode};
use eyre::{Result, WrapErr, eyre};
use kafka_worker::{ConsumerGroupDef, KafkaSettings};
use rdkafka::producer::{FutureProducer, FutureRecord};
use std::time::Duration;

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;

    let recipient = std::env::args().nth(1).unwrap_or_else(|| "test@example.com".to_string());
    let topic = env_optional("TEST_EMAIL_TOPIC").unwrap_or_else(|| EmailTopics::TOPICS[0].to_string());

    let mut settings = KafkaSettings::new(env_list("KAFKA_BROKERS")?, "send_test_email");
    settings.security_protocol = env_optional("KAFKA_SECURITY_PROTOCOL");
    settings.sasl_mechanism = env_optional("KAFKA_SASL_MECHANISM");
    settings.sasl_username = env_optional("KAFKA_SASL_USERNAME");
    settings.sasl_password = env_optional("KAFKA_SASL_PASSWORD");

    println!("Connecting to Kafka at {}", settings.brokers.join(","));
    let producer: FutureProducer = settings
        .client_config()
        .set("message.timeout.ms", "10000")
        .create()
        .wrap_err("Failed to create Kafka producer")?;

    let event = EmailEvent::new(
        recipient,
        "Test Email from the shop",
        "<h1>Hello!</h1><p>This is a test email sent through Kafka.</p>",
    );
    println!("Sending test email to: {}", event.recipient);
    println!("Topic: {}", topic);

    let payload = encode(&event);
    let delivery = producer
        .send(
            FutureRecord::<str, [u8]>::to(&topic)
                .key(event.recipient.as_str())
                .payload(&payload),
            Duration::from_secs(10),
        )
        .await
        .map_err(|(e, _)| eyre!("Failed to publish test email: {e}"))?;

    println!("Email queued successfully!");
    println!("Delivery: {:?}", delivery);

    Ok(())
}
