//! Consumer group and topics the email service subscribes to

use kafka_worker::ConsumerGroupDef;

/// Business events that end in an email
pub struct EmailTopics;

impl ConsumerGroupDef for EmailTopics {
    const GROUP_ID: &'static str = "email-service-group";

    const TOPICS: &'static [&'static str] = &[
        "email-service-topic-auth-register",
        "email-service-topic-auth-forgot-password",
        "email-service-topic-auth-verify-code-success",
        "email-service-topic-merchant-create",
        "email-service-topic-merchant-update-status",
        "email-service-topic-merchant-document-create",
        "email-service-topic-merchant-document-update-status",
        "email-service-topic-transaction-create",
    ];
}
