//! Consumer group definitions.
//!
//! Each service describes the group it joins with a [`ConsumerGroupDef`],
//! which [`WorkerConfig::from_group_def`](crate::WorkerConfig::from_group_def) turns into
//! a runnable configuration.

/// Consumer group definition trait.
///
/// # Example
///
/// ```rust,ignore
/// use kafka_worker::ConsumerGroupDef;
///
/// pub struct BillingEvents;
///
/// impl ConsumerGroupDef for BillingEvents {
///     const GROUP_ID: &'static str = "billing-group";
///     const TOPICS: &'static [&'static str] = &["billing-invoice-create"];
/// }
/// ```
pub trait ConsumerGroupDef: Send + Sync {
    /// Consumer group id
    const GROUP_ID: &'static str;

    /// Subscribed topics
    const TOPICS: &'static [&'static str];

    /// Dead-letter topic. `None` turns parking into skipping.
    const DLQ_TOPIC: Option<&'static str> = None;

    /// Maximum messages per fetch
    const BATCH_SIZE: usize = 16;

    fn group_id() -> &'static str {
        Self::GROUP_ID
    }

    fn topics() -> Vec<String> {
        Self::TOPICS.iter().map(|t| t.to_string()).collect()
    }
}
