//! Service configuration loaded from the environment

use core_config::{ConfigError, FromEnv, env_flag, env_list, env_optional, env_parse_or, env_required};
use email::{DEFAULT_MAX_MESSAGE_BYTES, EmailTopics, SmtpConfig, TlsMode};
use kafka_worker::{Backoff, KafkaSettings, RetryPolicy, WorkerConfig};
use std::time::Duration;

/// Everything the email service needs to start
#[derive(Clone)]
pub struct ServiceConfig {
    pub kafka: KafkaSettings,
    pub smtp: SmtpConfig,
    /// Unset turns parking into skipping
    pub dlq_topic: Option<String>,
    pub max_message_bytes: usize,
    pub max_attempts: u32,
    pub backoff_base: Duration,
    pub backoff_cap: Duration,
    /// Bound on each MTA submission
    pub mta_call_timeout: Duration,
    pub shutdown_deadline: Duration,
    /// Bound on draining revoked partitions before the rebalance completes
    pub rebalance_drain_deadline: Duration,
    pub health_port: u16,
    /// `None` retries the broker forever
    pub max_connect_retries: Option<u32>,
    pub exit_on_connect_exhausted: bool,
}

fn env_millis(key: &str, default_ms: u64) -> Result<Duration, ConfigError> {
    env_parse_or(key, default_ms).map(Duration::from_millis)
}

impl FromEnv for ServiceConfig {
    fn from_env() -> Result<Self, ConfigError> {
        let mut kafka = KafkaSettings::new(env_list("KAFKA_BROKERS")?, env!("CARGO_PKG_NAME"));
        kafka.security_protocol = env_optional("KAFKA_SECURITY_PROTOCOL");
        kafka.sasl_mechanism = env_optional("KAFKA_SASL_MECHANISM");
        kafka.sasl_username = env_optional("KAFKA_SASL_USERNAME");
        kafka.sasl_password = env_optional("KAFKA_SASL_PASSWORD");
        let rebalance_drain_deadline = env_millis("REBALANCE_DRAIN_DEADLINE_MS", 30_000)?;
        kafka.rebalance_drain_deadline = rebalance_drain_deadline;

        let mta_call_timeout = env_millis("MTA_CALL_TIMEOUT_MS", 30_000)?;
        let username = env_required("SMTP_USER")?;
        let smtp = SmtpConfig {
            host: env_required("SMTP_SERVER")?,
            port: env_parse_or("SMTP_PORT", 587)?,
            from: env_optional("SMTP_FROM").unwrap_or_else(|| username.clone()),
            username,
            password: env_required("SMTP_PASS")?,
            tls: env_parse_or("SMTP_TLS", TlsMode::default())?,
            timeout: mta_call_timeout,
        };

        let max_connect_retries = env_optional("MAX_CONNECT_RETRIES")
            .map(|raw| {
                raw.trim().parse::<u32>().map_err(|e| ConfigError::ParseError {
                    key: "MAX_CONNECT_RETRIES".to_string(),
                    details: e.to_string(),
                })
            })
            .transpose()?;

        let config = Self {
            kafka,
            smtp,
            dlq_topic: env_optional("DLQ_TOPIC"),
            max_message_bytes: env_parse_or("MAX_MESSAGE_BYTES", DEFAULT_MAX_MESSAGE_BYTES)?,
            max_attempts: env_parse_or("MAX_ATTEMPTS", 5)?,
            backoff_base: env_millis("BACKOFF_BASE_MS", 1_000)?,
            backoff_cap: env_millis("BACKOFF_CAP_MS", 60_000)?,
            mta_call_timeout,
            shutdown_deadline: env_millis("SHUTDOWN_DEADLINE_MS", 30_000)?,
            rebalance_drain_deadline,
            health_port: env_parse_or("HEALTH_PORT", 8081)?,
            max_connect_retries,
            exit_on_connect_exhausted: env_flag("EXIT_ON_CONNECT_EXHAUSTED", false),
        };
        config.validate()?;
        Ok(config)
    }
}

impl ServiceConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        if self.max_attempts == 0 {
            return Err(ConfigError::invalid("MAX_ATTEMPTS", "must be at least 1"));
        }
        if self.max_message_bytes == 0 {
            return Err(ConfigError::invalid("MAX_MESSAGE_BYTES", "must be positive"));
        }
        if self.backoff_base.is_zero() || self.backoff_base > self.backoff_cap {
            return Err(ConfigError::invalid(
                "BACKOFF_BASE_MS",
                format!(
                    "must be positive and not exceed BACKOFF_CAP_MS ({} > {})",
                    self.backoff_base.as_millis(),
                    self.backoff_cap.as_millis()
                ),
            ));
        }
        if self.mta_call_timeout.is_zero() {
            return Err(ConfigError::invalid("MTA_CALL_TIMEOUT_MS", "must be positive"));
        }
        if self.rebalance_drain_deadline.is_zero() {
            return Err(ConfigError::invalid("REBALANCE_DRAIN_DEADLINE_MS", "must be positive"));
        }
        Ok(())
    }

    /// Worker configuration for the email consumer group
    pub fn worker_config(&self) -> WorkerConfig {
        WorkerConfig::from_group_def::<EmailTopics>()
            .with_dlq_topic(self.dlq_topic.clone())
            .with_handler_timeout(self.mta_call_timeout)
            .with_drain_deadline(self.rebalance_drain_deadline)
            .with_retry_policy(RetryPolicy::new(
                self.max_attempts,
                Backoff::new(self.backoff_base, self.backoff_cap),
            ))
            .with_max_connect_retries(self.max_connect_retries, self.exit_on_connect_exhausted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const REQUIRED: [(&str, Option<&str>); 4] = [
        ("KAFKA_BROKERS", Some("kafka-0:9092, kafka-1:9092")),
        ("SMTP_SERVER", Some("smtp.shop.test")),
        ("SMTP_USER", Some("noreply@shop.test")),
        ("SMTP_PASS", Some("secret")),
    ];

    const OPTIONAL: [&str; 19] = [
        "SMTP_PORT",
        "SMTP_FROM",
        "SMTP_TLS",
        "DLQ_TOPIC",
        "MAX_MESSAGE_BYTES",
        "MAX_ATTEMPTS",
        "BACKOFF_BASE_MS",
        "BACKOFF_CAP_MS",
        "MTA_CALL_TIMEOUT_MS",
        "SHUTDOWN_DEADLINE_MS",
        "REBALANCE_DRAIN_DEADLINE_MS",
        "HEALTH_PORT",
        "MAX_CONNECT_RETRIES",
        "EXIT_ON_CONNECT_EXHAUSTED",
        "KAFKA_SECURITY_PROTOCOL",
        "KAFKA_SASL_MECHANISM",
        "KAFKA_SASL_USERNAME",
        "KAFKA_SASL_PASSWORD",
        "APP_ENV",
    ];

    /// Run `f` with the required variables set, optional ones cleared, then `overrides`
    fn with_env<R>(overrides: &[(&str, Option<&str>)], f: impl FnOnce() -> R) -> R {
        let overridden = |key: &str| overrides.iter().any(|(k, _)| *k == key);
        let mut vars: Vec<(&str, Option<&str>)> = REQUIRED.into_iter().filter(|(k, _)| !overridden(k)).collect();
        vars.extend(OPTIONAL.into_iter().filter(|k| !overridden(k)).map(|k| (k, None)));
        vars.extend_from_slice(overrides);
        temp_env::with_vars(vars, f)
    }

    #[test]
    fn test_defaults() {
        let config = with_env(&[], ServiceConfig::from_env).unwrap();

        assert_eq!(config.kafka.brokers, vec!["kafka-0:9092", "kafka-1:9092"]);
        assert_eq!(config.kafka.security_protocol, None);
        assert_eq!(config.smtp.host, "smtp.shop.test");
        assert_eq!(config.smtp.port, 587);
        assert_eq!(config.smtp.from, "noreply@shop.test");
        assert_eq!(config.smtp.tls, TlsMode::Opportunistic);
        assert_eq!(config.dlq_topic, None);
        assert_eq!(config.max_message_bytes, 256 * 1024);
        assert_eq!(config.max_attempts, 5);
        assert_eq!(config.backoff_base, Duration::from_secs(1));
        assert_eq!(config.backoff_cap, Duration::from_secs(60));
        assert_eq!(config.mta_call_timeout, Duration::from_secs(30));
        assert_eq!(config.shutdown_deadline, Duration::from_secs(30));
        assert_eq!(config.rebalance_drain_deadline, Duration::from_secs(30));
        assert_eq!(config.kafka.rebalance_drain_deadline, Duration::from_secs(30));
        assert_eq!(config.health_port, 8081);
        assert_eq!(config.max_connect_retries, None);
        assert!(!config.exit_on_connect_exhausted);
    }

    #[test]
    fn test_overrides() {
        let config = with_env(
            &[
                ("SMTP_PORT", Some("465")),
                ("SMTP_TLS", Some("wrapper")),
                ("SMTP_FROM", Some("Shop <hello@shop.test>")),
                ("DLQ_TOPIC", Some("email-service-dlq")),
                ("MAX_ATTEMPTS", Some("3")),
                ("BACKOFF_BASE_MS", Some("250")),
                ("BACKOFF_CAP_MS", Some("4000")),
                ("REBALANCE_DRAIN_DEADLINE_MS", Some("5000")),
                ("MAX_CONNECT_RETRIES", Some("10")),
                ("EXIT_ON_CONNECT_EXHAUSTED", Some("true")),
                ("KAFKA_SASL_USERNAME", Some("svc")),
                ("KAFKA_SASL_PASSWORD", Some("pw")),
            ],
            ServiceConfig::from_env,
        )
        .unwrap();

        assert_eq!(config.smtp.port, 465);
        assert_eq!(config.smtp.tls, TlsMode::Wrapper);
        assert_eq!(config.smtp.from, "Shop <hello@shop.test>");
        assert_eq!(config.smtp.username, "noreply@shop.test");
        assert_eq!(config.max_connect_retries, Some(10));
        assert!(config.exit_on_connect_exhausted);
        assert_eq!(config.kafka.sasl_username.as_deref(), Some("svc"));

        let worker = config.worker_config();
        assert_eq!(worker.group_id, "email-service-group");
        assert_eq!(worker.topics.len(), 8);
        assert_eq!(worker.dlq_topic.as_deref(), Some("email-service-dlq"));
        assert_eq!(worker.retry.max_attempts, 3);
        assert_eq!(worker.retry.backoff.base, Duration::from_millis(250));
        assert_eq!(worker.handler_timeout, Duration::from_secs(30));
        assert_eq!(worker.drain_deadline, Duration::from_secs(5));
        assert_eq!(config.kafka.rebalance_drain_deadline, Duration::from_secs(5));
        assert_eq!(worker.max_connect_retries, Some(10));
        assert!(worker.validate().is_ok());
    }

    #[test]
    fn test_missing_required_variable() {
        let result = with_env(&[("SMTP_PASS", None)], ServiceConfig::from_env);
        assert!(matches!(result, Err(ConfigError::MissingEnvVar(key)) if key == "SMTP_PASS"));

        let result = with_env(&[("KAFKA_BROKERS", Some(" , "))], ServiceConfig::from_env);
        assert!(matches!(result, Err(ConfigError::Invalid { key, .. }) if key == "KAFKA_BROKERS"));
    }

    #[test]
    fn test_unparseable_values_are_errors() {
        for (key, value) in [
            ("SMTP_PORT", "smtp"),
            ("SMTP_TLS", "sometimes"),
            ("MAX_ATTEMPTS", "-1"),
            ("MAX_CONNECT_RETRIES", "many"),
            ("SHUTDOWN_DEADLINE_MS", "30s"),
        ] {
            let result = with_env(&[(key, Some(value))], ServiceConfig::from_env);
            assert!(
                matches!(&result, Err(ConfigError::ParseError { key: k, .. }) if k == key),
                "{key}={value}"
            );
        }
    }

    #[test]
    fn test_inconsistent_values_are_rejected() {
        let cases = [
            ("MAX_ATTEMPTS", "0"),
            ("MAX_MESSAGE_BYTES", "0"),
            ("BACKOFF_BASE_MS", "120000"),
            ("MTA_CALL_TIMEOUT_MS", "0"),
            ("REBALANCE_DRAIN_DEADLINE_MS", "0"),
        ];
        for (key, value) in cases {
            let result = with_env(&[(key, Some(value))], ServiceConfig::from_env);
            assert!(matches!(result, Err(ConfigError::Invalid { .. })), "{key}={value}");
        }
    }
}
