//! Shop Email Service
//!
//! Consumes shop business events from Kafka and delivers them as email over SMTP.
//!
//! ## Architecture
//!
//! ```text
//! Kafka topics (email-service-topic-*)
//!   ↓ (Consumer Group: email-service-group)
//! Supervisor → one PartitionWorker per assigned partition
//!   ↓ (decode, retry, park)
//! EmailProcessor
//!   ↓
//! SmtpMailer → MTA
//! ```
//!
//! ## Features
//!
//! - At-least-once delivery with one offset commit per handled message
//! - Jittered exponential backoff for transient MTA failures
//! - Dead-letter topic for exhausted and rejected messages
//! - Graceful shutdown bounded by `SHUTDOWN_DEADLINE_MS`
//! - Health check endpoint for Kubernetes probes

pub mod config;
pub mod lifecycle;

use axum::Router;
use config::ServiceConfig;
use core_config::{Environment, FromEnv, app_info};
use email::{EmailProcessor, SmtpMailer};
use eyre::{Result, WrapErr};
use kafka_worker::{HealthState, KafkaBroker, PipelineMetrics, Supervisor, health_router, metrics};
use lifecycle::ExitCode;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

/// Start the health HTTP server
///
/// Provides endpoints for:
/// - Liveness probes: `/health`, `/healthz`
/// - Readiness probes: `/ready`, `/readyz`
/// - Pipeline counters: `/stats`
/// - Prometheus metrics: `/metrics`
async fn start_health_server(health_state: HealthState, port: u16) -> Result<()> {
    let app: Router = health_router(health_state);

    let addr = format!("0.0.0.0:{}", port);
    let listener = TcpListener::bind(&addr)
        .await
        .wrap_err_with(|| format!("Failed to bind health server to {}", addr))?;

    info!(port = %port, "Health server listening");

    axum::serve(listener, app).await.wrap_err("Health server failed")?;

    Ok(())
}

/// Run the email service and return the process exit code
///
/// 1. Sets up structured logging (env-aware: JSON for prod, pretty for dev)
/// 2. Loads configuration; any error here exits with code 1
/// 3. Builds the SMTP mailer and the Kafka consumer supervisor
/// 4. Runs until SIGINT/SIGTERM, then drains within the shutdown deadline
pub async fn run() -> ExitCode {
    let environment = Environment::from_env();
    core_config::tracing::init_tracing(&environment);

    match serve(environment).await {
        Ok(code) => code,
        Err(report) => {
            error!(error = ?report, "Email service failed to start");
            ExitCode::Config
        }
    }
}

async fn serve(environment: Environment) -> Result<ExitCode> {
    metrics::init_metrics().wrap_err("Failed to install Prometheus recorder")?;

    let app_info = app_info!();
    info!(name = %app_info.name, version = %app_info.version, "Starting email service");
    info!("Environment: {:?}", environment);

    let config = ServiceConfig::from_env().wrap_err("Failed to load configuration")?;
    let worker_config = config.worker_config();
    worker_config.validate().wrap_err("Invalid consumer configuration")?;
    info!(
        group_id = %worker_config.group_id,
        topics = worker_config.topics.len(),
        dlq_topic = worker_config.dlq_topic.as_deref().unwrap_or("<none>"),
        brokers = %config.kafka.brokers.join(","),
        smtp_host = %config.smtp.host,
        smtp_port = config.smtp.port,
        smtp_tls = %config.smtp.tls,
        "Worker configuration loaded"
    );

    let mailer = SmtpMailer::new(config.smtp.clone()).wrap_err("Invalid SMTP configuration")?;
    let pipeline_metrics = PipelineMetrics::new();
    let processor =
        EmailProcessor::new(Arc::new(mailer), pipeline_metrics.clone()).with_max_message_bytes(config.max_message_bytes);

    let supervisor = Supervisor::new(
        KafkaBroker::new(config.kafka.clone()),
        Arc::new(processor),
        worker_config,
        pipeline_metrics.clone(),
    );

    let health_state = HealthState::new(app_info.name, app_info.version, supervisor.state(), pipeline_metrics);
    let health_port = config.health_port;
    tokio::spawn(async move {
        if let Err(e) = start_health_server(health_state, health_port).await {
            error!(error = %e, "Health server failed");
        }
    });

    let cancel = CancellationToken::new();
    let code = lifecycle::drive(
        supervisor.run(cancel.clone()),
        lifecycle::shutdown_signal(),
        cancel,
        config.shutdown_deadline,
    )
    .await;

    info!(exit_code = code.code(), "Email service stopped");
    Ok(code)
}
