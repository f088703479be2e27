//! Process lifecycle: signal handling, bounded shutdown and exit codes

use kafka_worker::{BrokerError, WorkerError};
use std::future::Future;
use std::time::Duration;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Process exit status
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitCode {
    /// Stopped on request, or the consumer finished on its own
    Clean = 0,
    /// Invalid configuration, or a downstream that cannot work as configured
    Config = 1,
    /// Broker authentication rejected, or connect retries exhausted
    Broker = 2,
    /// The consumer did not stop within the shutdown deadline
    DeadlineExceeded = 3,
}

impl ExitCode {
    pub fn code(self) -> u8 {
        self as u8
    }
}

impl From<ExitCode> for std::process::ExitCode {
    fn from(code: ExitCode) -> Self {
        std::process::ExitCode::from(code.code())
    }
}

/// Map the consumer's result to an exit code
pub fn classify(result: &Result<(), WorkerError>) -> ExitCode {
    match result {
        Ok(()) | Err(WorkerError::Cancelled) => ExitCode::Clean,
        Err(WorkerError::Config(_)) => ExitCode::Config,
        Err(WorkerError::Broker(BrokerError::InvalidGroup(_) | BrokerError::Config(_))) => ExitCode::Config,
        Err(WorkerError::Broker(_)) => ExitCode::Broker,
    }
}

/// Run `consumer` until it returns or `shutdown` resolves.
///
/// On shutdown the token is cancelled and the consumer gets `deadline` to
/// finish; past that the process exits with [`ExitCode::DeadlineExceeded`].
pub async fn drive<F, S>(consumer: F, shutdown: S, cancel: CancellationToken, deadline: Duration) -> ExitCode
where
    F: Future<Output = Result<(), WorkerError>>,
    S: Future<Output = ()>,
{
    tokio::pin!(consumer);

    let result = tokio::select! {
        result = &mut consumer => result,
        _ = shutdown => {
            info!(deadline_ms = deadline.as_millis() as u64, "Shutdown requested, draining partitions");
            cancel.cancel();
            match tokio::time::timeout(deadline, &mut consumer).await {
                Ok(result) => result,
                Err(_) => {
                    error!(deadline_ms = deadline.as_millis() as u64, "Shutdown deadline exceeded");
                    return ExitCode::DeadlineExceeded;
                }
            }
        }
    };

    let code = classify(&result);
    match &result {
        Err(e) if code != ExitCode::Clean => error!(error = %e, exit_code = code.code(), "Consumer stopped"),
        _ => info!(exit_code = code.code(), "Consumer stopped"),
    }
    code
}

/// Wait for SIGINT or SIGTERM
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl+C, initiating shutdown..."),
        _ = terminate => info!("Received SIGTERM, initiating shutdown..."),
    }
}
