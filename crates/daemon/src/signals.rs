//! Signal handling for the daemon.
//!
//! SIGTERM, SIGINT and Ctrl+C request a graceful shutdown. On Unix, SIGHUP
//! requests an immediate reconciliation pass.

use tokio::sync::mpsc;
use tracing::{error, info};

/// Wait for a shutdown signal (SIGTERM, SIGINT, or Ctrl+C).
pub async fn wait_for_shutdown() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("received SIGINT (Ctrl+C)");
        }
        _ = terminate => {
            info!("received SIGTERM");
        }
    }
}

/// Forward SIGHUP to `trigger` until the receiver is dropped.
#[cfg(unix)]
pub async fn forward_reload(trigger: mpsc::Sender<()>) {
    let mut hangup = match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::hangup()) {
        Ok(signal) => signal,
        Err(e) => {
            error!(error = %e, "failed to install SIGHUP handler");
            return;
        }
    };
    while hangup.recv().await.is_some() {
        info!("received SIGHUP");
        if trigger.send(()).await.is_err() {
            break;
        }
    }
}

#[cfg(not(unix))]
pub async fn forward_reload(_trigger: mpsc::Sender<()>) {}
