//! Graceful shutdown handling for SIGTERM and SIGINT.
//!
//! A single cancellation token fans out to the engine loop and the HTTP
//! server. The engine observes the token only at step boundaries, so an
//! in-flight file install or service restart always completes before the
//! process exits.

use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::info;

/// Resolve when SIGINT or SIGTERM arrives (or when `cancel` is cancelled
/// from inside, e.g. a fatal engine error), cancelling the token so every
/// background task stops at its next boundary.
pub async fn shutdown_signal(cancel: CancellationToken) {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received SIGINT (Ctrl+C), initiating graceful shutdown...");
        }
        _ = terminate => {
            info!("Received SIGTERM, initiating graceful shutdown...");
        }
        _ = cancel.cancelled() => {}
    }

    cancel.cancel();
}
