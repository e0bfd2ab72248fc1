//! Termination signal handling.

use tokio::signal::unix::{SignalKind, signal};

/// Resolves with the name of the first SIGINT or SIGTERM received.
pub async fn shutdown_signal() -> String {
    match signal(SignalKind::terminate()) {
        Ok(mut terminate) => {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => String::from("SIGINT"),
                _ = terminate.recv() => String::from("SIGTERM"),
            }
        }
        Err(err) => {
            tracing::warn!(error = %err, "cannot listen for SIGTERM; only SIGINT interrupts the run");
            if let Err(ctrl_c_err) = tokio::signal::ctrl_c().await {
                tracing::warn!(error = %ctrl_c_err, "cannot listen for SIGINT");
                std::future::pending::<()>().await;
            }
            String::from("SIGINT")
        }
    }
}
