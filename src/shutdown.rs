//! OS signal handling
//!
//! Turns SIGINT, SIGTERM and SIGQUIT into cancellation of the root
//! [`CancellationToken`] every long-running task listens on.

use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Wait for a termination signal
///
/// Returns `Err` if the signal handlers cannot be registered.
#[cfg(unix)]
pub async fn wait_for_shutdown_signal() -> std::io::Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigint = signal(SignalKind::interrupt())?;
    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigquit = signal(SignalKind::quit())?;

    tokio::select! {
        _ = sigint.recv() => info!(signal = "SIGINT", "Received shutdown signal"),
        _ = sigterm.recv() => info!(signal = "SIGTERM", "Received shutdown signal"),
        _ = sigquit.recv() => info!(signal = "SIGQUIT", "Received shutdown signal"),
    }
    Ok(())
}

/// Wait for a termination signal
#[cfg(not(unix))]
pub async fn wait_for_shutdown_signal() -> std::io::Result<()> {
    tokio::signal::ctrl_c().await?;
    info!(signal = "ctrl-c", "Received shutdown signal");
    Ok(())
}

/// Cancel `cancel` on the first termination signal
///
/// Returns early, without cancelling, if `cancel` is cancelled by someone
/// else first. If handlers cannot be registered the token is cancelled
/// immediately so the process does not run unstoppable.
pub async fn cancel_on_signal(cancel: CancellationToken) {
    tokio::select! {
        _ = cancel.cancelled() => {}
        result = wait_for_shutdown_signal() => {
            if let Err(e) = result {
                warn!(error = %e, "Failed to register signal handlers, shutting down");
            }
            cancel.cancel();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn external_cancellation_ends_the_listener() {
        let cancel = CancellationToken::new();
        let task = tokio::spawn(cancel_on_signal(cancel.clone()));
        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(5), task)
            .await
            .expect("listener should stop")
            .unwrap();
    }
}
