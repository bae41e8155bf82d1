//! Graceful shutdown handling for SIGTERM and SIGINT.
//!
//! A signal cancels the run token: file tasks in flight stop at their next await
//! point and are counted as cancelled, while every directory already visited
//! still gets its snapshot written.

use std::io;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::info;

/// Shutdown coordinator
pub struct ShutdownCoordinator {
    token: CancellationToken,
}

impl ShutdownCoordinator {
    pub fn new(token: CancellationToken) -> Self {
        Self { token }
    }

    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    /// Wait for SIGTERM or SIGINT, then cancel the run.
    pub async fn wait_for_signal(&self) -> io::Result<()> {
        #[cfg(unix)]
        let mut terminate = signal::unix::signal(signal::unix::SignalKind::terminate())?;

        #[cfg(unix)]
        let terminate = async move {
            terminate.recv().await;
        };

        #[cfg(not(unix))]
        let terminate = std::future::pending::<()>();

        tokio::select! {
            result = signal::ctrl_c() => {
                result?;
                info!("Received SIGINT (Ctrl+C), cancelling run...");
            }
            _ = terminate => {
                info!("Received SIGTERM, cancelling run...");
            }
            _ = self.token.cancelled() => return Ok(()),
        }

        self.trigger();
        Ok(())
    }

    /// Cancel the run without a signal.
    pub fn trigger(&self) {
        if !self.token.is_cancelled() {
            info!("Shutdown requested");
            self.token.cancel();
        }
    }
}
