use eyre::{Result, WrapErr};
use tokio::signal;
use tokio_util::sync::CancellationToken;

/// Process-wide shutdown trigger.
///
/// Everything long-lived (the server, the health checker, the config watcher
/// and open streams) holds a child token and stops when it is cancelled.
#[derive(Debug, Clone, Default)]
pub struct ShutdownSignal {
    token: CancellationToken,
}

impl ShutdownSignal {
    pub fn new() -> Self {
        Self::default()
    }

    /// Token cancelled together with this signal.
    pub fn token(&self) -> CancellationToken {
        self.token.child_token()
    }

    pub fn is_triggered(&self) -> bool {
        self.token.is_cancelled()
    }

    pub fn trigger(&self) {
        if !self.token.is_cancelled() {
            tracing::info!("Shutdown triggered");
            self.token.cancel();
        }
    }

    /// Resolves once shutdown has been triggered.
    pub async fn triggered(&self) {
        self.token.cancelled().await;
    }

    /// Wait for SIGINT or SIGTERM, then trigger shutdown.
    pub async fn listen_for_signals(&self) -> Result<()> {
        tracing::info!("Listening for SIGINT and SIGTERM");

        tokio::select! {
            result = signal::ctrl_c() => {
                result.wrap_err("Failed to listen for Ctrl+C")?;
                tracing::info!("Received SIGINT, initiating graceful shutdown");
            }
            result = wait_for_sigterm() => {
                result?;
                tracing::info!("Received SIGTERM, initiating graceful shutdown");
            }
            _ = self.token.cancelled() => return Ok(()),
        }

        self.trigger();
        Ok(())
    }
}

#[cfg(unix)]
async fn wait_for_sigterm() -> Result<()> {
    use tokio::signal::unix::{SignalKind, signal};
    let mut sigterm =
        signal(SignalKind::terminate()).wrap_err("Failed to register SIGTERM handler")?;
    sigterm.recv().await;
    Ok(())
}

#[cfg(not(unix))]
async fn wait_for_sigterm() -> Result<()> {
    std::future::pending::<()>().await;
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[tokio::test]
    async fn test_trigger_cancels_child_tokens() {
        let shutdown = ShutdownSignal::new();
        let token = shutdown.token();
        assert!(!shutdown.is_triggered());
        assert!(!token.is_cancelled());

        shutdown.trigger();
        assert!(shutdown.is_triggered());
        assert!(token.is_cancelled());
    }

    #[tokio::test]
    async fn test_clones_share_state() {
        let shutdown = ShutdownSignal::new();
        let waiter = shutdown.clone();
        let handle = tokio::spawn(async move { waiter.triggered().await });

        shutdown.trigger();
        assert!(
            tokio::time::timeout(Duration::from_secs(1), handle)
                .await
                .is_ok()
        );
    }

    #[tokio::test]
    async fn test_signal_listener_returns_after_trigger() {
        let shutdown = ShutdownSignal::new();
        shutdown.trigger();
        let result =
            tokio::time::timeout(Duration::from_secs(1), shutdown.listen_for_signals()).await;
        assert!(matches!(result, Ok(Ok(()))));
    }
}
