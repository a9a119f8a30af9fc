use std::sync::{
    Arc,
    atomic::{AtomicBool, Ordering},
};

use tokio::{signal, sync::broadcast};

/// Represents different shutdown reasons
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownReason {
    /// SIGTERM or SIGINT
    Signal,
    /// Requested from inside the process
    Requested,
    /// The shutdown channel went away
    Force,
}

/// Fans a single shutdown event out to listeners and background tasks.
pub struct GracefulShutdown {
    shutdown_tx: broadcast::Sender<ShutdownReason>,
    shutdown_initiated: Arc<AtomicBool>,
}

impl GracefulShutdown {
    pub fn new() -> Self {
        let (shutdown_tx, _) = broadcast::channel(16);
        Self {
            shutdown_tx,
            shutdown_initiated: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Check if shutdown has been initiated
    pub fn is_shutdown_initiated(&self) -> bool {
        self.shutdown_initiated.load(Ordering::Acquire)
    }

    /// Starts shutdown once; later calls are ignored.
    pub fn trigger_shutdown(&self, reason: ShutdownReason) {
        if self
            .shutdown_initiated
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            tracing::info!("Shutdown initiated: {:?}", reason);
            // no receivers just means nobody is waiting yet
            let _ = self.shutdown_tx.send(reason);
        } else {
            tracing::debug!("Shutdown already initiated, ignoring {:?}", reason);
        }
    }

    /// Waits for SIGINT or SIGTERM and triggers shutdown.
    pub async fn run_signal_handler(&self) {
        tracing::info!("Signal handler started. Listening for SIGTERM and SIGINT");

        tokio::select! {
            result = signal::ctrl_c() => match result {
                Ok(()) => tracing::info!("Received SIGINT (Ctrl+C), initiating graceful shutdown..."),
                Err(e) => {
                    tracing::error!("Failed to listen for Ctrl+C: {}", e);
                    std::future::pending::<()>().await;
                }
            },
            _ = Self::wait_for_sigterm() => {
                tracing::info!("Received SIGTERM, initiating graceful shutdown...");
            }
        }
        self.trigger_shutdown(ShutdownReason::Signal);
    }

    #[cfg(unix)]
    async fn wait_for_sigterm() {
        use tokio::signal::unix::{SignalKind, signal};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to register SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    }

    #[cfg(not(unix))]
    async fn wait_for_sigterm() {
        std::future::pending::<()>().await;
    }

    /// Create a token that resolves once shutdown begins
    pub fn shutdown_token(&self) -> ShutdownToken {
        ShutdownToken {
            receiver: self.shutdown_tx.subscribe(),
            shutdown_initiated: self.shutdown_initiated.clone(),
        }
    }
}

impl Default for GracefulShutdown {
    fn default() -> Self {
        Self::new()
    }
}

/// Handed to each listener and background task.
pub struct ShutdownToken {
    receiver: broadcast::Receiver<ShutdownReason>,
    shutdown_initiated: Arc<AtomicBool>,
}

impl Clone for ShutdownToken {
    fn clone(&self) -> Self {
        Self {
            receiver: self.receiver.resubscribe(),
            shutdown_initiated: self.shutdown_initiated.clone(),
        }
    }
}

impl ShutdownToken {
    pub fn is_shutdown_initiated(&self) -> bool {
        self.shutdown_initiated.load(Ordering::Acquire)
    }

    /// Resolves when shutdown starts, immediately if it already has.
    pub async fn wait_for_shutdown(mut self) -> ShutdownReason {
        if self.is_shutdown_initiated() {
            return ShutdownReason::Requested;
        }
        match self.receiver.recv().await {
            Ok(reason) => reason,
            Err(broadcast::error::RecvError::Lagged(_)) => ShutdownReason::Requested,
            Err(broadcast::error::RecvError::Closed) if self.is_shutdown_initiated() => {
                ShutdownReason::Requested
            }
            Err(broadcast::error::RecvError::Closed) => ShutdownReason::Force,
        }
    }
}
