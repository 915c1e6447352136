use tokio::sync::broadcast;
use tracing::{info, warn};

/// Process-wide shutdown signal shared by the serve loop and background services.
pub struct GracefulShutdown {
    shutdown_tx: broadcast::Sender<()>,
    is_shutting_down: std::sync::atomic::AtomicBool,
}

impl GracefulShutdown {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(1);
        Self {
            shutdown_tx: tx,
            is_shutting_down: std::sync::atomic::AtomicBool::new(false),
        }
    }

    /// Check if shutdown has been requested.
    pub fn is_shutting_down(&self) -> bool {
        self.is_shutting_down
            .load(std::sync::atomic::Ordering::SeqCst)
    }

    /// Subscribe to shutdown signal. Returns a receiver that completes when shutdown is requested.
    pub fn subscribe(&self) -> broadcast::Receiver<()> {
        self.shutdown_tx.subscribe()
    }

    /// Request graceful shutdown.
    pub fn request_shutdown(&self) {
        if !self
            .is_shutting_down
            .swap(true, std::sync::atomic::Ordering::SeqCst)
        {
            info!("Shutdown requested, initiating graceful shutdown...");
            let _ = self.shutdown_tx.send(());
        }
    }

    /// Wait for SIGINT / SIGTERM, then request shutdown.
    pub async fn wait_for_signal(&self) {
        #[cfg(unix)]
        {
            use tokio::signal::unix::{signal, SignalKind};
            match (
                signal(SignalKind::interrupt()),
                signal(SignalKind::terminate()),
            ) {
                (Ok(mut sigint), Ok(mut sigterm)) => {
                    tokio::select! {
                        _ = sigint.recv() => info!("Received SIGINT"),
                        _ = sigterm.recv() => info!("Received SIGTERM"),
                    }
                }
                _ => {
                    warn!("Unix signal handlers unavailable, falling back to Ctrl+C");
                    wait_for_ctrl_c().await;
                }
            }
        }
        #[cfg(not(unix))]
        wait_for_ctrl_c().await;

        self.request_shutdown();
    }
}

async fn wait_for_ctrl_c() {
    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("Received Ctrl+C"),
        Err(e) => {
            warn!(error = %e, "Ctrl+C handler unavailable, waiting indefinitely");
            std::future::pending::<()>().await;
        }
    }
}

impl Default for GracefulShutdown {
    fn default() -> Self {
        Self::new()
    }
}
