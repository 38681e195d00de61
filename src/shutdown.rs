//! Graceful Shutdown Handling
//!
//! Bridges process signals to the server lifecycle. SIGTERM, SIGINT, and
//! Ctrl+C all funnel into one broadcast; the binary then drives
//! [`Server::stop`] and announces completion for anything waiting on it.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::signal;
use tokio::sync::{broadcast, Notify};
use tracing::{info, warn};

use crate::server::Server;
use crate::Result;

/// Coordinates signal-driven shutdown of a [`Server`].
pub struct ShutdownCoordinator {
    /// Broadcast sender for the shutdown signal
    shutdown_tx: broadcast::Sender<()>,
    /// Notification for shutdown completion
    shutdown_complete: Arc<Notify>,
}

impl ShutdownCoordinator {
    pub fn new() -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);

        Self {
            shutdown_tx,
            shutdown_complete: Arc::new(Notify::new()),
        }
    }

    /// Receiver for components that want to react to the shutdown signal.
    pub fn subscribe(&self) -> broadcast::Receiver<()> {
        self.shutdown_tx.subscribe()
    }

    /// Handle to wait for shutdown completion.
    pub fn completion_handle(&self) -> Arc<Notify> {
        Arc::clone(&self.shutdown_complete)
    }

    /// Programmatic shutdown, equivalent to receiving a signal.
    pub fn trigger(&self) {
        if let Err(e) = self.shutdown_tx.send(()) {
            warn!("failed to send shutdown signal: {}", e);
        }
    }

    /// Block until SIGTERM, SIGINT, or Ctrl+C arrives, then broadcast the
    /// shutdown signal.
    pub async fn listen_for_signals(&self) -> Result<()> {
        #[cfg(unix)]
        {
            let mut sigterm = signal::unix::signal(signal::unix::SignalKind::terminate())?;
            let mut sigint = signal::unix::signal(signal::unix::SignalKind::interrupt())?;

            tokio::select! {
                _ = sigterm.recv() => {
                    info!("received SIGTERM, initiating graceful shutdown");
                }
                _ = sigint.recv() => {
                    info!("received SIGINT, initiating graceful shutdown");
                }
                _ = signal::ctrl_c() => {
                    info!("received Ctrl+C, initiating graceful shutdown");
                }
            }
        }

        #[cfg(windows)]
        {
            signal::ctrl_c().await?;
            info!("received Ctrl+C, initiating graceful shutdown");
        }

        self.trigger();

        Ok(())
    }

    /// Stop the server and announce completion.
    pub async fn shutdown_server(&self, server: &Server) -> Result<()> {
        let started = Instant::now();
        let open = server.connection_count();
        if open > 0 {
            info!(connections = open, "tearing down admitted connections");
        }

        server.stop().await;

        info!(elapsed = ?started.elapsed(), "shutdown complete");
        self.shutdown_complete.notify_waiters();

        Ok(())
    }

    /// Wait for shutdown completion, bounded by `timeout`.
    pub async fn wait_for_completion(&self, timeout: Duration) -> Result<()> {
        tokio::time::timeout(timeout, self.shutdown_complete.notified())
            .await
            .map_err(|_| anyhow::anyhow!("shutdown completion timeout"))?;

        Ok(())
    }
}

impl Default for ShutdownCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::types::ServerConfig;
    use crate::handler::EchoHandlerFactory;
    use tokio::net::TcpStream;
    use tokio::time::sleep;

    fn test_server() -> Server {
        let config = ServerConfig {
            bind_addr: "127.0.0.1".parse().unwrap(),
            port: 0,
            maintenance_interval: Duration::from_millis(20),
            ..ServerConfig::default()
        };
        Server::new(config, Arc::new(EchoHandlerFactory::new(1024)))
    }

    #[tokio::test]
    async fn test_trigger_reaches_subscribers() {
        let coordinator = ShutdownCoordinator::new();
        let mut receiver = coordinator.subscribe();

        coordinator.trigger();

        assert!(receiver.recv().await.is_ok());
    }

    #[tokio::test]
    async fn test_shutdown_server_stops_and_notifies() {
        let coordinator = ShutdownCoordinator::new();
        let server = test_server();

        server.start().await.unwrap();
        let addr = server.local_addr().unwrap();
        let _client = TcpStream::connect(addr).await.unwrap();

        let completion = coordinator.completion_handle();
        let waiter = tokio::spawn(async move {
            completion.notified().await;
        });
        // Let the waiter park before completion fires.
        sleep(Duration::from_millis(20)).await;

        coordinator.shutdown_server(&server).await.unwrap();

        assert!(!server.is_active());
        assert_eq!(server.connection_count(), 0);
        tokio::time::timeout(Duration::from_secs(2), waiter)
            .await
            .expect("completion should be announced")
            .unwrap();
    }

    #[tokio::test]
    async fn test_wait_for_completion_times_out_without_shutdown() {
        let coordinator = ShutdownCoordinator::new();

        let result = coordinator
            .wait_for_completion(Duration::from_millis(50))
            .await;
        assert!(result.is_err());
    }
}
