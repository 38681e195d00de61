//! Server Lifecycle
//!
//! [`Server`] ties the pieces together: it binds the listener, runs the
//! capacity-gated accept loop, and runs the maintenance sweep, all against
//! one shared [`Registry`]. Start and stop are explicit and idempotent, and
//! both workers exit through the same shutdown broadcast.

use std::net::SocketAddr;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use parking_lot::Mutex;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{debug, info, warn};

use crate::config::types::ServerConfig;
use crate::handler::HandlerFactory;
use crate::reaper::Reaper;
use crate::registry::Registry;
use crate::Result;

/// Running totals kept by the acceptor and the maintenance sweep.
#[derive(Debug, Default)]
pub struct Counters {
    admitted: AtomicU64,
    capacity_deferrals: AtomicU64,
    accept_errors: AtomicU64,
    evicted_inactive: AtomicU64,
    evicted_expired: AtomicU64,
    sweep_faults: AtomicU64,
}

impl Counters {
    pub fn record_admitted(&self) {
        self.admitted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_capacity_deferral(&self) {
        self.capacity_deferrals.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_accept_error(&self) {
        self.accept_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_evicted_inactive(&self, n: u64) {
        self.evicted_inactive.fetch_add(n, Ordering::Relaxed);
    }

    pub fn record_evicted_expired(&self, n: u64) {
        self.evicted_expired.fetch_add(n, Ordering::Relaxed);
    }

    pub fn record_sweep_faults(&self, n: u64) {
        self.sweep_faults.fetch_add(n, Ordering::Relaxed);
    }

    pub fn snapshot(&self, current_connections: usize, max_connections: usize) -> ServerStats {
        ServerStats {
            current_connections,
            max_connections,
            admitted: self.admitted.load(Ordering::Relaxed),
            capacity_deferrals: self.capacity_deferrals.load(Ordering::Relaxed),
            accept_errors: self.accept_errors.load(Ordering::Relaxed),
            evicted_inactive: self.evicted_inactive.load(Ordering::Relaxed),
            evicted_expired: self.evicted_expired.load(Ordering::Relaxed),
            sweep_faults: self.sweep_faults.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time view of the server's counters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerStats {
    pub current_connections: usize,
    pub max_connections: usize,
    pub admitted: u64,
    pub capacity_deferrals: u64,
    pub accept_errors: u64,
    pub evicted_inactive: u64,
    pub evicted_expired: u64,
    pub sweep_faults: u64,
}

/// Accepts connections while the registry has room.
struct Acceptor {
    listener: TcpListener,
    registry: Arc<Registry>,
    factory: Arc<dyn HandlerFactory>,
    counters: Arc<Counters>,
    max_connections: usize,
    retry_delay: Duration,
}

impl Acceptor {
    async fn run(self, mut shutdown_rx: broadcast::Receiver<()>) {
        loop {
            // Strict ceiling: never admit while the registry is full. Wait
            // out one maintenance interval so the sweep can free a slot.
            if self.registry.len() >= self.max_connections {
                self.counters.record_capacity_deferral();
                debug!(limit = self.max_connections, "at capacity, deferring accepts");
                tokio::select! {
                    _ = sleep(self.retry_delay) => {}
                    _ = shutdown_rx.recv() => break,
                }
                continue;
            }

            tokio::select! {
                result = self.listener.accept() => {
                    match result {
                        Ok((stream, peer)) => self.admit(stream, peer),
                        Err(e) => {
                            self.counters.record_accept_error();
                            warn!(error = %e, "accept failed");
                        }
                    }
                }
                _ = shutdown_rx.recv() => break,
            }
        }

        // Dropping the listener here releases the port.
        debug!("accept loop stopped");
    }

    fn admit(&self, stream: TcpStream, peer: SocketAddr) {
        let handler = self.factory.create(peer);
        let key = self.registry.insert(Arc::clone(&handler), peer);
        handler.start(stream);
        self.counters.record_admitted();
        debug!(key, %peer, connections = self.registry.len(), "connection admitted");
    }
}

/// Capacity-gated TCP connection manager.
///
/// An instance owns its listener, registry, and worker tasks, so several
/// servers can coexist in one process. [`Server::start`] and
/// [`Server::stop`] may be called repeatedly on the same instance.
pub struct Server {
    config: ServerConfig,
    factory: Arc<dyn HandlerFactory>,
    registry: Arc<Registry>,
    counters: Arc<Counters>,
    active: AtomicBool,
    shutdown_tx: broadcast::Sender<()>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    local_addr: Mutex<Option<SocketAddr>>,
}

impl Server {
    pub fn new(config: ServerConfig, factory: Arc<dyn HandlerFactory>) -> Self {
        let (shutdown_tx, _) = broadcast::channel(4);

        Self {
            config,
            factory,
            registry: Arc::new(Registry::new()),
            counters: Arc::new(Counters::default()),
            active: AtomicBool::new(false),
            shutdown_tx,
            tasks: Mutex::new(Vec::new()),
            local_addr: Mutex::new(None),
        }
    }

    /// Bind the listener and launch the acceptor and maintenance workers.
    ///
    /// A bind failure is fatal and is returned to the caller with the flag
    /// cleared, so a retry is possible. Calling `start` on a server that is
    /// already running logs a warning and changes nothing.
    pub async fn start(&self) -> Result<()> {
        if self.active.swap(true, Ordering::SeqCst) {
            warn!("server already running, ignoring start request");
            return Ok(());
        }

        let addr = self.config.listen_addr();
        let listener = match TcpListener::bind(addr).await {
            Ok(listener) => listener,
            Err(e) => {
                self.active.store(false, Ordering::SeqCst);
                return Err(e).context(format!("failed to bind listener on {}", addr));
            }
        };

        let local_addr = match listener.local_addr() {
            Ok(addr) => addr,
            Err(e) => {
                self.active.store(false, Ordering::SeqCst);
                return Err(e).context("failed to read listener address");
            }
        };
        *self.local_addr.lock() = Some(local_addr);

        info!(
            addr = %local_addr,
            max_connections = self.config.max_connections,
            max_client_age = ?self.config.max_client_age,
            "server listening"
        );

        let acceptor = Acceptor {
            listener,
            registry: Arc::clone(&self.registry),
            factory: Arc::clone(&self.factory),
            counters: Arc::clone(&self.counters),
            max_connections: self.config.max_connections,
            retry_delay: self.config.maintenance_interval,
        };
        let reaper = Reaper::new(
            Arc::clone(&self.registry),
            self.config.max_client_age,
            self.config.maintenance_interval,
            Arc::clone(&self.counters),
        );

        let mut tasks = self.tasks.lock();
        tasks.push(tokio::spawn(acceptor.run(self.shutdown_tx.subscribe())));
        tasks.push(tokio::spawn(reaper.run(self.shutdown_tx.subscribe())));

        Ok(())
    }

    /// Stop accepting, wait for the workers to exit, then tear down every
    /// remaining handler. Idempotent; stopping a stopped server is a no-op.
    pub async fn stop(&self) {
        if !self.active.swap(false, Ordering::SeqCst) {
            debug!("server not running, ignoring stop request");
            return;
        }

        info!("server stopping");

        // send() errors only when no receiver is alive, meaning the workers
        // are already gone.
        let _ = self.shutdown_tx.send(());

        // Join the workers before draining: once the acceptor has exited,
        // nothing can admit behind our back.
        let tasks: Vec<JoinHandle<()>> = self.tasks.lock().drain(..).collect();
        for task in tasks {
            if let Err(e) = task.await {
                if !e.is_cancelled() {
                    warn!(error = %e, "worker task ended abnormally");
                }
            }
        }

        let drained = self.registry.drain();
        let closed = drained.len();
        for (key, entry) in drained {
            let teardown = panic::catch_unwind(AssertUnwindSafe(|| {
                entry.handler.stop();
                entry.handler.dispose();
            }));
            if teardown.is_err() {
                warn!(key, peer = %entry.peer, "handler fault during shutdown teardown");
            }
        }

        *self.local_addr.lock() = None;
        info!(connections_closed = closed, "server stopped");
    }

    /// Number of currently admitted connections.
    pub fn connection_count(&self) -> usize {
        self.registry.len()
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    /// Address the listener is actually bound to, while running. Useful when
    /// the configured port is 0.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.local_addr.lock()
    }

    pub fn get_stats(&self) -> ServerStats {
        self.counters
            .snapshot(self.registry.len(), self.config.max_connections)
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }
}
