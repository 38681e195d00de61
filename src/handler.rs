//! Client Handler Contract
//!
//! The connection manager owns admission and reaping; everything protocol
//! level happens behind the [`ClientHandler`] trait. A handler is minted by a
//! [`HandlerFactory`] for each accepted connection, registered, then started
//! with the raw stream. The manager only ever talks to it through the four
//! operations below.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bytes::BytesMut;
use parking_lot::Mutex;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Per-client handler contract required by the connection manager.
pub trait ClientHandler: Send + Sync {
    /// Begin processing the accepted stream. Spawns the handler's own task
    /// and must not block the caller.
    fn start(&self, stream: TcpStream);

    /// Whether the handler's connection/work is still live. A handler that
    /// returns false is removed and disposed on the next maintenance sweep.
    fn is_active(&self) -> bool;

    /// Request termination. Idempotent.
    fn stop(&self);

    /// Release the underlying socket and any resources. Idempotent and safe
    /// to call after `stop()`.
    fn dispose(&self);
}

/// Mints one handler per accepted connection.
pub trait HandlerFactory: Send + Sync {
    fn create(&self, peer: SocketAddr) -> Arc<dyn ClientHandler>;
}

/// Stock session handler: echoes whatever the client sends.
///
/// Exists so the binary is a running server out of the box and so the
/// integration tests can drive admission and eviction over real sockets.
/// Anything protocol-shaped beyond this belongs in a real handler
/// implementation.
pub struct EchoHandler {
    peer: SocketAddr,
    buffer_size: usize,
    active: Arc<AtomicBool>,
    stop_signal: Arc<Notify>,
    disposed: AtomicBool,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl EchoHandler {
    pub fn new(peer: SocketAddr, buffer_size: usize) -> Self {
        Self {
            peer,
            buffer_size,
            active: Arc::new(AtomicBool::new(true)),
            stop_signal: Arc::new(Notify::new()),
            disposed: AtomicBool::new(false),
            task: Mutex::new(None),
        }
    }

    async fn session(
        mut stream: TcpStream,
        peer: SocketAddr,
        buffer_size: usize,
        active: Arc<AtomicBool>,
        stop_signal: Arc<Notify>,
    ) {
        let mut buf = BytesMut::with_capacity(buffer_size);

        loop {
            tokio::select! {
                result = stream.read_buf(&mut buf) => {
                    match result {
                        Ok(0) => {
                            debug!(%peer, "client closed connection");
                            break;
                        }
                        Ok(n) => {
                            if let Err(e) = stream.write_all(&buf).await {
                                debug!(%peer, error = %e, "echo write failed");
                                break;
                            }
                            debug!(%peer, bytes = n, "echoed");
                            buf.clear();
                        }
                        Err(e) => {
                            debug!(%peer, error = %e, "read failed");
                            break;
                        }
                    }
                }
                _ = stop_signal.notified() => {
                    debug!(%peer, "session stop requested");
                    break;
                }
            }
        }

        active.store(false, Ordering::Release);
    }
}

impl ClientHandler for EchoHandler {
    fn start(&self, stream: TcpStream) {
        let mut slot = self.task.lock();
        if slot.is_some() {
            warn!(peer = %self.peer, "session already started, ignoring");
            return;
        }

        let peer = self.peer;
        let buffer_size = self.buffer_size;
        let active = Arc::clone(&self.active);
        let stop_signal = Arc::clone(&self.stop_signal);

        *slot = Some(tokio::spawn(async move {
            Self::session(stream, peer, buffer_size, active, stop_signal).await;
        }));

        debug!(peer = %self.peer, "session started");
    }

    fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    fn stop(&self) {
        self.active.store(false, Ordering::Release);
        // notify_one stores a permit, so a stop that lands before the session
        // task first awaits the signal is not lost
        self.stop_signal.notify_one();
    }

    fn dispose(&self) {
        if self.disposed.swap(true, Ordering::AcqRel) {
            return;
        }

        self.active.store(false, Ordering::Release);
        if let Some(task) = self.task.lock().take() {
            // The task owns the stream; ending it closes the socket.
            task.abort();
        }

        debug!(peer = %self.peer, "session resources released");
    }
}

/// Factory for the stock echo handler.
pub struct EchoHandlerFactory {
    buffer_size: usize,
}

impl EchoHandlerFactory {
    pub fn new(buffer_size: usize) -> Self {
        Self { buffer_size }
    }
}

impl HandlerFactory for EchoHandlerFactory {
    fn create(&self, peer: SocketAddr) -> Arc<dyn ClientHandler> {
        Arc::new(EchoHandler::new(peer, self.buffer_size))
    }
}
