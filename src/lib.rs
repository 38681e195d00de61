//! OTPGate Library
//!
//! Capacity-gated TCP connection manager with inactivity and age-based
//! reaping.
//!
//! A [`Server`] binds a listener and admits connections while the registry
//! has room; each connection is handed to a [`handler::ClientHandler`] minted
//! by a [`handler::HandlerFactory`]. A maintenance sweep evicts handlers that
//! report inactive and handlers that outlive the configured maximum age.

pub mod config;
pub mod handler;
pub mod reaper;
pub mod registry;
pub mod server;
pub mod shutdown;

pub use config::Config;
pub use handler::{ClientHandler, EchoHandlerFactory, HandlerFactory};
pub use registry::Registry;
pub use server::{Server, ServerStats};
pub use shutdown::ShutdownCoordinator;

/// Common error type for the connection manager
pub type Result<T> = anyhow::Result<T>;
