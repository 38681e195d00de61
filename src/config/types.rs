//! Configuration Types

use serde::{Deserialize, Serialize};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;

/// Main configuration structure
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    pub server: ServerConfig,
}

/// Server configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServerConfig {
    /// Address the listener binds to
    pub bind_addr: IpAddr,
    /// Port the listener binds to
    pub port: u16,
    /// Admission ceiling: the registry never grows past this many handlers
    pub max_connections: usize,
    /// Time-to-live for a handler, measured from admission
    #[serde(with = "humantime_serde")]
    pub max_client_age: Duration,
    /// Cadence of the maintenance sweep, also the capacity re-check delay
    #[serde(with = "humantime_serde")]
    pub maintenance_interval: Duration,
    /// Read buffer size used by the stock session handler
    pub buffer_size: usize,
}

impl Config {
    /// The full socket address the listener binds to.
    pub fn listen_addr(&self) -> SocketAddr {
        self.server.listen_addr()
    }
}

impl ServerConfig {
    pub fn listen_addr(&self) -> SocketAddr {
        SocketAddr::new(self.bind_addr, self.port)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            port: 16588,
            max_connections: 250,
            max_client_age: Duration::from_secs(60),
            maintenance_interval: Duration::from_millis(500),
            buffer_size: 8192,
        }
    }
}
