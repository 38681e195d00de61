//! Configuration Manager

use super::Config;
use crate::Result;
use anyhow::{bail, Context};
use std::net::IpAddr;
use std::path::Path;
use std::time::Duration;

/// Manages configuration loading and validation
pub struct ConfigManager;

impl ConfigManager {
    /// Load configuration from file
    pub fn load_from_file(path: &Path) -> Result<Config> {
        if path.exists() {
            tracing::info!("Loading configuration from: {}", path.display());
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read config file: {}", path.display()))?;

            let config: Config = toml::from_str(&content)
                .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

            config
                .validate()
                .with_context(|| "Configuration validation failed")?;

            tracing::info!("Configuration loaded and validated successfully");
            Ok(config)
        } else {
            tracing::warn!(
                "Configuration file not found at {}, using defaults",
                path.display()
            );
            let config = Config::default();
            config.validate()?;
            Ok(config)
        }
    }

    /// Load configuration from environment variables
    pub fn load_from_env() -> Result<Config> {
        let mut config = Config::default();

        if let Ok(bind_addr) = std::env::var("OTPGATE_BIND_ADDR") {
            config.server.bind_addr = bind_addr
                .parse::<IpAddr>()
                .with_context(|| format!("Invalid OTPGATE_BIND_ADDR: {}", bind_addr))?;
        }

        if let Ok(port) = std::env::var("OTPGATE_PORT") {
            config.server.port = port
                .parse::<u16>()
                .with_context(|| format!("Invalid OTPGATE_PORT: {}", port))?;
        }

        if let Ok(max_conn) = std::env::var("OTPGATE_MAX_CONNECTIONS") {
            config.server.max_connections = max_conn
                .parse::<usize>()
                .with_context(|| format!("Invalid OTPGATE_MAX_CONNECTIONS: {}", max_conn))?;
        }

        if let Ok(max_age) = std::env::var("OTPGATE_MAX_CLIENT_AGE") {
            config.server.max_client_age = humantime::parse_duration(&max_age)
                .with_context(|| format!("Invalid OTPGATE_MAX_CLIENT_AGE: {}", max_age))?;
        }

        if let Ok(interval) = std::env::var("OTPGATE_MAINTENANCE_INTERVAL") {
            config.server.maintenance_interval = humantime::parse_duration(&interval)
                .with_context(|| format!("Invalid OTPGATE_MAINTENANCE_INTERVAL: {}", interval))?;
        }

        if let Ok(buffer_size) = std::env::var("OTPGATE_BUFFER_SIZE") {
            config.server.buffer_size = buffer_size
                .parse::<usize>()
                .with_context(|| format!("Invalid OTPGATE_BUFFER_SIZE: {}", buffer_size))?;
        }

        config.validate()?;
        Ok(config)
    }
}

impl Config {
    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.server.port == 0 {
            bail!("port must be greater than 0");
        }

        if self.server.max_connections == 0 {
            bail!("max_connections must be greater than 0");
        }

        if self.server.max_connections > 100000 {
            bail!("max_connections cannot exceed 100,000 for safety");
        }

        if self.server.max_client_age < Duration::from_secs(1) {
            bail!("max_client_age must be at least 1 second");
        }

        if self.server.max_client_age > Duration::from_secs(24 * 3600) {
            bail!("max_client_age cannot exceed 24 hours");
        }

        if self.server.maintenance_interval < Duration::from_millis(10) {
            bail!("maintenance_interval must be at least 10ms");
        }

        if self.server.maintenance_interval > Duration::from_secs(60) {
            bail!("maintenance_interval cannot exceed 1 minute");
        }

        if self.server.buffer_size < 1024 {
            bail!("buffer_size must be at least 1024 bytes");
        }

        if self.server.buffer_size > 1048576 {
            bail!("buffer_size cannot exceed 1MB");
        }

        Ok(())
    }

    /// Merge with CLI arguments
    pub fn merge_with_cli_args(
        &mut self,
        bind: Option<IpAddr>,
        port: Option<u16>,
        max_connections: Option<usize>,
        max_client_age: Option<Duration>,
        maintenance_interval: Option<Duration>,
    ) {
        if let Some(addr) = bind {
            self.server.bind_addr = addr;
            tracing::info!("CLI override: bind address set to {}", addr);
        }

        if let Some(port) = port {
            self.server.port = port;
            tracing::info!("CLI override: port set to {}", port);
        }

        if let Some(max_conn) = max_connections {
            self.server.max_connections = max_conn;
            tracing::info!("CLI override: max connections set to {}", max_conn);
        }

        if let Some(age) = max_client_age {
            self.server.max_client_age = age;
            tracing::info!("CLI override: max client age set to {:?}", age);
        }

        if let Some(interval) = maintenance_interval {
            self.server.maintenance_interval = interval;
            tracing::info!("CLI override: maintenance interval set to {:?}", interval);
        }
    }
}
