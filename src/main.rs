//! OTPGate - Capacity-Gated TCP Connection Manager
//!
//! Binds a TCP listener, admits connections while the registry has room, and
//! evicts sessions that go quiet or outlive the configured maximum age.

use anyhow::{Context, Result};
use clap::Parser;
use std::net::IpAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use otpgate::{config::ConfigManager, EchoHandlerFactory, Server, ShutdownCoordinator};

/// CLI arguments for OTPGate
#[derive(Parser, Debug)]
#[command(name = "otpgate")]
#[command(about = "OTPGate - Capacity-gated TCP connection manager")]
#[command(version)]
#[command(long_about = "
OTPGate - Capacity-gated TCP connection manager

Accepts TCP connections up to a fixed ceiling and hands each one to a
session handler. A periodic maintenance sweep evicts sessions that have
gone inactive and sessions older than the configured maximum age.

Configuration priority (highest to lowest):
1. Command-line arguments
2. Configuration file
3. Environment variables
4. Built-in defaults

Environment variables:
  OTPGATE_BIND_ADDR            - Bind address (e.g., 0.0.0.0)
  OTPGATE_PORT                 - Port to bind to
  OTPGATE_MAX_CONNECTIONS      - Maximum concurrent connections
  OTPGATE_MAX_CLIENT_AGE       - Session time-to-live (e.g., 1m, 90s)
  OTPGATE_MAINTENANCE_INTERVAL - Sweep cadence (e.g., 500ms)
  OTPGATE_BUFFER_SIZE          - Session read buffer size in bytes
")]
pub struct CliArgs {
    /// Configuration file path
    #[arg(
        short,
        long,
        default_value = "config.toml",
        help = "Path to configuration file"
    )]
    pub config: PathBuf,

    /// Bind address (overrides config file)
    #[arg(short, long, help = "Bind address (e.g., 0.0.0.0)")]
    pub bind: Option<IpAddr>,

    /// Port to bind to (overrides config file)
    #[arg(short, long, help = "Port to bind to")]
    pub port: Option<u16>,

    /// Maximum number of concurrent connections
    #[arg(long, help = "Maximum number of concurrent connections")]
    pub max_connections: Option<usize>,

    /// Maximum session age before eviction
    #[arg(
        long,
        value_parser = humantime::parse_duration,
        help = "Maximum session age before eviction (e.g., 1m, 90s)"
    )]
    pub max_client_age: Option<Duration>,

    /// Maintenance sweep cadence
    #[arg(
        long,
        value_parser = humantime::parse_duration,
        help = "Maintenance sweep cadence (e.g., 500ms)"
    )]
    pub maintenance_interval: Option<Duration>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info", help = "Log level")]
    pub log_level: String,

    /// Enable verbose logging (sets log level to debug)
    #[arg(short, long, help = "Enable verbose logging")]
    pub verbose: bool,

    /// Validate configuration and exit
    #[arg(long, help = "Validate configuration and exit")]
    pub validate_config: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = CliArgs::parse();

    init_tracing(&args)?;

    info!("Starting OTPGate v{}", env!("CARGO_PKG_VERSION"));

    // Load configuration with priority: CLI args > config file > environment > defaults
    let mut config = if args.config.exists() {
        ConfigManager::load_from_file(&args.config)?
    } else {
        info!("Config file not found, checking environment variables");
        ConfigManager::load_from_env()?
    };

    // Apply CLI argument overrides (highest priority)
    config.merge_with_cli_args(
        args.bind,
        args.port,
        args.max_connections,
        args.max_client_age,
        args.maintenance_interval,
    );

    // Final validation after all overrides
    config
        .validate()
        .context("Final configuration validation failed")?;

    // If validate-config flag is set, just validate and exit
    if args.validate_config {
        info!("✅ Configuration is valid");
        info!("Configuration summary:");
        info!("  Listen address: {}", config.listen_addr());
        info!("  Max connections: {}", config.server.max_connections);
        info!("  Max client age: {:?}", config.server.max_client_age);
        info!(
            "  Maintenance interval: {:?}",
            config.server.maintenance_interval
        );
        info!("  Buffer size: {} bytes", config.server.buffer_size);
        return Ok(());
    }

    info!("Configuration loaded successfully");

    let shutdown_coordinator = ShutdownCoordinator::new();

    let factory = Arc::new(EchoHandlerFactory::new(config.server.buffer_size));
    let server = Server::new(config.server.clone(), factory);

    // A bind failure is fatal at startup.
    server.start().await?;

    info!("🚀 OTPGate started successfully!");
    info!("🛑 Press Ctrl+C or send SIGTERM/SIGINT to shutdown gracefully");

    if let Err(e) = shutdown_coordinator.listen_for_signals().await {
        error!("Error setting up signal handlers: {}", e);
    }

    shutdown_coordinator.shutdown_server(&server).await?;

    info!("Server shutdown complete");

    Ok(())
}

/// Initialize tracing/logging
fn init_tracing(args: &CliArgs) -> Result<()> {
    let log_level = if args.verbose {
        "debug"
    } else {
        &args.log_level
    };

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(log_level));

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_thread_ids(true)
                .with_level(true)
                .with_ansi(true),
        )
        .with(env_filter)
        .init();

    Ok(())
}
