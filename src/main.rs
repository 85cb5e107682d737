//! socksproxy - SOCKS5 proxy server

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use socksproxy::{config::ConfigManager, Config, ConnectionManager, ShutdownCoordinator};

/// CLI arguments for socksproxy
#[derive(Parser, Debug)]
#[command(name = "socksproxy")]
#[command(about = "SOCKS5 proxy server (RFC 1928 / RFC 1929)")]
#[command(version)]
#[command(long_about = "
SOCKS5 proxy server with username/password authentication and access control.

Configuration priority (highest to lowest):
1. Command-line arguments
2. Configuration file
3. Environment variables
4. Built-in defaults

Environment variables:
  SOCKS5_BIND_ADDR          - Bind address (e.g., 127.0.0.1:1080)
  SOCKS5_MAX_CONNECTIONS    - Maximum concurrent connections
  SOCKS5_HANDSHAKE_TIMEOUT  - Handshake timeout (e.g., 10s)
  SOCKS5_CONNECT_TIMEOUT    - Outbound connect timeout (e.g., 10s)
  SOCKS5_IDLE_TIMEOUT       - Relay idle timeout (e.g., 5m)
  SOCKS5_AUTH_METHODS       - Comma separated methods: none, userpass
  SOCKS5_LOG_LEVEL          - Log level (trace, debug, info, warn, error)

RUST_LOG, when set, overrides every log level option.
")]
pub struct CliArgs {
    #[arg(
        short,
        long,
        default_value = "config.toml",
        help = "Path to configuration file"
    )]
    pub config: PathBuf,

    #[arg(short, long, help = "Bind address (e.g., 127.0.0.1:1080)")]
    pub bind: Option<String>,

    #[arg(short, long, help = "Port to bind to")]
    pub port: Option<u16>,

    #[arg(long, help = "Log level (overrides logging.level)")]
    pub log_level: Option<String>,

    #[arg(short, long, help = "Enable verbose logging")]
    pub verbose: bool,

    #[arg(long, help = "Disable authentication")]
    pub no_auth: bool,

    #[arg(long, help = "Maximum number of concurrent connections")]
    pub max_connections: Option<usize>,

    #[arg(long, value_parser = humantime::parse_duration, help = "Outbound connect timeout (e.g., 10s)")]
    pub timeout: Option<Duration>,

    #[arg(long, help = "Relay buffer size in bytes")]
    pub buffer_size: Option<usize>,

    #[arg(long, help = "Validate configuration and exit")]
    pub validate_config: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = CliArgs::parse();

    // CLI args > config file > environment > defaults
    let mut config = if args.config.exists() {
        ConfigManager::load_from_file(&args.config)?
    } else {
        ConfigManager::load_from_env()?
    };

    init_tracing(&args, &config.logging.level)?;
    info!("Starting socksproxy v{}", env!("CARGO_PKG_VERSION"));
    if !args.config.exists() {
        info!(
            "Config file {} not found, using environment and defaults",
            args.config.display()
        );
    }

    config.merge_with_cli_args(
        args.bind.as_deref(),
        args.port,
        args.max_connections,
        args.no_auth,
        args.timeout,
        args.buffer_size,
    )?;

    config
        .validate()
        .context("Final configuration validation failed")?;

    if args.validate_config {
        info!("Configuration is valid");
        log_summary(&config);
        return Ok(());
    }
    log_summary(&config);

    let shutdown_coordinator = ShutdownCoordinator::new(config.server.shutdown_timeout);
    let mut connection_manager = ConnectionManager::new(Arc::new(config))?;
    connection_manager.bind().await?;
    let connection_manager = Arc::new(connection_manager);

    let server = Arc::clone(&connection_manager);
    let mut server_handle = tokio::spawn(async move { server.run().await });

    info!("Press Ctrl+C or send SIGTERM/SIGINT to shut down gracefully");

    tokio::select! {
        result = &mut server_handle => {
            match result {
                Ok(Ok(())) => info!("Server stopped"),
                Ok(Err(e)) => error!("Server error: {:#}", e),
                Err(e) => error!("Server task failed: {}", e),
            }
        }
        result = shutdown_coordinator.listen_for_signals() => {
            if let Err(e) = result {
                error!("Error setting up signal handlers: {}", e);
            }
            info!("Initiating graceful shutdown...");
            shutdown_coordinator
                .shutdown_connection_manager(&connection_manager)
                .await?;
            if let Err(e) = server_handle.await {
                if !e.is_cancelled() {
                    warn!("Server task failed: {}", e);
                }
            }
        }
    }

    info!("Server shutdown complete");
    Ok(())
}

fn log_summary(config: &Config) {
    info!("Bind address: {}", config.server.bind_addr);
    info!("Max connections: {}", config.server.max_connections);
    info!(
        "Timeouts: handshake {}, connect {}, idle {}",
        humantime::format_duration(config.server.handshake_timeout),
        humantime::format_duration(config.server.connect_timeout),
        humantime::format_duration(config.server.idle_timeout)
    );
    info!("Buffer size: {} bytes", config.server.buffer_size);
    info!(
        "Authentication methods: {}",
        config.auth.effective_methods().join(", ")
    );
    info!(
        "Access control: {}",
        if config.access_control.enabled {
            "enabled"
        } else {
            "disabled"
        }
    );
}

/// Initialize tracing/logging
fn init_tracing(args: &CliArgs, config_level: &str) -> Result<()> {
    let log_level = if args.verbose {
        "debug"
    } else {
        args.log_level.as_deref().unwrap_or(config_level)
    };

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .or_else(|_| tracing_subscriber::EnvFilter::try_new(log_level))
        .with_context(|| format!("Invalid log level: {}", log_level))?;

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
