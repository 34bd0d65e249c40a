//! VaultLink Proxy
//!
//! Native-messaging endpoint launched by the browser. Bridges the
//! extension's stdio framing to the credential store's Unix socket.

use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use daemon::config::Config;
use daemon::relay::{run_relay, spawn_host_reader, spawn_host_writer, RelayConfig};
use daemon::server::get_socket_path;

/// VaultLink Proxy - bridges a browser extension to the credential store.
#[derive(Parser, Debug)]
#[command(name = "vaultlink-proxy")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Path to configuration file
    #[arg(short, long, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Unix socket path of the credential store (overrides config)
    #[arg(short, long, value_name = "PATH")]
    pub socket: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long)]
    pub verbose: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Load configuration
    let mut config = if let Some(config_path) = &cli.config {
        Config::load(config_path)?
    } else {
        Config::load_default()?
    };

    // Apply environment variable overrides
    config.apply_env_overrides();

    // Validate configuration
    config.validate()?;

    // Initialize tracing. Stdout carries the native-messaging stream, so
    // all diagnostics go to stderr.
    let filter = if cli.verbose {
        "debug".to_string()
    } else {
        config.bridge.log_level.clone()
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let socket_path = cli
        .socket
        .or_else(|| config.bridge.socket_path.clone())
        .unwrap_or_else(get_socket_path);
    tracing::info!(path = %socket_path.display(), "VaultLink proxy starting");

    let relay_config = RelayConfig {
        socket_path,
        reconnect_delay: Duration::from_millis(config.proxy.reconnect_delay_ms),
        max_frame_size: config.proxy.max_message_size,
    };

    let host_rx = spawn_host_reader(std::io::stdin(), relay_config.max_frame_size);
    let host_tx = spawn_host_writer(std::io::stdout());

    run_relay(host_rx, host_tx, relay_config).await?;

    tracing::info!("browser disconnected, proxy exiting");
    Ok(())
}
