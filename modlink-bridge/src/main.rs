//! Modbus register bridge.
//!
//! Polls holding registers from a Modbus TCP endpoint and pushes snapshots
//! to WebSocket observers.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::sync::watch;
use tracing::{error, info, warn};

use modlink_bridge::server::HttpServer;
use modlink_bridge::{Bridge, BridgeConfig, ModbusTcpConnector};

/// Modbus register bridge.
#[derive(Parser, Debug)]
#[command(name = "modlink-bridge")]
#[command(about = "Polls Modbus holding registers and pushes snapshots to WebSocket observers")]
#[command(version)]
struct Args {
    /// Path to configuration file (JSON5 format)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Override log level (trace, debug, info, warn, error).
    #[arg(long)]
    log_level: Option<String>,

    /// HTTP listen address (overrides config).
    #[arg(long)]
    listen: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Load configuration
    let mut config = match &args.config {
        Some(path) => BridgeConfig::load_from_file(path)
            .with_context(|| format!("Failed to load config from {:?}", path))?,
        None => BridgeConfig::default(),
    };

    // Override listen address from CLI
    if let Some(listen) = args.listen {
        config.server.listen = listen;
    }

    // Validate once, with overrides applied
    config.validate().context("Invalid configuration")?;

    // Initialize logging
    let log_config = config.logging.with_level_override(args.log_level.as_deref());
    modlink_common::init_tracing(&log_config)
        .map_err(|e| anyhow::anyhow!("Failed to init tracing: {}", e))?;

    info!(version = env!("CARGO_PKG_VERSION"), "Starting modlink-bridge");
    match &args.config {
        Some(path) => info!("Loaded configuration from {:?}", path),
        None => info!("No configuration file given, using defaults"),
    }

    let listen_addr = config.server.listen_addr()?;
    let grace_period = config.shutdown.grace_period();

    let bridge = Bridge::start(&config, ModbusTcpConnector);

    let http_server = HttpServer::bind(
        bridge.app_state(config.server.format),
        listen_addr,
        &config.server.ws_path,
    )
    .await
    .context("Failed to start HTTP server")?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let http_task = tokio::spawn(async move {
        if let Err(e) = http_server.run(shutdown_rx).await {
            error!("HTTP server error: {}", e);
        }
    });

    // Wait for shutdown signal
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C, shutting down...");
        }
        _ = terminate() => {
            info!("Received SIGTERM, shutting down...");
        }
    }

    let shutdown = async move {
        bridge.shutdown().await;
        let _ = shutdown_tx.send(true);
        let _ = http_task.await;
    };

    if tokio::time::timeout(grace_period, shutdown).await.is_err() {
        warn!(
            grace_period_ms = grace_period.as_millis() as u64,
            "Shutdown grace period expired, forcing exit"
        );
        std::process::exit(1);
    }

    info!("modlink-bridge stopped");
    Ok(())
}

#[cfg(unix)]
async fn terminate() {
    match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
        Ok(mut sigterm) => {
            sigterm.recv().await;
        }
        Err(e) => {
            warn!(error = %e, "Failed to install SIGTERM handler");
            std::future::pending::<()>().await;
        }
    }
}

#[cfg(not(unix))]
async fn terminate() {
    std::future::pending::<()>().await;
}
