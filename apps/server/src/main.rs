//! Tower Server - standalone headless encoding server.
//!
//! Runs the broadcast pipeline as a background daemon: PCM ingest on one
//! port, continuous MP3 output plus status and events over HTTP on another.
//! Designed for systemd/container deployments; an orchestrator restarts the
//! process, the pipeline restarts its own encoder.

mod config;

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::signal;
use tower_core::bootstrap_services;

use crate::config::ServerConfig;

/// Tower Server - headless broadcast-grade MP3 streaming server.
#[derive(Parser, Debug)]
#[command(name = "tower-server")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to the configuration file (YAML).
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Log level (error, warn, info, debug, trace).
    #[arg(short, long, default_value = "info", env = "TOWER_LOG_LEVEL")]
    log_level: log::LevelFilter,

    /// HTTP bind port (overrides config file).
    #[arg(short = 'p', long, env = "TOWER_BIND_PORT")]
    port: Option<u16>,

    /// PCM ingest port (overrides config file).
    #[arg(short = 'i', long, env = "TOWER_INGEST_PORT")]
    ingest_port: Option<u16>,

    /// Disable the encoder subprocess (offline test mode).
    #[arg(long)]
    no_encoder: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    env_logger::Builder::new()
        .filter_level(args.log_level)
        .format_timestamp_millis()
        .init();

    log::info!("Tower Server v{}", env!("CARGO_PKG_VERSION"));

    let mut config =
        ServerConfig::load(args.config.as_deref()).context("Failed to load configuration")?;

    // Apply CLI overrides
    if let Some(port) = args.port {
        config.bind_port = port;
    }
    if let Some(port) = args.ingest_port {
        config.ingest_port = port;
    }
    if args.no_encoder {
        config.encoder_enabled = false;
    }

    log::info!(
        "Configuration: bind_port={}, ingest_port={}, encoder_enabled={}",
        config.bind_port,
        config.ingest_port,
        config.encoder_enabled
    );

    let core_config = config.to_core_config();
    let services = bootstrap_services(&core_config).context("Failed to bootstrap services")?;

    services
        .start()
        .await
        .context("Failed to start pipeline")?;
    log::info!("Pipeline started (mode: {})", services.mode().as_str());

    let listener = tokio::net::TcpListener::bind(("0.0.0.0", config.bind_port))
        .await
        .with_context(|| format!("Failed to bind HTTP port {}", config.bind_port))?;

    let app_state = services.app_state();
    let server_handle = tokio::spawn(async move {
        if let Err(e) = tower_core::start_server(app_state, listener).await {
            log::error!("Server error: {}", e);
        }
    });

    log::info!("HTTP server started on port {}", config.bind_port);

    // Wait for shutdown signal
    shutdown_signal().await;

    log::info!("Shutdown signal received, cleaning up...");

    services.shutdown().await;
    server_handle.abort();

    log::info!("Shutdown complete");
    Ok(())
}

/// Waits for a shutdown signal (Ctrl+C or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
