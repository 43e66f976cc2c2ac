//! Parley Server - standalone headless voice-agent media server.
//!
//! Hosts the media core against a PBX without a control-plane connection:
//! the dialplan dials our AudioSocket listener (or an ExternalMedia RTP
//! endpoint) directly, and each correlated media connection becomes a
//! call. Provider adapters beyond the built-in loopback are registered by
//! embedding the core; the standalone binary is the deployment smoke-test
//! and dialplan-only production shape.

mod config;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use parley_core::{bootstrap_services, DirectMediaPbx};
use tokio::signal;

use crate::config::ServerConfig;

/// Parley Server - headless PBX-to-AI voice agent media core.
#[derive(Parser, Debug)]
#[command(name = "parley-server")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to the configuration file (YAML).
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Log level (error, warn, info, debug, trace).
    #[arg(short, long, default_value = "info", env = "PARLEY_LOG_LEVEL")]
    log_level: log::LevelFilter,

    /// AudioSocket bind address (overrides config file).
    #[arg(short = 'b', long, env = "PARLEY_AUDIOSOCKET_BIND")]
    audiosocket_bind: Option<String>,

    /// Default provider adapter name (overrides config file).
    #[arg(short = 'p', long, env = "PARLEY_DEFAULT_PROVIDER")]
    provider: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize logging
    env_logger::Builder::new()
        .filter_level(args.log_level)
        .format_timestamp_millis()
        .init();

    log::info!("Parley Server v{}", env!("CARGO_PKG_VERSION"));

    // Load configuration
    let mut config = ServerConfig::load(args.config.as_deref())
        .context("Failed to load configuration")?;

    // Apply CLI overrides
    if let Some(bind) = args.audiosocket_bind {
        config.core.transport.audiosocket_bind = bind;
    }
    if let Some(provider) = args.provider {
        config.core.default_provider = provider;
    }
    if config.core.default_provider.is_empty() {
        // The loopback adapter makes a bare install testable end to end.
        config.core.default_provider = "echo".to_string();
    }

    log::info!(
        "Configuration: audiosocket_bind={}, default_provider={}, transport={}",
        config.core.transport.audiosocket_bind,
        config.core.default_provider,
        config.core.transport.default
    );

    // Bootstrap services; direct-media PBX since the standalone server has
    // no control-plane connection.
    let services = bootstrap_services(&config.core, Arc::new(DirectMediaPbx))
        .context("Failed to bootstrap services")?;

    if !services.providers.contains(&config.core.default_provider) {
        anyhow::bail!(
            "default provider '{}' is not registered (available: {:?})",
            config.core.default_provider,
            services.providers.names()
        );
    }

    services.start_background_tasks();
    log::info!("Media core is listening");

    // Wait for shutdown signal
    shutdown_signal().await;

    log::info!("Shutdown signal received, cleaning up...");
    services.shutdown().await;

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
