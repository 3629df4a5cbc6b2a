//! murmur-server: real-time chat server.
//!
//! Accepts WebSocket connections, authenticates users by password or access
//! key, and fans messages out over private and public channels backed by a
//! shared key-value store.

mod auth;
mod channel;
mod config;
mod controller;
mod presence;
mod server;
mod session;
mod store;
mod transport;
mod users;

use clap::Parser;
use config::{CliOverrides, ServerConfig};
use std::path::PathBuf;
use tracing::{error, info};

/// murmur-server: real-time chat server
#[derive(Parser, Debug)]
#[command(name = "murmur-server", version, about = "Real-time chat server")]
struct Cli {
    /// Listen address
    #[arg(long)]
    host: Option<String>,

    /// Listen port
    #[arg(short, long)]
    port: Option<u16>,

    /// Config file path
    #[arg(long, default_value = "~/.murmur/config.toml")]
    config: String,

    /// Store backend (memory or redis)
    #[arg(long)]
    store: Option<String>,

    /// Redis URL (with --store redis)
    #[arg(long)]
    redis_url: Option<String>,

    /// Maximum concurrent connections
    #[arg(long)]
    max_connections: Option<usize>,

    /// Presence marker time-to-live in milliseconds
    #[arg(long)]
    presence_ttl_ms: Option<u64>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    // Initialize tracing
    use tracing_subscriber::EnvFilter;
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&cli.log_level));
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .init();

    info!(version = env!("CARGO_PKG_VERSION"), "starting murmur-server");

    // Load server config (file + CLI overrides)
    let config_path = PathBuf::from(&cli.config);
    let overrides = CliOverrides {
        host: cli.host,
        port: cli.port,
        max_connections: cli.max_connections,
        store: cli.store,
        redis_url: cli.redis_url,
        presence_ttl_ms: cli.presence_ttl_ms,
    };
    let server_config = match ServerConfig::load(Some(&config_path), overrides) {
        Ok(cfg) => cfg,
        Err(e) => {
            error!(error = %e, "failed to load config");
            std::process::exit(1);
        }
    };

    if let Err(e) = server::serve(server_config, shutdown_signal()).await {
        error!(error = %e, "server error");
        std::process::exit(1);
    }

    info!("murmur-server stopped");
}

/// Wait for SIGTERM or SIGINT (Ctrl+C).
async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        let mut sigterm =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                .expect("failed to install SIGTERM handler");
        tokio::select! {
            _ = ctrl_c => {}
            _ = sigterm.recv() => {}
        }
    }

    #[cfg(not(unix))]
    {
        ctrl_c.await.ok();
    }
}
