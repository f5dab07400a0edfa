//! WebSocket Relay Server
//!
//! Clients connect with `?user=<identity>` on the handshake URL and exchange
//! broadcast or directed chat messages through the relay. Unresponsive
//! connections are detected with transport pings and evicted.

mod config;
mod registry;
mod relay;
mod server;

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tokio::signal;
use tracing::info;
use tracing_subscriber::EnvFilter;

use config::RelayConfig;
use server::WebSocketServer;

/// WebSocket Relay Server
///
/// Real-time message relay with identity registry and liveness probing
#[derive(Parser, Debug)]
#[command(name = "ws-relay")]
#[command(version, about, long_about = None)]
struct Args {
    /// Path to a TOML config file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Port to listen on
    #[arg(short, long)]
    port: Option<u16>,

    /// Bind address
    #[arg(long)]
    bind: Option<String>,

    /// Liveness probe interval in milliseconds
    #[arg(long)]
    probe_interval_ms: Option<u64>,

    /// Unanswered probes tolerated before eviction
    #[arg(long)]
    miss_tolerance: Option<u32>,

    /// Deliver directed messages to the target only
    #[arg(long)]
    private_direct: bool,

    /// Frames queued per connection before further frames to it are dropped
    #[arg(long)]
    outbound_capacity: Option<usize>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

impl Args {
    /// Resolve the effective config: defaults, then file, then flags
    fn into_config(self) -> anyhow::Result<RelayConfig> {
        let mut config = match &self.config {
            Some(path) => RelayConfig::load(path)?,
            None => RelayConfig::default(),
        };

        if let Some(port) = self.port {
            config.port = port;
        }
        if let Some(bind) = self.bind {
            config.bind = bind;
        }
        if let Some(ms) = self.probe_interval_ms {
            config.probe_interval_ms = ms;
        }
        if let Some(tolerance) = self.miss_tolerance {
            config.miss_tolerance = tolerance;
        }
        if self.private_direct {
            config.private_direct = true;
        }
        if let Some(capacity) = self.outbound_capacity {
            config.outbound_capacity = capacity;
        }

        config.validate()?;
        Ok(config)
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Initialize logging; RUST_LOG wins over --verbose
    let default_level = if args.verbose { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .compact()
        .init();

    info!("WebSocket Relay v{}", env!("CARGO_PKG_VERSION"));

    let config = args.into_config()?;
    info!(
        "Probe interval {:?}, miss tolerance {}, private direct {}",
        config.probe_interval(),
        config.miss_tolerance,
        config.private_direct
    );

    let server = Arc::new(WebSocketServer::new(config));
    let server_handle = Arc::clone(&server);

    // Spawn shutdown signal handler
    tokio::spawn(async move {
        shutdown_signal().await;
        info!("Initiating graceful shutdown...");
        server_handle.shutdown();
    });

    // Run the server
    server.run().await?;

    info!("Server shutdown complete");
    Ok(())
}

/// Wait for shutdown signal (SIGTERM or SIGINT)
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
        _ = ctrl_c => {
            info!("Received SIGINT (Ctrl+C)");
        }
        _ = terminate => {
            info!("Received SIGTERM");
        }
    }
}
