//! Livestream echo server
//!
//! Accepts WebSocket clients on `/live/livestream.flv`, reads one message from
//! each and sends it back with a timestamp every second until the client
//! goes away.

mod config;
mod server;

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tokio::signal;
use tracing::{error, info};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use config::FileConfig;
use server::WebSocketServer;

/// Livestream echo server
///
/// Streams a timestamped echo of each client's first WebSocket message
#[derive(Parser, Debug)]
#[command(name = "livestream-echo")]
#[command(version, about, long_about = None)]
struct Args {
    /// Port to listen on [default: 8088]
    #[arg(short = 'l', long = "listen", value_name = "PORT")]
    port: Option<u16>,

    /// Bind address [default: 0.0.0.0]
    #[arg(long)]
    bind: Option<String>,

    /// TOML config file; command line flags take precedence
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Seconds to wait for a client's first message (0 waits forever)
    #[arg(long, value_name = "SECS")]
    recv_timeout: Option<u64>,

    /// Enable verbose logging (RUST_LOG takes precedence when set)
    #[arg(short, long)]
    verbose: bool,
}

impl Args {
    /// Settings given on the command line
    fn overrides(&self) -> FileConfig {
        FileConfig {
            bind: self.bind.clone(),
            port: self.port,
            recv_timeout_secs: self.recv_timeout,
            ..Default::default()
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Initialize logging
    FmtSubscriber::builder()
        .with_env_filter(log_filter(args.verbose))
        .with_target(false)
        .compact()
        .init();

    let file_config = match &args.config {
        Some(path) => FileConfig::load(path)?,
        None => FileConfig::default(),
    };
    let (config, routes) = file_config.merge(args.overrides()).resolve()?;

    if let Some(limit) = config.recv_timeout {
        info!("Closing clients that send nothing within {:?}", limit);
    }

    let server = Arc::new(WebSocketServer::new(config, routes));
    let server_handle = Arc::clone(&server);

    // Spawn shutdown signal handler
    tokio::spawn(async move {
        shutdown_signal().await;
        info!("Initiating graceful shutdown...");
        server_handle.shutdown();
    });

    if let Err(e) = server.run().await {
        error!("Serve failed, err is {}", e);
        return Err(e.into());
    }

    info!("Server shutdown complete");
    Ok(())
}

/// Log filter from RUST_LOG, falling back to the `--verbose` level
fn log_filter(verbose: bool) -> EnvFilter {
    let level = if verbose { "debug" } else { "info" };
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level))
}

/// Wait for shutdown signal (SIGTERM or SIGINT)
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
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
