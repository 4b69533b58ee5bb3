//! seekdb - clustered search and indexing server.
//!
//! Serves a REST API on the HTTP port and the typed peer protocol on the
//! binary port, backed by a shared in-memory index.

use clap::Parser;
use seekdb_server::{Config, Manager};
use std::net::SocketAddr;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "seekdb", version, about = "Clustered search and indexing server")]
struct Args {
    /// HTTP listener address (overrides config).
    #[arg(long)]
    http_addr: Option<SocketAddr>,

    /// Binary listener address (overrides config).
    #[arg(long)]
    binary_addr: Option<SocketAddr>,

    /// Accept loops per listener (overrides config).
    #[arg(long)]
    loops: Option<usize>,

    /// YAML config file (same as SEEKDB_CONFIG).
    #[arg(long)]
    config: Option<String>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    if let Some(path) = &args.config {
        std::env::set_var("SEEKDB_CONFIG", path);
    }

    let mut config = match Config::load() {
        Ok(config) => config,
        Err(e) => {
            tracing::error!("failed to load config: {}", e);
            return Err(e.into());
        }
    };
    if let Some(addr) = args.http_addr {
        config.network.http_addr = addr;
    }
    if let Some(addr) = args.binary_addr {
        config.network.binary_addr = addr;
    }
    if let Some(loops) = args.loops {
        config.network.loops = loops;
    }

    tracing::info!("starting seekdb");
    tracing::info!("  http address: {}", config.network.http_addr);
    tracing::info!("  binary address: {}", config.network.binary_addr);
    tracing::info!("  accept loops: {}", config.network.loops);
    tracing::info!("  worker threads: {}", config.limits.worker_threads);
    tracing::info!("  temp directory: {}", config.storage.temp_dir().display());

    let manager = Arc::new(Manager::new(config)?);

    // First ctrl-c drains, second forces teardown.
    let signal_manager = manager.clone();
    tokio::spawn(async move {
        loop {
            if tokio::signal::ctrl_c().await.is_err() {
                return;
            }
            signal_manager.shutdown();
        }
    });

    manager.run().await?;
    Ok(())
}
