//! # Murmurd - Mesh Coordination Daemon
//!
//! A decentralized coordination node. Handles peer discovery, randomized
//! coordinator election, network-state aggregation, and an eventually
//! consistent replicated entity registry over UDP gossip.
//!
//! ## Architecture
//! ```text
//! murmurd ⇄ murmurd ⇄ murmurd
//!    ↓
//! blob store (content-addressed payloads)
//! ```

use anyhow::{Context, Result};
use clap::Parser;
use tracing::info;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

mod blob;
mod cluster;
mod config;
mod crypto;
mod discovery;
mod node;
mod transport;

use config::AppConfig;
use node::MurmurNode;

/// Murmurd - Mesh Coordination Daemon
#[derive(Parser, Debug)]
#[command(name = "murmurd")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Configuration file path
    #[arg(short, long, default_value = "config/murmurd.toml")]
    config: String,

    /// Gossip bind address (overrides config)
    #[arg(short, long, env = "BIND_ADDR")]
    bind: Option<String>,

    /// Region label (overrides config)
    #[arg(short, long, env = "REGION")]
    region: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info", env = "LOG_LEVEL")]
    log_level: String,

    /// Enable JSON logging output
    #[arg(long, default_value = "false")]
    json_logs: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Parse CLI arguments
    let args = Args::parse();

    // Initialize logging
    init_logging(&args.log_level, args.json_logs)?;

    info!("🕸️ Starting Murmur v{}", env!("CARGO_PKG_VERSION"));

    // Load configuration
    let config = AppConfig::load(&args.config, &args)?;
    info!("📋 Configuration loaded from {}", args.config);

    // Build and start the node
    let node = MurmurNode::new(config).await?;
    node.start().await?;

    // Run until interrupted
    tokio::signal::ctrl_c()
        .await
        .context("Failed to install Ctrl+C handler")?;
    info!("🛑 Shutdown signal received");

    node.stop().await;

    info!("👋 Murmurd shutdown complete");
    Ok(())
}

/// Initialize structured logging with tracing
fn init_logging(level: &str, json: bool) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    if json {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_target(true).with_thread_ids(true))
            .init();
    }

    Ok(())
}
