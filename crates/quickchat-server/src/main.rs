//! # QuickChat Server
//!
//! One-to-one chat server with live presence and unseen counters.
//!
//! ## Usage
//!
//! ```bash
//! # Run with default settings
//! quickchat
//!
//! # Run with custom config
//! quickchat --config /path/to/quickchat.toml
//!
//! # Run with environment variables
//! QUICKCHAT_PORT=8080 QUICKCHAT_HOST=0.0.0.0 quickchat
//! ```

mod api;
mod config;
mod gateway;
mod handlers;
mod metrics;
mod wire;

use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(name = "quickchat", version, about = "One-to-one chat server with live presence")]
struct Args {
    /// Path to a TOML config file. Searched for in the usual places if unset.
    #[arg(short, long)]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "quickchat=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = Args::parse();

    // Load configuration
    let config = config::Config::load(args.config.as_deref())?;

    tracing::info!(
        "Starting QuickChat server on {}:{}",
        config.host,
        config.port
    );

    // Initialize metrics
    metrics::init_metrics();

    // Start the server
    handlers::run_server(config).await?;

    tracing::info!("QuickChat server stopped");
    Ok(())
}
