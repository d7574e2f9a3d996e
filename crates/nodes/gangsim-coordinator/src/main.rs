//! Gangsim Coordinator - barrier service for distributed runs
//!
//! Participants started with `gangsim --real` connect here, join a barrier
//! path and are released step by step once everyone has arrived.
//!
//! Binary: gangsim-coordinator

use anyhow::Context;
use clap::Parser;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use gangsim_coordinator::CoordinatorServer;

/// Gangsim Coordinator - barrier service for distributed runs
#[derive(Parser)]
#[command(name = "gangsim-coordinator")]
#[command(about = "Step barrier coordinator for gang-scheduled simulations", long_about = None)]
struct Cli {
    /// Address to listen on
    #[arg(long, env = "GANGSIM_COORDINATOR_LISTEN", default_value = "0.0.0.0:2181")]
    listen: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "gangsim_coordinator=info,info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();

    info!("========================================");
    info!("Gangsim Coordinator starting");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));
    info!("Listen address: {}", cli.listen);
    info!("========================================");

    let server = CoordinatorServer::bind(&cli.listen)
        .await
        .with_context(|| format!("Failed to bind {}", cli.listen))?;

    tokio::select! {
        result = server.run() => result.context("Coordinator stopped")?,
        _ = tokio::signal::ctrl_c() => info!("Shutdown signal received"),
    }

    Ok(())
}
