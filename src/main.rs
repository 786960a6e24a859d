use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;
use wopa_core::{
    config::Config,
    provider::ProviderServer,
    service::ServiceServer,
    worker::WorkerServer,
};

/// Run all three WOPA tiers in one process (local mode).
#[derive(Parser)]
#[command(name = "wopa", version)]
struct Args {
    /// Path to the YAML configuration document.
    #[arg(long)]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    if let Err(e) = dotenvy::dotenv() {
        tracing::debug!("No .env file loaded: {e}");
    }

    let config = Arc::new(Config::load(args.config.as_deref())?);

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(config.logging.level.as_filter())),
        )
        .init();

    info!("Starting WOPA orchestration core (local mode)");

    let provider = ProviderServer::new(Arc::clone(&config))?;
    let worker = WorkerServer::new(Arc::clone(&config))?;
    let service = ServiceServer::new(Arc::clone(&config));

    tokio::select! {
        result = provider.run() => {
            if let Err(e) = result {
                tracing::error!("Provider server failed: {e}");
            }
        }
        result = worker.run() => {
            if let Err(e) = result {
                tracing::error!("Worker server failed: {e}");
            }
        }
        result = service.run() => {
            if let Err(e) = result {
                tracing::error!("Service server failed: {e}");
            }
        }
    }

    Ok(())
}
