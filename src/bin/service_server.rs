use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;
use wopa_core::{config::Config, service::ServiceServer};

/// WOPA Service tier: the public analysis API.
#[derive(Parser)]
#[command(name = "wopa-service", version)]
struct Args {
    /// Path to the YAML configuration document.
    #[arg(long)]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let _ = dotenvy::dotenv();

    let config = Arc::new(Config::load(args.config.as_deref())?);

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(config.logging.level.as_filter())),
        )
        .init();

    info!("Starting WOPA service tier");
    ServiceServer::new(config).run().await?;
    Ok(())
}
