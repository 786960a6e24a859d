use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;
use wopa_core::{config::Config, provider::ProviderServer};

/// WOPA Provider tier: LLM, sandbox, and emulator routing with
/// instance pools.
#[derive(Parser)]
#[command(name = "wopa-provider", version)]
struct Args {
    /// Path to the YAML configuration document.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Instance registry JSON written by the provisioner; overrides the
    /// `provider.registry_path` config key.
    #[arg(long)]
    registry: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let _ = dotenvy::dotenv();

    let mut config = Config::load(args.config.as_deref())?;
    if let Some(registry) = args.registry {
        config.provider.registry_path = Some(registry);
    }
    let config = Arc::new(config);

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(config.logging.level.as_filter())),
        )
        .init();

    info!("Starting WOPA provider tier");
    ProviderServer::new(config)?.run().await?;
    Ok(())
}
