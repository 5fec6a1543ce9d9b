//! Groupcast hub daemon entry point.

mod config;

use std::sync::Arc;

use tracing_subscriber::EnvFilter;

use groupcast_hub::{ClientRegistry, DefaultHandler, HubConfig, HubServer};

fn main() -> anyhow::Result<()> {
    // Initialize structured logging.
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        "starting groupcast hub"
    );

    // Load configuration.
    let config = config::Config::load()?;
    let address = config.address();
    tracing::info!(name = %config.name, %address, "configuration loaded");

    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(run(&config))?;

    tracing::info!("hub shut down cleanly");
    Ok(())
}

async fn run(config: &config::Config) -> anyhow::Result<()> {
    let registry = Arc::new(ClientRegistry::new());
    let hub_config = HubConfig::from_address(&config.address())?;
    let server = HubServer::new(hub_config, registry, DefaultHandler);

    let runner = Arc::clone(&server);
    let server_task = tokio::spawn(async move { runner.run().await });

    tokio::signal::ctrl_c().await?;
    tracing::info!("shutdown signal received");
    server.shutdown();

    server_task.await??;
    Ok(())
}
