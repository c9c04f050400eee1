use std::sync::Arc;

use anyhow::Result;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use sync_server::{run_server, ServerConfig, ServerState, StorageConfig};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,sync_server=debug".into()),
        )
        .init();

    tracing::info!("sync server v{}", env!("CARGO_PKG_VERSION"));

    let config = load_config()?;
    tracing::info!("storage backend: {:?}", config.storage);
    tracing::info!("merchant backend: {}", config.merchant_url);

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("received ctrl-c");
            let _ = shutdown_tx.send(true);
        }
    });

    let state = Arc::new(ServerState::from_config(config, shutdown_rx).await?);
    run_server(state).await?;

    Ok(())
}

fn load_config() -> Result<ServerConfig> {
    let mut config = ServerConfig::default();

    if let Ok(addr) = std::env::var("SYNC_LISTEN_ADDR") {
        config.listen_addr = addr;
    }
    if let Ok(url) = std::env::var("SYNC_DB_URL") {
        config.storage = StorageConfig::Postgres { url };
    }
    if let Ok(url) = std::env::var("SYNC_MERCHANT_URL") {
        config.merchant_url = url;
    }
    if let Ok(key) = std::env::var("SYNC_MERCHANT_API_KEY") {
        config.merchant_api_key = Some(key);
    }
    if let Ok(fee) = std::env::var("SYNC_ANNUAL_FEE") {
        config.annual_fee = fee
            .parse()
            .map_err(|e| anyhow::anyhow!("bad SYNC_ANNUAL_FEE: {e}"))?;
    }
    if let Ok(limit) = std::env::var("SYNC_UPLOAD_LIMIT_MB") {
        config.upload_limit_mb = limit
            .parse()
            .map_err(|e| anyhow::anyhow!("bad SYNC_UPLOAD_LIMIT_MB: {e}"))?;
    }

    Ok(config)
}
