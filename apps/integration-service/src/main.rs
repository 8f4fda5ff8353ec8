use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::net::TcpListener;
use tracing_subscriber::EnvFilter;

use funil_integration_service::build_router;
use funil_integration_service::config::Config;
use funil_store::IntegrationStore;
use funil_store::postgrest::PostgrestStore;

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::from_env().context("failed to load configuration")?;
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(config.log_filter.clone())),
        )
        .init();

    let store: Arc<dyn IntegrationStore> = Arc::new(PostgrestStore::new(
        &config.database_url,
        &config.service_key,
        config.sync_origin_header.clone(),
    ));

    let listener = TcpListener::bind(config.bind_addr)
        .await
        .with_context(|| format!("failed to bind {}", config.bind_addr))?;
    tracing::info!(addr = %config.bind_addr, "integration service listening");

    let app = build_router(config, store);
    axum::serve(listener, app)
        .await
        .context("server terminated")?;
    Ok(())
}
