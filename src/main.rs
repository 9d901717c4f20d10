use anyhow::{Context, Result};
use linkhub::config::{self, DEFAULT_CONFIG_PATH, ENV_CONFIG_PATH};
use linkhub::credentials::{SqliteSecureStore, TokenVault};
use linkhub::provider::{HttpConnectorProvider, HttpTokenRefresher, ProviderAuth};
use linkhub::service::IntegrationService;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "linkhub=info".into()),
        )
        .init();

    info!("linkhub starting...");

    let config_path =
        std::env::var(ENV_CONFIG_PATH).unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string());
    let mut config = config::load_config(&config_path)
        .with_context(|| format!("Failed to load config from {config_path}"))?;
    config.apply_env();
    config.validate().context("Invalid configuration")?;

    // validate() guarantees the key is present
    let encryption_key = config.vault.encryption_key.clone().unwrap_or_default();
    let timeout = Duration::from_secs(config.provider.timeout_seconds);

    let store = SqliteSecureStore::open(&config.vault.database_path).with_context(|| {
        format!("Failed to open vault database {}", config.vault.database_path)
    })?;
    let refresher = HttpTokenRefresher::new(&config.provider.base_url, timeout)
        .context("Failed to build token refresher")?;
    let vault = Arc::new(
        TokenVault::new(Arc::new(store), &encryption_key, &config.vault.namespace)
            .context("Failed to initialize token vault")?
            .with_refresher(Arc::new(refresher)),
    );

    if !vault.validate_integrity().await {
        tracing::warn!("Stored credentials failed integrity check and will be treated as absent");
    }

    let auth = match &config.provider.api_key {
        Some(key) => ProviderAuth::ApiKey(key.clone()),
        None => ProviderAuth::Session(vault.clone()),
    };
    let provider = HttpConnectorProvider::new(&config.provider.base_url, auth, timeout)
        .context("Failed to build provider client")?;

    let service = Arc::new(
        IntegrationService::new(Arc::new(provider), vault, &config)
            .context("Failed to initialize integration service")?,
    );

    let app = linkhub::api::create_router(service);

    let addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind {addr}"))?;
    info!(address = %addr, provider = %config.provider.base_url, "HTTP server listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("HTTP server error")?;

    info!("linkhub stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "Failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    info!("Shutdown signal received");
}
