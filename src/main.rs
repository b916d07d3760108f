mod config;

use clap::Parser as _;
use config::Config;
use dialogue_forge::{
    AppState, auth::TokenAuthenticator, build_metrics_layer_and_handle, build_metrics_router,
    build_router,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tracing::{info, instrument};

const SESSION_PURGE_SECS: u64 = 60 * 60;

#[tokio::main]
#[instrument]
pub async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let config = Config::parse().validate()?;
    info!("Starting Dialogue Forge with config: {:?}", config);

    let auth = Arc::new(TokenAuthenticator::from_keys(
        config.api_keys.clone(),
        chrono::Duration::hours(config.token_ttl_hours),
    ));
    let sessions = auth.clone();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(SESSION_PURGE_SECS));
        loop {
            interval.tick().await;
            sessions.purge_expired();
        }
    });

    let app_state = AppState::new(config.gateway(), config.settings(), auth, config.pool());
    let mut router = build_router(app_state);

    if config.metrics {
        let (prometheus_layer, handle) =
            build_metrics_layer_and_handle(config.metrics_prefix.clone());
        router = router.layer(prometheus_layer);

        let metrics_addr = format!("0.0.0.0:{}", config.metrics_port);
        let metrics_listener = TcpListener::bind(&metrics_addr).await?;
        info!("Metrics endpoint listening on {}", metrics_addr);
        tokio::spawn(async move {
            if let Err(e) = axum::serve(metrics_listener, build_metrics_router(handle)).await {
                tracing::error!("Metrics server stopped: {}", e);
            }
        });
    }

    let bind_addr = format!("0.0.0.0:{}", config.port);
    let listener = TcpListener::bind(&bind_addr).await?;
    info!("Dialogue Forge listening on {}", bind_addr);

    axum::serve(listener, router).await?;

    Ok(())
}
