mod auth;
mod config;
mod error;
mod pull;
mod rate_limit;
mod realtime;
mod reconciler;
mod routes;
mod store;

use std::sync::Arc;

use config::AppConfig;
use routes::{app_router, AppState};
use store::Store;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Only load .env in development; production uses platform-native env injection.
    #[cfg(debug_assertions)]
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("deskline_api=info".parse()?),
        )
        .init();

    let config = Arc::new(AppConfig::from_env()?);
    tracing::info!("Starting deskline-api with config: {:?}", config);

    let store = Store::open(&config.database_path).await?;
    if let Some(bootstrap) = &config.bootstrap {
        if let Some(organization) = store.bootstrap(bootstrap).await? {
            tracing::info!(organization = %organization.id, "Bootstrapped initial organization");
        }
    }

    let state = AppState::new(config, store);
    let bind_addr = state.config.bind_addr.clone();
    let router = app_router(state);

    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    tracing::info!("deskline-api listening on {}", bind_addr);
    axum::serve(listener, router).await?;
    Ok(())
}
