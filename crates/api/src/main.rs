//! DataLens Ledger API Server
//!
//! HTTP surface over the credit and subscription ledger: trial lifecycle,
//! credit deduction for usage-consuming callers, and the billing provider
//! webhook endpoint.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::http::{header, Method};
use datalens_api::{config::Config, routes::create_router, state::AppState};
use datalens_ledger::{LedgerService, RedisStore, StripeGateway, WebhookVerifier};
use tower_http::{
    cors::{AllowOrigin, CorsLayer},
    trace::TraceLayer,
};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env file if present
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,datalens_api=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting DataLens Ledger API v{}", env!("CARGO_PKG_VERSION"));

    let config = Config::from_env()?;
    tracing::info!("Configuration loaded");

    tracing::info!("Connecting to record store...");
    let store = RedisStore::connect(&config.redis_url).await?;

    let gateway = StripeGateway::new(config.stripe_secret_key.clone());
    let ledger = LedgerService::new(
        Arc::new(store),
        Arc::new(gateway),
        config.credits.clone(),
    );
    let verifier = WebhookVerifier::new(config.stripe_webhook_secret.clone());

    let state = AppState {
        ledger,
        verifier,
        config: config.clone(),
    };

    // Origin allowlist; defaults cover local development only.
    let allowed_origins: Vec<axum::http::HeaderValue> = std::env::var("ALLOWED_ORIGINS")
        .unwrap_or_else(|_| "http://localhost:3000,http://127.0.0.1:3000".to_string())
        .split(',')
        .filter_map(|s| s.trim().parse().ok())
        .collect();
    let cors = CorsLayer::new()
        .allow_origin(AllowOrigin::list(allowed_origins))
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers([header::AUTHORIZATION, header::CONTENT_TYPE, header::ACCEPT]);

    let app = create_router(state)
        .layer(cors)
        .layer(TraceLayer::new_for_http());

    let addr: SocketAddr = config.bind_address.parse()?;
    tracing::info!("Starting server on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
