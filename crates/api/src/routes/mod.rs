//! Route registration

mod credits;
mod health;
mod trial;
mod webhooks;

use axum::routing::{get, post};
use axum::Router;

use crate::state::AppState;

pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health::health))
        .route("/v1/trial/start", post(trial::start))
        .route("/v1/trial/cancel", post(trial::cancel))
        .route("/v1/credits/deduct", post(credits::deduct))
        .route("/v1/credits/remaining", get(credits::remaining))
        .route("/v1/webhooks/billing", post(webhooks::billing))
        .with_state(state)
}
