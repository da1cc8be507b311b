//! Trial lifecycle routes

use axum::extract::State;
use axum::Json;
use datalens_ledger::TrialStarted;
use serde::Deserialize;
use serde_json::{json, Value};

use crate::error::ApiResult;
use crate::state::AppState;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartTrialRequest {
    pub user_id: String,
    /// Provider customer id from the checkout flow
    pub customer_id: Option<String>,
    /// Provider subscription id from the checkout flow
    pub subscription_id: Option<String>,
}

pub async fn start(
    State(state): State<AppState>,
    Json(request): Json<StartTrialRequest>,
) -> ApiResult<Json<TrialStarted>> {
    let started = state
        .ledger
        .trial
        .start_trial(
            &request.user_id,
            request.customer_id.as_deref(),
            request.subscription_id.as_deref(),
        )
        .await?;
    Ok(Json(started))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CancelTrialRequest {
    pub user_id: String,
}

pub async fn cancel(
    State(state): State<AppState>,
    Json(request): Json<CancelTrialRequest>,
) -> ApiResult<Json<Value>> {
    state.ledger.trial.cancel_trial(&request.user_id).await?;
    Ok(Json(json!({"status": "canceled"})))
}
