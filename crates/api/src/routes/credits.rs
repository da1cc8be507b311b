//! Credit deduction and balance routes
//!
//! Both routes reconcile before touching the balance, so stale periods roll
//! over (or zero out) without any background scheduler.

use axum::extract::{Query, State};
use axum::Json;
use datalens_ledger::{DeductOutcome, Remaining};
use serde::{Deserialize, Serialize};

use crate::error::{ApiError, ApiResult};
use crate::state::AppState;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeductRequest {
    pub user_id: String,
    pub amount: i64,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BalanceResponse {
    pub remaining: Option<i64>,
    pub unlimited: bool,
}

impl From<Remaining> for BalanceResponse {
    fn from(remaining: Remaining) -> Self {
        match remaining {
            Remaining::Unlimited => Self {
                remaining: None,
                unlimited: true,
            },
            Remaining::Credits(n) => Self {
                remaining: Some(n),
                unlimited: false,
            },
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeductResponse {
    pub granted: bool,
    #[serde(flatten)]
    pub balance: BalanceResponse,
}

pub async fn deduct(
    State(state): State<AppState>,
    Json(request): Json<DeductRequest>,
) -> ApiResult<Json<DeductResponse>> {
    let outcome = state.ledger.deduct(&request.user_id, request.amount).await?;
    match outcome {
        DeductOutcome::Granted { remaining } => Ok(Json(DeductResponse {
            granted: true,
            balance: remaining.into(),
        })),
        DeductOutcome::Insufficient {
            requested,
            remaining,
        } => Err(ApiError::InsufficientCredits {
            requested,
            remaining,
        }),
        DeductOutcome::NoEntitlement => Err(ApiError::UpgradeRequired),
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemainingQuery {
    pub user_id: String,
}

pub async fn remaining(
    State(state): State<AppState>,
    Query(query): Query<RemainingQuery>,
) -> ApiResult<Json<BalanceResponse>> {
    let remaining = state.ledger.remaining(&query.user_id).await?;
    Ok(Json(remaining.into()))
}
