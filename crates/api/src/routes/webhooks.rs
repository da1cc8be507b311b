//! Billing provider webhook route
//!
//! Signature verification happens before anything else touches the payload.
//! Events for unmapped customers are acknowledged with 200 so the provider
//! does not retry them forever.

use axum::body::Bytes;
use axum::extract::State;
use axum::http::HeaderMap;
use axum::Json;
use datalens_ledger::{LedgerError, WebhookEvent, WebhookOutcome};
use serde_json::{json, Value};

use crate::error::{ApiError, ApiResult};
use crate::state::AppState;

const SIGNATURE_HEADER: &str = "stripe-signature";

pub async fn billing(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> ApiResult<Json<Value>> {
    let signature = headers
        .get(SIGNATURE_HEADER)
        .and_then(|v| v.to_str().ok())
        .ok_or(ApiError::InvalidSignature)?;
    let payload = std::str::from_utf8(&body)
        .map_err(|_| ApiError::InvalidPayload("payload is not utf-8".to_string()))?;

    state.verifier.verify(payload, signature)?;
    let event = WebhookEvent::parse(payload)?;

    match state.ledger.handle_webhook_event(&event).await {
        Ok(WebhookOutcome::Applied { user_id }) => {
            Ok(Json(json!({"received": true, "userId": user_id})))
        }
        Ok(WebhookOutcome::Ignored) => Ok(Json(json!({"received": true, "ignored": true}))),
        Err(LedgerError::UnresolvableWebhookSubject { subject }) => {
            tracing::warn!(event_id = %event.id, subject, "event for unmapped subject, acknowledged");
            Ok(Json(json!({"received": true, "ignored": true})))
        }
        Err(e) => Err(e.into()),
    }
}
