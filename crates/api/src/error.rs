//! API error responses
//!
//! Internal failures are translated into a small set of stable error codes
//! so callers never see provider-specific error shapes.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use datalens_ledger::LedgerError;
use serde_json::json;
use thiserror::Error;

pub type ApiResult<T> = Result<T, ApiError>;

#[derive(Error, Debug)]
pub enum ApiError {
    #[error("insufficient credits")]
    InsufficientCredits { requested: i64, remaining: i64 },

    #[error("upgrade required")]
    UpgradeRequired,

    #[error("trial already used")]
    TrialAlreadyUsed,

    #[error("invalid webhook signature")]
    InvalidSignature,

    #[error("invalid payload: {0}")]
    InvalidPayload(String),

    #[error("billing provider error")]
    Provider(String),

    #[error("internal error")]
    Internal(String),
}

impl ApiError {
    fn status_and_code(&self) -> (StatusCode, &'static str) {
        match self {
            ApiError::InsufficientCredits { .. } => {
                (StatusCode::PAYMENT_REQUIRED, "INSUFFICIENT_CREDITS")
            }
            ApiError::UpgradeRequired => (StatusCode::PAYMENT_REQUIRED, "UPGRADE_REQUIRED"),
            ApiError::TrialAlreadyUsed => (StatusCode::CONFLICT, "TRIAL_ALREADY_USED"),
            ApiError::InvalidSignature => (StatusCode::BAD_REQUEST, "INVALID_SIGNATURE"),
            ApiError::InvalidPayload(_) => {
                (StatusCode::BAD_REQUEST, "INVALID_SUBSCRIPTION_FORMAT")
            }
            ApiError::Provider(_) => (StatusCode::BAD_GATEWAY, "PROVIDER_ERROR"),
            ApiError::Internal(_) => (StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL"),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, code) = self.status_and_code();
        if status.is_server_error() {
            tracing::error!(code, error = %self, "request failed");
        }
        let mut body = json!({
            "error": {
                "code": code,
                "message": self.to_string(),
            }
        });
        if let ApiError::InsufficientCredits {
            requested,
            remaining,
        } = &self
        {
            body["error"]["requested"] = json!(requested);
            body["error"]["remaining"] = json!(remaining);
        }
        (status, Json(body)).into_response()
    }
}

impl From<LedgerError> for ApiError {
    fn from(e: LedgerError) -> Self {
        match e {
            LedgerError::InsufficientCredits {
                requested,
                remaining,
            } => ApiError::InsufficientCredits {
                requested,
                remaining,
            },
            LedgerError::NoActiveEntitlement => ApiError::UpgradeRequired,
            LedgerError::TrialAlreadyUsed => ApiError::TrialAlreadyUsed,
            LedgerError::InvalidWebhookSignature => ApiError::InvalidSignature,
            LedgerError::MalformedWebhookPayload(msg) => ApiError::InvalidPayload(msg),
            // Unresolvable subjects are acknowledged at the webhook route;
            // reaching here means a non-webhook path hit one.
            LedgerError::UnresolvableWebhookSubject { subject } => {
                ApiError::InvalidPayload(format!("no user mapped for {subject}"))
            }
            LedgerError::Provider(msg) => ApiError::Provider(msg),
            LedgerError::Store(msg) => ApiError::Internal(msg),
        }
    }
}
