//! Ledger errors

use thiserror::Error;

/// Errors produced by the credit and subscription ledger
#[derive(Error, Debug)]
pub enum LedgerError {
    /// Deduction requested exceeds the remaining allowance.
    ///
    /// Callers surface this as "insufficient credits"; it carries no retry
    /// semantics and must not crash the request.
    #[error("insufficient credits: requested {requested}, remaining {remaining}")]
    InsufficientCredits {
        /// Credits requested by the caller
        requested: i64,
        /// Credits remaining before the attempt
        remaining: i64,
    },

    /// No credit record exists, or the subscription is in a terminal state.
    ///
    /// Same caller-visible treatment as [`LedgerError::InsufficientCredits`]:
    /// the user must upgrade before consuming credits.
    #[error("no active entitlement for user")]
    NoActiveEntitlement,

    /// A trial has already been started (and possibly ended) for this user
    #[error("trial already used")]
    TrialAlreadyUsed,

    /// Webhook signature verification failed; the payload must not be trusted
    #[error("invalid webhook signature")]
    InvalidWebhookSignature,

    /// Webhook payload could not be parsed
    #[error("malformed webhook payload: {0}")]
    MalformedWebhookPayload(String),

    /// Event references a customer/subscription with no mapped user.
    ///
    /// Handlers acknowledge these (no provider retry storm) and perform no
    /// mutation.
    #[error("no user mapped for webhook subject {subject}")]
    UnresolvableWebhookSubject {
        /// Customer or subscription identifier from the event
        subject: String,
    },

    /// Billing provider call failed (network error or provider 5xx)
    #[error("billing provider error: {0}")]
    Provider(String),

    /// Record store failure
    #[error("store error: {0}")]
    Store(String),
}

impl From<redis::RedisError> for LedgerError {
    fn from(e: redis::RedisError) -> Self {
        LedgerError::Store(e.to_string())
    }
}

/// Result type for ledger operations
pub type LedgerResult<T> = Result<T, LedgerError>;
