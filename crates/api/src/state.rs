//! Application state

use datalens_ledger::{LedgerService, WebhookVerifier};

use crate::config::Config;

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub ledger: LedgerService,
    pub verifier: WebhookVerifier,
    pub config: Config,
}
