// Test code patterns (expected in test files):
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

//! DataLens Credit & Subscription Ledger
//!
//! Tracks per-user credit allotments and billing state for metered usage.
//!
//! ## Features
//!
//! - **Credit Ledger**: atomic deduction, remaining-balance queries, unlimited plans
//! - **Subscription Records**: idempotent field-level state from provider events
//! - **Lazy Reconciliation**: monthly rollover and cancellation zeroing, computed
//!   on read instead of by a scheduler
//! - **Trials**: one trial per user, with explicit cancellation
//! - **Webhooks**: signed provider events mapped to record mutations

pub mod config;
pub mod credits;
pub mod error;
pub mod provider;
pub mod reconcile;
pub mod store;
pub mod subscription;
pub mod trial;
pub mod types;
pub mod webhooks;


use std::sync::Arc;

pub use config::CreditsConfig;
pub use credits::{CancellationMarker, CreditLedger, DeductOutcome, Remaining};
pub use error::{LedgerError, LedgerResult};
pub use provider::{BillingProvider, ProviderSubscription, StripeGateway};
pub use reconcile::{ReconcileOutcome, Reconciler};
pub use store::{MemoryStore, RecordStore, RedisStore, SharedStore};
pub use subscription::SubscriptionStore;
pub use trial::{TrialService, TrialStarted};
pub use types::{
    BillingInterval, CreditRecord, PlanType, SubscriptionPatch, SubscriptionRecord,
    SubscriptionStatus,
};
pub use webhooks::{WebhookEvent, WebhookOutcome, WebhookProcessor, WebhookVerifier};

/// Everything wired together over one store and one billing provider.
///
/// Usage-consuming callers go through [`LedgerService::deduct`] and
/// [`LedgerService::remaining`], which reconcile first so stale allotments
/// are rolled over (or zeroed) before the balance is consulted.
#[derive(Clone)]
pub struct LedgerService {
    pub credits: CreditLedger,
    pub subscriptions: SubscriptionStore,
    pub reconciler: Reconciler,
    pub trial: TrialService,
    pub webhooks: WebhookProcessor,
}

impl LedgerService {
    pub fn new(
        store: SharedStore,
        provider: Arc<dyn BillingProvider>,
        config: CreditsConfig,
    ) -> Self {
        let credits = CreditLedger::new(store.clone(), config.clone());
        let subscriptions = SubscriptionStore::new(store);
        let reconciler = Reconciler::new(
            credits.clone(),
            subscriptions.clone(),
            config.clone(),
        );
        let trial = TrialService::new(
            credits.clone(),
            subscriptions.clone(),
            provider.clone(),
            config,
        );
        let webhooks = WebhookProcessor::new(credits.clone(), subscriptions.clone(), provider);
        Self {
            credits,
            subscriptions,
            reconciler,
            trial,
            webhooks,
        }
    }

    /// Reconcile, then attempt to deduct `amount` credits
    pub async fn deduct(&self, user_id: &str, amount: i64) -> LedgerResult<DeductOutcome> {
        self.reconciler.reconcile(user_id).await?;
        self.credits.deduct(user_id, amount).await
    }

    /// Reconcile, then report the remaining balance
    pub async fn remaining(&self, user_id: &str) -> LedgerResult<Remaining> {
        self.reconciler.reconcile(user_id).await?;
        self.credits.remaining(user_id).await
    }

    /// Verify-then-process is split across [`WebhookVerifier`] and
    /// [`WebhookProcessor`]; after a processed event, reconcile the affected
    /// user so derived credit state catches up immediately.
    pub async fn handle_webhook_event(
        &self,
        event: &WebhookEvent,
    ) -> LedgerResult<WebhookOutcome> {
        let outcome = self.webhooks.process(event).await?;
        if let WebhookOutcome::Applied { user_id } = &outcome {
            self.reconciler.reconcile(user_id).await?;
        }
        Ok(outcome)
    }
}
