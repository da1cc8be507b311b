//! Trial lifecycle
//!
//! Starting a trial creates the subscription and credit records; canceling
//! one tears them down to terminal values. A user gets exactly one trial:
//! the records are never hard-deleted, so a previous trial always leaves a
//! `trialStartDate` behind to refuse a second start against.

use std::sync::Arc;

use time::{Duration, OffsetDateTime};

use crate::config::CreditsConfig;
use crate::credits::{CancellationMarker, CreditLedger};
use crate::error::{LedgerError, LedgerResult};
use crate::provider::BillingProvider;
use crate::subscription::SubscriptionStore;
use crate::types::{advance_reset_date, PlanType, SubscriptionPatch, SubscriptionStatus};

/// Result of a successful trial start
#[derive(Debug, Clone, serde::Serialize)]
pub struct TrialStarted {
    pub credits: i64,
    #[serde(with = "time::serde::rfc3339")]
    pub trial_end: OffsetDateTime,
}

#[derive(Clone)]
pub struct TrialService {
    credits: CreditLedger,
    subscriptions: SubscriptionStore,
    provider: Arc<dyn BillingProvider>,
    config: CreditsConfig,
}

impl TrialService {
    pub fn new(
        credits: CreditLedger,
        subscriptions: SubscriptionStore,
        provider: Arc<dyn BillingProvider>,
        config: CreditsConfig,
    ) -> Self {
        Self {
            credits,
            subscriptions,
            provider,
            config,
        }
    }

    /// Start a trial: subscription record at `trialing`, a trial credit
    /// allotment, and the customer mapping for later webhook resolution.
    ///
    /// The provider-side customer and subscription are created by the
    /// checkout flow; this records the ids it hands over.
    pub async fn start_trial(
        &self,
        user_id: &str,
        customer_id: Option<&str>,
        subscription_id: Option<&str>,
    ) -> LedgerResult<TrialStarted> {
        if let Some(existing) = self.subscriptions.get(user_id).await? {
            if existing.trial_start_date.is_some() || existing.plan_type == PlanType::Trial {
                tracing::warn!(user_id, "trial start refused, trial already used");
                return Err(LedgerError::TrialAlreadyUsed);
            }
        }
        if let Some(credits) = self.credits.record(user_id).await? {
            if credits.trial_canceled {
                tracing::warn!(user_id, "trial start refused, previous trial was canceled");
                return Err(LedgerError::TrialAlreadyUsed);
            }
        }

        let now = OffsetDateTime::now_utc();
        let trial_end = now + Duration::days(self.config.trial_days);

        self.subscriptions
            .upsert(
                user_id,
                &SubscriptionPatch {
                    plan: Some(PlanType::Trial.display_name().to_string()),
                    plan_type: Some(PlanType::Trial),
                    status: Some(SubscriptionStatus::Trialing),
                    customer_id: customer_id.map(str::to_string),
                    subscription_id: subscription_id.map(str::to_string),
                    trial_start_date: Some(now),
                    trial_end_date: Some(trial_end),
                    cancel_at_period_end: Some(false),
                    ..Default::default()
                },
            )
            .await?;

        if let Some(customer_id) = customer_id {
            self.subscriptions.map_customer(customer_id, user_id).await?;
        }

        let reset_date = advance_reset_date(None, now.date());
        self.credits
            .initialize(user_id, self.config.trial_credits, reset_date, true)
            .await?;

        tracing::info!(
            user_id,
            credits = self.config.trial_credits,
            trial_days = self.config.trial_days,
            "trial started"
        );
        Ok(TrialStarted {
            credits: self.config.trial_credits,
            trial_end,
        })
    }

    /// Cancel an active trial: cancel the provider subscription, mark the
    /// record terminal, and zero the allotment with the `trialCanceled`
    /// marker so reconciliation never refreshes it.
    pub async fn cancel_trial(&self, user_id: &str) -> LedgerResult<()> {
        let record = self
            .subscriptions
            .get(user_id)
            .await?
            .ok_or(LedgerError::NoActiveEntitlement)?;

        if record.status.is_terminal() {
            tracing::info!(user_id, "trial already canceled");
            return Ok(());
        }

        if let Some(subscription_id) = &record.subscription_id {
            self.provider.cancel_subscription(subscription_id).await?;
        }

        self.subscriptions
            .upsert(
                user_id,
                &SubscriptionPatch {
                    status: Some(SubscriptionStatus::Canceled),
                    canceled_at: Some(OffsetDateTime::now_utc()),
                    cancel_at_period_end: Some(false),
                    ..Default::default()
                },
            )
            .await?;
        self.credits
            .zero(user_id, Some(CancellationMarker::TrialCanceled))
            .await?;

        tracing::info!(user_id, "trial canceled, credits zeroed");
        Ok(())
    }
}
