//! Lazy reconciliation
//!
//! Decides, from the current subscription and credit records plus the
//! wall-clock date, whether credits must be refreshed, zeroed, or left
//! alone, and whether a staged plan downgrade must be finalized. The
//! decision is a pure function; `Reconciler` loads records, plans, and
//! applies. It runs before every credit-consuming request and defensively
//! after webhook events, and is safe to run redundantly in parallel.

use time::{Date, OffsetDateTime};

use crate::config::CreditsConfig;
use crate::credits::CreditLedger;
use crate::error::LedgerResult;
use crate::subscription::SubscriptionStore;
use crate::types::{
    advance_reset_date, CreditRecord, PlanType, SubscriptionPatch, SubscriptionRecord,
    SubscriptionStatus,
};

/// Planned reconciliation effect
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconcileOutcome {
    NoChange,
    /// Genuine cancellation: revoke the allowance
    ZeroCredits,
    /// Period rollover is due
    Refresh {
        total: i64,
        reset_date: Date,
        /// A staged downgrade is being finalized; the subscription record
        /// transitions to its fully-downgraded terminal state as well.
        finalize_downgrade: bool,
    },
}

/// Decide what reconciliation should do. Pure: no I/O, no clock access.
pub fn plan_reconciliation(
    subscription: Option<&SubscriptionRecord>,
    credits: Option<&CreditRecord>,
    today: Date,
    config: &CreditsConfig,
) -> ReconcileOutcome {
    // No credit record: nothing to reconcile. Records are created by trial
    // start or subscription creation, never by reconciliation.
    let Some(credits) = credits else {
        return ReconcileOutcome::NoChange;
    };

    let status = subscription.map(|s| s.status);

    // States worth processing: active/trialing/canceling/inactive, or a
    // staged downgrade waiting on the credit record itself.
    let processable =
        status.is_some_and(|s| s.is_processable()) || credits.pending_downgrade;
    if !processable {
        return ReconcileOutcome::NoChange;
    }

    // Genuine cancellation requires an explicit signal on top of the status:
    // a trial converting to paid transiently passes through a canceling
    // status, and that alone must never revoke credits.
    if matches!(
        status,
        Some(SubscriptionStatus::Canceling) | Some(SubscriptionStatus::Canceled)
    ) {
        let explicit_signal = credits.has_cancellation_marker()
            || subscription.and_then(|s| s.canceled_at).is_some();
        if explicit_signal {
            if is_zeroed(credits) {
                return ReconcileOutcome::NoChange;
            }
            return ReconcileOutcome::ZeroCredits;
        }
    }

    // A fully terminal subscription never gets credits written back, even
    // when a stale pendingDowngrade marker is still present.
    if status.is_some_and(|s| s.is_terminal()) {
        return ReconcileOutcome::NoChange;
    }

    // The allotment that applies going forward.
    let pending_downgrade = credits.pending_downgrade;
    let total = if pending_downgrade || status == Some(SubscriptionStatus::Inactive) {
        credits.next_total_credits.unwrap_or(0)
    } else {
        match subscription {
            Some(sub) => config.plan_credits(sub.plan_type),
            None => return ReconcileOutcome::NoChange,
        }
    };

    // Date-only due check. An absent or unparseable reset date counts as
    // due now: refreshing early is safer than never refreshing.
    let due = credits.reset_date.map(|d| today >= d).unwrap_or(true);
    if !due {
        return ReconcileOutcome::NoChange;
    }

    ReconcileOutcome::Refresh {
        total,
        reset_date: advance_reset_date(credits.reset_date, today),
        finalize_downgrade: pending_downgrade
            && matches!(
                status,
                Some(SubscriptionStatus::Canceling) | Some(SubscriptionStatus::Inactive) | None
            ),
    }
}

fn is_zeroed(credits: &CreditRecord) -> bool {
    credits.total == Some(0) && credits.used == 0 && credits.reset_date.is_none()
}

/// Loads records, plans, and applies reconciliation effects
#[derive(Clone)]
pub struct Reconciler {
    credits: CreditLedger,
    subscriptions: SubscriptionStore,
    config: CreditsConfig,
}

impl Reconciler {
    pub fn new(
        credits: CreditLedger,
        subscriptions: SubscriptionStore,
        config: CreditsConfig,
    ) -> Self {
        Self {
            credits,
            subscriptions,
            config,
        }
    }

    /// Reconcile against the current UTC date
    pub async fn reconcile(&self, user_id: &str) -> LedgerResult<ReconcileOutcome> {
        self.reconcile_at(user_id, OffsetDateTime::now_utc().date())
            .await
    }

    /// Reconcile against an explicit date (injectable clock for tests)
    pub async fn reconcile_at(&self, user_id: &str, today: Date) -> LedgerResult<ReconcileOutcome> {
        let subscription = self.subscriptions.get(user_id).await?;
        let credits = self.credits.record(user_id).await?;

        let outcome =
            plan_reconciliation(subscription.as_ref(), credits.as_ref(), today, &self.config);

        match outcome {
            ReconcileOutcome::NoChange => {}
            ReconcileOutcome::ZeroCredits => {
                tracing::info!(user_id, "reconciliation: genuine cancellation, zeroing credits");
                self.credits.zero(user_id, None).await?;
            }
            ReconcileOutcome::Refresh {
                total,
                reset_date,
                finalize_downgrade,
            } => {
                tracing::info!(
                    user_id,
                    total,
                    finalize_downgrade,
                    "reconciliation: refreshing credit period"
                );
                self.credits
                    .refresh(user_id, total, reset_date, finalize_downgrade)
                    .await?;
                if finalize_downgrade {
                    self.subscriptions
                        .upsert(
                            user_id,
                            &SubscriptionPatch {
                                plan_type: Some(PlanType::Downgraded),
                                plan: Some(PlanType::Downgraded.display_name().to_string()),
                                status: Some(SubscriptionStatus::Canceled),
                                customer_id: Some(String::new()),
                                subscription_id: Some(String::new()),
                                cancel_at_period_end: Some(false),
                                ..Default::default()
                            },
                        )
                        .await?;
                }
            }
        }

        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{MemoryStore, RecordStore};
    use crate::types::BillingInterval;
    use time::macros::date;

    fn config() -> CreditsConfig {
        CreditsConfig::default()
    }

    fn credit_record() -> CreditRecord {
        CreditRecord {
            total: Some(500),
            used: 100,
            reset_date: Some(date!(2025 - 04 - 15)),
            last_update: None,
            is_trial_credits: false,
            trial_canceled: false,
            subscription_deleted: false,
            downgraded_at: None,
            pending_downgrade: false,
            next_total_credits: None,
        }
    }

    fn subscription(status: SubscriptionStatus, plan_type: PlanType) -> SubscriptionRecord {
        SubscriptionRecord {
            plan: plan_type.display_name().to_string(),
            plan_type,
            status,
            interval: Some(BillingInterval::Month),
            customer_id: Some("cus_1".to_string()),
            subscription_id: Some("sub_1".to_string()),
            trial_start_date: None,
            trial_end_date: None,
            canceled_at: None,
            trial_ended_at: None,
            last_updated: None,
            cancel_at_period_end: false,
            current_period_end: None,
        }
    }

    #[test]
    fn no_credit_record_means_no_change() {
        let sub = subscription(SubscriptionStatus::Active, PlanType::Standard);
        let outcome = plan_reconciliation(Some(&sub), None, date!(2025 - 05 - 01), &config());
        assert_eq!(outcome, ReconcileOutcome::NoChange);
    }

    #[test]
    fn not_due_means_no_change() {
        let sub = subscription(SubscriptionStatus::Active, PlanType::Standard);
        let credits = credit_record();
        let outcome =
            plan_reconciliation(Some(&sub), Some(&credits), date!(2025 - 04 - 01), &config());
        assert_eq!(outcome, ReconcileOutcome::NoChange);
    }

    #[test]
    fn due_refresh_preserves_anchor_day() {
        let sub = subscription(SubscriptionStatus::Active, PlanType::Standard);
        let credits = credit_record();
        // Reconciled on the 20th; the reset anchor stays on the 15th.
        let outcome =
            plan_reconciliation(Some(&sub), Some(&credits), date!(2025 - 04 - 20), &config());
        assert_eq!(
            outcome,
            ReconcileOutcome::Refresh {
                total: 500,
                reset_date: date!(2025 - 05 - 15),
                finalize_downgrade: false,
            }
        );
    }

    #[test]
    fn exhausted_allotment_refreshes_on_due_date() {
        // Exhausted period with the reset date already behind us.
        let sub = subscription(SubscriptionStatus::Active, PlanType::Standard);
        let mut credits = credit_record();
        credits.used = 500;
        credits.reset_date = Some(date!(2025 - 04 - 19));
        let outcome =
            plan_reconciliation(Some(&sub), Some(&credits), date!(2025 - 04 - 20), &config());
        assert_eq!(
            outcome,
            ReconcileOutcome::Refresh {
                total: 500,
                reset_date: date!(2025 - 05 - 19),
                finalize_downgrade: false,
            }
        );
    }

    #[test]
    fn trialing_grants_the_previewed_plan_allotment() {
        let sub = subscription(SubscriptionStatus::Trialing, PlanType::Trial);
        let mut credits = credit_record();
        credits.reset_date = None;
        let outcome =
            plan_reconciliation(Some(&sub), Some(&credits), date!(2025 - 04 - 20), &config());
        assert!(matches!(
            outcome,
            ReconcileOutcome::Refresh { total: 500, .. }
        ));
    }

    #[test]
    fn missing_reset_date_is_due_now() {
        let sub = subscription(SubscriptionStatus::Active, PlanType::Standard);
        let mut credits = credit_record();
        credits.reset_date = None;
        let outcome =
            plan_reconciliation(Some(&sub), Some(&credits), date!(2025 - 04 - 01), &config());
        assert!(matches!(outcome, ReconcileOutcome::Refresh { .. }));
    }

    // Genuine-cancellation gating: a canceling status alone (mid trial-to-
    // paid conversion) must not zero; an explicit marker must.
    #[test]
    fn canceling_without_marker_is_not_cancellation() {
        let sub = subscription(SubscriptionStatus::Canceling, PlanType::Standard);
        let mut credits = credit_record();
        credits.reset_date = Some(date!(2025 - 06 - 15));
        let outcome =
            plan_reconciliation(Some(&sub), Some(&credits), date!(2025 - 05 - 01), &config());
        assert_ne!(outcome, ReconcileOutcome::ZeroCredits);
    }

    #[test]
    fn canceling_with_trial_canceled_marker_zeroes() {
        let sub = subscription(SubscriptionStatus::Canceling, PlanType::Standard);
        let mut credits = credit_record();
        credits.trial_canceled = true;
        let outcome =
            plan_reconciliation(Some(&sub), Some(&credits), date!(2025 - 05 - 01), &config());
        assert_eq!(outcome, ReconcileOutcome::ZeroCredits);
    }

    #[test]
    fn canceled_at_timestamp_counts_as_explicit_signal() {
        let mut sub = subscription(SubscriptionStatus::Canceling, PlanType::Standard);
        sub.canceled_at = Some(OffsetDateTime::UNIX_EPOCH);
        let credits = credit_record();
        let outcome =
            plan_reconciliation(Some(&sub), Some(&credits), date!(2025 - 05 - 01), &config());
        assert_eq!(outcome, ReconcileOutcome::ZeroCredits);
    }

    #[test]
    fn terminal_canceled_account_is_never_resurrected() {
        let sub = subscription(SubscriptionStatus::Canceled, PlanType::Standard);
        let mut credits = credit_record();
        // Stale staged downgrade on a dead account: still no writes.
        credits.pending_downgrade = true;
        credits.next_total_credits = Some(500);
        credits.total = Some(0);
        credits.used = 0;
        credits.reset_date = None;
        let outcome =
            plan_reconciliation(Some(&sub), Some(&credits), date!(2025 - 05 - 01), &config());
        assert_eq!(outcome, ReconcileOutcome::NoChange);
    }

    #[test]
    fn pending_downgrade_uses_staged_total() {
        let sub = subscription(SubscriptionStatus::Canceling, PlanType::Pro);
        let mut credits = credit_record();
        credits.pending_downgrade = true;
        credits.next_total_credits = Some(500);
        credits.reset_date = Some(date!(2025 - 04 - 15));
        let outcome =
            plan_reconciliation(Some(&sub), Some(&credits), date!(2025 - 04 - 15), &config());
        assert_eq!(
            outcome,
            ReconcileOutcome::Refresh {
                total: 500,
                reset_date: date!(2025 - 05 - 15),
                finalize_downgrade: true,
            }
        );
    }

    #[test]
    fn pending_downgrade_without_staged_total_drops_to_zero() {
        let sub = subscription(SubscriptionStatus::Inactive, PlanType::Standard);
        let mut credits = credit_record();
        credits.pending_downgrade = true;
        credits.next_total_credits = None;
        let outcome =
            plan_reconciliation(Some(&sub), Some(&credits), date!(2025 - 04 - 20), &config());
        assert!(matches!(
            outcome,
            ReconcileOutcome::Refresh {
                total: 0,
                finalize_downgrade: true,
                ..
            }
        ));
    }

    #[test]
    fn active_downgrade_waits_for_period_end_without_finalizing_subscription() {
        // Downgrade staged while the subscription is still active: the new
        // total applies at rollover but the subscription stays untouched.
        let sub = subscription(SubscriptionStatus::Active, PlanType::Pro);
        let mut credits = credit_record();
        credits.pending_downgrade = true;
        credits.next_total_credits = Some(500);
        let outcome =
            plan_reconciliation(Some(&sub), Some(&credits), date!(2025 - 04 - 20), &config());
        assert_eq!(
            outcome,
            ReconcileOutcome::Refresh {
                total: 500,
                reset_date: date!(2025 - 05 - 15),
                finalize_downgrade: false,
            }
        );
    }

    #[test]
    fn pro_plan_refreshes_at_unlimited_sentinel() {
        let sub = subscription(SubscriptionStatus::Active, PlanType::Pro);
        let mut credits = credit_record();
        credits.total = Some(100_000);
        let outcome =
            plan_reconciliation(Some(&sub), Some(&credits), date!(2025 - 04 - 20), &config());
        assert!(matches!(
            outcome,
            ReconcileOutcome::Refresh { total: 100_000, .. }
        ));
    }

    // Applying tests against the in-memory store.

    fn build(store: crate::store::SharedStore) -> (Reconciler, CreditLedger, SubscriptionStore) {
        let credits = CreditLedger::new(store.clone(), config());
        let subscriptions = SubscriptionStore::new(store);
        let reconciler = Reconciler::new(credits.clone(), subscriptions.clone(), config());
        (reconciler, credits, subscriptions)
    }

    #[tokio::test]
    async fn genuine_cancellation_zeroes_stored_record() {
        let store = MemoryStore::shared();
        let (reconciler, credits, subscriptions) = build(store.clone());

        subscriptions
            .upsert(
                "u1",
                &SubscriptionPatch {
                    status: Some(SubscriptionStatus::Canceling),
                    plan_type: Some(PlanType::Standard),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        credits
            .initialize("u1", 500, date!(2025 - 06 - 01), true)
            .await
            .unwrap();
        credits.deduct("u1", 100).await.unwrap();
        // The explicit signal alone; reconciliation performs the revocation.
        store
            .put_fields(
                &crate::store::credits_key("u1"),
                &[("trialCanceled".to_string(), "true".to_string())],
            )
            .await
            .unwrap();

        let outcome = reconciler.reconcile_at("u1", date!(2025 - 05 - 01)).await.unwrap();
        assert_eq!(outcome, ReconcileOutcome::ZeroCredits);

        let record = credits.record("u1").await.unwrap().unwrap();
        assert_eq!(record.total, Some(0));
        assert_eq!(record.used, 0);
        assert_eq!(record.reset_date, None);
        assert!(record.trial_canceled, "marker survives the zeroing");

        // Replay: already zeroed, nothing further to write.
        let again = reconciler.reconcile_at("u1", date!(2025 - 05 - 01)).await.unwrap();
        assert_eq!(again, ReconcileOutcome::NoChange);
    }

    #[tokio::test]
    async fn reconciliation_is_idempotent() {
        let (reconciler, credits, subscriptions) = build(MemoryStore::shared());

        subscriptions
            .upsert(
                "u1",
                &SubscriptionPatch {
                    status: Some(SubscriptionStatus::Active),
                    plan_type: Some(PlanType::Standard),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        credits
            .initialize("u1", 500, date!(2025 - 04 - 15), false)
            .await
            .unwrap();
        credits.deduct("u1", 500).await.unwrap();

        let first = reconciler.reconcile_at("u1", date!(2025 - 04 - 20)).await.unwrap();
        assert!(matches!(first, ReconcileOutcome::Refresh { .. }));
        let after_first = credits.record("u1").await.unwrap().unwrap();

        let second = reconciler.reconcile_at("u1", date!(2025 - 04 - 20)).await.unwrap();
        assert_eq!(second, ReconcileOutcome::NoChange);
        let after_second = credits.record("u1").await.unwrap().unwrap();

        assert_eq!(after_first.total, after_second.total);
        assert_eq!(after_first.used, after_second.used);
        assert_eq!(after_first.reset_date, after_second.reset_date);
        assert_eq!(after_first.reset_date, Some(date!(2025 - 05 - 15)));
    }

    #[tokio::test]
    async fn finalizing_downgrade_terminates_subscription_record() {
        let (reconciler, credits, subscriptions) = build(MemoryStore::shared());

        subscriptions
            .upsert(
                "u1",
                &SubscriptionPatch {
                    status: Some(SubscriptionStatus::Canceling),
                    plan_type: Some(PlanType::Pro),
                    customer_id: Some("cus_1".to_string()),
                    subscription_id: Some("sub_1".to_string()),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        credits
            .initialize("u1", 100_000, date!(2025 - 04 - 15), false)
            .await
            .unwrap();
        // Stage the downgrade the way a plan-change request would.
        credits.stage_downgrade("u1", 0).await.unwrap();

        let outcome = reconciler.reconcile_at("u1", date!(2025 - 04 - 16)).await.unwrap();
        assert!(matches!(
            outcome,
            ReconcileOutcome::Refresh {
                total: 0,
                finalize_downgrade: true,
                ..
            }
        ));

        let sub = subscriptions.get("u1").await.unwrap().unwrap();
        assert_eq!(sub.plan_type, PlanType::Downgraded);
        assert_eq!(sub.status, SubscriptionStatus::Canceled);
        assert_eq!(sub.customer_id, None);
        assert_eq!(sub.subscription_id, None);

        let record = credits.record("u1").await.unwrap().unwrap();
        assert_eq!(record.total, Some(0));
        assert!(!record.pending_downgrade);
        assert!(record.next_total_credits.is_none());
        assert!(record.downgraded_at.is_some());
    }
}
