//! Credit ledger
//!
//! Tracks the remaining usage allowance per user and answers "may this user
//! spend N credits now?". Deduction uses the store's atomic field increment
//! with rollback so two simultaneous requests from the same user can never
//! push `used` past `total`.

use time::{Date, OffsetDateTime};

use crate::config::CreditsConfig;
use crate::error::LedgerResult;
use crate::store::{credits_key, RecordStore, SharedStore};
use crate::types::{credit_fields, format_date, format_timestamp, CreditRecord};

/// Remaining allowance for a user
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Remaining {
    /// Total is at or above the unlimited sentinel threshold
    Unlimited,
    Credits(i64),
}

impl Remaining {
    pub fn is_unlimited(&self) -> bool {
        matches!(self, Remaining::Unlimited)
    }

    /// Credits count, `None` when unlimited
    pub fn credits(&self) -> Option<i64> {
        match self {
            Remaining::Unlimited => None,
            Remaining::Credits(n) => Some(*n),
        }
    }
}

/// Result of a deduction attempt. Refusals are values, not errors: the
/// caller maps them to an "upgrade required" response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeductOutcome {
    Granted {
        remaining: Remaining,
    },
    Insufficient {
        requested: i64,
        remaining: i64,
    },
    /// No credit record at all: the user has no subscription and zero
    /// allowance
    NoEntitlement,
}

impl DeductOutcome {
    pub fn is_granted(&self) -> bool {
        matches!(self, DeductOutcome::Granted { .. })
    }
}

/// Explicit cancellation signal stamped when credits are revoked
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancellationMarker {
    TrialCanceled,
    SubscriptionDeleted,
}

impl CancellationMarker {
    fn field(&self) -> &'static str {
        match self {
            CancellationMarker::TrialCanceled => credit_fields::TRIAL_CANCELED,
            CancellationMarker::SubscriptionDeleted => credit_fields::SUBSCRIPTION_DELETED,
        }
    }
}

/// Per-user credit accounting over the record store
#[derive(Clone)]
pub struct CreditLedger {
    store: SharedStore,
    config: CreditsConfig,
}

impl CreditLedger {
    pub fn new(store: SharedStore, config: CreditsConfig) -> Self {
        Self { store, config }
    }

    /// Load the decoded credit record, `None` when absent
    pub async fn record(&self, user_id: &str) -> LedgerResult<Option<CreditRecord>> {
        let fields = self.store.fields(&credits_key(user_id)).await?;
        Ok(CreditRecord::from_fields(&fields))
    }

    /// Remaining allowance. A user with no record (or a record with no
    /// total) reports the configured floor, 0 by default.
    pub async fn remaining(&self, user_id: &str) -> LedgerResult<Remaining> {
        let record = self.record(user_id).await?;
        Ok(self.remaining_of(record.as_ref()))
    }

    /// Remaining allowance of an already-loaded record
    pub fn remaining_of(&self, record: Option<&CreditRecord>) -> Remaining {
        match record.and_then(|r| r.total.map(|total| (total, r.used))) {
            Some((total, _)) if self.config.is_unlimited(total) => Remaining::Unlimited,
            Some((total, used)) => Remaining::Credits((total - used).max(0)),
            None => Remaining::Credits(self.config.missing_record_floor),
        }
    }

    /// Attempt to spend `amount` credits.
    ///
    /// Refusal is a normal negative outcome; only store failures error.
    /// Non-positive amounts are a no-op grant.
    pub async fn deduct(&self, user_id: &str, amount: i64) -> LedgerResult<DeductOutcome> {
        let key = credits_key(user_id);
        let record = self.record(user_id).await?;

        let Some(total) = record.as_ref().and_then(|r| r.total) else {
            tracing::debug!(user_id, "deduct refused: no credit record");
            return Ok(DeductOutcome::NoEntitlement);
        };

        if amount <= 0 {
            return Ok(DeductOutcome::Granted {
                remaining: self.remaining_of(record.as_ref()),
            });
        }

        if self.config.is_unlimited(total) {
            // Usage is still tracked for unlimited accounts, but never gates.
            self.store
                .increment_field(&key, credit_fields::USED, amount)
                .await?;
            self.stamp(&key).await?;
            return Ok(DeductOutcome::Granted {
                remaining: Remaining::Unlimited,
            });
        }

        // Atomic claim: increment first, roll back when oversubscribed.
        // Concurrent deductions may transiently read used > total but can
        // never both keep their claim.
        let new_used = self
            .store
            .increment_field(&key, credit_fields::USED, amount)
            .await?;

        if new_used > total {
            self.store
                .increment_field(&key, credit_fields::USED, -amount)
                .await?;
            let remaining = (total - (new_used - amount)).max(0);
            tracing::debug!(
                user_id,
                requested = amount,
                remaining,
                "deduct refused: insufficient credits"
            );
            return Ok(DeductOutcome::Insufficient {
                requested: amount,
                remaining,
            });
        }

        self.stamp(&key).await?;
        Ok(DeductOutcome::Granted {
            remaining: Remaining::Credits(total - new_used),
        })
    }

    /// Create or overwrite the credit record for a new period/grant.
    /// Clears any stale cancellation and downgrade markers.
    pub async fn initialize(
        &self,
        user_id: &str,
        total: i64,
        reset_date: Date,
        is_trial_credits: bool,
    ) -> LedgerResult<()> {
        let key = credits_key(user_id);
        let mut fields = vec![
            (credit_fields::TOTAL.to_string(), total.to_string()),
            (credit_fields::USED.to_string(), "0".to_string()),
            (credit_fields::RESET_DATE.to_string(), format_date(reset_date)),
            (
                credit_fields::LAST_UPDATE.to_string(),
                format_timestamp(OffsetDateTime::now_utc()),
            ),
        ];
        if is_trial_credits {
            fields.push((credit_fields::IS_TRIAL_CREDITS.to_string(), "true".to_string()));
        }
        self.store.put_fields(&key, &fields).await?;
        self.store
            .delete_fields(
                &key,
                &[
                    credit_fields::TRIAL_CANCELED,
                    credit_fields::SUBSCRIPTION_DELETED,
                    credit_fields::PENDING_DOWNGRADE,
                    credit_fields::NEXT_TOTAL_CREDITS,
                    credit_fields::DOWNGRADED_AT,
                ],
            )
            .await?;
        tracing::info!(user_id, total, is_trial_credits, "credit record initialized");
        Ok(())
    }

    /// Stage a plan downgrade to take effect at the next period rollover.
    /// Reconciliation consumes the markers and applies the staged total.
    pub async fn stage_downgrade(&self, user_id: &str, next_total: i64) -> LedgerResult<()> {
        self.store
            .put_fields(
                &credits_key(user_id),
                &[
                    (credit_fields::PENDING_DOWNGRADE.to_string(), "true".to_string()),
                    (
                        credit_fields::NEXT_TOTAL_CREDITS.to_string(),
                        next_total.to_string(),
                    ),
                ],
            )
            .await?;
        tracing::info!(user_id, next_total, "downgrade staged for next rollover");
        Ok(())
    }

    /// Apply a period rollover: new total, used back to 0, next reset date.
    /// Clears staged downgrade markers but leaves grant provenance flags
    /// (such as `isTrialCredits`) alone.
    pub async fn refresh(
        &self,
        user_id: &str,
        total: i64,
        reset_date: Date,
        downgraded: bool,
    ) -> LedgerResult<()> {
        let key = credits_key(user_id);
        let mut fields = vec![
            (credit_fields::TOTAL.to_string(), total.to_string()),
            (credit_fields::USED.to_string(), "0".to_string()),
            (credit_fields::RESET_DATE.to_string(), format_date(reset_date)),
            (
                credit_fields::LAST_UPDATE.to_string(),
                format_timestamp(OffsetDateTime::now_utc()),
            ),
        ];
        if downgraded {
            fields.push((
                credit_fields::DOWNGRADED_AT.to_string(),
                format_timestamp(OffsetDateTime::now_utc()),
            ));
        }
        self.store.put_fields(&key, &fields).await?;
        self.store
            .delete_fields(
                &key,
                &[credit_fields::PENDING_DOWNGRADE, credit_fields::NEXT_TOTAL_CREDITS],
            )
            .await?;
        tracing::info!(user_id, total, reset = %format_date(reset_date), "credits refreshed");
        Ok(())
    }

    /// Revoke all credits immediately: total=0, used=0, no scheduled
    /// refresh, optional cancellation marker. Clears staged downgrades.
    pub async fn zero(
        &self,
        user_id: &str,
        marker: Option<CancellationMarker>,
    ) -> LedgerResult<()> {
        let key = credits_key(user_id);
        let mut fields = vec![
            (credit_fields::TOTAL.to_string(), "0".to_string()),
            (credit_fields::USED.to_string(), "0".to_string()),
            (credit_fields::RESET_DATE.to_string(), String::new()),
            (
                credit_fields::LAST_UPDATE.to_string(),
                format_timestamp(OffsetDateTime::now_utc()),
            ),
        ];
        if let Some(marker) = marker {
            fields.push((marker.field().to_string(), "true".to_string()));
        }
        self.store.put_fields(&key, &fields).await?;
        self.store
            .delete_fields(
                &key,
                &[credit_fields::PENDING_DOWNGRADE, credit_fields::NEXT_TOTAL_CREDITS],
            )
            .await?;
        tracing::info!(user_id, marker = ?marker, "credits zeroed");
        Ok(())
    }

    async fn stamp(&self, key: &str) -> LedgerResult<()> {
        self.store
            .put_fields(
                key,
                &[(
                    credit_fields::LAST_UPDATE.to_string(),
                    format_timestamp(OffsetDateTime::now_utc()),
                )],
            )
            .await
    }
}
