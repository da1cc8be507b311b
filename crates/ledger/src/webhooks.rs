//! Billing provider webhook handling
//!
//! Verifies event signatures and translates provider events into credit and
//! subscription record mutations. Delivery is at least once and unordered,
//! so every mapping is a field-level idempotent write guarded by explicit
//! terminal-state checks rather than sequence numbers.

use std::collections::HashMap;
use std::sync::Arc;

use hmac::{Hmac, Mac};
use serde::Deserialize;
use sha2::Sha256;
use subtle::ConstantTimeEq;
use time::OffsetDateTime;

use crate::credits::{CancellationMarker, CreditLedger};
use crate::error::{LedgerError, LedgerResult};
use crate::provider::BillingProvider;
use crate::subscription::SubscriptionStore;
use crate::types::{SubscriptionPatch, SubscriptionStatus};

type HmacSha256 = Hmac<Sha256>;

/// Maximum accepted age of a signed payload, in seconds
const SIGNATURE_TOLERANCE_SECS: i64 = 300;

const METADATA_USER_ID: &str = "userId";
const METADATA_SUBSCRIPTION_ID: &str = "subscriptionId";

/// Verifies webhook signatures of the form `t=<unix>,v1=<hex hmac>`
#[derive(Clone)]
pub struct WebhookVerifier {
    secret: String,
}

impl WebhookVerifier {
    pub fn new(secret: impl Into<String>) -> Self {
        Self {
            secret: secret.into(),
        }
    }

    /// Verify `signature_header` against `payload`.
    ///
    /// The signed message is `<timestamp>.<payload>` keyed with the endpoint
    /// secret. Stale timestamps are rejected to bound replay windows. No
    /// state may be mutated before this returns `Ok`.
    pub fn verify(&self, payload: &str, signature_header: &str) -> LedgerResult<()> {
        self.verify_at(payload, signature_header, OffsetDateTime::now_utc())
    }

    fn verify_at(
        &self,
        payload: &str,
        signature_header: &str,
        now: OffsetDateTime,
    ) -> LedgerResult<()> {
        let mut timestamp: Option<i64> = None;
        let mut v1_signature: Option<&str> = None;

        for part in signature_header.split(',') {
            match part.trim().split_once('=') {
                Some(("t", value)) => timestamp = value.parse().ok(),
                Some(("v1", value)) => v1_signature = Some(value),
                _ => {}
            }
        }

        let timestamp = timestamp.ok_or_else(|| {
            tracing::warn!("webhook signature header missing timestamp");
            LedgerError::InvalidWebhookSignature
        })?;
        let v1_signature = v1_signature.ok_or_else(|| {
            tracing::warn!("webhook signature header missing v1 signature");
            LedgerError::InvalidWebhookSignature
        })?;

        let age = (now.unix_timestamp() - timestamp).abs();
        if age > SIGNATURE_TOLERANCE_SECS {
            tracing::warn!(timestamp, age, "webhook timestamp outside tolerance");
            return Err(LedgerError::InvalidWebhookSignature);
        }

        let secret_key = self.secret.strip_prefix("whsec_").unwrap_or(&self.secret);
        let mut mac = HmacSha256::new_from_slice(secret_key.as_bytes())
            .map_err(|_| LedgerError::InvalidWebhookSignature)?;
        mac.update(format!("{timestamp}.{payload}").as_bytes());
        let computed = hex::encode(mac.finalize().into_bytes());

        if computed.as_bytes().ct_eq(v1_signature.as_bytes()).into() {
            Ok(())
        } else {
            tracing::warn!("webhook signature mismatch");
            Err(LedgerError::InvalidWebhookSignature)
        }
    }
}

/// Raw provider event envelope
#[derive(Debug, Clone, Deserialize)]
pub struct WebhookEvent {
    pub id: String,
    #[serde(rename = "type")]
    pub event_type: String,
    pub data: WebhookEventData,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WebhookEventData {
    pub object: serde_json::Value,
    #[serde(default)]
    pub previous_attributes: Option<serde_json::Value>,
}

impl WebhookEvent {
    pub fn parse(payload: &str) -> LedgerResult<Self> {
        serde_json::from_str(payload)
            .map_err(|e| LedgerError::MalformedWebhookPayload(e.to_string()))
    }
}

#[derive(Debug, Deserialize)]
struct SubscriptionObject {
    id: String,
    customer: Option<String>,
    status: String,
    #[serde(default)]
    cancel_at_period_end: bool,
    current_period_end: Option<i64>,
    #[serde(default)]
    metadata: HashMap<String, String>,
}

#[derive(Debug, Deserialize)]
struct InvoiceObject {
    customer: Option<String>,
    billing_reason: Option<String>,
    subscription: Option<String>,
}

#[derive(Debug, Deserialize)]
struct IntentObject {
    customer: Option<String>,
    #[serde(default)]
    metadata: HashMap<String, String>,
}

/// Outcome of processing one verified event
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WebhookOutcome {
    /// Records for this user were updated; the caller should reconcile
    Applied { user_id: String },
    /// Event type or billing reason is not one this ledger reacts to
    Ignored,
}

/// Maps verified provider events to record mutations
#[derive(Clone)]
pub struct WebhookProcessor {
    credits: CreditLedger,
    subscriptions: SubscriptionStore,
    provider: Arc<dyn BillingProvider>,
}

impl WebhookProcessor {
    pub fn new(
        credits: CreditLedger,
        subscriptions: SubscriptionStore,
        provider: Arc<dyn BillingProvider>,
    ) -> Self {
        Self {
            credits,
            subscriptions,
            provider,
        }
    }

    /// Apply one verified event.
    ///
    /// Events referencing a customer with no mapped user return
    /// [`LedgerError::UnresolvableWebhookSubject`]; callers acknowledge
    /// those to the provider instead of provoking retries.
    pub async fn process(&self, event: &WebhookEvent) -> LedgerResult<WebhookOutcome> {
        tracing::info!(
            event_id = %event.id,
            event_type = %event.event_type,
            "processing billing event"
        );

        match event.event_type.as_str() {
            "customer.subscription.updated" => self.subscription_updated(event).await,
            "customer.subscription.deleted" => self.subscription_deleted(event).await,
            "invoice.payment_succeeded" => self.invoice_payment_succeeded(event).await,
            "invoice.payment_failed" => self.invoice_payment_failed(event).await,
            "payment_intent.payment_failed" => {
                self.intent_failure(event, SubscriptionStatus::PaymentFailed).await
            }
            "payment_intent.canceled" => {
                self.intent_failure(event, SubscriptionStatus::Canceled).await
            }
            "setup_intent.setup_failed" => self.setup_failed(event).await,
            other => {
                tracing::info!(event_type = %other, "unhandled billing event type");
                Ok(WebhookOutcome::Ignored)
            }
        }
    }

    async fn subscription_updated(&self, event: &WebhookEvent) -> LedgerResult<WebhookOutcome> {
        let subscription = extract::<SubscriptionObject>(event)?;
        let user_id = self
            .resolve_user(&subscription.metadata, subscription.customer.as_deref())
            .await?;

        let previous_status = event
            .data
            .previous_attributes
            .as_ref()
            .and_then(|prev| prev.get("status"))
            .and_then(|s| s.as_str());

        if previous_status == Some("trialing") && subscription.status == "active" {
            // Trial converted to paid. Not a cancellation: keep ids, stamp
            // the transition, and let reconciliation handle the allotment.
            self.subscriptions
                .upsert(
                    &user_id,
                    &SubscriptionPatch {
                        status: Some(SubscriptionStatus::Active),
                        trial_ended_at: Some(OffsetDateTime::now_utc()),
                        subscription_id: Some(subscription.id.clone()),
                        ..Default::default()
                    },
                )
                .await?;
            tracing::info!(user_id, subscription_id = %subscription.id, "trial converted to active");
            return Ok(WebhookOutcome::Applied { user_id });
        }

        if subscription.cancel_at_period_end {
            // Overlay only. Status stays as-is until the deletion event;
            // the user keeps their credits through the paid period.
            self.subscriptions
                .upsert(
                    &user_id,
                    &SubscriptionPatch {
                        cancel_at_period_end: Some(true),
                        current_period_end: unix_timestamp(subscription.current_period_end),
                        ..Default::default()
                    },
                )
                .await?;
            tracing::info!(
                user_id,
                subscription_id = %subscription.id,
                period_end = ?subscription.current_period_end,
                "cancellation scheduled at period end"
            );
            return Ok(WebhookOutcome::Applied { user_id });
        }

        // General status sync. Clearing the overlay here handles the user
        // un-scheduling a cancellation from the provider portal.
        let status = SubscriptionStatus::parse(&subscription.status);
        self.subscriptions
            .upsert(
                &user_id,
                &SubscriptionPatch {
                    status,
                    cancel_at_period_end: Some(false),
                    current_period_end: unix_timestamp(subscription.current_period_end),
                    subscription_id: Some(subscription.id.clone()),
                    ..Default::default()
                },
            )
            .await?;
        tracing::info!(user_id, status = %subscription.status, "subscription status synced");
        Ok(WebhookOutcome::Applied { user_id })
    }

    async fn subscription_deleted(&self, event: &WebhookEvent) -> LedgerResult<WebhookOutcome> {
        let subscription = extract::<SubscriptionObject>(event)?;
        let user_id = self
            .resolve_user(&subscription.metadata, subscription.customer.as_deref())
            .await?;

        self.subscriptions
            .upsert(
                &user_id,
                &SubscriptionPatch {
                    status: Some(SubscriptionStatus::Canceled),
                    canceled_at: Some(OffsetDateTime::now_utc()),
                    subscription_id: Some(String::new()),
                    customer_id: Some(String::new()),
                    cancel_at_period_end: Some(false),
                    ..Default::default()
                },
            )
            .await?;
        self.credits
            .zero(&user_id, Some(CancellationMarker::SubscriptionDeleted))
            .await?;

        tracing::info!(user_id, subscription_id = %subscription.id, "subscription deleted, credits zeroed");
        Ok(WebhookOutcome::Applied { user_id })
    }

    async fn invoice_payment_succeeded(
        &self,
        event: &WebhookEvent,
    ) -> LedgerResult<WebhookOutcome> {
        let invoice = extract::<InvoiceObject>(event)?;
        if invoice.billing_reason.as_deref() != Some("subscription_cycle") {
            tracing::debug!(
                billing_reason = ?invoice.billing_reason,
                "ignoring non-cycle invoice payment"
            );
            return Ok(WebhookOutcome::Ignored);
        }
        let user_id = self
            .resolve_user(&HashMap::new(), invoice.customer.as_deref())
            .await?;

        self.subscriptions
            .upsert(
                &user_id,
                &SubscriptionPatch {
                    status: Some(SubscriptionStatus::Active),
                    trial_ended_at: Some(OffsetDateTime::now_utc()),
                    ..Default::default()
                },
            )
            .await?;
        tracing::info!(user_id, subscription = ?invoice.subscription, "cycle invoice paid");
        Ok(WebhookOutcome::Applied { user_id })
    }

    async fn invoice_payment_failed(&self, event: &WebhookEvent) -> LedgerResult<WebhookOutcome> {
        let invoice = extract::<InvoiceObject>(event)?;
        if invoice.billing_reason.as_deref() != Some("subscription_cycle") {
            tracing::debug!(
                billing_reason = ?invoice.billing_reason,
                "ignoring non-cycle invoice failure"
            );
            return Ok(WebhookOutcome::Ignored);
        }
        let user_id = self
            .resolve_user(&HashMap::new(), invoice.customer.as_deref())
            .await?;

        self.credits.zero(&user_id, None).await?;
        self.subscriptions
            .upsert(&user_id, &SubscriptionPatch::status(SubscriptionStatus::PastDue))
            .await?;

        tracing::warn!(user_id, subscription = ?invoice.subscription, "cycle payment failed, credits zeroed");
        Ok(WebhookOutcome::Applied { user_id })
    }

    /// Trial payment intents carry the user id in metadata; intents without
    /// it belong to flows this ledger does not own.
    async fn intent_failure(
        &self,
        event: &WebhookEvent,
        status: SubscriptionStatus,
    ) -> LedgerResult<WebhookOutcome> {
        let intent = extract::<IntentObject>(event)?;
        let Some(user_id) = intent.metadata.get(METADATA_USER_ID).cloned() else {
            tracing::debug!(event_type = %event.event_type, "intent without user metadata, ignoring");
            return Ok(WebhookOutcome::Ignored);
        };

        self.credits.zero(&user_id, None).await?;
        let patch = SubscriptionPatch {
            status: Some(status),
            canceled_at: (status == SubscriptionStatus::Canceled)
                .then(OffsetDateTime::now_utc),
            ..Default::default()
        };
        self.subscriptions.upsert(&user_id, &patch).await?;

        tracing::warn!(user_id, %status, "payment intent failure, credits zeroed");
        Ok(WebhookOutcome::Applied { user_id })
    }

    async fn setup_failed(&self, event: &WebhookEvent) -> LedgerResult<WebhookOutcome> {
        let intent = extract::<IntentObject>(event)?;
        let Some(user_id) = intent.metadata.get(METADATA_USER_ID).cloned() else {
            tracing::debug!("setup intent without user metadata, ignoring");
            return Ok(WebhookOutcome::Ignored);
        };

        // Cancel the subscription the setup intent was provisioning so the
        // provider stops attempting to bill it.
        let subscription_id = match intent.metadata.get(METADATA_SUBSCRIPTION_ID) {
            Some(id) => Some(id.clone()),
            None => self
                .subscriptions
                .get(&user_id)
                .await?
                .and_then(|record| record.subscription_id),
        };
        if let Some(subscription_id) = subscription_id {
            if let Err(e) = self.provider.cancel_subscription(&subscription_id).await {
                // Records still transition locally; the deletion webhook
                // will arrive if the provider cancels it another way.
                tracing::error!(user_id, subscription_id, error = %e, "provider cancel failed");
            }
        }

        self.credits.zero(&user_id, None).await?;
        self.subscriptions
            .upsert(&user_id, &SubscriptionPatch::status(SubscriptionStatus::SetupFailed))
            .await?;

        tracing::warn!(user_id, "setup failed, subscription canceled and credits zeroed");
        Ok(WebhookOutcome::Applied { user_id })
    }

    /// Resolve the affected user: explicit metadata first, then the stored
    /// customer mapping.
    async fn resolve_user(
        &self,
        metadata: &HashMap<String, String>,
        customer: Option<&str>,
    ) -> LedgerResult<String> {
        if let Some(user_id) = metadata.get(METADATA_USER_ID) {
            return Ok(user_id.clone());
        }
        if let Some(customer_id) = customer {
            if let Some(user_id) = self.subscriptions.user_for_customer(customer_id).await? {
                return Ok(user_id);
            }
        }
        Err(LedgerError::UnresolvableWebhookSubject {
            subject: customer.unwrap_or("<no customer>").to_string(),
        })
    }
}

fn extract<T: for<'de> Deserialize<'de>>(event: &WebhookEvent) -> LedgerResult<T> {
    serde_json::from_value(event.data.object.clone())
        .map_err(|e| LedgerError::MalformedWebhookPayload(e.to_string()))
}

fn unix_timestamp(ts: Option<i64>) -> Option<OffsetDateTime> {
    ts.and_then(|t| OffsetDateTime::from_unix_timestamp(t).ok())
}
