//! Billing provider abstraction
//!
//! Outbound calls to the billing provider sit behind a trait so the trial
//! lifecycle and webhook handling are testable without the network. The
//! production implementation talks to the Stripe REST API.

use async_trait::async_trait;
use serde::Deserialize;
use std::collections::HashMap;
use std::time::Duration;

use crate::error::{LedgerError, LedgerResult};

const STRIPE_API_BASE: &str = "https://api.stripe.com/v1";

/// Bounded timeout for provider calls; failures surface to the caller
/// instead of hanging the request.
const PROVIDER_TIMEOUT: Duration = Duration::from_secs(10);

/// Subscription state as reported by the provider
#[derive(Debug, Clone, Deserialize)]
pub struct ProviderSubscription {
    pub id: String,
    pub customer: Option<String>,
    pub status: String,
    #[serde(default)]
    pub cancel_at_period_end: bool,
    /// Unix timestamp of the current period end
    pub current_period_end: Option<i64>,
    /// Unix timestamp of the trial end, when trialing
    pub trial_end: Option<i64>,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

/// Outbound billing provider operations
#[async_trait]
pub trait BillingProvider: Send + Sync {
    /// Fetch the provider's current view of a subscription
    async fn retrieve_subscription(&self, subscription_id: &str)
        -> LedgerResult<ProviderSubscription>;

    /// Cancel immediately
    async fn cancel_subscription(&self, subscription_id: &str)
        -> LedgerResult<ProviderSubscription>;

    /// Schedule cancellation for the end of the current period
    async fn cancel_at_period_end(&self, subscription_id: &str)
        -> LedgerResult<ProviderSubscription>;
}

/// Stripe REST implementation
#[derive(Clone)]
pub struct StripeGateway {
    client: reqwest::Client,
    secret_key: String,
    api_base: String,
}

impl StripeGateway {
    pub fn new(secret_key: impl Into<String>) -> Self {
        let client = reqwest::Client::builder()
            .timeout(PROVIDER_TIMEOUT)
            .build()
            .unwrap_or_default();
        Self {
            client,
            secret_key: secret_key.into(),
            api_base: STRIPE_API_BASE.to_string(),
        }
    }

    /// Override the API base URL (tests point this at a mock server)
    pub fn with_api_base(mut self, api_base: impl Into<String>) -> Self {
        self.api_base = api_base.into();
        self
    }

    async fn request<T: for<'de> Deserialize<'de>>(
        &self,
        method: reqwest::Method,
        endpoint: &str,
        form: Option<&[(&str, &str)]>,
    ) -> LedgerResult<T> {
        let url = format!("{}{endpoint}", self.api_base);

        let mut request = self
            .client
            .request(method, &url)
            .basic_auth(&self.secret_key, Option::<&str>::None);
        if let Some(form) = form {
            request = request.form(form);
        }

        let response = request.send().await.map_err(|e| {
            tracing::error!(endpoint, error = %e, "provider request failed");
            LedgerError::Provider(e.to_string())
        })?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            tracing::error!(endpoint, %status, body = %body, "provider returned error");
            return Err(LedgerError::Provider(format!("provider error: {status}")));
        }

        response.json::<T>().await.map_err(|e| {
            tracing::error!(endpoint, error = %e, "failed to parse provider response");
            LedgerError::Provider(e.to_string())
        })
    }
}

#[async_trait]
impl BillingProvider for StripeGateway {
    async fn retrieve_subscription(
        &self,
        subscription_id: &str,
    ) -> LedgerResult<ProviderSubscription> {
        tracing::debug!(subscription_id, "retrieving subscription");
        self.request(
            reqwest::Method::GET,
            &format!("/subscriptions/{subscription_id}"),
            None,
        )
        .await
    }

    async fn cancel_subscription(
        &self,
        subscription_id: &str,
    ) -> LedgerResult<ProviderSubscription> {
        tracing::info!(subscription_id, "canceling subscription immediately");
        self.request(
            reqwest::Method::DELETE,
            &format!("/subscriptions/{subscription_id}"),
            None,
        )
        .await
    }

    async fn cancel_at_period_end(
        &self,
        subscription_id: &str,
    ) -> LedgerResult<ProviderSubscription> {
        tracing::info!(subscription_id, "scheduling cancellation at period end");
        self.request(
            reqwest::Method::POST,
            &format!("/subscriptions/{subscription_id}"),
            Some(&[("cancel_at_period_end", "true")]),
        )
        .await
    }
}
