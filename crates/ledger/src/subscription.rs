//! Subscription record store
//!
//! Holds the latest known billing state per user. Updates are field-level
//! merges, so replaying the same provider event writes the same values and
//! converges to the same record (webhooks are delivered at least once).

use time::OffsetDateTime;

use crate::error::LedgerResult;
use crate::store::{customer_key, subscription_key, RecordStore, SharedStore};
use crate::types::{
    format_timestamp, subscription_fields, SubscriptionPatch, SubscriptionRecord,
};

const CUSTOMER_USER_FIELD: &str = "userId";

/// Subscription record operations over the record store
#[derive(Clone)]
pub struct SubscriptionStore {
    store: SharedStore,
}

impl SubscriptionStore {
    pub fn new(store: SharedStore) -> Self {
        Self { store }
    }

    /// Load the decoded subscription record, `None` when absent
    pub async fn get(&self, user_id: &str) -> LedgerResult<Option<SubscriptionRecord>> {
        let fields = self.store.fields(&subscription_key(user_id)).await?;
        Ok(SubscriptionRecord::from_fields(&fields))
    }

    /// Merge the set fields of `patch` into the record and stamp
    /// `lastUpdated`. Callers only set the fields they know changed.
    pub async fn upsert(&self, user_id: &str, patch: &SubscriptionPatch) -> LedgerResult<()> {
        let mut fields = patch.to_fields();
        if fields.is_empty() {
            return Ok(());
        }
        fields.push((
            subscription_fields::LAST_UPDATED.to_string(),
            format_timestamp(OffsetDateTime::now_utc()),
        ));
        self.store
            .put_fields(&subscription_key(user_id), &fields)
            .await?;
        tracing::debug!(user_id, fields = fields.len(), "subscription record updated");
        Ok(())
    }

    /// Remember which user a provider customer id belongs to, so events
    /// that carry only a customer id still resolve.
    pub async fn map_customer(&self, customer_id: &str, user_id: &str) -> LedgerResult<()> {
        self.store
            .put_fields(
                &customer_key(customer_id),
                &[(CUSTOMER_USER_FIELD.to_string(), user_id.to_string())],
            )
            .await
    }

    /// Resolve a provider customer id back to a user id
    pub async fn user_for_customer(&self, customer_id: &str) -> LedgerResult<Option<String>> {
        self.store
            .field(&customer_key(customer_id), CUSTOMER_USER_FIELD)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use crate::types::{PlanType, SubscriptionStatus};

    #[tokio::test]
    async fn upsert_merges_partial_updates() {
        let subs = SubscriptionStore::new(MemoryStore::shared());

        subs.upsert(
            "u1",
            &SubscriptionPatch {
                plan: Some("Standard Plan".to_string()),
                plan_type: Some(PlanType::Standard),
                status: Some(SubscriptionStatus::Active),
                subscription_id: Some("sub_123".to_string()),
                ..Default::default()
            },
        )
        .await
        .unwrap();

        // Second write touches only the status; everything else survives.
        subs.upsert("u1", &SubscriptionPatch::status(SubscriptionStatus::PastDue))
            .await
            .unwrap();

        let record = subs.get("u1").await.unwrap().unwrap();
        assert_eq!(record.status, SubscriptionStatus::PastDue);
        assert_eq!(record.plan, "Standard Plan");
        assert_eq!(record.plan_type, PlanType::Standard);
        assert_eq!(record.subscription_id.as_deref(), Some("sub_123"));
        assert!(record.last_updated.is_some());
    }

    #[tokio::test]
    async fn replaying_the_same_patch_is_idempotent() {
        let subs = SubscriptionStore::new(MemoryStore::shared());
        let patch = SubscriptionPatch {
            status: Some(SubscriptionStatus::Canceled),
            subscription_id: Some(String::new()),
            customer_id: Some(String::new()),
            ..Default::default()
        };

        subs.upsert("u1", &patch).await.unwrap();
        let first = subs.get("u1").await.unwrap().unwrap();

        subs.upsert("u1", &patch).await.unwrap();
        let second = subs.get("u1").await.unwrap().unwrap();

        assert_eq!(first.status, second.status);
        assert_eq!(first.subscription_id, second.subscription_id);
        assert_eq!(first.customer_id, second.customer_id);
    }

    #[tokio::test]
    async fn empty_patch_writes_nothing() {
        let subs = SubscriptionStore::new(MemoryStore::shared());
        subs.upsert("u1", &SubscriptionPatch::default()).await.unwrap();
        assert!(subs.get("u1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn customer_mapping_roundtrip() {
        let subs = SubscriptionStore::new(MemoryStore::shared());
        subs.map_customer("cus_42", "u1").await.unwrap();
        assert_eq!(
            subs.user_for_customer("cus_42").await.unwrap().as_deref(),
            Some("u1")
        );
        assert_eq!(subs.user_for_customer("cus_none").await.unwrap(), None);
    }
}
