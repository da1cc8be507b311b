//! Record store abstraction
//!
//! Credit and subscription records are hash-style maps under deterministic
//! keys. The store is injected so the ledger and reconciliation logic are
//! testable without a live Redis; any key-value store with atomic per-field
//! hash updates suffices.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use redis::AsyncCommands;
use tokio::sync::Mutex;

use crate::error::LedgerResult;

/// Key for a user's credit record
pub fn credits_key(user_id: &str) -> String {
    format!("user:{user_id}:credits")
}

/// Key for a user's subscription record
pub fn subscription_key(user_id: &str) -> String {
    format!("user:{user_id}:subscription")
}

/// Key for the provider-customer reverse mapping
pub fn customer_key(customer_id: &str) -> String {
    format!("customer:{customer_id}")
}

/// Hash-record store with atomic per-field increments
#[async_trait]
pub trait RecordStore: Send + Sync {
    /// All fields of a hash; empty map when the key does not exist
    async fn fields(&self, key: &str) -> LedgerResult<HashMap<String, String>>;

    /// Read one field
    async fn field(&self, key: &str, field: &str) -> LedgerResult<Option<String>>;

    /// Merge the given fields into the hash (partial update)
    async fn put_fields(&self, key: &str, fields: &[(String, String)]) -> LedgerResult<()>;

    /// Atomically add `delta` to an integer field, returning the new value.
    /// A missing field counts as 0.
    async fn increment_field(&self, key: &str, field: &str, delta: i64) -> LedgerResult<i64>;

    /// Remove the given fields from the hash
    async fn delete_fields(&self, key: &str, fields: &[&str]) -> LedgerResult<()>;
}

/// Shared handle to a record store
pub type SharedStore = Arc<dyn RecordStore>;

/// Redis-backed store
#[derive(Clone)]
pub struct RedisStore {
    conn: redis::aio::ConnectionManager,
}

impl RedisStore {
    /// Connect and build a managed connection (reconnects internally)
    pub async fn connect(url: &str) -> LedgerResult<Self> {
        let client = redis::Client::open(url)?;
        let conn = redis::aio::ConnectionManager::new(client).await?;
        tracing::info!("Redis record store connected");
        Ok(Self { conn })
    }
}

#[async_trait]
impl RecordStore for RedisStore {
    async fn fields(&self, key: &str) -> LedgerResult<HashMap<String, String>> {
        let mut conn = self.conn.clone();
        let fields: HashMap<String, String> = conn.hgetall(key).await?;
        Ok(fields)
    }

    async fn field(&self, key: &str, field: &str) -> LedgerResult<Option<String>> {
        let mut conn = self.conn.clone();
        let value: Option<String> = conn.hget(key, field).await?;
        Ok(value)
    }

    async fn put_fields(&self, key: &str, fields: &[(String, String)]) -> LedgerResult<()> {
        if fields.is_empty() {
            return Ok(());
        }
        let mut conn = self.conn.clone();
        let _: () = conn.hset_multiple(key, fields).await?;
        Ok(())
    }

    async fn increment_field(&self, key: &str, field: &str, delta: i64) -> LedgerResult<i64> {
        let mut conn = self.conn.clone();
        let value: i64 = conn.hincr(key, field, delta).await?;
        Ok(value)
    }

    async fn delete_fields(&self, key: &str, fields: &[&str]) -> LedgerResult<()> {
        if fields.is_empty() {
            return Ok(());
        }
        let mut conn = self.conn.clone();
        let _: () = conn.hdel(key, fields).await?;
        Ok(())
    }
}

/// In-memory store for tests and local development
#[derive(Default)]
pub struct MemoryStore {
    hashes: Mutex<HashMap<String, HashMap<String, String>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fresh shared handle
    pub fn shared() -> SharedStore {
        Arc::new(Self::new())
    }
}

#[async_trait]
impl RecordStore for MemoryStore {
    async fn fields(&self, key: &str) -> LedgerResult<HashMap<String, String>> {
        let hashes = self.hashes.lock().await;
        Ok(hashes.get(key).cloned().unwrap_or_default())
    }

    async fn field(&self, key: &str, field: &str) -> LedgerResult<Option<String>> {
        let hashes = self.hashes.lock().await;
        Ok(hashes.get(key).and_then(|h| h.get(field).cloned()))
    }

    async fn put_fields(&self, key: &str, fields: &[(String, String)]) -> LedgerResult<()> {
        let mut hashes = self.hashes.lock().await;
        let hash = hashes.entry(key.to_string()).or_default();
        for (field, value) in fields {
            hash.insert(field.clone(), value.clone());
        }
        Ok(())
    }

    async fn increment_field(&self, key: &str, field: &str, delta: i64) -> LedgerResult<i64> {
        let mut hashes = self.hashes.lock().await;
        let hash = hashes.entry(key.to_string()).or_default();
        let current: i64 = hash.get(field).and_then(|v| v.parse().ok()).unwrap_or(0);
        let next = current + delta;
        hash.insert(field.to_string(), next.to_string());
        Ok(next)
    }

    async fn delete_fields(&self, key: &str, fields: &[&str]) -> LedgerResult<()> {
        let mut hashes = self.hashes.lock().await;
        if let Some(hash) = hashes.get_mut(key) {
            for field in fields {
                hash.remove(*field);
            }
        }
        Ok(())
    }
}
