//! TTL-aware key/value store exposed to guest code as `store.*`.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;

/// `ttl` result for a key that does not exist.
pub const TTL_MISSING: i64 = -2;
/// `ttl` result for a key without expiry.
pub const TTL_PERSISTENT: i64 = -1;

/// Backing store for the guest `store` capability.
///
/// Keys arrive already namespaced by workspace.
#[async_trait]
pub trait KvStore: Send + Sync {
    async fn get(&self, key: &str) -> anyhow::Result<Option<Value>>;

    /// Set `key`, optionally expiring after `ttl`.
    async fn set(&self, key: &str, value: Value, ttl: Option<Duration>) -> anyhow::Result<()>;

    /// Returns whether the key existed.
    async fn del(&self, key: &str) -> anyhow::Result<bool>;

    /// Remaining lifetime in whole seconds, [`TTL_PERSISTENT`] or [`TTL_MISSING`].
    async fn ttl(&self, key: &str) -> anyhow::Result<i64>;
}

#[derive(Debug, Clone)]
struct StoredValue {
    value: Value,
    expires_at: Option<Instant>,
}

impl StoredValue {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at.map_or(true, |at| at > now)
    }
}

/// Process-local [`KvStore`]. Expired keys are purged on access.
#[derive(Debug, Default)]
pub struct InMemoryKvStore {
    entries: Mutex<HashMap<String, StoredValue>>,
}

impl InMemoryKvStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live keys.
    pub fn len(&self) -> usize {
        let now = Instant::now();
        self.entries.lock().values().filter(|v| v.is_live(now)).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn live(&self, key: &str) -> Option<StoredValue> {
        let now = Instant::now();
        let mut entries = self.entries.lock();
        match entries.get(key) {
            Some(v) if v.is_live(now) => Some(v.clone()),
            Some(_) => {
                entries.remove(key);
                None
            }
            None => None,
        }
    }
}

#[async_trait]
impl KvStore for InMemoryKvStore {
    async fn get(&self, key: &str) -> anyhow::Result<Option<Value>> {
        Ok(self.live(key).map(|v| v.value))
    }

    async fn set(&self, key: &str, value: Value, ttl: Option<Duration>) -> anyhow::Result<()> {
        let expires_at = ttl.map(|ttl| Instant::now() + ttl);
        self.entries
            .lock()
            .insert(key.to_string(), StoredValue { value, expires_at });
        Ok(())
    }

    async fn del(&self, key: &str) -> anyhow::Result<bool> {
        let existed = self.live(key).is_some();
        self.entries.lock().remove(key);
        Ok(existed)
    }

    async fn ttl(&self, key: &str) -> anyhow::Result<i64> {
        Ok(match self.live(key) {
            None => TTL_MISSING,
            Some(StoredValue {
                expires_at: None, ..
            }) => TTL_PERSISTENT,
            Some(StoredValue {
                expires_at: Some(at),
                ..
            }) => {
                let remaining = at.saturating_duration_since(Instant::now());
                // Round up so a live key never reports 0.
                remaining.as_millis().div_ceil(1000) as i64
            }
        })
    }
}
