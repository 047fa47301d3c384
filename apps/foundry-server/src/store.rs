//! Ephemeral keyed store with per-entry TTL.
//!
//! Holds nonce records, rate-limit windows, token records and the shared secret.
//! Every method is atomic with respect to the key it touches; callers build their
//! compare-and-set logic on [`EphemeralStore::set_if_absent`], [`EphemeralStore::take`]
//! and [`EphemeralStore::update`] instead of locking around the store.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use moka::future::Cache;
use moka::ops::compute::Op;
use moka::Expiry;
use serde_json::Value;

pub(crate) type UpdateFn = Box<dyn FnOnce(Option<&Value>) -> Value + Send>;

#[async_trait]
pub(crate) trait EphemeralStore: Send + Sync {
    async fn get(&self, key: &str) -> Option<Value>;

    async fn set(&self, key: &str, value: Value, ttl: Option<Duration>);

    /// Insert only when no live entry exists; returns whether the insert happened.
    async fn set_if_absent(&self, key: &str, value: Value, ttl: Option<Duration>) -> bool;

    /// Remove and return the live entry, if any.
    async fn take(&self, key: &str) -> Option<Value>;

    async fn delete(&self, key: &str);

    /// Replace the entry with `f(current)` and return the new value.
    async fn update(&self, key: &str, ttl: Option<Duration>, f: UpdateFn) -> Value;
}

#[derive(Clone)]
struct Slot {
    value: Value,
    expires: Option<Instant>,
}

impl Slot {
    fn new(value: Value, ttl: Option<Duration>) -> Self {
        Self {
            value,
            expires: ttl.map(|d| Instant::now() + d),
        }
    }

    fn live(&self) -> bool {
        self.expires.map_or(true, |at| at > Instant::now())
    }

    fn remaining(&self, from: Instant) -> Option<Duration> {
        self.expires.map(|at| at.saturating_duration_since(from))
    }
}

/// Each entry carries its own deadline; writes restart it.
struct PerEntryTtl;

impl Expiry<String, Slot> for PerEntryTtl {
    fn expire_after_create(&self, _key: &String, slot: &Slot, created_at: Instant) -> Option<Duration> {
        slot.remaining(created_at)
    }

    fn expire_after_update(
        &self,
        _key: &String,
        slot: &Slot,
        updated_at: Instant,
        _duration_until_expiry: Option<Duration>,
    ) -> Option<Duration> {
        slot.remaining(updated_at)
    }
}

/// Process-local store backed by a `moka` cache with per-entry expiry.
pub(crate) struct MemoryStore {
    cache: Cache<String, Slot>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            cache: Cache::builder().expire_after(PerEntryTtl).build(),
        }
    }

    #[cfg(test)]
    pub async fn len(&self) -> usize {
        self.cache.run_pending_tasks().await;
        self.cache.entry_count() as usize
    }
}

#[async_trait]
impl EphemeralStore for MemoryStore {
    async fn get(&self, key: &str) -> Option<Value> {
        self.cache.get(key).await.filter(Slot::live).map(|s| s.value)
    }

    async fn set(&self, key: &str, value: Value, ttl: Option<Duration>) {
        self.cache.insert(key.to_string(), Slot::new(value, ttl)).await;
    }

    async fn set_if_absent(&self, key: &str, value: Value, ttl: Option<Duration>) -> bool {
        self.cache
            .entry_by_ref(key)
            .or_insert_with(async move { Slot::new(value, ttl) })
            .await
            .is_fresh()
    }

    async fn take(&self, key: &str) -> Option<Value> {
        self.cache.remove(key).await.filter(Slot::live).map(|s| s.value)
    }

    async fn delete(&self, key: &str) {
        self.cache.invalidate(key).await;
    }

    async fn update(&self, key: &str, ttl: Option<Duration>, f: UpdateFn) -> Value {
        let mut next = Value::Null;
        self.cache
            .entry_by_ref(key)
            .and_compute_with(|current| {
                let value = f(current
                    .as_ref()
                    .map(|e| e.value())
                    .filter(|s| s.live())
                    .map(|s| &s.value));
                next = value.clone();
                std::future::ready(Op::Put(Slot::new(value, ttl)))
            })
            .await;
        next
    }
}
