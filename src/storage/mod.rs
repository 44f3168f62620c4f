//! Cache storage abstraction.
//!
//! [`CacheBackend`] is dyn-compatible, following the pack's caching-library
//! adapter shape: a plain `#[async_trait]` trait plus blanket impls so callers
//! can hand a `Memoized` engine an `Arc<dyn CacheBackend<V>>` without knowing
//! the concrete backend.

pub mod memory;

use async_trait::async_trait;
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

/// A value stored in the cache, either owned directly or held weakly
/// alongside an external strong reference. `use_weak_ref` on the memoize
/// engine only has effect for `V = Arc<T>`; other value types always use
/// `Value`.
#[derive(Clone)]
pub enum StoredValue<V> {
    Value(V),
    Weak(Weak<V>),
}

impl<V: Clone> StoredValue<V> {
    /// Resolve to an owned value. A dropped `Weak` reference is treated as a
    /// miss by the caller (returns `None`).
    pub fn resolve(&self) -> Option<V> {
        match self {
            StoredValue::Value(v) => Some(v.clone()),
            StoredValue::Weak(w) => w.upgrade().map(|arc| (*arc).clone()),
        }
    }
}

/// An entry held by a [`CacheBackend`].
#[derive(Clone)]
pub struct CacheEntry<V> {
    pub value: StoredValue<V>,
    pub created_at: Instant,
    pub expires_at: Option<Instant>,
    pub stale_at: Option<Instant>,
    pub last_accessed: Instant,
    pub access_sequence: u64,
    pub access_count: u64,
}

impl<V> CacheEntry<V> {
    pub fn new(value: StoredValue<V>, now: Instant, ttl: Option<Duration>, stale_in: Option<Duration>) -> Self {
        Self {
            value,
            created_at: now,
            expires_at: ttl.map(|d| now + d),
            stale_at: stale_in.map(|d| now + d),
            last_accessed: now,
            access_sequence: 0,
            access_count: 0,
        }
    }

    pub fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.map(|exp| now >= exp).unwrap_or(false)
    }

    pub fn is_stale(&self, now: Instant) -> bool {
        self.stale_at.map(|at| now >= at).unwrap_or(false)
    }

    pub fn touch(&mut self, now: Instant, sequence: u64) {
        self.last_accessed = now;
        self.access_sequence = sequence;
        self.access_count += 1;
    }
}

/// Storage adapter protocol for the memoize engine.
///
/// Dyn-compatible: implementors may be wrapped in `Arc<dyn CacheBackend<V>>`.
#[async_trait]
pub trait CacheBackend<V>: Send + Sync
where
    V: Send + Sync + 'static,
{
    async fn get(&self, key: &str) -> Option<CacheEntry<V>>;
    async fn set(&self, key: String, entry: CacheEntry<V>);
    async fn delete(&self, key: &str) -> bool;
    async fn clear(&self);
    async fn has(&self, key: &str) -> bool {
        self.get(key).await.is_some()
    }
    async fn size(&self) -> usize;

    /// All keys currently stored. Default: empty (backends aren't required to
    /// support enumeration).
    async fn keys(&self) -> Vec<String> {
        Vec::new()
    }

    /// All entries currently stored. Default: empty.
    async fn entries(&self) -> Vec<(String, CacheEntry<V>)> {
        Vec::new()
    }
}

#[async_trait]
impl<V> CacheBackend<V> for Arc<dyn CacheBackend<V>>
where
    V: Send + Sync + 'static,
{
    async fn get(&self, key: &str) -> Option<CacheEntry<V>> {
        (**self).get(key).await
    }
    async fn set(&self, key: String, entry: CacheEntry<V>) {
        (**self).set(key, entry).await
    }
    async fn delete(&self, key: &str) -> bool {
        (**self).delete(key).await
    }
    async fn clear(&self) {
        (**self).clear().await
    }
    async fn has(&self, key: &str) -> bool {
        (**self).has(key).await
    }
    async fn size(&self) -> usize {
        (**self).size().await
    }
    async fn keys(&self) -> Vec<String> {
        (**self).keys().await
    }
    async fn entries(&self) -> Vec<(String, CacheEntry<V>)> {
        (**self).entries().await
    }
}

/// Point-in-time cache statistics, separate from any single backend so
/// callers needn't lock the whole map to read a counter.
#[derive(Debug, Clone, Copy, Default)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub size: usize,
}
