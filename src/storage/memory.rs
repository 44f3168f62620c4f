//! In-memory cache backend: `DashMap` plus an optional background sweeper.

use super::{CacheBackend, CacheEntry};
use crate::lru::select_eviction_candidate;
use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;

/// Default in-memory [`CacheBackend`].
///
/// Eviction on `set` delegates to [`select_eviction_candidate`] once the map
/// exceeds `max_size`. A detached sweeper task removes expired entries on
/// `cleanup_interval` (0 disables it); the handle is aborted when the backend
/// is dropped so no task outlives its owner.
pub struct MemoryBackend<V> {
    map: Arc<DashMap<String, CacheEntry<V>>>,
    max_size: Option<usize>,
    access_sequence: Arc<AtomicU64>,
    sweeper: Mutex<Option<JoinHandle<()>>>,
}

impl<V> MemoryBackend<V>
where
    V: Send + Sync + 'static,
{
    pub fn new(max_size: Option<usize>) -> Self {
        Self { map: Arc::new(DashMap::new()), max_size, access_sequence: Arc::new(AtomicU64::new(0)), sweeper: Mutex::new(None) }
    }

    /// Spawn the background sweeper. `interval` of zero disables it (no task
    /// is spawned and this is a no-op).
    pub fn with_cleanup_interval(self, interval: Duration) -> Self {
        if interval.is_zero() {
            return self;
        }
        let map = self.map.clone();
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                let now = Instant::now();
                let expired: Vec<String> = map
                    .iter()
                    .filter(|entry| entry.value().is_expired(now))
                    .map(|entry| entry.key().clone())
                    .collect();
                for key in expired {
                    map.remove(&key);
                }
                tracing::debug!(removed = map.len(), "cache sweeper pass complete");
            }
        });
        *self.sweeper.lock().unwrap_or_else(|p| p.into_inner()) = Some(handle);
        self
    }

    fn next_sequence(&self) -> u64 {
        self.access_sequence.fetch_add(1, Ordering::Relaxed)
    }

    fn evict_if_over_capacity(&self)
    where
        V: Clone,
    {
        let Some(max_size) = self.max_size else { return };
        while self.map.len() > max_size {
            let snapshot: Vec<(String, CacheEntry<V>)> =
                self.map.iter().map(|r| (r.key().clone(), r.value().clone())).collect();
            let candidate = select_eviction_candidate(snapshot.iter().map(|(k, v)| (k, v)));
            match candidate {
                Some(key) => {
                    self.map.remove(&key);
                    tracing::debug!(%key, "evicted entry over capacity");
                }
                None => break,
            }
        }
    }
}

#[async_trait]
impl<V> CacheBackend<V> for MemoryBackend<V>
where
    V: Clone + Send + Sync + 'static,
{
    async fn get(&self, key: &str) -> Option<CacheEntry<V>> {
        let mut entry = self.map.get_mut(key)?;
        let now = Instant::now();
        if entry.is_expired(now) {
            drop(entry);
            self.map.remove(key);
            return None;
        }
        let sequence = self.next_sequence();
        entry.touch(now, sequence);
        Some(entry.clone())
    }

    async fn set(&self, key: String, entry: CacheEntry<V>) {
        self.map.insert(key, entry);
        self.evict_if_over_capacity();
    }

    async fn delete(&self, key: &str) -> bool {
        self.map.remove(key).is_some()
    }

    async fn clear(&self) {
        self.map.clear();
        self.access_sequence.store(0, Ordering::Relaxed);
    }

    async fn has(&self, key: &str) -> bool {
        match self.map.get(key) {
            Some(entry) => !entry.is_expired(Instant::now()),
            None => false,
        }
    }

    async fn size(&self) -> usize {
        self.map.len()
    }

    async fn keys(&self) -> Vec<String> {
        self.map.iter().map(|e| e.key().clone()).collect()
    }

    async fn entries(&self) -> Vec<(String, CacheEntry<V>)> {
        self.map.iter().map(|e| (e.key().clone(), e.value().clone())).collect()
    }
}

impl<V> Drop for MemoryBackend<V> {
    fn drop(&mut self) {
        if let Some(handle) = self.sweeper.lock().unwrap_or_else(|p| p.into_inner()).take() {
            handle.abort();
        }
    }
}
