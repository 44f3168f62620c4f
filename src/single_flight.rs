//! Single-flight request coalescing: concurrent callers for the same key
//! share one producer invocation.

use crate::error::FlowError;
use dashmap::DashMap;
use futures::future::{BoxFuture, Shared};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

type SharedOutcome<T, E> = Shared<BoxFuture<'static, Result<T, FlowError<E>>>>;

struct InFlightEntry<T, E> {
    outcome: SharedOutcome<T, E>,
    waiting_count: Arc<AtomicUsize>,
}

impl<T, E> Clone for InFlightEntry<T, E> {
    fn clone(&self) -> Self {
        Self { outcome: self.outcome.clone(), waiting_count: self.waiting_count.clone() }
    }
}

/// RAII guard clearing a key's in-flight entry exactly once, when the
/// original caller's future settles — the idiomatic translation of the
/// "cleanup callback invoked exactly once" contract into Rust's `Drop`.
pub struct CleanupGuard<T, E>
where
    T: Send + Sync + 'static,
    E: Send + Sync + 'static,
{
    group: SingleFlightGroup<T, E>,
    key: String,
    armed: bool,
}

impl<T, E> CleanupGuard<T, E>
where
    T: Send + Sync + 'static,
    E: Send + Sync + 'static,
{
    /// Disarm the guard without removing the entry (used when a later stage
    /// wants to keep the in-flight marker alive, e.g. to hand it to a joiner
    /// that raced in during the write).
    pub fn disarm(mut self) {
        self.armed = false;
    }
}

impl<T, E> Drop for CleanupGuard<T, E>
where
    T: Send + Sync + 'static,
    E: Send + Sync + 'static,
{
    fn drop(&mut self) {
        if self.armed {
            self.group.inner.remove(&self.key);
        }
    }
}

/// Coalesces concurrent calls for the same key into a single producer
/// invocation; joiners `.await` the same shared outcome.
pub struct SingleFlightGroup<T, E>
where
    T: Send + Sync + 'static,
    E: Send + Sync + 'static,
{
    inner: Arc<DashMap<String, InFlightEntry<T, E>>>,
}

impl<T, E> Clone for SingleFlightGroup<T, E>
where
    T: Send + Sync + 'static,
    E: Send + Sync + 'static,
{
    fn clone(&self) -> Self {
        Self { inner: self.inner.clone() }
    }
}

impl<T, E> Default for SingleFlightGroup<T, E>
where
    T: Send + Sync + 'static,
    E: Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<T, E> SingleFlightGroup<T, E>
where
    T: Clone + Send + Sync + 'static,
    E: Clone + Send + Sync + 'static,
{
    pub fn new() -> Self {
        Self { inner: Arc::new(DashMap::new()) }
    }

    /// Returns the shared outcome already in flight for `key`, if any,
    /// incrementing the waiting-joiner count.
    pub fn join_inflight(&self, key: &str) -> Option<(SharedOutcome<T, E>, usize)> {
        let entry = self.inner.get(key)?;
        let waiting = entry.waiting_count.fetch_add(1, Ordering::SeqCst) + 1;
        Some((entry.outcome.clone(), waiting))
    }

    pub fn has_inflight(&self, key: &str) -> bool {
        self.inner.contains_key(key)
    }

    pub fn clear(&self) {
        self.inner.clear();
    }

    /// Register `fut` as the in-flight outcome for `key`, returning the
    /// shared outcome to `.await` and a [`CleanupGuard`] that removes the
    /// entry once dropped.
    pub fn track_inflight(
        &self,
        key: String,
        fut: BoxFuture<'static, Result<T, FlowError<E>>>,
    ) -> (SharedOutcome<T, E>, CleanupGuard<T, E>) {
        use futures::FutureExt;
        let shared = fut.shared();
        self.inner.insert(
            key.clone(),
            InFlightEntry { outcome: shared.clone(), waiting_count: Arc::new(AtomicUsize::new(1)) },
        );
        let guard = CleanupGuard { group: self.clone(), key, armed: true };
        (shared, guard)
    }
}
