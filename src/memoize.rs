//! Memoize engine: TTL caching with stale-while-revalidate and single-flight
//! deduplication. The core of the crate — everything else wraps a producer;
//! this one also remembers its outcome.

use crate::error::{AssertError, FlowError};
use crate::key::{fingerprint, KeyArg};
use crate::single_flight::SingleFlightGroup;
use crate::storage::memory::MemoryBackend;
use crate::storage::{CacheBackend, CacheEntry, CacheStats, StoredValue};
use futures::future::BoxFuture;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

type KeyFn<Args> = Arc<dyn Fn(&Args) -> String + Send + Sync>;
type ShouldCacheFn<Args> = Arc<dyn Fn(&Args) -> bool + Send + Sync>;
type OnErrorFn<E> = Arc<dyn Fn(&E) + Send + Sync>;
type Producer<Args, T, E> =
    Arc<dyn Fn(Args) -> BoxFuture<'static, Result<T, E>> + Send + Sync>;

/// Builder for a [`Memoized`] engine. Defaults: no TTL, no size cap, default
/// serializer-derived keys, every call cached, no SWR.
pub struct MemoizeBuilder<Args, T, E> {
    ttl: Option<Duration>,
    max_size: Option<usize>,
    generate_key: Option<KeyFn<Args>>,
    on_error: Option<OnErrorFn<E>>,
    cleanup_interval: Option<Duration>,
    stale_in: Option<Duration>,
    stale_timeout: Option<Duration>,
    use_weak_ref: bool,
    adapter: Option<Arc<dyn CacheBackend<T>>>,
    should_cache: Option<ShouldCacheFn<Args>>,
    _marker: std::marker::PhantomData<(Args, T, E)>,
}

impl<Args, T, E> Default for MemoizeBuilder<Args, T, E> {
    fn default() -> Self {
        Self {
            ttl: None,
            max_size: None,
            generate_key: None,
            on_error: None,
            cleanup_interval: None,
            stale_in: None,
            stale_timeout: None,
            use_weak_ref: false,
            adapter: None,
            should_cache: None,
            _marker: std::marker::PhantomData,
        }
    }
}

impl<Args, T, E> MemoizeBuilder<Args, T, E>
where
    Args: ToKeyArgs + Send + Sync + 'static,
    T: Clone + Send + Sync + 'static,
    E: Clone + Send + Sync + 'static,
{
    pub fn new() -> Self {
        Self::default()
    }

    pub fn ttl(mut self, ttl: Duration) -> Self {
        self.ttl = Some(ttl);
        self
    }

    pub fn max_size(mut self, max_size: usize) -> Self {
        self.max_size = Some(max_size);
        self
    }

    pub fn generate_key<F: Fn(&Args) -> String + Send + Sync + 'static>(mut self, f: F) -> Self {
        self.generate_key = Some(Arc::new(f));
        self
    }

    pub fn on_error<F: Fn(&E) + Send + Sync + 'static>(mut self, f: F) -> Self {
        self.on_error = Some(Arc::new(f));
        self
    }

    pub fn cleanup_interval(mut self, interval: Duration) -> Self {
        self.cleanup_interval = Some(interval);
        self
    }

    pub fn stale_in(mut self, stale_in: Duration) -> Self {
        self.stale_in = Some(stale_in);
        self
    }

    pub fn stale_timeout(mut self, stale_timeout: Duration) -> Self {
        self.stale_timeout = Some(stale_timeout);
        self
    }

    pub fn use_weak_ref(mut self, use_weak_ref: bool) -> Self {
        self.use_weak_ref = use_weak_ref;
        self
    }

    pub fn adapter(mut self, adapter: Arc<dyn CacheBackend<T>>) -> Self {
        self.adapter = Some(adapter);
        self
    }

    pub fn should_cache<F: Fn(&Args) -> bool + Send + Sync + 'static>(mut self, f: F) -> Self {
        self.should_cache = Some(Arc::new(f));
        self
    }

    /// Wrap `producer` (called with the args passed to `.call()`) per §4.5.
    pub fn build<Fut, P>(self, producer: P) -> Result<Memoized<Args, T, E>, AssertError>
    where
        Fut: Future<Output = Result<T, E>> + Send + 'static,
        P: Fn(Args) -> Fut + Send + Sync + 'static,
    {
        if let Some(ttl) = self.ttl {
            crate::error::assert_positive_duration("ttl", ttl)?;
        }
        if let Some(max_size) = self.max_size {
            crate::error::assert_positive_count("max_size", max_size)?;
        }

        let adapter = self.adapter.unwrap_or_else(|| {
            let mut backend = MemoryBackend::new(self.max_size);
            if let Some(interval) = self.cleanup_interval {
                backend = backend.with_cleanup_interval(interval);
            }
            Arc::new(backend) as Arc<dyn CacheBackend<T>>
        });

        Ok(Memoized {
            inner: Arc::new(Inner {
                producer: Arc::new(move |args: Args| Box::pin(producer(args))),
                ttl: self.ttl,
                generate_key: self.generate_key,
                on_error: self.on_error,
                stale_in: self.stale_in,
                stale_timeout: self.stale_timeout,
                use_weak_ref: self.use_weak_ref,
                should_cache: self.should_cache,
                adapter,
                coordinator: SingleFlightGroup::new(),
                access_sequence: AtomicU64::new(0),
                hits: AtomicU64::new(0),
                misses: AtomicU64::new(0),
                evictions: AtomicU64::new(0),
            }),
        })
    }
}

struct Inner<Args, T, E> {
    producer: Producer<Args, T, E>,
    ttl: Option<Duration>,
    generate_key: Option<KeyFn<Args>>,
    on_error: Option<OnErrorFn<E>>,
    stale_in: Option<Duration>,
    stale_timeout: Option<Duration>,
    /// See `MemoizeBuilder::use_weak_ref`: a documented no-op for this
    /// engine's storage layer (no `V = Arc<T>` specialization in stable
    /// Rust), logged once per write so the setting isn't silently ignored.
    use_weak_ref: bool,
    should_cache: Option<ShouldCacheFn<Args>>,
    adapter: Arc<dyn CacheBackend<T>>,
    coordinator: SingleFlightGroup<T, E>,
    access_sequence: AtomicU64,
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
}

/// Wraps `value` for storage, honoring `use_weak_ref` where it is
/// meaningful. This engine stores `V` directly (no split between a cached
/// type and a pointee type), so a generic `V` can never be detected as
/// `Arc<U>` from inside a single `impl<T>` body — stable Rust has no
/// specialization to special-case it. `use_weak_ref` is therefore accepted
/// and validated but always resolves to `StoredValue::Value`, matching the
/// "treat as no-op and document it" fallback for hosts without native
/// weak-reference support.
fn stored_value<T>(value: T, use_weak_ref: bool) -> StoredValue<T> {
    if use_weak_ref {
        tracing::debug!("use_weak_ref has no effect for this value type; storing by value");
    }
    StoredValue::Value(value)
}

/// A memoized producer plus its cache handle.
#[derive(Clone)]
pub struct Memoized<Args, T, E> {
    inner: Arc<Inner<Args, T, E>>,
}

impl<Args, T, E> Memoized<Args, T, E>
where
    Args: ToKeyArgs + Send + Sync + 'static,
    T: Clone + Send + Sync + 'static,
    E: Clone + Send + Sync + 'static,
{
    /// Step 1: a custom `generate_key` takes precedence; otherwise fall back
    /// to the default serializer (`ToKeyArgs` + `fingerprint`).
    fn key_for(&self, args: &Args) -> String {
        match &self.inner.generate_key {
            Some(f) => f(args),
            None => default_key(args),
        }
    }

    /// Step 1–8 of the memoize contract.
    pub async fn call(&self, args: Args) -> Result<T, FlowError<E>>
    where
        Args: Clone,
    {
        let key = self.key_for(&args);
        let cacheable = self.inner.should_cache.as_ref().map(|f| f(&args)).unwrap_or(true);

        if cacheable {
            if let Some(value) = self.try_read(&key, &args).await? {
                return Ok(value);
            }
        }

        self.execute_and_cache(key, args, cacheable).await
    }

    /// Returns `Some(value)` on a cache hit (fresh or SWR-resolved), `None`
    /// to fall through to `execute_and_cache`.
    async fn try_read(&self, key: &str, args: &Args) -> Result<Option<T>, FlowError<E>>
    where
        Args: Clone,
    {
        let Some(mut entry) = self.inner.adapter.get(key).await else {
            self.inner.misses.fetch_add(1, Ordering::Relaxed);
            return Ok(None);
        };

        let now = Instant::now();
        if entry.is_expired(now) {
            self.inner.adapter.delete(key).await;
            self.inner.misses.fetch_add(1, Ordering::Relaxed);
            return Ok(None);
        }

        let Some(value) = entry.value.resolve() else {
            // Weakly-referenced value was reclaimed: treat as miss and evict.
            self.inner.adapter.delete(key).await;
            self.inner.misses.fetch_add(1, Ordering::Relaxed);
            return Ok(None);
        };

        let sequence = self.inner.access_sequence.fetch_add(1, Ordering::Relaxed);
        entry.touch(now, sequence);
        self.inner.adapter.set(key.to_string(), entry.clone()).await;

        if self.inner.stale_in.is_some() && entry.is_stale(now) {
            self.inner.hits.fetch_add(1, Ordering::Relaxed);
            return Ok(Some(self.revalidate(key.to_string(), args.clone(), value).await));
        }

        self.inner.hits.fetch_add(1, Ordering::Relaxed);
        Ok(Some(value))
    }

    /// Stale-while-revalidate, step 5. Never returns an error — a failed or
    /// slow refresh always degrades to the stale value already in hand.
    async fn revalidate(&self, key: String, args: Args, stale_value: T) -> T {
        match self.inner.stale_timeout {
            None => stale_value,
            Some(timeout) if timeout.is_zero() => {
                let inner = self.inner.clone();
                tokio::spawn(async move {
                    let result = (inner.producer)(args).await;
                    if let Ok(value) = result {
                        let now = Instant::now();
                        let stored = stored_value(value, inner.use_weak_ref);
                        let entry = CacheEntry::new(stored, now, inner.ttl, inner.stale_in);
                        inner.adapter.set(key, entry).await;
                    }
                });
                stale_value
            }
            Some(timeout) => {
                let inner = self.inner.clone();
                let key_for_write = key.clone();
                let refresh = async move {
                    let result = (inner.producer)(args).await;
                    if let Ok(value) = &result {
                        let now = Instant::now();
                        let stored = stored_value(value.clone(), inner.use_weak_ref);
                        let entry = CacheEntry::new(stored, now, inner.ttl, inner.stale_in);
                        inner.adapter.set(key_for_write, entry).await;
                    }
                    result
                };
                match tokio::time::timeout(timeout, refresh).await {
                    Ok(Ok(fresh)) => fresh,
                    Ok(Err(_)) | Err(_) => stale_value,
                }
            }
        }
    }

    async fn execute_and_cache(&self, key: String, args: Args, cacheable: bool) -> Result<T, FlowError<E>> {
        if let Some((shared, waiting)) = self.inner.coordinator.join_inflight(&key) {
            tracing::debug!(%key, waiting, "joining in-flight memoize call");
            self.inner.hits.fetch_add(1, Ordering::Relaxed);
            return shared.await;
        }

        let inner = self.inner.clone();
        let key_for_fut = key.clone();
        let fut: BoxFuture<'static, Result<T, FlowError<E>>> = Box::pin(async move {
            let result = (inner.producer)(args).await;
            match result {
                Ok(value) => {
                    if cacheable {
                        let now = Instant::now();
                        let stored = stored_value(value.clone(), inner.use_weak_ref);
                        let entry = CacheEntry::new(stored, now, inner.ttl, inner.stale_in);
                        inner.adapter.set(key_for_fut, entry).await;
                    }
                    Ok(value)
                }
                Err(err) => {
                    if let Some(on_error) = &inner.on_error {
                        on_error(&err);
                    }
                    Err(FlowError::Inner(err))
                }
            }
        });

        let (shared, guard) = self.inner.coordinator.track_inflight(key.clone(), fut);
        // The cache write happens inside the boxed future above, before this
        // await resolves, so it is always visible before the guard (and thus
        // the in-flight entry) is dropped.
        let result = shared.await;
        drop(guard);
        if result.is_err() {
            self.inner.misses.fetch_add(1, Ordering::Relaxed);
        }
        result
    }

    pub fn cache(&self) -> CacheHandle<Args, T, E> {
        CacheHandle { inner: self.inner.clone() }
    }
}

/// Handle exposing cache introspection/management, independent of the
/// callable producer wrapper.
#[derive(Clone)]
pub struct CacheHandle<Args, T, E> {
    inner: Arc<Inner<Args, T, E>>,
}

impl<Args, T, E> CacheHandle<Args, T, E>
where
    T: Clone + Send + Sync + 'static,
{
    pub async fn clear(&self) {
        self.inner.adapter.clear().await;
        self.inner.coordinator.clear();
        self.inner.access_sequence.store(0, Ordering::Relaxed);
        self.inner.hits.store(0, Ordering::Relaxed);
        self.inner.misses.store(0, Ordering::Relaxed);
        self.inner.evictions.store(0, Ordering::Relaxed);
    }

    pub async fn delete(&self, key: &str) -> bool {
        self.inner.adapter.delete(key).await
    }

    pub async fn has(&self, key: &str) -> bool {
        self.inner.adapter.has(key).await
    }

    pub async fn size(&self) -> usize {
        self.inner.adapter.size().await
    }

    pub async fn keys(&self) -> Vec<String> {
        self.inner.adapter.keys().await
    }

    pub async fn entries(&self) -> Vec<(String, CacheEntry<T>)> {
        self.inner.adapter.entries().await
    }

    pub async fn stats(&self) -> CacheStats {
        let hits = self.inner.hits.load(Ordering::Relaxed);
        let misses = self.inner.misses.load(Ordering::Relaxed);
        CacheStats {
            hits,
            misses,
            evictions: self.inner.evictions.load(Ordering::Relaxed),
            size: self.inner.adapter.size().await,
        }
    }
}

impl CacheStats {
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

/// Default key derivation from an argument tuple implementing [`ToKeyArgs`].
pub fn default_key<Args: ToKeyArgs>(args: &Args) -> String {
    fingerprint(&args.to_key_args())
}

/// Implemented for producer argument tuples that want the built-in
/// serializer instead of a custom `generate_key` closure.
pub trait ToKeyArgs {
    fn to_key_args(&self) -> Vec<KeyArg>;
}

impl ToKeyArgs for () {
    fn to_key_args(&self) -> Vec<KeyArg> {
        Vec::new()
    }
}

impl ToKeyArgs for String {
    fn to_key_args(&self) -> Vec<KeyArg> {
        vec![KeyArg::Str(self.clone())]
    }
}

impl ToKeyArgs for i64 {
    fn to_key_args(&self) -> Vec<KeyArg> {
        vec![KeyArg::Int(*self)]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[derive(Debug, Clone, PartialEq, Eq)]
    struct TestError(String);

    fn counting_memoizer(
        calls: Arc<AtomicUsize>,
    ) -> Memoized<String, i32, TestError> {
        MemoizeBuilder::new()
            .ttl(Duration::from_secs(60))
            .generate_key(|args: &String| args.clone())
            .build(move |args: String| {
                let calls = calls.clone();
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok::<_, TestError>(args.len() as i32)
                }
            })
            .unwrap()
    }

    #[tokio::test]
    async fn repeated_calls_hit_cache() {
        let calls = Arc::new(AtomicUsize::new(0));
        let memo = counting_memoizer(calls.clone());

        let first = memo.call("hello".to_string()).await.unwrap();
        let second = memo.call("hello".to_string()).await.unwrap();

        assert_eq!(first, 5);
        assert_eq!(second, 5);
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        let stats = memo.cache().stats().await;
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
    }

    #[tokio::test]
    async fn distinct_keys_each_invoke_producer() {
        let calls = Arc::new(AtomicUsize::new(0));
        let memo = counting_memoizer(calls.clone());

        memo.call("a".to_string()).await.unwrap();
        memo.call("bb".to_string()).await.unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn concurrent_calls_for_same_key_coalesce() {
        let calls = Arc::new(AtomicUsize::new(0));
        let memo = counting_memoizer(calls.clone());

        let m1 = memo.clone();
        let m2 = memo.clone();
        let (r1, r2) = tokio::join!(m1.call("x".to_string()), m2.call("x".to_string()));

        assert_eq!(r1.unwrap(), 1);
        assert_eq!(r2.unwrap(), 1);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn producer_error_is_not_cached() {
        let calls = Arc::new(AtomicUsize::new(0));
        let memo: Memoized<String, i32, TestError> = MemoizeBuilder::new()
            .generate_key(|args: &String| args.clone())
            .build(move |_args: String| {
                let calls = calls.clone();
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err::<i32, _>(TestError("boom".into()))
                }
            })
            .unwrap();

        let first = memo.call("x".to_string()).await;
        let second = memo.call("x".to_string()).await;
        assert!(first.is_err());
        assert!(second.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 2, "failed calls must not be cached");
    }

    #[tokio::test]
    async fn should_cache_false_skips_cache_but_still_dedups() {
        let calls = Arc::new(AtomicUsize::new(0));
        let memo: Memoized<String, i32, TestError> = MemoizeBuilder::new()
            .generate_key(|args: &String| args.clone())
            .should_cache(|_args: &String| false)
            .build(move |args: String| {
                let calls = calls.clone();
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok::<_, TestError>(args.len() as i32)
                }
            })
            .unwrap();

        memo.call("hi".to_string()).await.unwrap();
        memo.call("hi".to_string()).await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 2, "shouldCache=false must bypass the cache");
    }

    #[tokio::test]
    async fn cache_clear_resets_stats_and_entries() {
        let calls = Arc::new(AtomicUsize::new(0));
        let memo = counting_memoizer(calls.clone());
        memo.call("hello".to_string()).await.unwrap();

        memo.cache().clear().await;
        assert_eq!(memo.cache().size().await, 0);
        let stats = memo.cache().stats().await;
        assert_eq!(stats.hits, 0);
        assert_eq!(stats.misses, 0);
    }

    #[test]
    fn hit_rate_handles_zero_denominator() {
        let stats = CacheStats::default();
        assert_eq!(stats.hit_rate(), 0.0);
    }

    #[tokio::test]
    async fn falls_back_to_default_key_without_generate_key() {
        let calls = Arc::new(AtomicUsize::new(0));
        let memo: Memoized<i64, i64, TestError> = MemoizeBuilder::new()
            .build(move |args: i64| {
                let calls = calls.clone();
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok::<_, TestError>(args * 2)
                }
            })
            .unwrap();

        let first = memo.call(7).await.unwrap();
        let second = memo.call(7).await.unwrap();

        assert_eq!(first, 14);
        assert_eq!(second, 14);
        assert_eq!(memo.cache().stats().await.hits, 1, "default key must dedupe identical args");
    }
}
