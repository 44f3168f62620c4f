//! Wrap registry and composer: layers policies around a producer in
//! declared order, rejecting a second application of the same policy kind
//! to the same registered producer.

use crate::circuit_breaker::CircuitBreakerPolicy;
use crate::error::{AssertError, FlowError};
use crate::rate_limit::RateLimiter;
use crate::retry::RetryPolicy;
use crate::single_flight::SingleFlightGroup;
use crate::timeout::TimeoutPolicy;
use futures::future::BoxFuture;
use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::{Arc, Mutex};

/// Policy kinds the composer can layer. `Inflight` is single-flight-only
/// deduplication with no TTL cache, per §4.13.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PolicyKind {
    RateLimit,
    CircuitBreaker,
    Retry,
    WithTimeout,
    Inflight,
}

impl std::fmt::Display for PolicyKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", kind_name(*self))
    }
}

/// Process-wide record of which policy kinds have been applied to each
/// producer identity. Rust closures have no stable identity the way JS
/// function objects do, so callers tag a producer with an explicit id at
/// wrap time rather than one being inferred from the closure value.
#[derive(Default)]
pub struct WrapRegistry {
    applied: Mutex<HashMap<String, HashSet<PolicyKind>>>,
}

impl WrapRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record `kind` as applied to `producer_id`. Returns
    /// `AssertError::AlreadyWrapped` if that kind was already applied.
    pub fn register(&self, producer_id: &str, kind: PolicyKind) -> Result<(), AssertError> {
        let mut applied = self.applied.lock().unwrap_or_else(|p| p.into_inner());
        let kinds = applied.entry(producer_id.to_string()).or_default();
        if !kinds.insert(kind) {
            return Err(AssertError::AlreadyWrapped {
                producer: producer_id.to_string(),
                kind: kind_name(kind),
            });
        }
        Ok(())
    }

    pub fn applied_kinds(&self, producer_id: &str) -> HashSet<PolicyKind> {
        self.applied.lock().unwrap_or_else(|p| p.into_inner()).get(producer_id).cloned().unwrap_or_default()
    }

    pub fn forget(&self, producer_id: &str) {
        self.applied.lock().unwrap_or_else(|p| p.into_inner()).remove(producer_id);
    }
}

fn kind_name(kind: PolicyKind) -> &'static str {
    match kind {
        PolicyKind::RateLimit => "rate_limit",
        PolicyKind::CircuitBreaker => "circuit_breaker",
        PolicyKind::Retry => "retry",
        PolicyKind::WithTimeout => "with_timeout",
        PolicyKind::Inflight => "inflight",
    }
}

type BoxedProducer<T, E> = Arc<dyn Fn() -> BoxFuture<'static, Result<T, FlowError<E>>> + Send + Sync>;

/// Layers policies around a producer in declared order, rejecting a second
/// application of the same policy kind to the same registered producer.
/// Layering is inside-out: the first `wrap_*` call wraps the producer
/// directly, each subsequent call wraps the previous layer.
pub struct Composer<'a, T, E> {
    registry: &'a WrapRegistry,
    producer_id: String,
    order: Vec<PolicyKind>,
    producer: BoxedProducer<T, E>,
}

impl<'a, T, E> Composer<'a, T, E>
where
    T: Send + 'static,
    E: Send + 'static,
{
    pub fn new<Fut, P>(registry: &'a WrapRegistry, producer_id: impl Into<String>, producer: P) -> Self
    where
        Fut: Future<Output = Result<T, E>> + Send + 'static,
        P: Fn() -> Fut + Send + Sync + 'static,
    {
        Self {
            registry,
            producer_id: producer_id.into(),
            order: Vec::new(),
            producer: Arc::new(move || {
                let fut = producer();
                Box::pin(async move { fut.await.map_err(FlowError::Inner) })
                    as BoxFuture<'static, Result<T, FlowError<E>>>
            }),
        }
    }

    /// Layer a rate limiter around the current producer.
    pub fn wrap_rate_limit(mut self, limiter: RateLimiter) -> Result<Self, AssertError> {
        self.registry.register(&self.producer_id, PolicyKind::RateLimit)?;
        self.order.push(PolicyKind::RateLimit);
        let inner = self.producer.clone();
        self.producer = Arc::new(move || {
            let inner = inner.clone();
            let limiter = limiter.clone();
            Box::pin(async move { limiter.execute(move || inner()).await })
        });
        Ok(self)
    }

    /// Layer a circuit breaker around the current producer.
    pub fn wrap_circuit_breaker(mut self, breaker: CircuitBreakerPolicy<E>) -> Result<Self, AssertError> {
        self.registry.register(&self.producer_id, PolicyKind::CircuitBreaker)?;
        self.order.push(PolicyKind::CircuitBreaker);
        let inner = self.producer.clone();
        self.producer = Arc::new(move || {
            let inner = inner.clone();
            let breaker = breaker.clone();
            Box::pin(async move { breaker.execute(move || inner()).await })
        });
        Ok(self)
    }

    /// Layer a deadline around the current producer.
    pub fn wrap_timeout(mut self, timeout: TimeoutPolicy<E>) -> Result<Self, AssertError> {
        self.registry.register(&self.producer_id, PolicyKind::WithTimeout)?;
        self.order.push(PolicyKind::WithTimeout);
        let inner = self.producer.clone();
        self.producer = Arc::new(move || {
            let inner = inner.clone();
            let timeout = timeout.clone();
            Box::pin(async move { timeout.execute(move || inner()).await })
        });
        Ok(self)
    }

    /// The declared layering order (first = innermost).
    pub fn order(&self) -> &[PolicyKind] {
        &self.order
    }

    pub fn producer_id(&self) -> &str {
        &self.producer_id
    }

    /// Run the fully composed producer.
    pub async fn execute(&self) -> Result<T, FlowError<E>> {
        (self.producer)().await
    }
}

impl<'a, T, E> Composer<'a, T, E>
where
    T: Send + 'static,
    E: std::error::Error + Send + Sync + 'static,
{
    /// Layer retry-with-backoff around the current producer. Needs `E:
    /// Error` because [`RetryPolicy`] does.
    pub fn wrap_retry(mut self, retry: RetryPolicy<E>) -> Result<Self, AssertError> {
        self.registry.register(&self.producer_id, PolicyKind::Retry)?;
        self.order.push(PolicyKind::Retry);
        let inner = self.producer.clone();
        self.producer = Arc::new(move || {
            let inner = inner.clone();
            let retry = retry.clone();
            Box::pin(async move { retry.execute(move || inner()).await })
        });
        Ok(self)
    }
}

impl<'a, T, E> Composer<'a, T, E>
where
    T: Clone + Send + Sync + 'static,
    E: Clone + Send + Sync + 'static,
{
    /// Layer single-flight coalescing around the current producer: callers
    /// racing the composed producer under `key` share one invocation.
    pub fn wrap_inflight(mut self, group: SingleFlightGroup<T, E>, key: impl Into<String>) -> Result<Self, AssertError> {
        self.registry.register(&self.producer_id, PolicyKind::Inflight)?;
        self.order.push(PolicyKind::Inflight);
        let inner = self.producer.clone();
        let key = key.into();
        self.producer = Arc::new(move || {
            let inner = inner.clone();
            let group = group.clone();
            let key = key.clone();
            Box::pin(async move {
                if let Some((shared, _waiting)) = group.join_inflight(&key) {
                    return shared.await;
                }
                let fut = inner();
                let (shared, guard) = group.track_inflight(key.clone(), fut);
                let result = shared.await;
                drop(guard);
                result
            })
        });
        Ok(self)
    }
}
