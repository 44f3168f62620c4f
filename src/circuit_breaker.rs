//! Circuit breaker: lock-free atomic state machine (Closed → Open → HalfOpen).

use crate::clock::{Clock, MonotonicClock};
use crate::error::FlowError;
use std::future::Future;
use std::sync::atomic::{AtomicU64, AtomicU8, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

const STATE_CLOSED: u8 = 0;
const STATE_OPEN: u8 = 1;
const STATE_HALF_OPEN: u8 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

/// Hook hub for circuit-breaker state transitions. All hooks default to no-ops;
/// override the ones you care about. Hooks run synchronously and must not panic —
/// a panicking hook propagates the panic into the caller's call stack.
pub trait CircuitBreakerHooks<E>: Send + Sync {
    fn on_trip(&self, _failure_count: usize) {}
    fn on_reset(&self) {}
    fn on_half_open(&self) {}
    fn on_error(&self, _error: &E) {}
}

struct NoopHooks;
impl<E> CircuitBreakerHooks<E> for NoopHooks {}

#[derive(Clone)]
pub struct CircuitBreakerConfig {
    pub failure_threshold: usize,
    pub recovery_timeout: Duration,
    pub half_open_max_attempts: usize,
}

impl CircuitBreakerConfig {
    pub fn disabled() -> Self {
        Self {
            failure_threshold: usize::MAX,
            recovery_timeout: Duration::from_secs(0),
            half_open_max_attempts: usize::MAX,
        }
    }

    pub fn validate(&self) -> Result<(), crate::error::AssertError> {
        crate::error::assert_positive_count("failure_threshold", self.failure_threshold)?;
        crate::error::assert_positive_count(
            "half_open_max_attempts",
            self.half_open_max_attempts,
        )?;
        Ok(())
    }
}

struct CircuitBreakerState {
    state: AtomicU8,
    failure_count: AtomicUsize,
    opened_at_millis: AtomicU64,
    half_open_calls: AtomicUsize,
}

#[derive(Clone)]
pub struct CircuitBreakerPolicy<E = std::convert::Infallible> {
    state: Arc<CircuitBreakerState>,
    config: CircuitBreakerConfig,
    clock: Arc<dyn Clock>,
    hooks: Arc<dyn CircuitBreakerHooks<E>>,
    /// Failures for which this returns `false` propagate without tripping
    /// the breaker or counting toward `failure_threshold`.
    should_trip_on_error: Arc<dyn Fn(&E) -> bool + Send + Sync>,
}

impl<E> CircuitBreakerPolicy<E> {
    pub fn new(
        failure_threshold: usize,
        recovery_timeout: Duration,
    ) -> Result<Self, crate::error::AssertError> {
        Self::with_config(CircuitBreakerConfig {
            failure_threshold,
            recovery_timeout,
            half_open_max_attempts: 1,
        })
    }

    pub fn with_config(config: CircuitBreakerConfig) -> Result<Self, crate::error::AssertError> {
        config.validate()?;
        Ok(Self {
            state: Arc::new(CircuitBreakerState {
                state: AtomicU8::new(STATE_CLOSED),
                failure_count: AtomicUsize::new(0),
                opened_at_millis: AtomicU64::new(0),
                half_open_calls: AtomicUsize::new(0),
            }),
            config,
            clock: Arc::new(MonotonicClock::default()),
            hooks: Arc::new(NoopHooks),
            should_trip_on_error: Arc::new(|_| true),
        })
    }

    /// Override the clock (useful for deterministic tests).
    pub fn with_clock<C: Clock + 'static>(mut self, clock: C) -> Self {
        self.clock = Arc::new(clock);
        self
    }

    pub fn with_hooks<H: CircuitBreakerHooks<E> + 'static>(mut self, hooks: H) -> Self {
        self.hooks = Arc::new(hooks);
        self
    }

    /// Only failures for which `predicate` returns `true` trip the breaker
    /// or count toward `failure_threshold`. Failures it rejects still
    /// propagate to the caller but leave breaker state untouched.
    pub fn with_should_trip_on_error<F>(mut self, predicate: F) -> Self
    where
        F: Fn(&E) -> bool + Send + Sync + 'static,
    {
        self.should_trip_on_error = Arc::new(predicate);
        self
    }

    pub fn state(&self) -> CircuitState {
        match self.state.state.load(Ordering::Acquire) {
            STATE_CLOSED => CircuitState::Closed,
            STATE_OPEN => CircuitState::Open,
            STATE_HALF_OPEN => CircuitState::HalfOpen,
            _ => unreachable!("invalid circuit breaker state"),
        }
    }

    pub fn failure_count(&self) -> usize {
        self.state.failure_count.load(Ordering::Acquire)
    }

    pub async fn execute<T, Fut, Op>(&self, mut operation: Op) -> Result<T, FlowError<E>>
    where
        T: Send,
        Fut: Future<Output = Result<T, FlowError<E>>> + Send,
        Op: FnMut() -> Fut + Send,
    {
        loop {
            let current_state = self.state.state.load(Ordering::Acquire);

            match current_state {
                STATE_OPEN => {
                    let opened_at = self.state.opened_at_millis.load(Ordering::Acquire);
                    let now = self.now_millis();
                    let elapsed = now.saturating_sub(opened_at);

                    if elapsed >= self.config.recovery_timeout.as_millis() as u64 {
                        match self.state.state.compare_exchange(
                            STATE_OPEN,
                            STATE_HALF_OPEN,
                            Ordering::AcqRel,
                            Ordering::Acquire,
                        ) {
                            Ok(_) => {
                                tracing::info!("circuit breaker -> half-open");
                                self.state.half_open_calls.store(1, Ordering::Release);
                                self.hooks.on_half_open();
                                break;
                            }
                            Err(STATE_HALF_OPEN) => continue,
                            Err(STATE_CLOSED) => break,
                            Err(_) => unreachable!("invalid state transition"),
                        }
                    } else {
                        return Err(FlowError::CircuitOpen {
                            failure_count: self.state.failure_count.load(Ordering::Acquire),
                            open_duration: Duration::from_millis(elapsed),
                        });
                    }
                }
                STATE_HALF_OPEN => {
                    let current = self.state.half_open_calls.fetch_add(1, Ordering::AcqRel);
                    if current >= self.config.half_open_max_attempts {
                        self.state.half_open_calls.fetch_sub(1, Ordering::Release);
                        return Err(FlowError::CircuitOpen {
                            failure_count: self.state.failure_count.load(Ordering::Acquire),
                            open_duration: Duration::from_millis(0),
                        });
                    }
                    tracing::debug!(
                        in_flight = current + 1,
                        max = self.config.half_open_max_attempts,
                        "circuit breaker: half-open test request"
                    );
                    break;
                }
                STATE_CLOSED => break,
                _ => unreachable!("invalid circuit breaker state"),
            }
        }

        let was_half_open = self.state.state.load(Ordering::Acquire) == STATE_HALF_OPEN;
        let result = operation().await;

        if was_half_open {
            self.state.half_open_calls.fetch_sub(1, Ordering::Release);
        }

        match &result {
            Ok(_) => self.on_success(),
            Err(FlowError::Inner(e)) => {
                self.hooks.on_error(e);
                if (self.should_trip_on_error)(e) {
                    self.on_failure();
                }
            }
            Err(_) => self.on_failure(),
        }

        result
    }

    fn on_success(&self) {
        let current = self.state.state.load(Ordering::Acquire);

        match current {
            STATE_HALF_OPEN => {
                if self
                    .state
                    .state
                    .compare_exchange(STATE_HALF_OPEN, STATE_CLOSED, Ordering::AcqRel, Ordering::Acquire)
                    .is_ok()
                {
                    self.state.failure_count.store(0, Ordering::Release);
                    self.state.opened_at_millis.store(0, Ordering::Release);
                    tracing::info!("circuit breaker -> closed");
                    self.hooks.on_reset();
                }
            }
            STATE_CLOSED => {
                self.state.failure_count.store(0, Ordering::Release);
            }
            _ => {}
        }
    }

    fn on_failure(&self) {
        let current = self.state.state.load(Ordering::Acquire);
        let failures = self.state.failure_count.fetch_add(1, Ordering::AcqRel) + 1;

        match current {
            STATE_HALF_OPEN => {
                if self
                    .state
                    .state
                    .compare_exchange(STATE_HALF_OPEN, STATE_OPEN, Ordering::AcqRel, Ordering::Acquire)
                    .is_ok()
                {
                    self.state.opened_at_millis.store(self.now_millis(), Ordering::Release);
                    tracing::warn!(failures, "circuit breaker: test failed -> open");
                    self.hooks.on_trip(failures);
                }
            }
            STATE_CLOSED => {
                if failures >= self.config.failure_threshold {
                    if self
                        .state
                        .state
                        .compare_exchange(STATE_CLOSED, STATE_OPEN, Ordering::AcqRel, Ordering::Acquire)
                        .is_ok()
                    {
                        self.state.opened_at_millis.store(self.now_millis(), Ordering::Release);
                        tracing::error!(
                            failures,
                            threshold = self.config.failure_threshold,
                            "circuit breaker -> open"
                        );
                        self.hooks.on_trip(failures);
                    }
                }
            }
            _ => {}
        }
    }

    fn now_millis(&self) -> u64 {
        self.clock.now_millis()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
    use std::sync::Arc;

    #[derive(Debug, Clone, PartialEq, Eq)]
    struct TestError(String);

    impl std::fmt::Display for TestError {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            write!(f, "TestError: {}", self.0)
        }
    }

    impl std::error::Error for TestError {}

    #[derive(Debug, Clone)]
    struct ManualClock {
        now: Arc<AtomicU64>,
    }

    impl ManualClock {
        fn new() -> Self {
            Self { now: Arc::new(AtomicU64::new(0)) }
        }

        fn advance(&self, millis: u64) {
            self.now.fetch_add(millis, Ordering::SeqCst);
        }
    }

    impl Clock for ManualClock {
        fn now_millis(&self) -> u64 {
            self.now.load(Ordering::SeqCst)
        }
    }

    #[tokio::test]
    async fn starts_closed() {
        let breaker = CircuitBreakerPolicy::<TestError>::new(3, Duration::from_secs(1)).unwrap();
        let counter = Arc::new(AtomicUsize::new(0));
        let counter_clone = counter.clone();

        let result = breaker
            .execute(|| {
                let counter = counter_clone.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Ok::<_, FlowError<TestError>>(42)
                }
            })
            .await;

        assert_eq!(result.unwrap(), 42);
        assert_eq!(counter.load(Ordering::SeqCst), 1);
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn opens_after_threshold_failures() {
        let breaker = CircuitBreakerPolicy::<TestError>::new(3, Duration::from_secs(10)).unwrap();

        for _ in 0..3 {
            let _ = breaker
                .execute(|| async {
                    Err::<(), _>(FlowError::Inner(TestError("fail".to_string())))
                })
                .await;
        }

        assert_eq!(breaker.state(), CircuitState::Open);

        let result = breaker.execute(|| async { Ok::<_, FlowError<TestError>>(42) }).await;
        assert!(result.unwrap_err().is_circuit_open());
    }

    #[tokio::test]
    async fn half_open_test_success_closes_circuit() {
        let breaker = CircuitBreakerPolicy::<TestError>::new(1, Duration::from_millis(50)).unwrap();

        let _ = breaker
            .execute(|| async { Err::<(), _>(FlowError::Inner(TestError("fail".to_string()))) })
            .await;
        assert_eq!(breaker.state(), CircuitState::Open);

        tokio::time::sleep(Duration::from_millis(75)).await;

        let result = breaker.execute(|| async { Ok::<_, FlowError<TestError>>(42) }).await;
        assert_eq!(result.unwrap(), 42);
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn half_open_test_failure_reopens_circuit() {
        let breaker = CircuitBreakerPolicy::<TestError>::new(1, Duration::from_millis(50)).unwrap();

        let _ = breaker
            .execute(|| async { Err::<(), _>(FlowError::Inner(TestError("fail".to_string()))) })
            .await;
        tokio::time::sleep(Duration::from_millis(75)).await;

        let _ = breaker
            .execute(|| async {
                Err::<(), _>(FlowError::Inner(TestError("fail again".to_string())))
            })
            .await;

        assert_eq!(breaker.state(), CircuitState::Open);
    }

    #[tokio::test]
    async fn half_open_limits_concurrent_calls() {
        let breaker = CircuitBreakerPolicy::<TestError>::with_config(CircuitBreakerConfig {
            failure_threshold: 1,
            recovery_timeout: Duration::from_millis(50),
            half_open_max_attempts: 1,
        })
        .unwrap();

        let _ = breaker
            .execute(|| async { Err::<(), _>(FlowError::Inner(TestError("fail".to_string()))) })
            .await;
        tokio::time::sleep(Duration::from_millis(75)).await;

        let counter = Arc::new(AtomicUsize::new(0));
        let mut handles = vec![];
        for _ in 0..3 {
            let breaker_clone = breaker.clone();
            let counter_clone = counter.clone();
            handles.push(tokio::spawn(async move {
                breaker_clone
                    .execute(|| {
                        let counter = counter_clone.clone();
                        async move {
                            counter.fetch_add(1, Ordering::SeqCst);
                            tokio::time::sleep(Duration::from_millis(30)).await;
                            Ok::<_, FlowError<TestError>>(42)
                        }
                    })
                    .await
            }));
        }

        let results: Vec<_> = futures::future::join_all(handles).await;
        let successes = results.iter().filter(|r| r.as_ref().unwrap().is_ok()).count();
        let rejections = results
            .iter()
            .filter(|r| r.as_ref().unwrap().as_ref().err().map_or(false, |e| e.is_circuit_open()))
            .count();

        assert_eq!(successes, 1);
        assert_eq!(rejections, 2);
    }

    #[tokio::test]
    async fn disabled_breaker_never_opens() {
        let breaker =
            CircuitBreakerPolicy::<TestError>::with_config(CircuitBreakerConfig::disabled())
                .unwrap();

        for _ in 0..50 {
            let _ = breaker
                .execute(|| async { Err::<(), _>(FlowError::Inner(TestError("fail".to_string()))) })
                .await;
        }

        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn successes_reset_failure_count_in_closed_state() {
        let breaker = CircuitBreakerPolicy::<TestError>::new(3, Duration::from_secs(1)).unwrap();

        for _ in 0..2 {
            let _ = breaker
                .execute(|| async { Err::<(), _>(FlowError::Inner(TestError("fail".to_string()))) })
                .await;
        }
        let _ = breaker.execute(|| async { Ok::<_, FlowError<TestError>>(42) }).await;
        assert_eq!(breaker.failure_count(), 0);

        for _ in 0..2 {
            let result = breaker
                .execute(|| async { Err::<(), _>(FlowError::Inner(TestError("fail".to_string()))) })
                .await;
            assert!(matches!(result, Err(FlowError::Inner(_))));
        }
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn manual_clock_drives_recovery() {
        let clock = ManualClock::new();
        let breaker = CircuitBreakerPolicy::<TestError>::new(1, Duration::from_millis(100))
            .unwrap()
            .with_clock(clock.clone());

        let _ = breaker
            .execute(|| async { Err::<(), _>(FlowError::Inner(TestError("fail".to_string()))) })
            .await;

        let blocked = breaker.execute(|| async { Ok::<_, FlowError<TestError>>(()) }).await;
        assert!(blocked.unwrap_err().is_circuit_open());

        clock.advance(150);

        let success = breaker.execute(|| async { Ok::<_, FlowError<TestError>>(42) }).await;
        assert_eq!(success.unwrap(), 42);
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn hooks_fire_on_trip_and_reset() {
        struct Recording {
            trips: Arc<AtomicUsize>,
            resets: Arc<AtomicUsize>,
        }
        impl CircuitBreakerHooks<TestError> for Recording {
            fn on_trip(&self, _failure_count: usize) {
                self.trips.fetch_add(1, Ordering::SeqCst);
            }
            fn on_reset(&self) {
                self.resets.fetch_add(1, Ordering::SeqCst);
            }
        }

        let trips = Arc::new(AtomicUsize::new(0));
        let resets = Arc::new(AtomicUsize::new(0));
        let breaker = CircuitBreakerPolicy::<TestError>::new(1, Duration::from_millis(30))
            .unwrap()
            .with_hooks(Recording { trips: trips.clone(), resets: resets.clone() });

        let _ = breaker
            .execute(|| async { Err::<(), _>(FlowError::Inner(TestError("fail".to_string()))) })
            .await;
        assert_eq!(trips.load(Ordering::SeqCst), 1);

        tokio::time::sleep(Duration::from_millis(45)).await;
        let _ = breaker.execute(|| async { Ok::<_, FlowError<TestError>>(1) }).await;
        assert_eq!(resets.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn should_trip_on_error_false_skips_state_change() {
        let breaker = CircuitBreakerPolicy::<TestError>::new(1, Duration::from_secs(10))
            .unwrap()
            .with_should_trip_on_error(|e: &TestError| e.0 != "ignored");

        let result = breaker
            .execute(|| async { Err::<(), _>(FlowError::Inner(TestError("ignored".to_string()))) })
            .await;
        assert!(result.unwrap_err().is_inner());
        assert_eq!(breaker.state(), CircuitState::Closed);
        assert_eq!(breaker.failure_count(), 0);

        let result = breaker
            .execute(|| async { Err::<(), _>(FlowError::Inner(TestError("real".to_string()))) })
            .await;
        assert!(result.unwrap_err().is_inner());
        assert_eq!(breaker.state(), CircuitState::Open, "a counted failure still trips at threshold 1");
    }

    #[test]
    fn rejects_zero_failure_threshold() {
        let err = CircuitBreakerPolicy::<TestError>::new(0, Duration::from_secs(1)).unwrap_err();
        assert_eq!(err, crate::error::AssertError::ZeroCount("failure_threshold"));
    }
}
