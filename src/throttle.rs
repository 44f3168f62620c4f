//! Throttle: leading-edge rate limiting. The first call within a window runs
//! the producer; later calls within the same window replay its last result.

use crate::clock::{Clock, MonotonicClock};
use crate::error::{AssertError, FlowError};
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;

pub trait ThrottleHooks<T, E>: Send + Sync {
    fn on_throttle(&self, _last_result: &Result<T, E>) {}
}

struct NoopHooks;
impl<T, E> ThrottleHooks<T, E> for NoopHooks {}

struct State<T, E> {
    last_called_at: Option<u64>,
    last_result: Option<Result<T, E>>,
}

#[derive(Clone)]
pub struct Throttle<T, E> {
    delay: Duration,
    throws: bool,
    clock: Arc<dyn Clock>,
    state: Arc<Mutex<State<T, E>>>,
    hooks: Arc<dyn ThrottleHooks<T, E>>,
}

impl<T, E> Throttle<T, E>
where
    T: Clone + Send + Sync + 'static,
    E: Clone + Send + Sync + 'static,
{
    pub fn new(delay: Duration, throws: bool) -> Result<Self, AssertError> {
        crate::error::assert_positive_duration("delay", delay)?;
        Ok(Self {
            delay,
            throws,
            clock: Arc::new(MonotonicClock::default()),
            state: Arc::new(Mutex::new(State { last_called_at: None, last_result: None })),
            hooks: Arc::new(NoopHooks),
        })
    }

    pub fn with_clock<C: Clock + 'static>(mut self, clock: C) -> Self {
        self.clock = Arc::new(clock);
        self
    }

    pub fn with_hooks<H: ThrottleHooks<T, E> + 'static>(mut self, hooks: H) -> Self {
        self.hooks = Arc::new(hooks);
        self
    }

    /// Drop any remembered call, so the next invocation always runs the
    /// producer regardless of the window.
    pub fn cancel(&self) {
        let mut state = self.state.lock().unwrap_or_else(|p| p.into_inner());
        state.last_called_at = None;
        state.last_result = None;
    }

    pub async fn call<Fut, Op>(&self, operation: Op) -> Result<T, FlowError<E>>
    where
        Fut: Future<Output = Result<T, E>> + Send,
        Op: FnOnce() -> Fut + Send,
    {
        let now = self.clock.now_millis();
        let should_call = {
            let state = self.state.lock().unwrap_or_else(|p| p.into_inner());
            match state.last_called_at {
                None => true,
                Some(last) => now.saturating_sub(last) >= self.delay.as_millis() as u64,
            }
        };

        if should_call {
            let result = operation().await;
            let mut state = self.state.lock().unwrap_or_else(|p| p.into_inner());
            state.last_called_at = Some(now);
            state.last_result = Some(result.clone());
            return result.map_err(FlowError::Inner);
        }

        let state = self.state.lock().unwrap_or_else(|p| p.into_inner());
        let last = state.last_result.clone();
        drop(state);

        match last {
            Some(result) => {
                self.hooks.on_throttle(&result);
                if self.throws {
                    Err(FlowError::Throttled)
                } else {
                    result.map_err(FlowError::Inner)
                }
            }
            None => Err(FlowError::Throttled),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

    #[derive(Debug, Clone, PartialEq, Eq)]
    struct TestError(String);

    #[derive(Debug, Clone)]
    struct ManualClock {
        now: Arc<AtomicU64>,
    }
    impl ManualClock {
        fn new() -> Self {
            Self { now: Arc::new(AtomicU64::new(0)) }
        }
        fn advance(&self, ms: u64) {
            self.now.fetch_add(ms, Ordering::SeqCst);
        }
    }
    impl Clock for ManualClock {
        fn now_millis(&self) -> u64 {
            self.now.load(Ordering::SeqCst)
        }
    }

    #[tokio::test]
    async fn first_call_runs_producer() {
        let throttle: Throttle<i32, TestError> = Throttle::new(Duration::from_millis(100), true).unwrap();
        let calls = Arc::new(AtomicUsize::new(0));
        let calls_clone = calls.clone();

        let result = throttle
            .call(|| {
                let calls = calls_clone.clone();
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok::<_, TestError>(1)
                }
            })
            .await;

        assert_eq!(result.unwrap(), 1);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn subsequent_calls_within_window_are_throttled() {
        let clock = ManualClock::new();
        let throttle: Throttle<i32, TestError> =
            Throttle::new(Duration::from_millis(100), true).unwrap().with_clock(clock.clone());
        let calls = Arc::new(AtomicUsize::new(0));

        for _ in 0..3 {
            let calls_clone = calls.clone();
            let _ = throttle
                .call(|| {
                    let calls = calls_clone.clone();
                    async move {
                        calls.fetch_add(1, Ordering::SeqCst);
                        Ok::<_, TestError>(calls.load(Ordering::SeqCst) as i32)
                    }
                })
                .await;
        }

        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn non_throwing_throttle_replays_last_result() {
        let clock = ManualClock::new();
        let throttle: Throttle<i32, TestError> =
            Throttle::new(Duration::from_millis(100), false).unwrap().with_clock(clock.clone());

        let first = throttle.call(|| async { Ok::<_, TestError>(7) }).await;
        assert_eq!(first.unwrap(), 7);

        let second = throttle.call(|| async { Ok::<_, TestError>(99) }).await;
        assert_eq!(second.unwrap(), 7, "should replay the first call's result");
    }

    #[tokio::test]
    async fn call_runs_again_after_window_elapses() {
        let clock = ManualClock::new();
        let throttle: Throttle<i32, TestError> =
            Throttle::new(Duration::from_millis(100), true).unwrap().with_clock(clock.clone());
        let calls = Arc::new(AtomicUsize::new(0));

        let calls_clone = calls.clone();
        let _ = throttle.call(|| { let calls = calls_clone.clone(); async move { calls.fetch_add(1, Ordering::SeqCst); Ok::<_, TestError>(1) } }).await;

        clock.advance(150);

        let calls_clone = calls.clone();
        let _ = throttle.call(|| { let calls = calls_clone.clone(); async move { calls.fetch_add(1, Ordering::SeqCst); Ok::<_, TestError>(2) } }).await;

        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn cancel_forces_next_call_through() {
        let clock = ManualClock::new();
        let throttle: Throttle<i32, TestError> =
            Throttle::new(Duration::from_millis(1000), true).unwrap().with_clock(clock.clone());
        let _ = throttle.call(|| async { Ok::<_, TestError>(1) }).await;

        throttle.cancel();

        let calls = Arc::new(AtomicUsize::new(0));
        let calls_clone = calls.clone();
        let _ = throttle
            .call(|| {
                let calls = calls_clone.clone();
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok::<_, TestError>(2)
                }
            })
            .await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn rejects_zero_delay() {
        let err = Throttle::<i32, TestError>::new(Duration::ZERO, true).unwrap_err();
        assert_eq!(err, AssertError::ZeroDuration("delay"));
    }
}
