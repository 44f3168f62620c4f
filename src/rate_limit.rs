//! Rate limiter: wraps a producer behind a [`TokenBucket`].

use crate::cancel::CancelSignal;
use crate::error::{AssertError, FlowError};
use crate::token_bucket::TokenBucket;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

/// Hook hub for rate-limiter rejections.
pub trait RateLimitHooks: Send + Sync {
    fn on_limit_reached(&self, _max_calls: usize) {}
}

struct NoopHooks;
impl RateLimitHooks for NoopHooks {}

#[derive(Clone)]
pub struct RateLimiter {
    bucket: Arc<TokenBucket>,
    max_calls: usize,
    /// When `true`, a call made with no tokens available returns
    /// `FlowError::RateLimit` immediately; when `false`, the call waits for
    /// a token (bounded by an optional `CancelSignal`).
    throws: bool,
    hooks: Arc<dyn RateLimitHooks>,
}

impl RateLimiter {
    /// `max_calls` tokens refill evenly across `window`.
    pub fn new(max_calls: usize, window: Duration, throws: bool) -> Result<Self, AssertError> {
        crate::error::assert_positive_count("max_calls", max_calls)?;
        crate::error::assert_positive_duration("window", window)?;
        let refill_interval = window / max_calls as u32;
        Ok(Self {
            bucket: Arc::new(TokenBucket::new(max_calls, refill_interval)?),
            max_calls,
            throws,
            hooks: Arc::new(NoopHooks),
        })
    }

    pub fn with_hooks<H: RateLimitHooks + 'static>(mut self, hooks: H) -> Self {
        self.hooks = Arc::new(hooks);
        self
    }

    /// Jitter applied to the wait delay of a non-throwing limiter. See
    /// [`TokenBucket::set_jitter_factor`].
    pub fn with_jitter_factor(self, factor: f64) -> Self {
        self.bucket.set_jitter_factor(factor);
        self
    }

    pub fn snapshot(&self) -> crate::token_bucket::TokenBucketSnapshot {
        self.bucket.snapshot()
    }

    pub async fn execute<T, E, Fut, Op>(&self, operation: Op) -> Result<T, FlowError<E>>
    where
        T: Send,
        Fut: Future<Output = Result<T, FlowError<E>>> + Send,
        Op: FnOnce() -> Fut + Send,
    {
        self.execute_with_cancel(operation, &CancelSignal::new()).await
    }

    pub async fn execute_with_cancel<T, E, Fut, Op>(
        &self,
        operation: Op,
        cancel: &CancelSignal,
    ) -> Result<T, FlowError<E>>
    where
        T: Send,
        Fut: Future<Output = Result<T, FlowError<E>>> + Send,
        Op: FnOnce() -> Fut + Send,
    {
        if self.throws {
            if !self.bucket.consume() {
                self.hooks.on_limit_reached(self.max_calls);
                return Err(FlowError::RateLimit { max_calls: self.max_calls });
            }
        } else {
            let max_calls = self.max_calls;
            let hooks = self.hooks.clone();
            let consumed = self
                .bucket
                .wait_and_consume_with(cancel, move || hooks.on_limit_reached(max_calls))
                .await;
            if !consumed {
                return Err(FlowError::RateLimit { max_calls: self.max_calls });
            }
        }

        operation().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Debug, Clone, PartialEq, Eq)]
    struct TestError(String);

    impl std::fmt::Display for TestError {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            write!(f, "{}", self.0)
        }
    }
    impl std::error::Error for TestError {}

    #[tokio::test]
    async fn admits_calls_up_to_max() {
        let limiter = RateLimiter::new(3, Duration::from_secs(1), true).unwrap();
        for _ in 0..3 {
            let result = limiter.execute(|| async { Ok::<_, FlowError<TestError>>(1) }).await;
            assert!(result.is_ok());
        }
        let rejected = limiter.execute(|| async { Ok::<_, FlowError<TestError>>(1) }).await;
        assert!(rejected.unwrap_err().is_rate_limit());
    }

    #[tokio::test]
    async fn non_throwing_limiter_waits_for_capacity() {
        let limiter = RateLimiter::new(1, Duration::from_millis(30), false).unwrap();
        let calls = Arc::new(AtomicUsize::new(0));

        let first = limiter.execute(|| {
            let calls = calls.clone();
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok::<_, FlowError<TestError>>(1)
            }
        });
        assert!(first.await.is_ok());

        let second = limiter.execute(|| {
            let calls = calls.clone();
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok::<_, FlowError<TestError>>(2)
            }
        });
        let result = tokio::time::timeout(Duration::from_millis(500), second).await.unwrap();
        assert!(result.is_ok());
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn rejects_zero_max_calls() {
        let err = RateLimiter::new(0, Duration::from_secs(1), true).unwrap_err();
        assert_eq!(err, AssertError::ZeroCount("max_calls"));
    }

    #[tokio::test]
    async fn on_limit_reached_fires_for_every_wait_not_just_rejection() {
        struct Recorder(Arc<AtomicUsize>);
        impl RateLimitHooks for Recorder {
            fn on_limit_reached(&self, _max_calls: usize) {
                self.0.fetch_add(1, Ordering::SeqCst);
            }
        }

        let hits = Arc::new(AtomicUsize::new(0));
        let limiter = RateLimiter::new(1, Duration::from_millis(10), false)
            .unwrap()
            .with_hooks(Recorder(hits.clone()));

        limiter.execute(|| async { Ok::<_, FlowError<TestError>>(1) }).await.unwrap();
        limiter.execute(|| async { Ok::<_, FlowError<TestError>>(2) }).await.unwrap();

        assert!(hits.load(Ordering::SeqCst) >= 1, "waiting for the second call should report at least one wait");
    }
}
