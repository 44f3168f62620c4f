//! Timeout policy for bounding async operation duration.
//!
//! Wraps an async operation and returns [`FlowError::Timeout`] when the
//! deadline elapses. Uses `tokio::time::timeout`; on timeout the inner future
//! is dropped (not forcibly aborted), so cancellation-unsafe work may leave
//! partial state. A [`CancelSignal`] is tripped the moment the deadline
//! fires, so cooperative producers racing on it unwind promptly instead of
//! running to completion unobserved.

use crate::cancel::CancelSignal;
use crate::error::{AssertError, FlowError};
use std::future::Future;
use std::time::Duration;
use tokio::time::Instant;

/// Maximum allowed timeout duration (30 days), to guard against accidental
/// `Duration::MAX`-style timeouts while still permitting long-running jobs.
pub const MAX_TIMEOUT: Duration = Duration::from_secs(30 * 24 * 60 * 60);

/// Hook hub for timeout outcomes.
pub trait TimeoutHooks<E>: Send + Sync {
    fn on_timeout(&self, _elapsed: Duration, _limit: Duration) {}
    /// The producer itself failed (not a timeout); `didTimeout` is always
    /// `false` here, since a timeout never reaches this hook.
    fn on_error(&self, _err: &E) {}
}

struct NoopHooks;
impl<E> TimeoutHooks<E> for NoopHooks {}

/// Policy that enforces a maximum duration on async operations.
#[derive(Clone)]
pub struct TimeoutPolicy<E = std::convert::Infallible> {
    duration: Duration,
    hooks: std::sync::Arc<dyn TimeoutHooks<E>>,
}

impl<E> TimeoutPolicy<E> {
    /// Creates a timeout policy with the specified duration.
    #[must_use = "the result must be checked for validation errors"]
    pub fn new(duration: Duration) -> Result<Self, AssertError> {
        Self::new_with_max(duration, MAX_TIMEOUT)
    }

    /// Construct with a caller-specified maximum allowed timeout.
    pub fn new_with_max(duration: Duration, max: Duration) -> Result<Self, AssertError> {
        crate::error::assert_positive_duration("duration", duration)?;
        if duration > max {
            return Err(AssertError::ExceedsMaximum { field: "duration", requested: duration, limit: max });
        }
        Ok(Self { duration, hooks: std::sync::Arc::new(NoopHooks) })
    }

    pub fn with_hooks<H: TimeoutHooks<E> + 'static>(mut self, hooks: H) -> Self {
        self.hooks = std::sync::Arc::new(hooks);
        self
    }

    #[must_use]
    #[inline]
    pub fn duration(&self) -> Duration {
        self.duration
    }

    /// Execute an operation with a timeout, without a fallback value: a
    /// timeout always surfaces as [`FlowError::Timeout`].
    pub async fn execute<T, Fut, Op>(&self, operation: Op) -> Result<T, FlowError<E>>
    where
        T: Send,
        Fut: Future<Output = Result<T, FlowError<E>>> + Send,
        Op: FnOnce() -> Fut + Send,
    {
        self.execute_with_cancel(operation, &CancelSignal::new()).await
    }

    /// Execute with a timeout, tripping `cancel` as soon as the deadline
    /// fires so the caller's own cancellation-aware work can unwind.
    pub async fn execute_with_cancel<T, Fut, Op>(
        &self,
        operation: Op,
        cancel: &CancelSignal,
    ) -> Result<T, FlowError<E>>
    where
        T: Send,
        Fut: Future<Output = Result<T, FlowError<E>>> + Send,
        Op: FnOnce() -> Fut + Send,
    {
        let start = Instant::now();

        match tokio::time::timeout(self.duration, operation()).await {
            Ok(Err(FlowError::Inner(e))) => {
                self.hooks.on_error(&e);
                Err(FlowError::Inner(e))
            }
            Ok(result) => result,
            Err(_) => {
                cancel.cancel();
                let elapsed = start.elapsed();
                self.hooks.on_timeout(elapsed, self.duration);
                Err(FlowError::Timeout { elapsed, timeout: self.duration })
            }
        }
    }

    /// Execute with a timeout, substituting `fallback` instead of returning
    /// an error when the deadline elapses. Mirrors a `throws: false` timeout
    /// configuration: the caller must supply a value to return in that case,
    /// since Rust's `Result` has no implicit "no-op success" the way a
    /// nullable return does.
    pub async fn execute_or<T, Fut, Op>(&self, operation: Op, fallback: T) -> Result<T, FlowError<E>>
    where
        T: Send,
        Fut: Future<Output = Result<T, FlowError<E>>> + Send,
        Op: FnOnce() -> Fut + Send,
    {
        match self.execute(operation).await {
            Err(FlowError::Timeout { .. }) => Ok(fallback),
            other => other,
        }
    }
}
