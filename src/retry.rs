//! Retry policy: configurable backoff, jitter, cancellation, and hooks.

use crate::cancel::CancelSignal;
use crate::error::{FlowError, MAX_RETRY_FAILURES};
use crate::{Backoff, Jitter, Sleeper, TokioSleeper};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

/// Hook hub for retry attempts. All hooks default to no-ops.
pub trait RetryHooks<E>: Send + Sync {
    fn on_retry(&self, _attempt: usize, _error: &E, _delay: Duration) {}
    fn on_exhausted(&self, _attempts: usize) {}
}

struct NoopHooks;
impl<E> RetryHooks<E> for NoopHooks {}

#[derive(Clone)]
pub struct RetryPolicy<E> {
    max_attempts: usize,
    backoff: Backoff,
    jitter: Jitter,
    /// Extra scalar multiplier applied to the jittered delay, in addition to
    /// the `Jitter` strategy itself (e.g. to deliberately soften or amplify it).
    jitter_factor: f64,
    should_retry: Arc<dyn Fn(&E) -> bool + Send + Sync>,
    /// When set, exhaustion propagates the last recorded failure directly
    /// (`FlowError::Inner`) instead of `FlowError::RetryExhausted`.
    throw_last_error: bool,
    sleeper: Arc<dyn Sleeper>,
    hooks: Arc<dyn RetryHooks<E>>,
}

impl<E> std::fmt::Debug for RetryPolicy<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RetryPolicy")
            .field("max_attempts", &self.max_attempts)
            .field("backoff", &self.backoff)
            .field("jitter", &self.jitter)
            .field("jitter_factor", &self.jitter_factor)
            .field("throw_last_error", &self.throw_last_error)
            .field("sleeper", &"<sleeper>")
            .finish()
    }
}

impl<E> RetryPolicy<E>
where
    E: std::error::Error + Send + Sync + 'static,
{
    pub fn builder() -> RetryPolicyBuilder<E> {
        RetryPolicyBuilder::new()
    }

    /// Run `operation` until it succeeds, the predicate rejects an error, a
    /// non-`Inner` policy error arrives, `cancel` trips, or attempts are
    /// exhausted.
    pub async fn execute<T, Fut, Op>(&self, operation: Op) -> Result<T, FlowError<E>>
    where
        T: Send,
        Fut: Future<Output = Result<T, FlowError<E>>> + Send,
        Op: FnMut() -> Fut + Send,
    {
        self.execute_with_cancel(operation, &CancelSignal::new()).await
    }

    pub async fn execute_with_cancel<T, Fut, Op>(
        &self,
        mut operation: Op,
        cancel: &CancelSignal,
    ) -> Result<T, FlowError<E>>
    where
        T: Send,
        Fut: Future<Output = Result<T, FlowError<E>>> + Send,
        Op: FnMut() -> Fut + Send,
    {
        let mut failures = Vec::new();

        for attempt in 0..self.max_attempts {
            if cancel.is_cancelled() {
                return Err(self.exhaustion_error(attempt, failures));
            }

            match operation().await {
                Ok(value) => return Ok(value),
                Err(FlowError::Inner(e)) => {
                    if !(self.should_retry)(&e) {
                        return Err(FlowError::Inner(e));
                    }

                    failures.push(e);
                    if failures.len() > MAX_RETRY_FAILURES {
                        let excess = failures.len() - MAX_RETRY_FAILURES;
                        failures.drain(0..excess);
                    }

                    if attempt + 1 >= self.max_attempts {
                        self.hooks.on_exhausted(self.max_attempts);
                        return Err(self.exhaustion_error(self.max_attempts, failures));
                    }

                    let mut delay = self.backoff.delay(attempt + 1);
                    delay = self.jitter.apply(delay);
                    delay = delay.mul_f64(self.jitter_factor.max(0.0));

                    self.hooks.on_retry(attempt + 1, failures.last().unwrap(), delay);

                    tokio::select! {
                        _ = self.sleeper.sleep(delay) => {}
                        _ = cancel.cancelled() => {
                            return Err(self.exhaustion_error(attempt + 1, failures));
                        }
                    }
                }
                Err(e) => return Err(e),
            }
        }

        unreachable!("retry loop should have returned or errored")
    }

    /// Builds the error returned when retries are exhausted (or cancelled).
    /// With `throw_last_error` set, the last recorded failure propagates
    /// directly instead of being wrapped in `RetryExhausted`.
    fn exhaustion_error(&self, attempts: usize, mut failures: Vec<E>) -> FlowError<E> {
        if self.throw_last_error {
            if let Some(last) = failures.pop() {
                return FlowError::Inner(last);
            }
        }
        FlowError::RetryExhausted { attempts, failures }
    }
}

pub struct RetryPolicyBuilder<E> {
    max_attempts: usize,
    backoff: Backoff,
    jitter: Jitter,
    jitter_factor: f64,
    should_retry: Arc<dyn Fn(&E) -> bool + Send + Sync>,
    throw_last_error: bool,
    sleeper: Arc<dyn Sleeper>,
    hooks: Arc<dyn RetryHooks<E>>,
}

#[derive(Debug, PartialEq, Eq)]
pub enum BuildError {
    InvalidMaxAttempts(usize),
}

impl std::fmt::Display for BuildError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BuildError::InvalidMaxAttempts(n) => write!(f, "max_attempts must be > 0 (got {n})"),
        }
    }
}

impl std::error::Error for BuildError {}

impl<E> RetryPolicyBuilder<E>
where
    E: std::error::Error + Send + Sync + 'static,
{
    pub fn new() -> Self {
        Self {
            max_attempts: 3,
            backoff: Backoff::exponential(Duration::from_secs(1)),
            jitter: Jitter::full(),
            jitter_factor: 1.0,
            should_retry: Arc::new(|_| true),
            throw_last_error: false,
            sleeper: Arc::new(TokioSleeper),
            hooks: Arc::new(NoopHooks),
        }
    }

    pub fn max_attempts(mut self, attempts: usize) -> Result<Self, BuildError> {
        if attempts == 0 {
            return Err(BuildError::InvalidMaxAttempts(attempts));
        }
        self.max_attempts = attempts;
        Ok(self)
    }

    pub fn backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn with_jitter(mut self, jitter: Jitter) -> Self {
        self.jitter = jitter;
        self
    }

    /// Scale the post-jitter delay by this factor (default `1.0`).
    pub fn jitter_factor(mut self, factor: f64) -> Self {
        self.jitter_factor = factor;
        self
    }

    pub fn should_retry<F>(mut self, predicate: F) -> Self
    where
        F: Fn(&E) -> bool + Send + Sync + 'static,
    {
        self.should_retry = Arc::new(predicate);
        self
    }

    /// When `enabled`, exhaustion propagates the last underlying error
    /// directly instead of `FlowError::RetryExhausted`.
    pub fn throw_last_error(mut self, enabled: bool) -> Self {
        self.throw_last_error = enabled;
        self
    }

    pub fn with_sleeper<S>(mut self, sleeper: S) -> Self
    where
        S: Sleeper + 'static,
    {
        self.sleeper = Arc::new(sleeper);
        self
    }

    pub fn with_hooks<H>(mut self, hooks: H) -> Self
    where
        H: RetryHooks<E> + 'static,
    {
        self.hooks = Arc::new(hooks);
        self
    }

    pub fn build(self) -> RetryPolicy<E> {
        RetryPolicy {
            max_attempts: self.max_attempts,
            backoff: self.backoff,
            jitter: self.jitter,
            jitter_factor: self.jitter_factor,
            should_retry: self.should_retry,
            throw_last_error: self.throw_last_error,
            sleeper: self.sleeper,
            hooks: self.hooks,
        }
    }
}

impl<E> Default for RetryPolicyBuilder<E>
where
    E: std::error::Error + Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}
