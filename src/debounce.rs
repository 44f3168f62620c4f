//! Debounce: trailing-edge call coalescing. Each call resets a timer; the
//! producer only runs once the timer elapses with no further calls, or once
//! `max_wait` forces a run regardless of incoming resets.

use crate::error::{AssertError, FlowError};
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Notify;

type BoxedProducer<Args, T, E> =
    Box<dyn Fn(Args) -> Pin<Box<dyn Future<Output = Result<T, E>> + Send>> + Send + Sync>;

pub trait DebounceHooks: Send + Sync {
    fn on_flush(&self, _pending_calls: u64) {}
}

struct NoopHooks;
impl DebounceHooks for NoopHooks {}

struct Inner<Args, T, E> {
    producer: BoxedProducer<Args, T, E>,
    delay: Duration,
    max_wait: Option<Duration>,
    notify: Notify,
    generation: AtomicU64,
    pending_calls: AtomicU64,
    first_call_at: Mutex<Option<tokio::time::Instant>>,
    /// Args from the most recent `.call()`; the trailing-edge run uses
    /// whichever args arrived last, discarding the rest.
    last_args: Mutex<Option<Args>>,
    hooks_slot: Mutex<Arc<dyn DebounceHooks>>,
}

/// Debounced wrapper around a producer taking the args of the most recent
/// `.call()`. Each `.call()` resets the trailing-edge timer; the returned
/// future resolves when that particular generation's timer finally fires
/// and the producer has run with the latest args.
#[derive(Clone)]
pub struct Debounce<Args, T, E>
where
    Args: Send + Sync + 'static,
    T: Clone + Send + Sync + 'static,
    E: Clone + Send + Sync + 'static,
{
    inner: Arc<Inner<Args, T, E>>,
    last_result: Arc<Mutex<Option<Result<T, E>>>>,
}

impl<Args, T, E> Debounce<Args, T, E>
where
    Args: Send + Sync + 'static,
    T: Clone + Send + Sync + 'static,
    E: Clone + Send + Sync + 'static,
{
    pub fn new<Fut, P>(producer: P, delay: Duration, max_wait: Option<Duration>) -> Result<Self, AssertError>
    where
        Fut: Future<Output = Result<T, E>> + Send + 'static,
        P: Fn(Args) -> Fut + Send + Sync + 'static,
    {
        crate::error::assert_positive_duration("delay", delay)?;
        if let Some(max_wait) = max_wait {
            crate::error::assert_positive_duration("max_wait", max_wait)?;
        }
        Ok(Self {
            inner: Arc::new(Inner {
                producer: Box::new(move |args: Args| Box::pin(producer(args))),
                delay,
                max_wait,
                notify: Notify::new(),
                generation: AtomicU64::new(0),
                pending_calls: AtomicU64::new(0),
                first_call_at: Mutex::new(None),
                last_args: Mutex::new(None),
                hooks_slot: Mutex::new(Arc::new(NoopHooks)),
            }),
            last_result: Arc::new(Mutex::new(None)),
        })
    }

    pub fn with_hooks<H: DebounceHooks + 'static>(self, hooks: H) -> Self {
        *self.inner.hooks_slot.lock().unwrap_or_else(|p| p.into_inner()) = Arc::new(hooks);
        self
    }

    /// Request a run with `args`. Resolves once this generation's
    /// trailing-edge timer fires and the producer has been invoked with the
    /// most recently supplied args, yielding the result every caller in that
    /// generation shares.
    pub async fn call(&self, args: Args) -> Result<T, FlowError<E>> {
        let generation = self.inner.generation.load(Ordering::SeqCst);
        self.inner.pending_calls.fetch_add(1, Ordering::SeqCst);
        *self.inner.last_args.lock().unwrap_or_else(|p| p.into_inner()) = Some(args);

        {
            let mut first_call_at = self.inner.first_call_at.lock().unwrap_or_else(|p| p.into_inner());
            if first_call_at.is_none() {
                *first_call_at = Some(tokio::time::Instant::now());
            }
        }

        loop {
            let deadline = tokio::time::Instant::now() + self.inner.delay;
            let forced_deadline = self.inner.max_wait.and_then(|max_wait| {
                self.inner
                    .first_call_at
                    .lock()
                    .unwrap_or_else(|p| p.into_inner())
                    .map(|first| first + max_wait)
            });
            let effective_deadline = match forced_deadline {
                Some(forced) if forced < deadline => forced,
                _ => deadline,
            };

            tokio::select! {
                _ = tokio::time::sleep_until(effective_deadline) => {}
                _ = self.inner.notify.notified() => {
                    if self.inner.generation.load(Ordering::SeqCst) != generation {
                        return self.await_result(generation).await;
                    }
                    continue;
                }
            }

            if self.try_fire(generation).await {
                break;
            }
        }

        self.await_result(generation).await
    }

    /// Attempts to advance past `generation` and run the producer with the
    /// latest stored args. A no-op (returns `false`, no generation change)
    /// when another caller already advanced past `generation`, or when no
    /// args have ever been recorded (an idle debounce has nothing to run).
    async fn try_fire(&self, generation: u64) -> bool {
        let Some(args) = self.inner.last_args.lock().unwrap_or_else(|p| p.into_inner()).take() else {
            return false;
        };

        if self
            .inner
            .generation
            .compare_exchange(generation, generation + 1, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            *self.inner.last_args.lock().unwrap_or_else(|p| p.into_inner()) = Some(args);
            return false;
        }

        let pending = self.inner.pending_calls.swap(0, Ordering::SeqCst);
        *self.inner.first_call_at.lock().unwrap_or_else(|p| p.into_inner()) = None;
        self.inner.hooks_slot.lock().unwrap_or_else(|p| p.into_inner()).on_flush(pending);

        let result = (self.inner.producer)(args).await;
        *self.last_result.lock().unwrap_or_else(|p| p.into_inner()) = Some(result);
        self.inner.notify.notify_waiters();
        true
    }

    async fn await_result(&self, generation: u64) -> Result<T, FlowError<E>> {
        while self.inner.generation.load(Ordering::SeqCst) <= generation {
            self.inner.notify.notified().await;
        }
        self.last_result
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .clone()
            .expect("generation advanced past await_result's target without setting a result")
            .map_err(FlowError::Inner)
    }

    /// Force the pending call (if any) to run immediately, bypassing the
    /// remaining delay.
    pub async fn flush(&self) -> Result<T, FlowError<E>> {
        let generation = self.inner.generation.load(Ordering::SeqCst);
        self.try_fire(generation).await;
        self.await_result(generation).await
    }

    /// Drop the pending call without running the producer.
    pub fn cancel(&self) {
        self.inner.generation.fetch_add(1, Ordering::SeqCst);
        self.inner.pending_calls.store(0, Ordering::SeqCst);
        *self.inner.first_call_at.lock().unwrap_or_else(|p| p.into_inner()) = None;
        *self.inner.last_args.lock().unwrap_or_else(|p| p.into_inner()) = None;
        self.inner.notify.notify_waiters();
    }
}
