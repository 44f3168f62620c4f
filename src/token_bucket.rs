//! Token bucket: continuous refill, atomic wait-and-consume.

use crate::cancel::CancelSignal;
use crate::clock::{Clock, MonotonicClock};
use crate::error::AssertError;
use rand::Rng;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

struct RefillState {
    tokens: f64,
    last_refill_millis: u64,
}

/// Continuous-refill token bucket.
///
/// The fractional `tokens`/`last_refill` pair mutate together on every
/// `consume`, so — unlike the circuit breaker's independent atomics — this
/// is a single narrow `Mutex` guarding just that pair; floats have no sound
/// lock-free compare-and-swap, so the circuit breaker's atomics style
/// doesn't translate here. Cumulative counters live outside the lock.
pub struct TokenBucket {
    capacity: f64,
    refill_interval_millis: f64,
    state: Mutex<RefillState>,
    clock: Arc<dyn Clock>,
    /// Extra randomized slack added to each computed wait, as a fraction of
    /// the base wait (e.g. `0.1` adds up to 10% extra delay). Spreads out
    /// callers that were all refused at the same instant.
    jitter_factor: AtomicU64,
    total_requests: AtomicU64,
    rejected: AtomicU64,
    total_wait_millis: AtomicU64,
    wait_count: AtomicU32,
}

#[derive(Debug, Clone, Copy)]
pub struct TokenBucketSnapshot {
    pub tokens_available: f64,
    pub capacity: f64,
    pub total_requests: u64,
    pub rejected: u64,
    pub wait_count: u32,
    pub average_wait_millis: f64,
}

impl TokenBucket {
    /// `capacity`: max tokens (and burst size). `refill_interval`: time to
    /// refill one token.
    pub fn new(capacity: usize, refill_interval: Duration) -> Result<Self, AssertError> {
        crate::error::assert_positive_count("capacity", capacity)?;
        crate::error::assert_positive_duration("refill_interval", refill_interval)?;
        Ok(Self {
            capacity: capacity as f64,
            refill_interval_millis: refill_interval.as_millis() as f64,
            state: Mutex::new(RefillState { tokens: capacity as f64, last_refill_millis: 0 }),
            clock: Arc::new(MonotonicClock::default()),
            jitter_factor: AtomicU64::new(0.0f64.to_bits()),
            total_requests: AtomicU64::new(0),
            rejected: AtomicU64::new(0),
            total_wait_millis: AtomicU64::new(0),
            wait_count: AtomicU32::new(0),
        })
    }

    pub fn with_clock<C: Clock + 'static>(mut self, clock: C) -> Self {
        self.clock = Arc::new(clock);
        self
    }

    /// Scale each computed wait by up to `1.0 + factor` (default `0.0`, no
    /// jitter). Clamped to non-negative.
    pub fn with_jitter_factor(self, factor: f64) -> Self {
        self.set_jitter_factor(factor);
        self
    }

    /// As [`Self::with_jitter_factor`], for buckets already shared via `Arc`.
    pub fn set_jitter_factor(&self, factor: f64) {
        self.jitter_factor.store(factor.max(0.0).to_bits(), Ordering::Relaxed);
    }

    fn jitter_factor(&self) -> f64 {
        f64::from_bits(self.jitter_factor.load(Ordering::Relaxed))
    }

    fn refill_rate_per_milli(&self) -> f64 {
        1.0 / self.refill_interval_millis
    }

    /// Refill based on elapsed time, guarding against clock anomalies
    /// (negative elapsed, or an absurdly large jump) by refilling to full.
    fn refill_locked(&self, state: &mut RefillState, now_millis: u64) {
        let elapsed = now_millis.saturating_sub(state.last_refill_millis) as f64;
        let anomaly_threshold = self.capacity * self.refill_interval_millis * 4.0;

        if now_millis < state.last_refill_millis || elapsed > anomaly_threshold {
            state.tokens = self.capacity;
        } else {
            let gained = elapsed * self.refill_rate_per_milli();
            state.tokens = (state.tokens + gained).min(self.capacity);
        }
        state.last_refill_millis = now_millis;
    }

    /// Attempt to take one token immediately. Returns `true` if consumed.
    pub fn consume(&self) -> bool {
        self.total_requests.fetch_add(1, Ordering::Relaxed);
        let now = self.clock.now_millis();
        let mut state = self.state.lock().unwrap_or_else(|p| p.into_inner());
        self.refill_locked(&mut state, now);

        if state.tokens >= 1.0 {
            state.tokens -= 1.0;
            true
        } else {
            self.rejected.fetch_add(1, Ordering::Relaxed);
            false
        }
    }

    /// Milliseconds until at least one token will be available, `0` if one
    /// is available now.
    pub fn get_wait_time_ms(&self) -> u64 {
        let now = self.clock.now_millis();
        let mut state = self.state.lock().unwrap_or_else(|p| p.into_inner());
        self.refill_locked(&mut state, now);

        if state.tokens >= 1.0 {
            0
        } else {
            let deficit = 1.0 - state.tokens;
            (deficit / self.refill_rate_per_milli()).ceil() as u64
        }
    }

    /// Wait until a token is available (or `cancel` trips) and consume it.
    /// Returns `false` if cancelled before a token became available.
    pub async fn wait_and_consume(&self, cancel: &CancelSignal) -> bool {
        self.wait_and_consume_with(cancel, || {}).await
    }

    /// As [`Self::wait_and_consume`], invoking `on_wait` every time the
    /// bucket is found empty and a wait is about to begin (not just once, on
    /// final rejection).
    pub async fn wait_and_consume_with(&self, cancel: &CancelSignal, mut on_wait: impl FnMut()) -> bool {
        loop {
            if self.consume() {
                return true;
            }
            on_wait();

            let base_wait_ms = self.get_wait_time_ms().max(1);
            let jitter_factor = self.jitter_factor();
            let wait_ms = if jitter_factor > 0.0 {
                let extra = rand::thread_rng().gen_range(0.0..=jitter_factor);
                (base_wait_ms as f64 * (1.0 + extra)).ceil() as u64
            } else {
                base_wait_ms
            };
            self.total_wait_millis.fetch_add(wait_ms, Ordering::Relaxed);
            self.wait_count.fetch_add(1, Ordering::Relaxed);

            tokio::select! {
                _ = tokio::time::sleep(Duration::from_millis(wait_ms)) => {}
                _ = cancel.cancelled() => return false,
            }
        }
    }

    pub fn reset(&self) {
        let mut state = self.state.lock().unwrap_or_else(|p| p.into_inner());
        state.tokens = self.capacity;
        state.last_refill_millis = self.clock.now_millis();
    }

    pub fn snapshot(&self) -> TokenBucketSnapshot {
        let now = self.clock.now_millis();
        let mut state = self.state.lock().unwrap_or_else(|p| p.into_inner());
        self.refill_locked(&mut state, now);

        let wait_count = self.wait_count.load(Ordering::Relaxed);
        let total_wait = self.total_wait_millis.load(Ordering::Relaxed);
        TokenBucketSnapshot {
            tokens_available: state.tokens,
            capacity: self.capacity,
            total_requests: self.total_requests.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
            wait_count,
            average_wait_millis: if wait_count == 0 { 0.0 } else { total_wait as f64 / wait_count as f64 },
        }
    }
}
