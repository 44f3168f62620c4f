#![forbid(unsafe_code)]

//! # flowcache
//!
//! A flow-control and caching toolkit for async Rust: memoization with
//! stale-while-revalidate, single-flight request coalescing, rate limiting,
//! circuit breakers, retry, timeout, throttle, and debounce — composable
//! behind one error taxonomy.
//!
//! ## Features
//!
//! - **Memoize** with TTL, LRU eviction, and stale-while-revalidate
//! - **Single-flight** deduplication of concurrent calls for the same key
//! - **Rate limiting** via a continuous-refill token bucket
//! - **Circuit breakers** with half-open probing
//! - **Retry** with configurable backoff and jitter
//! - **Timeout** racing with cooperative cancellation
//! - **Throttle** (leading-edge) and **debounce** (trailing-edge)
//! - **Composition** via a wrap registry that rejects double-wrapping
//!
//! ## Quick Start
//!
//! ```rust
//! use std::sync::atomic::{AtomicUsize, Ordering};
//! use std::sync::Arc;
//! use std::time::Duration;
//! use flowcache::{Backoff, CircuitBreakerPolicy, FlowError, Jitter, RetryPolicy, TimeoutPolicy};
//!
//! async fn flaky_operation(
//!     attempts: Arc<AtomicUsize>,
//! ) -> Result<u32, FlowError<std::io::Error>> {
//!     let n = attempts.fetch_add(1, Ordering::Relaxed);
//!     if n < 2 {
//!         Err(FlowError::Inner(std::io::Error::new(std::io::ErrorKind::Other, "transient failure")))
//!     } else {
//!         Ok(n)
//!     }
//! }
//!
//! #[tokio::main]
//! async fn main() -> Result<(), FlowError<std::io::Error>> {
//!     let attempts = Arc::new(AtomicUsize::new(0));
//!
//!     let retry = RetryPolicy::builder()
//!         .max_attempts(3)
//!         .expect("positive max_attempts")
//!         .backoff(Backoff::exponential(Duration::from_millis(200)))
//!         .with_jitter(Jitter::full())
//!         .build();
//!     let timeout = TimeoutPolicy::new(Duration::from_secs(2)).expect("valid timeout");
//!     let breaker = CircuitBreakerPolicy::new(5, Duration::from_secs(30)).expect("valid breaker");
//!
//!     // Compose inside-out: retry wraps the breaker, the timeout wraps both.
//!     let attempts_for_call = attempts.clone();
//!     timeout
//!         .execute(|| {
//!             let breaker = breaker.clone();
//!             let attempts = attempts_for_call.clone();
//!             retry.execute(move || breaker.execute({
//!                 let attempts = attempts.clone();
//!                 move || flaky_operation(attempts.clone())
//!             }))
//!         })
//!         .await?;
//!     Ok(())
//! }
//! ```

mod backoff;
mod cancel;
mod circuit_breaker;
mod clock;
mod compose;
mod debounce;
mod error;
mod jitter;
mod key;
mod lru;
mod memoize;
mod rate_limit;
mod retry;
mod single_flight;
mod sleeper;
mod storage;
mod throttle;
mod timeout;
mod token_bucket;

// Re-exports
pub use backoff::Backoff;
pub use cancel::CancelSignal;
pub use circuit_breaker::{CircuitBreakerConfig, CircuitBreakerHooks, CircuitBreakerPolicy, CircuitState};
pub use clock::{Clock, MonotonicClock};
pub use compose::{Composer, PolicyKind, WrapRegistry};
pub use debounce::{Debounce, DebounceHooks};
pub use error::{AssertError, FlowError, MAX_RETRY_FAILURES};
pub use jitter::Jitter;
pub use key::{fingerprint, opaque_id, KeyArg};
pub use lru::select_eviction_candidate;
pub use memoize::{CacheHandle, MemoizeBuilder, Memoized, ToKeyArgs};
pub use rate_limit::{RateLimitHooks, RateLimiter};
pub use retry::{BuildError, RetryHooks, RetryPolicy, RetryPolicyBuilder};
pub use single_flight::{CleanupGuard, SingleFlightGroup};
pub use sleeper::{InstantSleeper, Sleeper, TokioSleeper, TrackingSleeper};
pub use storage::memory::MemoryBackend;
pub use storage::{CacheBackend, CacheEntry, CacheStats, StoredValue};
pub use throttle::{Throttle, ThrottleHooks};
pub use timeout::{TimeoutHooks, TimeoutPolicy, MAX_TIMEOUT};
pub use token_bucket::{TokenBucket, TokenBucketSnapshot};

pub mod prelude;
