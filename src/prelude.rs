//! Convenient re-exports for common flowcache types.
pub use crate::{
    AssertError, Backoff, CacheBackend, CacheEntry, CacheHandle, CacheStats, CancelSignal,
    CircuitBreakerConfig, CircuitBreakerHooks, CircuitBreakerPolicy, CircuitState, Clock, Composer,
    Debounce, DebounceHooks, FlowError, Jitter, KeyArg, MemoizeBuilder, Memoized, MemoryBackend,
    MonotonicClock, PolicyKind, RateLimitHooks, RateLimiter, RetryHooks, RetryPolicy,
    RetryPolicyBuilder, SingleFlightGroup, Sleeper, StoredValue, Throttle, ThrottleHooks,
    TimeoutHooks, TimeoutPolicy, TokenBucket, TokioSleeper, WrapRegistry,
};
