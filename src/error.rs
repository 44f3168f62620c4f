//! Error taxonomy for the flow-control and caching toolkit.

use std::fmt;
use std::time::Duration;

/// Cap the number of stored failures inside `RetryExhausted` to avoid unbounded growth.
pub const MAX_RETRY_FAILURES: usize = 10;

/// Configuration errors raised at wrap/construction time.
///
/// These are fatal and never mutate any policy state: a caller that gets an
/// `AssertError` back from a builder has not started anything.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AssertError {
    /// A duration-valued option must be greater than zero.
    ZeroDuration(&'static str),
    /// A count-valued option (capacity, max attempts, max size, ...) must be greater than zero.
    ZeroCount(&'static str),
    /// A duration exceeded the caller-specified or crate-default maximum.
    ExceedsMaximum { field: &'static str, requested: Duration, limit: Duration },
    /// The same policy kind was applied twice to a producer already registered
    /// under the wrap registry.
    AlreadyWrapped { producer: String, kind: &'static str },
    /// A generic precondition failure, for checks that don't fit the other variants.
    Invalid(String),
}

impl fmt::Display for AssertError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ZeroDuration(field) => write!(f, "{field} must be > 0"),
            Self::ZeroCount(field) => write!(f, "{field} must be > 0"),
            Self::ExceedsMaximum { field, requested, limit } => {
                write!(f, "{field} {requested:?} exceeds maximum allowed {limit:?}")
            }
            Self::AlreadyWrapped { producer, kind } => {
                write!(f, "producer {producer:?} is already wrapped with policy {kind:?}")
            }
            Self::Invalid(msg) => write!(f, "{msg}"),
        }
    }
}

impl std::error::Error for AssertError {}

/// Unified error type surfaced by every wrapper in this crate.
///
/// Policy rejections (rate limiting, circuit breaking, retry exhaustion,
/// timeout, throttling, configuration) are distinguished from the producer's
/// own error, which is always propagated unwrapped via [`FlowError::Inner`].
#[derive(Debug)]
pub enum FlowError<E> {
    /// The rate limiter's token bucket had no capacity and `throws` was set.
    RateLimit {
        /// The configured `max_calls` for the limiter that rejected this call.
        max_calls: usize,
    },
    /// The circuit breaker is open (or half-open and already testing).
    CircuitOpen { failure_count: usize, open_duration: Duration },
    /// All retry attempts were exhausted.
    RetryExhausted { attempts: usize, failures: Vec<E> },
    /// The operation exceeded its deadline.
    Timeout { elapsed: Duration, timeout: Duration },
    /// A throttled call arrived before `delay` had elapsed and `throws` was set.
    Throttled,
    /// Invalid configuration, detected at wrap time.
    Assert(AssertError),
    /// The underlying producer failed; this is the producer's own error, unwrapped.
    Inner(E),
}

impl<E: Clone> Clone for FlowError<E> {
    fn clone(&self) -> Self {
        match self {
            Self::RateLimit { max_calls } => Self::RateLimit { max_calls: *max_calls },
            Self::CircuitOpen { failure_count, open_duration } => {
                Self::CircuitOpen { failure_count: *failure_count, open_duration: *open_duration }
            }
            Self::RetryExhausted { attempts, failures } => {
                Self::RetryExhausted { attempts: *attempts, failures: failures.clone() }
            }
            Self::Timeout { elapsed, timeout } => {
                Self::Timeout { elapsed: *elapsed, timeout: *timeout }
            }
            Self::Throttled => Self::Throttled,
            Self::Assert(e) => Self::Assert(e.clone()),
            Self::Inner(e) => Self::Inner(e.clone()),
        }
    }
}

impl<E: PartialEq> PartialEq for FlowError<E> {
    fn eq(&self, other: &Self) -> bool {
        use FlowError::*;
        match (self, other) {
            (RateLimit { max_calls: a }, RateLimit { max_calls: b }) => a == b,
            (
                CircuitOpen { failure_count: f1, open_duration: d1 },
                CircuitOpen { failure_count: f2, open_duration: d2 },
            ) => f1 == f2 && d1 == d2,
            (
                RetryExhausted { attempts: a1, failures: f1 },
                RetryExhausted { attempts: a2, failures: f2 },
            ) => a1 == a2 && f1 == f2,
            (Timeout { elapsed: a1, timeout: b1 }, Timeout { elapsed: a2, timeout: b2 }) => {
                a1 == a2 && b1 == b2
            }
            (Throttled, Throttled) => true,
            (Assert(a), Assert(b)) => a == b,
            (Inner(a), Inner(b)) => a == b,
            _ => false,
        }
    }
}

impl<E: Eq> Eq for FlowError<E> {}

impl<E: fmt::Display> fmt::Display for FlowError<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::RateLimit { max_calls } => {
                write!(f, "rate limit exceeded (max {max_calls} calls per window)")
            }
            Self::CircuitOpen { failure_count, open_duration } => write!(
                f,
                "circuit breaker open ({failure_count} failures, open for {open_duration:?})"
            ),
            Self::RetryExhausted { attempts, failures } => {
                let last = failures.last().map(|e| e.to_string()).unwrap_or_default();
                write!(
                    f,
                    "retry exhausted after {attempts} attempts ({} failures), last error: {last}",
                    failures.len()
                )
            }
            Self::Timeout { elapsed, timeout } => {
                write!(f, "operation timed out after {elapsed:?} (limit: {timeout:?})")
            }
            Self::Throttled => write!(f, "call throttled"),
            Self::Assert(e) => write!(f, "invalid configuration: {e}"),
            Self::Inner(e) => write!(f, "{e}"),
        }
    }
}

impl<E: std::error::Error + 'static> std::error::Error for FlowError<E> {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Inner(e) => Some(e),
            Self::Assert(e) => Some(e),
            Self::RetryExhausted { failures, .. } => {
                failures.last().map(|e| e as &dyn std::error::Error)
            }
            _ => None,
        }
    }
}

impl<E> FlowError<E> {
    pub fn is_rate_limit(&self) -> bool {
        matches!(self, Self::RateLimit { .. })
    }

    pub fn is_circuit_open(&self) -> bool {
        matches!(self, Self::CircuitOpen { .. })
    }

    pub fn is_retry_exhausted(&self) -> bool {
        matches!(self, Self::RetryExhausted { .. })
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }

    pub fn is_throttled(&self) -> bool {
        matches!(self, Self::Throttled)
    }

    pub fn is_assert(&self) -> bool {
        matches!(self, Self::Assert(_))
    }

    pub fn is_inner(&self) -> bool {
        matches!(self, Self::Inner(_))
    }

    /// Get the inner producer error, if this is an `Inner` variant.
    pub fn into_inner(self) -> Option<E> {
        match self {
            Self::Inner(e) => Some(e),
            _ => None,
        }
    }

    pub fn as_inner(&self) -> Option<&E> {
        match self {
            Self::Inner(e) => Some(e),
            _ => None,
        }
    }

    /// Recorded failures for a `RetryExhausted` error, if present.
    pub fn failures(&self) -> Option<&[E]> {
        match self {
            Self::RetryExhausted { failures, .. } => Some(failures.as_slice()),
            _ => None,
        }
    }
}

impl<E> From<AssertError> for FlowError<E> {
    fn from(e: AssertError) -> Self {
        Self::Assert(e)
    }
}

/// Require `value > 0`, returning [`AssertError::ZeroDuration`] otherwise.
pub fn assert_positive_duration(field: &'static str, value: Duration) -> Result<(), AssertError> {
    if value.is_zero() {
        Err(AssertError::ZeroDuration(field))
    } else {
        Ok(())
    }
}

/// Require `value > 0`, returning [`AssertError::ZeroCount`] otherwise.
pub fn assert_positive_count(field: &'static str, value: usize) -> Result<(), AssertError> {
    if value == 0 {
        Err(AssertError::ZeroCount(field))
    } else {
        Ok(())
    }
}
