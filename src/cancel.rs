//! Cooperative cancellation signal shared by retry, rate-limit, and timeout waits.
//!
//! Rust has no `AbortController` analogue in the standard library; this is the
//! minimal primitive the rest of the crate needs: a flag that can be tripped
//! from one task and observed (and waited upon) from another.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Notify;

#[derive(Debug, Default)]
struct Inner {
    tripped: AtomicBool,
    notify: Notify,
}

/// A cheaply cloneable cancellation flag.
///
/// Cloning shares the same underlying signal; any clone can call
/// [`CancelSignal::cancel`] and every clone observes [`CancelSignal::is_cancelled`]
/// becoming `true` immediately after.
#[derive(Debug, Clone, Default)]
pub struct CancelSignal {
    inner: Arc<Inner>,
}

impl CancelSignal {
    pub fn new() -> Self {
        Self::default()
    }

    /// Trip the signal. Idempotent.
    pub fn cancel(&self) {
        self.inner.tripped.store(true, Ordering::Release);
        self.inner.notify.notify_waiters();
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.tripped.load(Ordering::Acquire)
    }

    /// Resolve as soon as the signal is tripped. Resolves immediately if
    /// already tripped.
    pub async fn cancelled(&self) {
        if self.is_cancelled() {
            return;
        }
        let notified = self.inner.notify.notified();
        if self.is_cancelled() {
            return;
        }
        notified.await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn starts_uncancelled() {
        let sig = CancelSignal::new();
        assert!(!sig.is_cancelled());
    }

    #[tokio::test]
    async fn cancel_is_observed_by_clones() {
        let sig = CancelSignal::new();
        let clone = sig.clone();
        clone.cancel();
        assert!(sig.is_cancelled());
    }

    #[tokio::test]
    async fn cancelled_resolves_after_cancel() {
        let sig = CancelSignal::new();
        let waiter = sig.clone();
        let handle = tokio::spawn(async move {
            waiter.cancelled().await;
        });
        tokio::time::sleep(Duration::from_millis(10)).await;
        sig.cancel();
        tokio::time::timeout(Duration::from_millis(200), handle).await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn cancelled_resolves_immediately_if_already_cancelled() {
        let sig = CancelSignal::new();
        sig.cancel();
        tokio::time::timeout(Duration::from_millis(50), sig.cancelled()).await.unwrap();
    }
}
