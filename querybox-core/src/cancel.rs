//! Cooperative cancellation.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::Notify;

#[derive(Debug, Default)]
struct Inner {
    cancelled: AtomicBool,
    notify: Notify,
}

/// Signal telling a query that its result is no longer wanted.
///
/// Clones share the same flag. Cancelling is idempotent and cannot be
/// undone. Query functions may poll [`is_cancelled`](Self::is_cancelled) or
/// await [`cancelled`](Self::cancelled) to abort early; the executor discards
/// the result of a cancelled attempt either way.
///
/// ```
/// use querybox_core::CancellationSignal;
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() {
/// let signal = CancellationSignal::new();
/// let observed = signal.clone();
///
/// signal.cancel();
/// observed.cancelled().await;
/// assert!(observed.is_cancelled());
/// # }
/// ```
#[derive(Debug, Clone, Default)]
pub struct CancellationSignal {
    inner: Arc<Inner>,
}

impl CancellationSignal {
    /// Creates a signal that is not cancelled.
    pub fn new() -> Self {
        Self::default()
    }

    /// Cancels the signal and wakes every waiter.
    pub fn cancel(&self) {
        if !self.inner.cancelled.swap(true, Ordering::AcqRel) {
            self.inner.notify.notify_waiters();
        }
    }

    /// Returns `true` once [`cancel`](Self::cancel) was called on any clone.
    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::Acquire)
    }

    /// Resolves once the signal is cancelled.
    pub async fn cancelled(&self) {
        loop {
            let notified = self.inner.notify.notified();
            tokio::pin!(notified);
            // Register before checking the flag so a concurrent cancel is not missed.
            notified.as_mut().enable();
            if self.is_cancelled() {
                return;
            }
            notified.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn waiters_are_woken() {
        let signal = CancellationSignal::new();
        let waiter = tokio::spawn({
            let signal = signal.clone();
            async move { signal.cancelled().await }
        });

        tokio::task::yield_now().await;
        assert!(!signal.is_cancelled());
        signal.cancel();

        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("waiter was not woken")
            .unwrap();
    }

    #[tokio::test]
    async fn cancel_is_idempotent() {
        let signal = CancellationSignal::new();
        signal.cancel();
        signal.cancel();
        signal.cancelled().await;
        assert!(signal.clone().is_cancelled());
    }
}
