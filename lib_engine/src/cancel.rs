//! Set-once cancellation flag shared by every engine task.
//!
//! The flag itself is lock-free so the firing busy-wait can poll it on
//! every spin; async callers park on a [`Notify`] instead of polling.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::Notify;

#[derive(Clone, Default)]
pub struct CancelFlag {
    inner: Arc<Inner>,
}

#[derive(Default)]
struct Inner {
    flag: AtomicBool,
    notify: Notify,
}

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the flag. Idempotent; wakes every parked waiter.
    pub fn cancel(&self) {
        self.inner.flag.store(true, Ordering::SeqCst);
        self.inner.notify.notify_waiters();
    }

    /// Cheap check, safe inside the busy-wait.
    #[inline]
    pub fn is_cancelled(&self) -> bool {
        self.inner.flag.load(Ordering::Relaxed)
    }

    /// Races `fut` against cancellation. `None` means the flag won; the
    /// future is dropped, which aborts any in-flight request it owned.
    pub async fn abortable<F: std::future::Future>(&self, fut: F) -> Option<F::Output> {
        tokio::select! {
            _ = self.cancelled() => None,
            out = fut => Some(out),
        }
    }

    /// Resolves once the flag is set. Registration happens before the
    /// re-check, so a concurrent `cancel` cannot be lost.
    pub async fn cancelled(&self) {
        loop {
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
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn cancel_wakes_waiters() {
        let flag = CancelFlag::new();
        assert!(!flag.is_cancelled());

        let waiter = {
            let flag = flag.clone();
            tokio::spawn(async move { flag.cancelled().await })
        };
        flag.cancel();
        waiter.await.unwrap();
        assert!(flag.is_cancelled());
    }

    #[tokio::test]
    async fn cancelled_returns_immediately_when_already_set() {
        let flag = CancelFlag::new();
        flag.cancel();
        flag.cancelled().await;
    }
}
