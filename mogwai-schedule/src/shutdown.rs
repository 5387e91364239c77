//! Cooperative shutdown token
//!
//! A clonable flag that in-flight peer resolutions race against: once
//! triggered, pending operations resolve to `Cancelled` instead of
//! completing.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::Notify;

#[derive(Debug, Default)]
struct Inner {
    triggered: AtomicBool,
    notify: Notify,
}

/// Clonable shutdown signal shared by the scheduler loop and the service
/// facade.
#[derive(Debug, Clone, Default)]
pub struct ShutdownToken {
    inner: Arc<Inner>,
}

impl ShutdownToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Trigger shutdown, waking every task waiting in [`cancelled`].
    ///
    /// [`cancelled`]: ShutdownToken::cancelled
    pub fn trigger(&self) {
        self.inner.triggered.store(true, Ordering::SeqCst);
        self.inner.notify.notify_waiters();
    }

    pub fn is_triggered(&self) -> bool {
        self.inner.triggered.load(Ordering::SeqCst)
    }

    /// Resolve once shutdown has been triggered.
    pub async fn cancelled(&self) {
        while !self.is_triggered() {
            let notified = self.inner.notify.notified();
            // Re-check after registering so a trigger between the check and
            // the registration is not lost.
            if self.is_triggered() {
                break;
            }
            notified.await;
        }
    }
}
