//! Coalescing wake-up

use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::Notify;

/// A wake-up that collapses repeated raises into one pending signal
///
/// The producer raises after every enqueue; while a wake is already pending the
/// raise is a no-op. The consumer clears the pending flag as it wakes and then
/// drains everything queued, so work enqueued after the clear always raises a
/// fresh wake.
#[derive(Debug, Default)]
pub struct WakeSignal {
    notify: Notify,
    pending: AtomicBool,
}

impl WakeSignal {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns true if this call scheduled a wake-up
    pub fn raise(&self) -> bool {
        if self.pending.swap(true, Ordering::AcqRel) {
            return false;
        }
        self.notify.notify_one();
        true
    }

    /// Wait for a raise, then clear the pending flag
    pub async fn wait(&self) {
        self.notify.notified().await;
        self.pending.store(false, Ordering::Release);
    }

    pub fn is_pending(&self) -> bool {
        self.pending.load(Ordering::Acquire)
    }
}
