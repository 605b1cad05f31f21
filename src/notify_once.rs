use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::Notify;

/// A one-shot notification: published at most once, observable forever after.
#[derive(Debug, Default)]
pub(crate) struct NotifyOnce {
    notified: AtomicBool,
    notify: Notify,
}

impl NotifyOnce {
    /// Publishes the notification and wakes every waiter.
    ///
    /// Returns `false` without waking anyone if it was already published.
    pub(crate) fn notify_waiters(&self) -> bool {
        if self
            .notified
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return false;
        }

        self.notify.notify_waiters();
        true
    }

    pub(crate) fn is_notified(&self) -> bool {
        self.notified.load(Ordering::SeqCst)
    }

    /// Resolves immediately if already published, otherwise on publication.
    pub(crate) async fn notified(&self) {
        // Register interest before checking the flag so a concurrent
        // publish between the two can't be missed.
        let future = self.notify.notified();

        if !self.notified.load(Ordering::SeqCst) {
            future.await;
        }
    }
}
