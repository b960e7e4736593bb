//! One-shot broadcast notifier used by the triage gates.

use tokio::sync::watch;

/// A single-writer latch: `notify()` releases every current and future
/// `wait()`er. Notifying more than once is a no-op.
#[derive(Debug, Clone)]
pub struct Notifier {
    tx: watch::Sender<bool>,
}

impl Notifier {
    /// Create an un-notified latch.
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self { tx }
    }

    /// Release all waiters.
    pub fn notify(&self) {
        self.tx.send_replace(true);
    }

    /// Whether the latch has been released.
    pub fn is_notified(&self) -> bool {
        *self.tx.borrow()
    }

    /// Wait until the latch is released. Returns immediately if it already
    /// was.
    pub async fn wait(&self) {
        let mut rx = self.tx.subscribe();
        if *rx.borrow() {
            return;
        }
        while rx.changed().await.is_ok() {
            if *rx.borrow() {
                return;
            }
        }
    }
}

impl Default for Notifier {
    fn default() -> Self {
        Self::new()
    }
}
