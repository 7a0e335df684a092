//! Cooperative cancellation shared by the orchestrator and its worker tasks.

use std::sync::Arc;
use tokio::sync::watch;

/// Cloneable cancellation signal.
///
/// Every clone observes the same state. Cancelling is idempotent and cannot be undone.
#[derive(Debug, Clone)]
pub struct CancelToken {
    tx: Arc<watch::Sender<bool>>,
    rx: watch::Receiver<bool>,
}

impl Default for CancelToken {
    fn default() -> Self {
        Self::new()
    }
}

impl CancelToken {
    #[must_use]
    pub fn new() -> Self {
        let (tx, rx) = watch::channel(false);
        Self {
            tx: Arc::new(tx),
            rx,
        }
    }

    pub fn cancel(&self) {
        self.tx.send_replace(true);
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolves once the token is cancelled.
    pub async fn cancelled(&self) {
        let mut rx = self.rx.clone();
        // The sender lives in `self`, so `wait_for` only errors after every clone is gone.
        let _ = rx.wait_for(|cancelled| *cancelled).await;
    }
}
