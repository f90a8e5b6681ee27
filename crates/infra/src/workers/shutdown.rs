//! Cooperative shutdown signal shared by the worker tasks.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;

/// Create a linked trigger/listener pair.
pub fn channel() -> (ShutdownTrigger, Shutdown) {
    let (tx, rx) = watch::channel(false);
    (ShutdownTrigger { tx: Arc::new(tx) }, Shutdown { rx })
}

/// Sending side. Triggering is idempotent.
#[derive(Debug, Clone)]
pub struct ShutdownTrigger {
    tx: Arc<watch::Sender<bool>>,
}

impl ShutdownTrigger {
    pub fn trigger(&self) {
        self.tx.send_replace(true);
    }

    pub fn subscribe(&self) -> Shutdown {
        Shutdown {
            rx: self.tx.subscribe(),
        }
    }

    pub fn is_triggered(&self) -> bool {
        *self.tx.borrow()
    }
}

/// Listening side, one clone per task.
#[derive(Debug, Clone)]
pub struct Shutdown {
    rx: watch::Receiver<bool>,
}

impl Shutdown {
    pub fn is_triggered(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolve once shutdown is triggered (or every trigger is gone).
    pub async fn triggered(&mut self) {
        // Err means all senders were dropped; nothing can trigger any more.
        let _ = self.rx.wait_for(|stop| *stop).await;
    }

    /// Sleep for `duration` unless shutdown comes first.
    ///
    /// Returns `true` when woken by shutdown.
    pub async fn sleep(&mut self, duration: Duration) -> bool {
        if self.is_triggered() {
            return true;
        }
        tokio::select! {
            _ = self.triggered() => true,
            _ = tokio::time::sleep(duration) => false,
        }
    }
}
