//! Cooperative cancellation for long-running loops
//!
//! A [`ShutdownTrigger`] / [`ShutdownSignal`] pair wraps a `watch` channel.
//! Loops check the signal at each suspension point and wind down on their
//! own, so in-flight handler work is never interrupted.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

/// Create a connected trigger/signal pair
pub fn shutdown_channel() -> (ShutdownTrigger, ShutdownSignal) {
    let (tx, rx) = watch::channel(false);
    (ShutdownTrigger { tx: Arc::new(tx) }, ShutdownSignal { rx })
}

/// Sending half: fires the shutdown
#[derive(Debug, Clone)]
pub struct ShutdownTrigger {
    tx: Arc<watch::Sender<bool>>,
}

impl ShutdownTrigger {
    /// Request shutdown. Idempotent.
    pub fn trigger(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_triggered(&self) -> bool {
        *self.tx.borrow()
    }

    /// A fresh signal observing this trigger
    pub fn signal(&self) -> ShutdownSignal {
        ShutdownSignal {
            rx: self.tx.subscribe(),
        }
    }
}

/// Receiving half: observed by loops
#[derive(Debug, Clone)]
pub struct ShutdownSignal {
    rx: watch::Receiver<bool>,
}

impl ShutdownSignal {
    /// A signal that never fires
    pub fn never() -> Self {
        let (trigger, signal) = shutdown_channel();
        drop(trigger);
        signal
    }

    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolves once shutdown was requested. Never resolves if every trigger
    /// was dropped without firing.
    pub async fn cancelled(&self) {
        let mut rx = self.rx.clone();
        loop {
            if *rx.borrow_and_update() {
                return;
            }
            if rx.changed().await.is_err() {
                std::future::pending::<()>().await;
            }
        }
    }

    /// Sleep for `delay` unless shutdown is requested first.
    /// Returns true if the sleep completed, false if it was interrupted.
    pub async fn sleep(&self, delay: Duration) -> bool {
        if self.is_cancelled() {
            return false;
        }
        tokio::select! {
            _ = self.cancelled() => false,
            _ = tokio::time::sleep(delay) => true,
        }
    }

    /// Derive a signal that fires when this one fires or when the returned
    /// trigger is used, whichever comes first. Lets a session stop one of its
    /// loops without stopping the caller.
    pub fn child(&self) -> (ShutdownTrigger, ShutdownSignal) {
        let (trigger, signal) = shutdown_channel();
        let parent = self.clone();
        let tx = trigger.tx.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = parent.cancelled() => {
                    let _ = tx.send(true);
                }
                _ = tx.closed() => {}
            }
        });
        (trigger, signal)
    }
}
