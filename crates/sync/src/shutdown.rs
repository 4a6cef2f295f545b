//! Cooperative shutdown signalling
//!
//! One [`ShutdownHandle`] per worker group; every worker and retry scheduler
//! holds a [`ShutdownListener`]. Shutdown is checked once per loop iteration
//! and interrupts idle and backoff sleeps, never an in-flight fetch or flush.

use std::time::Duration;

use tokio::sync::watch;

/// Create a connected handle/listener pair
pub fn shutdown_channel() -> (ShutdownHandle, ShutdownListener) {
    let (tx, rx) = watch::channel(false);
    (ShutdownHandle { tx }, ShutdownListener { rx })
}

/// Sending side: requests shutdown of every listener
#[derive(Debug)]
pub struct ShutdownHandle {
    tx: watch::Sender<bool>,
}

impl ShutdownHandle {
    /// Request shutdown. Idempotent.
    pub fn shutdown(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_shutdown(&self) -> bool {
        *self.tx.borrow()
    }

    /// A new listener bound to this handle
    pub fn listener(&self) -> ShutdownListener {
        ShutdownListener {
            rx: self.tx.subscribe(),
        }
    }
}

/// Receiving side, cheap to clone
#[derive(Debug, Clone)]
pub struct ShutdownListener {
    rx: watch::Receiver<bool>,
}

impl ShutdownListener {
    /// A listener that never fires, for components used outside a worker group
    pub fn never() -> Self {
        let (tx, rx) = watch::channel(false);
        // Receivers keep the last value once the sender is gone
        drop(tx);
        Self { rx }
    }

    pub fn is_shutdown(&self) -> bool {
        *self.rx.borrow()
    }

    /// Sleep for `duration` unless shutdown is requested first.
    ///
    /// Returns `true` if the sleep was cut short by shutdown.
    pub async fn sleep(&self, duration: Duration) -> bool {
        if self.is_shutdown() {
            return true;
        }
        let mut rx = self.rx.clone();
        let stopped = async move {
            if rx.wait_for(|stop| *stop).await.is_err() {
                // Sender gone: shutdown can no longer be requested
                std::future::pending::<()>().await;
            }
        };
        tokio::select! {
            _ = tokio::time::sleep(duration) => false,
            _ = stopped => true,
        }
    }
}
