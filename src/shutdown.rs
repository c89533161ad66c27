//! Cooperative shutdown and cancellation
//!
//! A [`ShutdownSignal`] is broadcast to every request handler. Each handler
//! also gets its own [`CancelToken`], fired when the client gives up on the
//! request. The [`InflightTracker`] counts running handlers so the server can
//! drain them before tearing the backend down.

use std::sync::Arc;
use tokio::sync::watch;

/// Process-wide "stop now" broadcast
#[derive(Clone, Debug)]
pub struct ShutdownSignal {
    tx: Arc<watch::Sender<bool>>,
}

impl ShutdownSignal {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    pub fn trigger(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_triggered(&self) -> bool {
        *self.tx.borrow()
    }

    /// Token for one request: cancelled by [`CancelToken::cancel`] or by this signal.
    pub fn token(&self) -> CancelToken {
        let (own_tx, _rx) = watch::channel(false);
        CancelToken {
            own: Arc::new(own_tx),
            shutdown: self.tx.subscribe(),
        }
    }
}

impl Default for ShutdownSignal {
    fn default() -> Self {
        Self::new()
    }
}

/// Cancellation for a single request
#[derive(Clone, Debug)]
pub struct CancelToken {
    own: Arc<watch::Sender<bool>>,
    shutdown: watch::Receiver<bool>,
}

impl CancelToken {
    pub fn cancel(&self) {
        self.own.send_replace(true);
    }

    pub fn is_cancelled(&self) -> bool {
        *self.own.borrow() || *self.shutdown.borrow()
    }

    /// Resolves once the request is cancelled or the server shuts down.
    pub async fn cancelled(&self) {
        let mut own = self.own.subscribe();
        let mut shutdown = self.shutdown.clone();
        tokio::select! {
            _ = wait_true(&mut own) => {}
            _ = wait_true(&mut shutdown) => {}
        }
    }
}

async fn wait_true(rx: &mut watch::Receiver<bool>) {
    let closed = rx.wait_for(|set| *set).await.is_err();
    if closed {
        // Sender gone without ever firing; never resolve.
        std::future::pending::<()>().await;
    }
}

/// Counts running handlers
#[derive(Clone, Debug)]
pub struct InflightTracker {
    tx: Arc<watch::Sender<usize>>,
}

impl InflightTracker {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(0usize);
        Self { tx: Arc::new(tx) }
    }

    /// Count a handler until the returned guard drops.
    pub fn enter(&self) -> InflightGuard {
        self.tx.send_modify(|n| *n += 1);
        InflightGuard {
            tx: Arc::clone(&self.tx),
        }
    }

    pub fn count(&self) -> usize {
        *self.tx.borrow()
    }

    /// Wait until no handler is running.
    pub async fn wait_idle(&self) {
        let mut rx = self.tx.subscribe();
        // The sender lives in self, so the channel cannot close here.
        let _ = rx.wait_for(|n| *n == 0).await;
    }
}

impl Default for InflightTracker {
    fn default() -> Self {
        Self::new()
    }
}

pub struct InflightGuard {
    tx: Arc<watch::Sender<usize>>,
}

impl Drop for InflightGuard {
    fn drop(&mut self) {
        self.tx.send_modify(|n| *n = n.saturating_sub(1));
    }
}
