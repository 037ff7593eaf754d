//! Shutdown coordination for the proxy.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;

/// Coordinator for graceful shutdown.
///
/// Servers subscribe and stop accepting once triggered. Cloning shares the
/// same signal.
#[derive(Clone)]
pub struct Shutdown {
    tx: broadcast::Sender<()>,
    triggered: Arc<AtomicBool>,
}

impl Shutdown {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(1);
        Self {
            tx,
            triggered: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Subscribe to the shutdown signal.
    ///
    /// A receiver created after `trigger` will not see the signal; check
    /// [`Shutdown::is_triggered`] first when that matters.
    pub fn subscribe(&self) -> broadcast::Receiver<()> {
        self.tx.subscribe()
    }

    /// Trigger the shutdown signal. Later calls are no-ops.
    pub fn trigger(&self) {
        if !self.triggered.swap(true, Ordering::SeqCst) {
            let _ = self.tx.send(());
        }
    }

    pub fn is_triggered(&self) -> bool {
        self.triggered.load(Ordering::SeqCst)
    }

    /// Wait for `task` to finish, giving up after `deadline`.
    ///
    /// Returns `None` when the deadline passed first.
    pub async fn drain<F: Future>(task: F, deadline: Duration) -> Option<F::Output> {
        match tokio::time::timeout(deadline, task).await {
            Ok(output) => Some(output),
            Err(_) => {
                tracing::warn!(deadline_secs = deadline.as_secs(), "Drain deadline passed; abandoning open connections");
                None
            }
        }
    }
}

impl Default for Shutdown {
    fn default() -> Self {
        Self::new()
    }
}
