//! Fire-once lifecycle signals observable by any number of waiters.

use std::sync::Arc;

use tokio::sync::watch;

/// A latch that fires once and stays fired.
///
/// Late waiters return immediately, which a plain `Notify` would not give us.
#[derive(Debug, Clone)]
pub struct Signal {
    tx: Arc<watch::Sender<bool>>,
}

impl Signal {
    /// Create an unfired signal.
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    /// Fire the signal. Firing twice is a no-op.
    pub fn fire(&self) {
        self.tx.send_replace(true);
    }

    /// Whether the signal has fired.
    pub fn is_fired(&self) -> bool {
        *self.tx.borrow()
    }

    /// Wait until the signal fires.
    pub async fn wait(&self) {
        let mut rx = self.tx.subscribe();
        // The sender lives in `self`, so the channel cannot close under us.
        let _ = rx.wait_for(|fired| *fired).await;
    }
}

impl Default for Signal {
    fn default() -> Self {
        Self::new()
    }
}

/// The pair of signals describing one pool incarnation's shutdown.
#[derive(Debug, Clone, Default)]
pub struct LifecycleSignals {
    shutdown_started: Signal,
    shutdown_completed: Signal,
}

impl LifecycleSignals {
    /// Fresh, unfired signals.
    pub fn new() -> Self {
        Self::default()
    }

    /// Fires when the pool stops accepting new work.
    pub fn shutdown_started(&self) -> &Signal {
        &self.shutdown_started
    }

    /// Fires when every connection of the pool is closed.
    pub fn shutdown_completed(&self) -> &Signal {
        &self.shutdown_completed
    }
}
