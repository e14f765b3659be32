//! Lifecycle tracking for upgraded (relayed) connections.
//!
//! # Responsibilities
//! - Give every relay a unique id for tracing
//! - Count relays that are still open
//! - Tell open relays to close at shutdown, then wait for them to drain

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;

/// Relays outlive the HTTP server, so ids are process-wide.
static RELAY_ID_COUNTER: AtomicU64 = AtomicU64::new(1);

/// Unique identifier for a relayed connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RelayId(u64);

impl RelayId {
    pub fn new() -> Self {
        Self(RELAY_ID_COUNTER.fetch_add(1, Ordering::Relaxed))
    }
}

impl Default for RelayId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for RelayId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "relay-{}", self.0)
    }
}

/// Tracks open relays for graceful shutdown.
#[derive(Debug, Clone)]
pub struct ConnectionTracker {
    active_count: Arc<AtomicU64>,
    closing_tx: Arc<watch::Sender<bool>>,
    closing_rx: watch::Receiver<bool>,
}

impl ConnectionTracker {
    pub fn new() -> Self {
        let (tx, rx) = watch::channel(false);
        Self {
            active_count: Arc::new(AtomicU64::new(0)),
            closing_tx: Arc::new(tx),
            closing_rx: rx,
        }
    }

    /// Record a new relay. Returns a guard that decrements on drop.
    pub fn track(&self) -> ConnectionGuard {
        self.active_count.fetch_add(1, Ordering::SeqCst);
        let id = RelayId::new();
        tracing::trace!(relay_id = %id, "Relay opened");
        ConnectionGuard {
            active_count: Arc::clone(&self.active_count),
            id,
        }
    }

    pub fn active_count(&self) -> u64 {
        self.active_count.load(Ordering::SeqCst)
    }

    /// Receiver that flips to `true` once [`close_all`](Self::close_all) runs.
    pub fn closing(&self) -> watch::Receiver<bool> {
        self.closing_rx.clone()
    }

    /// Ask every open relay to shut down.
    pub fn close_all(&self) {
        let _ = self.closing_tx.send(true);
    }

    /// Wait until every relay is gone or `grace` elapses. Returns the number
    /// still open.
    pub async fn drain(&self, grace: Duration) -> u64 {
        let deadline = tokio::time::Instant::now() + grace;
        while self.active_count() > 0 && tokio::time::Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        self.active_count()
    }
}

impl Default for ConnectionTracker {
    fn default() -> Self {
        Self::new()
    }
}

/// Held by a relay task for as long as the relay runs.
#[derive(Debug)]
pub struct ConnectionGuard {
    active_count: Arc<AtomicU64>,
    id: RelayId,
}

impl ConnectionGuard {
    pub fn id(&self) -> RelayId {
        self.id
    }
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.active_count.fetch_sub(1, Ordering::SeqCst);
        tracing::trace!(relay_id = %self.id, "Relay closed");
    }
}

/// Resolves once `closing` reports shutdown, or never if the tracker is gone.
pub async fn closed(mut closing: watch::Receiver<bool>) {
    if closing.wait_for(|closing| *closing).await.is_err() {
        std::future::pending::<()>().await;
    }
}
