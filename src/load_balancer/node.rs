//! Upstream node abstraction.
//!
//! # Responsibilities
//! - Represent a single statically configured upstream node
//! - Track in-flight proxied calls (for least-loaded ordering)
//! - Hold the node's circuit breaker state
//! - Keep lifetime request/failure totals for `/healthz`

use std::ops::Deref;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use serde::Serialize;

use crate::config::NodeConfig;
use crate::resilience::circuit_breaker::BreakerCell;

/// A single upstream node.
#[derive(Debug)]
pub struct UpstreamNode {
    /// Unique node id, also the affinity cookie value.
    pub id: String,
    pub host: String,
    pub port: u16,

    /// Number of currently outstanding proxied calls.
    inflight: AtomicUsize,
    /// Failure streak and cooldown window.
    breaker: BreakerCell,
    total_requests: AtomicU64,
    total_failures: AtomicU64,
}

impl UpstreamNode {
    pub fn new(id: impl Into<String>, host: impl Into<String>, port: u16) -> Self {
        Self {
            id: id.into(),
            host: host.into(),
            port,
            inflight: AtomicUsize::new(0),
            breaker: BreakerCell::default(),
            total_requests: AtomicU64::new(0),
            total_failures: AtomicU64::new(0),
        }
    }

    /// `host:port`, used as the connect target and the forwarded `Host`.
    pub fn authority(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Get the current number of in-flight calls.
    pub fn inflight(&self) -> usize {
        self.inflight.load(Ordering::Relaxed)
    }

    /// Count a new call against this node. The returned guard releases the
    /// in-flight slot when dropped.
    pub fn begin_call(self: &Arc<Self>) -> InflightGuard {
        self.inflight.fetch_add(1, Ordering::Relaxed);
        self.total_requests.fetch_add(1, Ordering::Relaxed);
        InflightGuard { node: self.clone() }
    }

    pub(crate) fn breaker(&self) -> &BreakerCell {
        &self.breaker
    }

    pub(crate) fn record_failure(&self) {
        self.total_failures.fetch_add(1, Ordering::Relaxed);
    }

    /// Snapshot for the health endpoint.
    pub fn status(&self, circuit_open: bool) -> NodeStatus {
        NodeStatus {
            id: self.id.clone(),
            host: self.host.clone(),
            port: self.port,
            inflight: self.inflight(),
            circuit_open,
            total_requests: self.total_requests.load(Ordering::Relaxed),
            total_failures: self.total_failures.load(Ordering::Relaxed),
        }
    }
}

impl From<&NodeConfig> for UpstreamNode {
    fn from(config: &NodeConfig) -> Self {
        Self::new(config.id.clone(), config.host.clone(), config.port)
    }
}

/// Serializable node view returned by `/healthz`.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct NodeStatus {
    pub id: String,
    pub host: String,
    pub port: u16,
    pub inflight: usize,
    pub circuit_open: bool,
    pub total_requests: u64,
    pub total_failures: u64,
}

/// A RAII guard that holds one in-flight slot on a node.
#[derive(Debug)]
pub struct InflightGuard {
    node: Arc<UpstreamNode>,
}

impl Deref for InflightGuard {
    type Target = UpstreamNode;
    fn deref(&self) -> &Self::Target {
        &self.node
    }
}

impl Drop for InflightGuard {
    fn drop(&mut self) {
        self.node.inflight.fetch_sub(1, Ordering::Relaxed);
    }
}
