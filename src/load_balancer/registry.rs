//! Node registry.
//!
//! # Responsibilities
//! - Own the static list of upstream nodes (index order = config order)
//! - Resolve node ids to indices for affinity lookups
//! - Produce `/healthz` snapshots

use std::sync::Arc;

use crate::config::NodeConfig;
use crate::load_balancer::node::{NodeStatus, UpstreamNode};
use crate::resilience::circuit_breaker::CircuitBreaker;

/// The fixed set of upstream nodes.
#[derive(Debug)]
pub struct NodeRegistry {
    nodes: Vec<Arc<UpstreamNode>>,
}

impl NodeRegistry {
    /// Create a registry from configuration.
    pub fn new(configs: &[NodeConfig]) -> Self {
        let nodes = configs
            .iter()
            .map(|config| Arc::new(UpstreamNode::from(config)))
            .collect();
        Self { nodes }
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&Arc<UpstreamNode>> {
        self.nodes.get(index)
    }

    /// Index of the node with the given id.
    pub fn index_of(&self, id: &str) -> Option<usize> {
        self.nodes.iter().position(|node| node.id == id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<UpstreamNode>> {
        self.nodes.iter()
    }

    /// Status of every node, in registry order.
    pub fn statuses(&self, breaker: &CircuitBreaker) -> Vec<NodeStatus> {
        let now = breaker.now_ms();
        self.nodes
            .iter()
            .map(|node| node.status(breaker.is_open(node, now)))
            .collect()
    }

    /// `id@host:port, ...` for startup logging.
    pub fn describe(&self) -> String {
        self.nodes
            .iter()
            .map(|node| format!("{}@{}", node.id, node.authority()))
            .collect::<Vec<_>>()
            .join(", ")
    }
}
