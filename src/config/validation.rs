//! Configuration validation.
//!
//! # Responsibilities
//! - Semantic validation (serde handles syntactic)
//! - Validate the node list (non-empty, unique ids)
//! - Validate value ranges (timeouts > 0, limits > 0)
//!
//! # Design Decisions
//! - Returns all validation errors, not just first
//! - Validation is pure function: IngressConfig → Result<(), Vec<ValidationError>>
//! - Runs before config is accepted into the system

use std::collections::HashSet;

use thiserror::Error;

use crate::config::schema::IngressConfig;

/// A single semantic problem with a configuration.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("no upstream nodes configured (set INGRESS_NODES, SERVER_CLUSTER_NODES, or CLUSTER_NODES)")]
    NoNodes,

    #[error("duplicate upstream node id: {0}")]
    DuplicateNodeId(String),

    #[error("{field} must be greater than zero")]
    NotPositive { field: &'static str },

    #[error("invalid affinity cookie name: {0:?}")]
    InvalidCookieName(String),
}

/// Validate a fully merged configuration.
pub fn validate_config(config: &IngressConfig) -> Result<(), Vec<ValidationError>> {
    let mut errors = Vec::new();

    if config.upstream.nodes.is_empty() {
        errors.push(ValidationError::NoNodes);
    }

    let mut ids = HashSet::new();
    for node in &config.upstream.nodes {
        if !ids.insert(node.id.as_str()) {
            errors.push(ValidationError::DuplicateNodeId(node.id.clone()));
        }
    }

    let positive: [(&'static str, u64); 8] = [
        ("listener.port", u64::from(config.listener.port)),
        ("upstream.timeout_ms", config.upstream.timeout_ms),
        ("upstream.max_body_bytes", config.upstream.max_body_bytes as u64),
        ("circuit_breaker.failure_threshold", u64::from(config.circuit_breaker.failure_threshold)),
        ("circuit_breaker.cooldown_ms", config.circuit_breaker.cooldown_ms),
        ("admission.max_inflight", config.admission.max_inflight as u64),
        ("admission.queue_timeout_ms", config.admission.queue_timeout_ms),
        ("pool.max_sockets", config.pool.max_sockets as u64),
    ];
    for (field, value) in positive {
        if value == 0 {
            errors.push(ValidationError::NotPositive { field });
        }
    }

    let name = &config.affinity.cookie_name;
    let valid_name = !name.is_empty()
        && name
            .bytes()
            .all(|b| b.is_ascii_graphic() && !b"()<>@,;:\\\"/[]?={}".contains(&b));
    if !valid_name {
        errors.push(ValidationError::InvalidCookieName(name.clone()));
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::nodes::NodeConfig;

    fn with_nodes(nodes: Vec<NodeConfig>) -> IngressConfig {
        let mut config = IngressConfig::default();
        config.upstream.nodes = nodes;
        config
    }

    #[test]
    fn accepts_minimal_config() {
        let config = with_nodes(vec![NodeConfig::new("node-1", "127.0.0.1", 3000)]);
        assert!(validate_config(&config).is_ok());
    }

    #[test]
    fn collects_every_error() {
        let mut config = with_nodes(vec![
            NodeConfig::new("a", "127.0.0.1", 3000),
            NodeConfig::new("a", "127.0.0.1", 3001),
        ]);
        config.admission.max_inflight = 0;
        config.affinity.cookie_name = "bad name".into();

        let errors = validate_config(&config).unwrap_err();
        assert!(errors.contains(&ValidationError::DuplicateNodeId("a".into())));
        assert!(errors.contains(&ValidationError::NotPositive {
            field: "admission.max_inflight"
        }));
        assert!(errors.contains(&ValidationError::InvalidCookieName("bad name".into())));
    }

    #[test]
    fn empty_node_list_is_rejected() {
        let errors = validate_config(&IngressConfig::default()).unwrap_err();
        assert_eq!(errors, vec![ValidationError::NoNodes]);
    }
}
