//! Attempt-order planning.
//!
//! # Algorithm
//! ```text
//! all nodes
//!     → drop circuit-open nodes (keep all if none survive)
//!     → sort by in-flight calls, ties rotated by a shared pivot
//!     → move the sticky preference (cookie > token hash > address hash) to the front
//!     → append every node still missing
//! ```
//!
//! # Design Decisions
//! - The order always names every node exactly once; the breaker demotes, never excludes
//! - The pivot advances on every plan, giving round-robin among equally loaded nodes
//! - A sticky preference may point at a circuit-open node and still goes first

use std::net::IpAddr;
use std::sync::atomic::{AtomicUsize, Ordering};

use crate::config::AffinityConfig;
use crate::load_balancer::affinity::{affinity_cookie_header, hash_to_index, RoutingHints};
use crate::load_balancer::node::UpstreamNode;
use crate::load_balancer::registry::NodeRegistry;
use crate::resilience::circuit_breaker::CircuitBreaker;

/// Where a sticky preference came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Preference {
    Cookie(usize),
    Token(usize),
    Address(usize),
}

impl Preference {
    pub fn index(self) -> usize {
        match self {
            Preference::Cookie(i) | Preference::Token(i) | Preference::Address(i) => i,
        }
    }
}

/// The plan for one request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttemptPlan {
    /// Node indices in the order they should be tried.
    pub order: Vec<usize>,
    /// The sticky preference, if any was derived.
    pub preference: Option<Preference>,
    /// The client sent the affinity cookie.
    pub cookie_presented: bool,
}

/// Builds attempt orders and decides when to (re)issue the affinity cookie.
#[derive(Debug)]
pub struct RoutingPlanner {
    pivot: AtomicUsize,
    affinity: AffinityConfig,
}

impl RoutingPlanner {
    pub fn new(affinity: AffinityConfig) -> Self {
        Self {
            pivot: AtomicUsize::new(0),
            affinity,
        }
    }

    pub fn affinity(&self) -> &AffinityConfig {
        &self.affinity
    }

    /// Compute the full attempt order for a request.
    pub fn attempt_order(
        &self,
        hints: &RoutingHints,
        registry: &NodeRegistry,
        breaker: &CircuitBreaker,
    ) -> AttemptPlan {
        let count = registry.len();
        let now = breaker.now_ms();

        let all: Vec<usize> = (0..count).collect();
        let healthy: Vec<usize> = registry
            .iter()
            .enumerate()
            .filter(|(_, node)| !breaker.is_open(node, now))
            .map(|(index, _)| index)
            .collect();
        let base = if healthy.is_empty() { all.clone() } else { healthy };

        let mut sorted = self.sort_by_load(base, registry);
        let preference = self.preferred(hints, registry);
        if let Some(preferred) = preference.map(Preference::index) {
            sorted.retain(|&index| index != preferred);
            sorted.insert(0, preferred);
        }

        let mut order = Vec::with_capacity(count);
        for index in sorted.into_iter().chain(all) {
            if index < count && !order.contains(&index) {
                order.push(index);
            }
        }

        AttemptPlan {
            order,
            preference,
            cookie_presented: hints.has_affinity_cookie(),
        }
    }

    /// Ascending by in-flight count; equal loads ordered by distance from the pivot.
    fn sort_by_load(&self, mut indices: Vec<usize>, registry: &NodeRegistry) -> Vec<usize> {
        let count = registry.len().max(1);
        let pivot = self
            .pivot
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |p| Some((p + 1) % count))
            .unwrap_or(0)
            % count;

        let loads: Vec<usize> = registry.iter().map(|node| node.inflight()).collect();
        indices.sort_by_key(|&index| {
            let load = loads.get(index).copied().unwrap_or(usize::MAX);
            (load, (index + count - pivot) % count)
        });
        indices
    }

    /// Sticky preference for a request, if sticky routing is on.
    pub fn preferred(&self, hints: &RoutingHints, registry: &NodeRegistry) -> Option<Preference> {
        if !self.affinity.sticky_enabled || registry.is_empty() {
            return None;
        }

        if let Some(index) = hints
            .affinity_cookie
            .as_deref()
            .and_then(|id| registry.index_of(id))
        {
            return Some(Preference::Cookie(index));
        }

        if let Some(token) = &hints.bearer_token {
            let index = hash_to_index(&format!("token:{}", token), registry.len());
            return Some(Preference::Token(index));
        }

        hints.remote_addr.map(|addr: IpAddr| {
            Preference::Address(hash_to_index(&format!("ip:{}", addr), registry.len()))
        })
    }

    /// The `Set-Cookie` value to add when attempt number `attempt` goes to `node`.
    pub fn cookie_for_attempt(
        &self,
        plan: &AttemptPlan,
        node: &UpstreamNode,
        attempt: usize,
    ) -> Option<String> {
        if !self.affinity.sticky_enabled || !self.affinity.cookie_enabled {
            return None;
        }
        if attempt == 0 && (plan.cookie_presented || plan.preference.is_some()) {
            return None;
        }
        Some(affinity_cookie_header(&self.affinity, &node.id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{CircuitBreakerConfig, NodeConfig};
    use std::collections::HashSet;

    fn registry(n: usize) -> NodeRegistry {
        let configs: Vec<_> = (0..n)
            .map(|i| NodeConfig::new(format!("node-{}", i + 1), "127.0.0.1", 3000 + i as u16))
            .collect();
        NodeRegistry::new(&configs)
    }

    fn breaker(threshold: u32) -> CircuitBreaker {
        CircuitBreaker::new(&CircuitBreakerConfig {
            failure_threshold: threshold,
            cooldown_ms: 60_000,
        })
    }

    fn sticky(cookie: bool) -> AffinityConfig {
        AffinityConfig {
            sticky_enabled: true,
            cookie_enabled: cookie,
            ..AffinityConfig::default()
        }
    }

    fn is_permutation(order: &[usize], n: usize) -> bool {
        let mut sorted = order.to_vec();
        sorted.sort_unstable();
        sorted == (0..n).collect::<Vec<_>>()
    }

    #[test]
    fn order_is_always_a_permutation() {
        let registry = registry(4);
        let cb = breaker(1);
        let planner = RoutingPlanner::new(sticky(true));
        let hints = RoutingHints {
            remote_addr: Some("10.1.2.3".parse().unwrap()),
            ..RoutingHints::default()
        };

        for round in 0..8 {
            if round % 2 == 0 {
                cb.mark_failure(registry.get(round % 4).unwrap());
            }
            let plan = planner.attempt_order(&hints, &registry, &cb);
            assert!(is_permutation(&plan.order, 4), "{:?}", plan.order);
        }

        // every circuit open: fail open over the whole cluster
        for node in registry.iter() {
            cb.mark_failure(node);
        }
        let plan = planner.attempt_order(&RoutingHints::default(), &registry, &cb);
        assert!(is_permutation(&plan.order, 4));
    }

    #[test]
    fn equal_load_rotates() {
        let registry = registry(3);
        let cb = breaker(6);
        let planner = RoutingPlanner::new(AffinityConfig::default());
        let hints = RoutingHints::default();

        let firsts: Vec<usize> = (0..3)
            .map(|_| planner.attempt_order(&hints, &registry, &cb).order[0])
            .collect();
        assert_eq!(firsts, vec![0, 1, 2]);
        assert_eq!(planner.attempt_order(&hints, &registry, &cb).order, vec![0, 1, 2]);
    }

    #[test]
    fn least_loaded_goes_first() {
        let registry = registry(3);
        let cb = breaker(6);
        let planner = RoutingPlanner::new(AffinityConfig::default());

        let _busy0 = registry.get(0).unwrap().begin_call();
        let _busy2a = registry.get(2).unwrap().begin_call();
        let _busy2b = registry.get(2).unwrap().begin_call();

        let plan = planner.attempt_order(&RoutingHints::default(), &registry, &cb);
        assert_eq!(plan.order, vec![1, 0, 2]);
    }

    #[test]
    fn affinity_cookie_wins() {
        let registry = registry(3);
        let cb = breaker(6);
        let planner = RoutingPlanner::new(sticky(true));
        let hints = RoutingHints {
            affinity_cookie: Some("node-2".into()),
            bearer_token: Some("abc".into()),
            remote_addr: Some("10.0.0.1".parse().unwrap()),
        };

        for _ in 0..3 {
            let plan = planner.attempt_order(&hints, &registry, &cb);
            assert_eq!(plan.order[0], registry.index_of("node-2").unwrap());
            assert_eq!(plan.preference, Some(Preference::Cookie(1)));
        }
    }

    #[test]
    fn unknown_cookie_falls_back_to_token_then_address() {
        let registry = registry(3);
        let cb = breaker(6);
        let planner = RoutingPlanner::new(sticky(true));

        let hints = RoutingHints {
            affinity_cookie: Some("node-9".into()),
            bearer_token: Some("abc".into()),
            remote_addr: Some("10.0.0.1".parse().unwrap()),
        };
        let expected = hash_to_index("token:abc", 3);
        assert_eq!(
            planner.preferred(&hints, &registry),
            Some(Preference::Token(expected))
        );

        let hints = RoutingHints {
            remote_addr: Some("10.0.0.1".parse().unwrap()),
            ..RoutingHints::default()
        };
        let expected = hash_to_index("ip:10.0.0.1", 3);
        assert_eq!(
            planner.preferred(&hints, &registry),
            Some(Preference::Address(expected))
        );
        assert_eq!(planner.attempt_order(&hints, &registry, &cb).order[0], expected);
    }

    #[test]
    fn sticky_disabled_has_no_preference() {
        let registry = registry(3);
        let planner = RoutingPlanner::new(AffinityConfig::default());
        let hints = RoutingHints {
            affinity_cookie: Some("node-2".into()),
            ..RoutingHints::default()
        };
        assert_eq!(planner.preferred(&hints, &registry), None);
    }

    #[test]
    fn preference_overrides_open_circuit() {
        let registry = registry(3);
        let cb = breaker(1);
        let planner = RoutingPlanner::new(sticky(false));
        cb.mark_failure(registry.get(1).unwrap());

        let hints = RoutingHints {
            affinity_cookie: Some("node-2".into()),
            ..RoutingHints::default()
        };
        let plan = planner.attempt_order(&hints, &registry, &cb);
        assert_eq!(plan.order[0], 1);
        assert!(is_permutation(&plan.order, 3));
    }

    #[test]
    fn tripped_node_is_demoted_not_dropped() {
        let registry = registry(3);
        let cb = breaker(6);
        let planner = RoutingPlanner::new(AffinityConfig::default());
        let node1 = registry.get(0).unwrap();

        for _ in 0..6 {
            cb.mark_failure(node1);
        }

        // the pivot would otherwise put node-1 first on some of these rounds
        for _ in 0..3 {
            let plan = planner.attempt_order(&RoutingHints::default(), &registry, &cb);
            assert_ne!(plan.order[0], 0);
            assert_eq!(plan.order[2], 0);
            let unique: HashSet<_> = plan.order.iter().collect();
            assert_eq!(unique.len(), 3);
        }
    }

    #[test]
    fn cookie_write_policy() {
        let registry = registry(3);
        let node = registry.get(2).unwrap();
        let planner = RoutingPlanner::new(sticky(true));

        let fresh = AttemptPlan {
            order: vec![2, 0, 1],
            preference: None,
            cookie_presented: false,
        };
        let cookie = planner.cookie_for_attempt(&fresh, node, 0).unwrap();
        assert!(cookie.starts_with("RDB_INGRESS_AFFINITY=node-3; Path=/"));

        let presented = AttemptPlan {
            preference: Some(Preference::Cookie(2)),
            cookie_presented: true,
            ..fresh.clone()
        };
        assert_eq!(planner.cookie_for_attempt(&presented, node, 0), None);
        assert!(planner.cookie_for_attempt(&presented, node, 1).is_some());

        let hashed = AttemptPlan {
            preference: Some(Preference::Address(2)),
            ..fresh.clone()
        };
        assert_eq!(planner.cookie_for_attempt(&hashed, node, 0), None);
        assert!(planner.cookie_for_attempt(&hashed, node, 2).is_some());

        let no_cookie = RoutingPlanner::new(sticky(false));
        assert_eq!(no_cookie.cookie_for_attempt(&fresh, node, 1), None);
    }
}
