//! Circuit breaker for upstream nodes.
//!
//! # States
//! - Closed: `open_until_ms == 0` or already elapsed; node is in the healthy set
//! - Open: `open_until_ms` is in the future; node is demoted behind healthy ones
//!
//! # State Transitions
//! ```text
//! Closed → Open: consecutive failures >= threshold (counter resets to 0)
//! Open → Closed: cooldown elapses (no probe), or any success
//! ```
//!
//! # Design Decisions
//! - Per-node circuit breaker (not global)
//! - No half-open state: after the cooldown the very next outcome decides
//! - An open circuit demotes a node, it never removes it from the attempt order
//! - Timestamps are milliseconds since the breaker was created, so 0 means closed

use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};

use crate::config::CircuitBreakerConfig;
use crate::load_balancer::node::UpstreamNode;
use crate::observability::metrics;

/// Failure bookkeeping stored on every node.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct BreakerState {
    pub consecutive_failures: u32,
    pub open_until_ms: u64,
}

/// Per-node breaker state behind a short critical section.
#[derive(Debug, Default)]
pub struct BreakerCell(Mutex<BreakerState>);

impl BreakerCell {
    fn lock(&self) -> MutexGuard<'_, BreakerState> {
        self.0.lock().expect("breaker mutex poisoned")
    }

    /// Copy of the current state.
    pub fn get(&self) -> BreakerState {
        *self.lock()
    }
}

/// Breaker policy shared by all nodes.
#[derive(Debug)]
pub struct CircuitBreaker {
    failure_threshold: u32,
    cooldown: Duration,
    epoch: Instant,
}

impl CircuitBreaker {
    pub fn new(config: &CircuitBreakerConfig) -> Self {
        Self {
            failure_threshold: config.failure_threshold.max(1),
            cooldown: Duration::from_millis(config.cooldown_ms),
            epoch: Instant::now(),
        }
    }

    /// Milliseconds on the breaker clock.
    pub fn now_ms(&self) -> u64 {
        self.epoch.elapsed().as_millis() as u64
    }

    fn cooldown_ms(&self) -> u64 {
        u64::try_from(self.cooldown.as_millis()).unwrap_or(u64::MAX)
    }

    pub fn failure_threshold(&self) -> u32 {
        self.failure_threshold
    }

    /// A call to `node` completed: forget the failure streak and close the circuit.
    pub fn mark_success(&self, node: &UpstreamNode) {
        let mut state = node.breaker().lock();
        state.consecutive_failures = 0;
        state.open_until_ms = 0;
    }

    /// A call to `node` failed at the transport level.
    pub fn mark_failure(&self, node: &UpstreamNode) {
        self.mark_failure_at(node, self.now_ms());
    }

    /// `mark_failure` against an explicit clock reading.
    pub fn mark_failure_at(&self, node: &UpstreamNode, now_ms: u64) {
        node.record_failure();

        let opened = {
            let mut state = node.breaker().lock();
            state.consecutive_failures += 1;
            if state.consecutive_failures >= self.failure_threshold {
                state.open_until_ms = now_ms.saturating_add(self.cooldown_ms());
                state.consecutive_failures = 0;
                true
            } else {
                false
            }
        };

        if opened {
            tracing::warn!(
                node = %node.id,
                cooldown_ms = self.cooldown_ms(),
                "Circuit opened"
            );
            metrics::record_circuit_opened(&node.id);
        }
    }

    /// True while the node's cooldown window is in the future.
    pub fn is_open(&self, node: &UpstreamNode, now_ms: u64) -> bool {
        node.breaker().get().open_until_ms > now_ms
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn breaker(threshold: u32, cooldown_ms: u64) -> CircuitBreaker {
        CircuitBreaker::new(&CircuitBreakerConfig {
            failure_threshold: threshold,
            cooldown_ms,
        })
    }

    fn node() -> UpstreamNode {
        UpstreamNode::new("node-1", "127.0.0.1", 3000)
    }

    #[test]
    fn opens_at_threshold_and_resets_counter() {
        let cb = breaker(3, 800);
        let node = node();

        cb.mark_failure_at(&node, 100);
        cb.mark_failure_at(&node, 100);
        assert!(!cb.is_open(&node, 100));
        assert_eq!(node.breaker().get().consecutive_failures, 2);

        cb.mark_failure_at(&node, 100);
        let state = node.breaker().get();
        assert_eq!(state.consecutive_failures, 0);
        assert_eq!(state.open_until_ms, 900);
        assert!(cb.is_open(&node, 100));
        assert_eq!(node.status(false).total_failures, 3);
    }

    #[test]
    fn closes_once_cooldown_elapses() {
        let cb = breaker(2, 800);
        let node = node();
        cb.mark_failure_at(&node, 1_000);
        cb.mark_failure_at(&node, 1_000);

        assert!(cb.is_open(&node, 1_799));
        // open iff strictly in the future
        assert!(!cb.is_open(&node, 1_800));
        assert!(!cb.is_open(&node, 5_000));
    }

    #[test]
    fn single_failure_after_cooldown_restarts_from_one() {
        let cb = breaker(2, 10);
        let node = node();
        cb.mark_failure_at(&node, 0);
        cb.mark_failure_at(&node, 0);
        assert!(!cb.is_open(&node, 20));

        cb.mark_failure_at(&node, 20);
        assert!(!cb.is_open(&node, 20));
        assert_eq!(node.breaker().get().consecutive_failures, 1);
    }

    #[test]
    fn success_clears_streak_and_circuit() {
        let cb = breaker(3, 800);
        let node = node();
        cb.mark_failure_at(&node, 0);
        cb.mark_failure_at(&node, 0);
        cb.mark_success(&node);
        assert_eq!(node.breaker().get(), BreakerState::default());

        for _ in 0..3 {
            cb.mark_failure_at(&node, 0);
        }
        assert!(cb.is_open(&node, 0));
        cb.mark_success(&node);
        assert!(!cb.is_open(&node, 0));
        // total failures survive a success
        assert_eq!(node.status(false).total_failures, 5);
    }

    #[test]
    fn huge_cooldown_saturates_instead_of_wrapping() {
        let cb = breaker(1, u64::MAX);
        let node = node();
        cb.mark_failure_at(&node, 5_000);

        assert_eq!(node.breaker().get().open_until_ms, u64::MAX);
        assert!(cb.is_open(&node, 10_000));
    }
}
