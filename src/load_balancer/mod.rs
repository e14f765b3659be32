//! Load balancing subsystem.
//!
//! # Data Flow
//! ```text
//! Request headers + peer address
//!     → affinity.rs (cookie, bearer token, address hints)
//!     → planner.rs (attempt order over every node)
//!         - registry.rs (static node list, lookup by id)
//!         - node.rs (in-flight counts, breaker cell)
//!     → Forwarders walk the order until a node answers
//! ```
//!
//! # Design Decisions
//! - The node list is fixed at startup; nodes are never removed
//! - Circuit-open nodes are demoted, never excluded
//! - In-flight counts are updated by the forwarders through RAII guards

pub mod affinity;
pub mod node;
pub mod planner;
pub mod registry;
