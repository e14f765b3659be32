//! Resilience subsystem.
//!
//! # Data Flow
//! ```text
//! Incoming request:
//!     → admission.rs (admit, queue with deadline, or shed)
//! Each upstream attempt:
//!     → circuit_breaker.rs (count transport failures, open for a cooldown at the threshold)
//! ```
//!
//! # Design Decisions
//! - Admission bounds the whole proxy, not individual nodes
//! - The breaker has no half-open probing; the cooldown simply lapses
//! - Only transport failures count; upstream 5xx responses are successes

pub mod admission;
pub mod circuit_breaker;
