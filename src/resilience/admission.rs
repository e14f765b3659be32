//! Admission control.
//!
//! # Responsibilities
//! - Bound the number of concurrently proxied requests
//! - Queue excess requests FIFO, each with a deadline
//! - Shed immediately once the queue is full
//!
//! # Data Flow
//! ```text
//! enter()
//!     inflight < max_inflight  → admitted (permit)
//!     queue full               → Overloaded::Shed
//!     otherwise                → queued ticket
//!         promoted by a leave()  → admitted (permit)
//!         deadline passes        → removed, Overloaded::QueueTimeout
//!
//! permit dropped → leave() → promote oldest tickets while slots are free
//! ```
//!
//! # Design Decisions
//! - `leave()` only runs from `AdmissionPermit::drop`, so it happens exactly once per admission
//! - A promoted ticket receives its slot already counted in `inflight`
//! - A waiter dropped while queued removes its ticket, or returns a slot it was granted

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use serde::Serialize;
use thiserror::Error;
use tokio::sync::oneshot;

use crate::config::AdmissionConfig;
use crate::observability::metrics;

/// Why a request was not admitted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum Overloaded {
    #[error("ingress inflight limit")]
    Shed,
    #[error("ingress queue timeout")]
    QueueTimeout,
}

impl Overloaded {
    pub fn reason(&self) -> &'static str {
        match self {
            Overloaded::Shed => "shed",
            Overloaded::QueueTimeout => "queue_timeout",
        }
    }
}

/// Point-in-time view of the controller, as reported by `/healthz`.
#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
pub struct AdmissionSnapshot {
    pub inflight: usize,
    pub queued: usize,
    pub shed: u64,
    pub queue_timeout: u64,
    pub max_inflight: usize,
    pub max_queue: usize,
}

#[derive(Debug)]
struct Ticket {
    id: u64,
    wake: oneshot::Sender<()>,
}

#[derive(Debug, Default)]
struct State {
    inflight: usize,
    queue: VecDeque<Ticket>,
    next_ticket: u64,
    shed: u64,
    timeouts: u64,
}

#[derive(Debug)]
struct Inner {
    max_inflight: usize,
    max_queue: usize,
    queue_timeout: Duration,
    state: Mutex<State>,
}

impl Inner {
    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().expect("admission mutex poisoned")
    }

    fn leave(&self) {
        let mut state = self.lock();
        state.inflight = state.inflight.saturating_sub(1);
        self.drain(&mut state);
    }

    /// Promote queued tickets, oldest first, while slots are free.
    fn drain(&self, state: &mut State) {
        while state.inflight < self.max_inflight {
            let Some(ticket) = state.queue.pop_front() else {
                break;
            };
            // A closed receiver belongs to a waiter that already gave up.
            if ticket.wake.send(()).is_ok() {
                state.inflight += 1;
            }
        }
    }
}

/// Bounds concurrent proxied requests. Cheap to clone.
#[derive(Debug, Clone)]
pub struct AdmissionController {
    inner: Arc<Inner>,
}

impl AdmissionController {
    pub fn new(config: &AdmissionConfig) -> Self {
        Self::with_limits(config.max_inflight, config.max_queue, config.queue_timeout())
    }

    pub fn with_limits(max_inflight: usize, max_queue: usize, queue_timeout: Duration) -> Self {
        Self {
            inner: Arc::new(Inner {
                max_inflight: max_inflight.max(1),
                max_queue,
                queue_timeout,
                state: Mutex::new(State::default()),
            }),
        }
    }

    /// Wait for a slot. The returned permit releases it when dropped.
    pub async fn enter(&self) -> Result<AdmissionPermit, Overloaded> {
        let (id, mut wake) = {
            let mut state = self.inner.lock();
            if state.inflight < self.inner.max_inflight {
                state.inflight += 1;
                return Ok(self.permit());
            }
            if state.queue.len() >= self.inner.max_queue {
                state.shed += 1;
                drop(state);
                metrics::record_admission_rejected(Overloaded::Shed.reason());
                return Err(Overloaded::Shed);
            }

            let id = state.next_ticket;
            state.next_ticket += 1;
            let (tx, rx) = oneshot::channel();
            state.queue.push_back(Ticket { id, wake: tx });
            (id, rx)
        };

        let mut waiting = QueuedTicket {
            inner: &self.inner,
            id,
            armed: true,
        };

        // The receiver stays alive until we have looked at the queue, so a
        // promotion racing the deadline always lands.
        let promoted = tokio::time::timeout(self.inner.queue_timeout, &mut wake).await;
        waiting.armed = false;
        if let Ok(Ok(())) = promoted {
            return Ok(self.permit());
        }

        let mut state = self.inner.lock();
        if let Some(pos) = state.queue.iter().position(|t| t.id == id) {
            state.queue.remove(pos);
            state.timeouts += 1;
            drop(state);
            metrics::record_admission_rejected(Overloaded::QueueTimeout.reason());
            return Err(Overloaded::QueueTimeout);
        }
        drop(state);

        // Promoted between the deadline firing and taking the lock: the slot
        // is already counted, so keep it.
        match wake.try_recv() {
            Ok(()) => Ok(self.permit()),
            Err(_) => Err(Overloaded::QueueTimeout),
        }
    }

    fn permit(&self) -> AdmissionPermit {
        AdmissionPermit {
            inner: self.inner.clone(),
        }
    }

    /// Current counters.
    pub fn snapshot(&self) -> AdmissionSnapshot {
        let state = self.inner.lock();
        AdmissionSnapshot {
            inflight: state.inflight,
            queued: state.queue.len(),
            shed: state.shed,
            queue_timeout: state.timeouts,
            max_inflight: self.inner.max_inflight,
            max_queue: self.inner.max_queue,
        }
    }
}

/// One admitted request. Dropping it calls `leave()`.
#[derive(Debug)]
#[must_use = "dropping the permit releases the admission slot"]
pub struct AdmissionPermit {
    inner: Arc<Inner>,
}

impl Drop for AdmissionPermit {
    fn drop(&mut self) {
        self.inner.leave();
    }
}

/// Cleans up after a waiter whose `enter()` future is dropped mid-wait.
struct QueuedTicket<'a> {
    inner: &'a Inner,
    id: u64,
    armed: bool,
}

impl Drop for QueuedTicket<'_> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let mut state = self.inner.lock();
        if let Some(pos) = state.queue.iter().position(|t| t.id == self.id) {
            state.queue.remove(pos);
            return;
        }
        // Already promoted: hand the slot on.
        state.inflight = state.inflight.saturating_sub(1);
        self.inner.drain(&mut state);
    }
}
