use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// Concurrency ceiling for executions. Requests past the ceiling are turned
/// away immediately; nothing queues.
#[derive(Debug, Clone)]
pub struct AdmissionLimiter {
    ceiling: usize,
    in_flight: Arc<AtomicUsize>,
}

/// Holds one admission slot until dropped
#[derive(Debug)]
pub struct AdmissionPermit {
    in_flight: Arc<AtomicUsize>,
}

impl AdmissionLimiter {
    pub fn new(ceiling: usize) -> Self {
        Self {
            ceiling,
            in_flight: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn ceiling(&self) -> usize {
        self.ceiling
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    /// Claim a slot, or `None` when the ceiling is reached.
    pub fn try_acquire(&self) -> Option<AdmissionPermit> {
        self.in_flight
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |current| {
                (current < self.ceiling).then_some(current + 1)
            })
            .ok()
            .map(|_| AdmissionPermit {
                in_flight: Arc::clone(&self.in_flight),
            })
    }
}

impl Drop for AdmissionPermit {
    fn drop(&mut self) {
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}
