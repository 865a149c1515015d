//! Concurrency Limiter.
//!
//! A bounded gate of `max_concurrent_downloads` tickets. A ticket is held by
//! a worker for as long as its job is `downloading` or `processing` and is
//! returned to the gate when dropped.

use std::sync::Arc;

use tokio::sync::{OwnedSemaphorePermit, Semaphore};

/// Bounded counting gate.
#[derive(Debug, Clone)]
pub struct ConcurrencyLimiter {
    semaphore: Arc<Semaphore>,
    capacity: usize,
}

/// A held concurrency slot. Released on drop.
#[derive(Debug)]
pub struct Ticket {
    _permit: OwnedSemaphorePermit,
}

impl ConcurrencyLimiter {
    /// Create a gate with `capacity` tickets.
    pub fn new(capacity: usize) -> Self {
        Self {
            semaphore: Arc::new(Semaphore::new(capacity)),
            capacity,
        }
    }

    /// Take a ticket without waiting; `None` when all are in use.
    pub fn try_acquire(&self) -> Option<Ticket> {
        self.semaphore
            .clone()
            .try_acquire_owned()
            .ok()
            .map(|permit| Ticket { _permit: permit })
    }

    /// Total number of tickets.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Tickets currently free.
    pub fn available(&self) -> usize {
        self.semaphore.available_permits()
    }

    /// Tickets currently held.
    pub fn in_use(&self) -> usize {
        let available = self.available();
        assert!(
            available <= self.capacity,
            "limiter holds {available} free tickets but capacity is {}",
            self.capacity
        );
        self.capacity - available
    }
}
