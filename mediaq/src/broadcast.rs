//! Event Broadcaster.
//!
//! Fans job events out to every live subscriber. Each subscriber owns a
//! bounded buffer; delivery uses `try_send`, and a subscriber whose buffer is
//! full or whose receiver is gone is dropped instead of stalling the others.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::{debug, warn};

use crate::domain::JobEvent;

/// Default per-subscriber buffer size.
pub const DEFAULT_SUBSCRIBER_BUFFER: usize = 64;

type Registry = Mutex<HashMap<u64, mpsc::Sender<JobEvent>>>;

/// Receiving end of a live-update subscription. Unsubscribes on drop.
#[derive(Debug)]
pub struct Subscription {
    id: u64,
    rx: mpsc::Receiver<JobEvent>,
    registry: Weak<Registry>,
}

impl Subscription {
    /// Subscriber id.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Wait for the next event. `None` once the subscriber was dropped by the
    /// broadcaster and the buffer is drained.
    pub async fn recv(&mut self) -> Option<JobEvent> {
        self.rx.recv().await
    }

    /// Take the next buffered event without waiting.
    pub fn try_recv(&mut self) -> Option<JobEvent> {
        self.rx.try_recv().ok()
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(registry) = self.registry.upgrade()
            && registry.lock().remove(&self.id).is_some()
        {
            debug!(subscriber = self.id, "Subscriber disconnected");
        }
    }
}

/// Non-blocking fan-out to live subscribers.
pub struct EventBroadcaster {
    subscribers: Arc<Registry>,
    next_id: AtomicU64,
    buffer: usize,
}

impl EventBroadcaster {
    /// Create a broadcaster whose subscribers buffer up to `buffer` events.
    pub fn new(buffer: usize) -> Self {
        Self {
            subscribers: Arc::new(Mutex::new(HashMap::new())),
            next_id: AtomicU64::new(1),
            buffer: buffer.max(1),
        }
    }

    /// Register a new subscriber.
    pub fn subscribe(&self) -> Subscription {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::channel(self.buffer);
        self.subscribers.lock().insert(id, tx);
        debug!(subscriber = id, "Subscriber connected");
        Subscription {
            id,
            rx,
            registry: Arc::downgrade(&self.subscribers),
        }
    }

    /// Push an event to every subscriber. Returns the number of deliveries.
    pub fn publish(&self, event: JobEvent) -> usize {
        let mut subscribers = self.subscribers.lock();
        let mut delivered = 0;

        subscribers.retain(|id, tx| match tx.try_send(event.clone()) {
            Ok(()) => {
                delivered += 1;
                true
            }
            Err(TrySendError::Full(_)) => {
                warn!(subscriber = id, "Subscriber buffer full, disconnecting");
                false
            }
            Err(TrySendError::Closed(_)) => {
                debug!(subscriber = id, "Subscriber gone");
                false
            }
        });

        delivered
    }

    /// Number of connected subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().len()
    }
}

impl Default for EventBroadcaster {
    fn default() -> Self {
        Self::new(DEFAULT_SUBSCRIBER_BUFFER)
    }
}
