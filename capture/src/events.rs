//! In-process fan-out of live events to SSE subscribers.
//!
//! Each subscriber owns a bounded queue.  `publish` never waits: a
//! subscriber whose queue is full is disconnected instead, and its stream
//! ends so the client reconnects and refetches `/status`.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use lapse_common::protocol::Event;

pub struct EventBus {
    subscribers: Mutex<HashMap<u64, mpsc::Sender<Arc<Event>>>>,
    next_id: AtomicU64,
    capacity: usize,
}

/// Receiving side of one subscriber.  Dropping it unsubscribes.
pub struct Subscription {
    id: u64,
    rx: mpsc::Receiver<Arc<Event>>,
    bus: Arc<EventBus>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Arc<Self> {
        Arc::new(EventBus {
            subscribers: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            capacity: capacity.max(1),
        })
    }

    /// Register a receiver.  Only events published afterwards are seen.
    pub fn subscribe(self: &Arc<Self>) -> Subscription {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::channel(self.capacity);
        let total = {
            let mut subs = self.lock();
            subs.insert(id, tx);
            subs.len()
        };
        info!(subscriber = id, total, "Event subscriber connected");
        Subscription {
            id,
            rx,
            bus: Arc::clone(self),
        }
    }

    pub fn unsubscribe(&self, id: u64) {
        if self.lock().remove(&id).is_some() {
            debug!(subscriber = id, "Event subscriber removed");
        }
    }

    /// Deliver to every current subscriber without blocking.
    pub fn publish(&self, event: Event) {
        let event = Arc::new(event);
        let mut subs = self.lock();
        subs.retain(|id, tx| match tx.try_send(Arc::clone(&event)) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!(subscriber = *id, "Event queue full, dropping slow subscriber");
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        });
        debug!(kind = event.kind(), subscribers = subs.len(), "Event published");
    }

    pub fn subscriber_count(&self) -> usize {
        self.lock().len()
    }

    /// Disconnect everyone; open streams end.
    pub fn close_all(&self) {
        self.lock().clear();
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<u64, mpsc::Sender<Arc<Event>>>> {
        self.subscribers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Subscription {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Next event, or `None` once the bus dropped this subscriber.
    pub async fn recv(&mut self) -> Option<Arc<Event>> {
        self.rx.recv().await
    }

    #[cfg(test)]
    pub fn try_recv(&mut self) -> Option<Arc<Event>> {
        self.rx.try_recv().ok()
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.bus.unsubscribe(self.id);
    }
}
