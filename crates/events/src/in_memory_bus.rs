//! In-memory event bus for tests/dev.

use std::sync::{Mutex, mpsc};

use crate::bus::{BusError, EventBus, Subscription};

/// Messages buffered per subscriber before it counts as lagging.
pub const DEFAULT_SUBSCRIBER_CAPACITY: usize = 1024;

/// In-memory pub/sub bus.
///
/// - No IO
/// - Each subscriber has a bounded buffer. A subscriber that is dropped, or
///   whose buffer is full when a message is published, is pruned: it keeps
///   what was already buffered, then sees a disconnect.
#[derive(Debug)]
pub struct InMemoryEventBus<M> {
    subscribers: Mutex<Vec<mpsc::SyncSender<M>>>,
    capacity: usize,
}

impl<M> InMemoryEventBus<M> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bus whose subscribers buffer at most `capacity` messages (minimum 1).
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            subscribers: Mutex::new(Vec::new()),
            capacity: capacity.max(1),
        }
    }

    /// Number of live subscribers as of the last publish.
    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().map(|s| s.len()).unwrap_or(0)
    }
}

impl<M> Default for InMemoryEventBus<M> {
    fn default() -> Self {
        Self::with_capacity(DEFAULT_SUBSCRIBER_CAPACITY)
    }
}

impl<M> EventBus<M> for InMemoryEventBus<M>
where
    M: Clone + Send + 'static,
{
    fn publish(&self, message: M) -> Result<(), BusError> {
        let mut subs = self.subscribers.lock().map_err(|_| BusError::Poisoned)?;
        let before = subs.len();
        subs.retain(|tx| tx.try_send(message.clone()).is_ok());
        let pruned = before - subs.len();
        if pruned > 0 {
            tracing::debug!(pruned, "pruned dropped or lagging subscribers");
        }
        Ok(())
    }

    fn subscribe(&self) -> Subscription<M> {
        let (tx, rx) = mpsc::sync_channel(self.capacity);

        // A poisoned lock still yields a subscription; it just stays silent.
        if let Ok(mut subs) = self.subscribers.lock() {
            subs.push(tx);
        }

        Subscription::new(rx)
    }
}
