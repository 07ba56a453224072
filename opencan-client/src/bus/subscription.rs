//! Registry of frame subscribers
//!
use std::sync::{Arc, Mutex};

use opencan_common::CanMessage;
use tokio::sync::mpsc::{channel, error::TrySendError, Receiver, Sender};

/// A predicate selecting which frames a subscription receives
pub type FrameFilter = Box<dyn Fn(&CanMessage) -> bool + Send + Sync>;

/// Identifies one subscription on a [FrameBus](crate::FrameBus)
///
/// IDs are allocated from a counter and never reused during the lifetime of a bus.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionId(pub(crate) u64);

struct Subscriber {
    id: SubscriptionId,
    filter: Option<FrameFilter>,
    tx: Sender<CanMessage>,
}

pub(crate) struct Registry {
    next_id: u64,
    capacity: usize,
    subscribers: Vec<Subscriber>,
}

impl Registry {
    pub fn new(capacity: usize) -> Self {
        Self {
            next_id: 0,
            capacity: capacity.max(1),
            subscribers: Vec::new(),
        }
    }

    pub fn create(&mut self, filter: Option<FrameFilter>) -> (SubscriptionId, Receiver<CanMessage>) {
        let id = SubscriptionId(self.next_id);
        self.next_id += 1;
        let (tx, rx) = channel(self.capacity);
        self.subscribers.push(Subscriber { id, filter, tx });
        (id, rx)
    }

    /// Remove a subscriber. Dropping its sender closes the channel.
    pub fn remove(&mut self, id: SubscriptionId) -> bool {
        let before = self.subscribers.len();
        self.subscribers.retain(|s| s.id != id);
        before != self.subscribers.len()
    }

    pub fn len(&self) -> usize {
        self.subscribers.len()
    }

    /// Offer a frame to every subscriber whose filter accepts it
    ///
    /// Never blocks. A full channel loses this frame; a closed channel is unregistered.
    pub fn publish(&mut self, msg: CanMessage) {
        self.subscribers.retain(|sub| {
            if let Some(filter) = &sub.filter {
                if !filter(&msg) {
                    return true;
                }
            }
            match sub.tx.try_send(msg) {
                Ok(()) => true,
                Err(TrySendError::Full(_)) => {
                    log::warn!(
                        "Dropped received message {} due to overflow on subscription {}",
                        msg.id(),
                        sub.id.0
                    );
                    true
                }
                Err(TrySendError::Closed(_)) => false,
            }
        });
    }
}

/// A channel of received frames, registered with a [FrameBus](crate::FrameBus)
///
/// The subscription is removed from the bus when this is dropped.
pub struct Subscription {
    id: SubscriptionId,
    rx: Receiver<CanMessage>,
    registry: Arc<Mutex<Registry>>,
}

impl core::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Subscription").field("id", &self.id).finish()
    }
}

impl Subscription {
    pub(crate) fn new(
        id: SubscriptionId,
        rx: Receiver<CanMessage>,
        registry: Arc<Mutex<Registry>>,
    ) -> Self {
        Self { id, rx, registry }
    }

    /// The ID of this subscription
    pub fn id(&self) -> SubscriptionId {
        self.id
    }

    /// Wait for the next frame
    ///
    /// Returns None once the subscription has been released.
    pub async fn recv(&mut self) -> Option<CanMessage> {
        self.rx.recv().await
    }

    /// Get the next frame if one is already queued
    pub fn try_recv(&mut self) -> Option<CanMessage> {
        self.rx.try_recv().ok()
    }

    /// Remove any pending frames from the queue
    pub fn flush(&mut self) {
        while self.rx.try_recv().is_ok() {}
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Ok(mut registry) = self.registry.lock() {
            registry.remove(self.id);
        }
    }
}
