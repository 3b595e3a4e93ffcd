use parking_lot::RwLock;

use crate::core::types::Block;

/// The chain lifecycle notifications subscribers can observe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    BlockAccepted,
    BlockConnected,
    BlockDisconnected,
    BlockPersistCompleted,
    RollbackTransaction,
}

type Handler = Box<dyn Fn(&Block) + Send + Sync>;

/// Synchronous multicast event bus. Delivery happens on the thread that
/// mutated the chain, before the chain writer lock is released, so
/// handlers observe a consistent tip. Handlers must not call back into
/// chain mutators.
#[derive(Default)]
pub struct EventBus {
    subscribers: RwLock<Vec<(EventKind, Handler)>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe<F>(&self, kind: EventKind, handler: F)
    where
        F: Fn(&Block) + Send + Sync + 'static,
    {
        self.subscribers.write().push((kind, Box::new(handler)));
    }

    pub fn notify(&self, kind: EventKind, block: &Block) {
        for (subscribed, handler) in self.subscribers.read().iter() {
            if *subscribed == kind {
                handler(block);
            }
        }
    }
}
