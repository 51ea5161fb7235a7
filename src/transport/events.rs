//! Multi-subscriber event fan-out
//!
//! Handlers run synchronously on the emitting task and must not block;
//! anything that needs to await should forward the event into a channel.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::{Arc, Weak};

use crate::protocol::{EventKind, TransportEvent};

type Handler = Arc<dyn Fn(&TransportEvent) + Send + Sync>;

#[derive(Default)]
struct Registry {
    next_id: u64,
    by_kind: HashMap<EventKind, Vec<(u64, Handler)>>,
    any: Vec<(u64, Handler)>,
}

/// Event bus shared by the adapter and its observers
#[derive(Clone, Default)]
pub struct EventBus {
    registry: Arc<Mutex<Registry>>,
}

/// Handle returned by [`EventBus::on`]; removes exactly one handler
#[must_use = "dropping a Subscription keeps the handler registered; call unsubscribe() to remove it"]
pub struct Subscription {
    registry: Weak<Mutex<Registry>>,
    kind: Option<EventKind>,
    id: u64,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler for one event kind
    pub fn on<F>(&self, kind: EventKind, handler: F) -> Subscription
    where
        F: Fn(&TransportEvent) + Send + Sync + 'static,
    {
        let mut registry = self.registry.lock();
        let id = registry.next_id;
        registry.next_id += 1;
        registry
            .by_kind
            .entry(kind)
            .or_default()
            .push((id, Arc::new(handler)));

        Subscription {
            registry: Arc::downgrade(&self.registry),
            kind: Some(kind),
            id,
        }
    }

    /// Register a handler for every event
    pub fn on_any<F>(&self, handler: F) -> Subscription
    where
        F: Fn(&TransportEvent) + Send + Sync + 'static,
    {
        let mut registry = self.registry.lock();
        let id = registry.next_id;
        registry.next_id += 1;
        registry.any.push((id, Arc::new(handler)));

        Subscription {
            registry: Arc::downgrade(&self.registry),
            kind: None,
            id,
        }
    }

    /// Deliver an event to every matching handler
    pub fn emit(&self, event: &TransportEvent) {
        // Snapshot so handlers may (un)subscribe without deadlocking
        let handlers: Vec<Handler> = {
            let registry = self.registry.lock();
            registry
                .by_kind
                .get(&event.kind())
                .into_iter()
                .flatten()
                .chain(registry.any.iter())
                .map(|(_, handler)| handler.clone())
                .collect()
        };

        tracing::debug!("Emitting {:?} to {} handler(s)", event.kind(), handlers.len());
        for handler in handlers {
            handler(event);
        }
    }

    /// Number of handlers that would receive an event of this kind
    pub fn handler_count(&self, kind: EventKind) -> usize {
        let registry = self.registry.lock();
        registry.by_kind.get(&kind).map_or(0, Vec::len) + registry.any.len()
    }
}

impl Subscription {
    pub fn unsubscribe(self) {
        let Some(registry) = self.registry.upgrade() else {
            return;
        };
        let mut registry = registry.lock();
        let list = match self.kind {
            Some(kind) => match registry.by_kind.get_mut(&kind) {
                Some(list) => list,
                None => return,
            },
            None => &mut registry.any,
        };
        list.retain(|(id, _)| *id != self.id);
    }
}
