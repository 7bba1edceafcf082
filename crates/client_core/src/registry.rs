//! Process-wide fan-out of hub events to any number of listeners sharing one
//! connection.

use std::{
    collections::HashMap,
    panic::{catch_unwind, AssertUnwindSafe},
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, PoisonError, RwLock, Weak,
    },
};

use anyhow::Result;
use serde_json::Value;
use tracing::{debug, error, warn};

pub type EventHandler = Arc<dyn Fn(&Value) -> Result<()> + Send + Sync>;

pub fn handler<F>(f: F) -> EventHandler
where
    F: Fn(&Value) -> Result<()> + Send + Sync + 'static,
{
    Arc::new(f)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

struct Listener {
    id: ListenerId,
    handler: EventHandler,
    // Registrations sharing this handler.
    refs: usize,
}

#[derive(Default)]
pub struct EventRegistry {
    listeners: RwLock<HashMap<String, Vec<Listener>>>,
    next_id: AtomicU64,
}

impl EventRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registering the same handler twice for one event returns the
    /// existing id and does not cause double delivery. The listener stays
    /// registered until every registration is released by id.
    pub fn add_listener(&self, event: &str, handler: EventHandler) -> ListenerId {
        let mut listeners = self.listeners.write().unwrap_or_else(PoisonError::into_inner);
        let entries = listeners.entry(event.to_string()).or_default();
        if let Some(existing) = entries
            .iter_mut()
            .find(|listener| Arc::ptr_eq(&listener.handler, &handler))
        {
            existing.refs += 1;
            return existing.id;
        }
        let id = ListenerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        entries.push(Listener {
            id,
            handler,
            refs: 1,
        });
        debug!(event, listeners = entries.len(), "registry: listener added");
        id
    }

    /// Removes the handler outright, whatever its registration count.
    pub fn remove_listener(&self, event: &str, handler: &EventHandler) -> bool {
        self.release_where(event, |listener| Arc::ptr_eq(&listener.handler, handler), true)
    }

    /// Releases one registration; the listener goes once none remain.
    pub fn remove_listener_by_id(&self, event: &str, id: ListenerId) -> bool {
        self.release_where(event, |listener| listener.id == id, false)
    }

    fn release_where(
        &self,
        event: &str,
        predicate: impl Fn(&Listener) -> bool,
        all: bool,
    ) -> bool {
        let mut listeners = self.listeners.write().unwrap_or_else(PoisonError::into_inner);
        let Some(entries) = listeners.get_mut(event) else {
            return false;
        };
        let Some(index) = entries.iter().position(|listener| predicate(listener)) else {
            return false;
        };
        let listener = &mut entries[index];
        listener.refs = if all { 0 } else { listener.refs - 1 };
        if listener.refs == 0 {
            entries.remove(index);
            debug!(event, "registry: listener removed");
        }
        if entries.is_empty() {
            listeners.remove(event);
        }
        true
    }

    pub fn subscribe(self: &Arc<Self>, event: &str, handler: EventHandler) -> Subscription {
        let id = self.add_listener(event, handler);
        Subscription {
            registry: Arc::downgrade(self),
            event: event.to_string(),
            id,
        }
    }

    pub fn listener_count(&self, event: &str) -> usize {
        self.listeners
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(event)
            .map_or(0, Vec::len)
    }

    /// Invokes every listener registered for `event` before returning. A
    /// listener that errors or panics is logged and skipped. Returns how
    /// many listeners completed successfully.
    pub fn dispatch(&self, event: &str, payload: &Value) -> usize {
        let handlers: Vec<(ListenerId, EventHandler)> = {
            let listeners = self.listeners.read().unwrap_or_else(PoisonError::into_inner);
            match listeners.get(event) {
                Some(entries) => entries
                    .iter()
                    .map(|listener| (listener.id, Arc::clone(&listener.handler)))
                    .collect(),
                None => {
                    debug!(event, "registry: no listeners for event");
                    return 0;
                }
            }
        };

        let mut delivered = 0;
        for (id, handler) in handlers {
            match catch_unwind(AssertUnwindSafe(|| handler(payload))) {
                Ok(Ok(())) => delivered += 1,
                Ok(Err(err)) => {
                    warn!(event, listener = id.0, "registry: listener failed: {err:#}");
                }
                Err(_) => {
                    error!(event, listener = id.0, "registry: listener panicked");
                }
            }
        }
        delivered
    }
}

/// Releases its registration when dropped. Subscriptions sharing one
/// handler keep it registered until the last of them is dropped.
#[must_use = "dropping a Subscription unregisters its listener"]
pub struct Subscription {
    registry: Weak<EventRegistry>,
    event: String,
    id: ListenerId,
}

impl Subscription {
    pub fn event(&self) -> &str {
        &self.event
    }

    pub fn id(&self) -> ListenerId {
        self.id
    }

    pub fn unsubscribe(self) {}
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(registry) = self.registry.upgrade() {
            registry.remove_listener_by_id(&self.event, self.id);
        }
    }
}

#[cfg(test)]
#[path = "tests/registry_tests.rs"]
mod tests;
