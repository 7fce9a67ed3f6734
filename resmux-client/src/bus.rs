//! Namespaced event bus.
//!
//! A small synchronous pub/sub surface: handlers attach to a `(target,
//! event)` pair and receive the full namespaced event path along with a
//! typed payload. Resource events dispatch under
//! `<namespace>.resource.<rid>.<name>`; client-level events (empty target)
//! under `<namespace>.<name>`.
//!
//! Panics raised by user handlers are caught at the dispatch site and
//! logged; they never unwind into the client.

use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use serde_json::Value;

use crate::error::Error;
use crate::model::Model;
use crate::resource::Resource;

// ─── Payloads ─────────────────────────────────────────────────────────────

/// Payload delivered to event handlers.
#[derive(Debug, Clone)]
pub enum EventPayload {
    /// A model changed. Maps each changed key to its previous value;
    /// `None` marks a key that did not exist before.
    Change { old: HashMap<String, Option<Value>> },

    /// A model was inserted into a collection.
    Add { item: Model, idx: usize },

    /// A model was removed from a collection.
    Remove { item: Model, idx: usize },

    /// The server dropped its subscription for this resource.
    Unsubscribe { item: Resource },

    /// A pass-through event with no special client handling.
    Custom { name: String, data: Option<Value> },

    /// The connection is open and resynchronized.
    Connect,

    /// The connection closed.
    Close,

    /// A client-level error: failed request, malformed frame, integrity
    /// violation.
    Error { error: Error },
}

/// Handler signature: full event path plus payload.
pub type EventHandler = Arc<dyn Fn(&str, &EventPayload) + Send + Sync>;

/// Opaque id returned by `on`, used to detach the handler again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HandlerId(u64);

// ─── Bus ──────────────────────────────────────────────────────────────────

struct Registration {
    id: u64,
    handler: EventHandler,
}

pub(crate) struct EventBus {
    namespace: String,
    next_id: AtomicU64,
    handlers: Mutex<HashMap<(String, String), Vec<Registration>>>,
}

impl EventBus {
    pub(crate) fn new(namespace: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            next_id: AtomicU64::new(1),
            handlers: Mutex::new(HashMap::new()),
        }
    }

    /// Attaches `handler` to each space-separated event name in `events`,
    /// scoped to `target`. One id covers the whole attachment.
    pub(crate) fn on(&self, target: &str, events: &str, handler: EventHandler) -> HandlerId {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let mut map = self.handlers.lock().unwrap();
        for event in events.split_whitespace() {
            map.entry((target.to_string(), event.to_string()))
                .or_default()
                .push(Registration {
                    id,
                    handler: handler.clone(),
                });
        }
        HandlerId(id)
    }

    /// Detaches the handler registered under `id` from the given events.
    /// Returns `true` if at least one registration was removed.
    pub(crate) fn off(&self, target: &str, events: &str, id: HandlerId) -> bool {
        let mut removed = false;
        let mut map = self.handlers.lock().unwrap();
        for event in events.split_whitespace() {
            let key = (target.to_string(), event.to_string());
            if let Some(regs) = map.get_mut(&key) {
                let before = regs.len();
                regs.retain(|r| r.id != id.0);
                removed |= regs.len() != before;
                if regs.is_empty() {
                    map.remove(&key);
                }
            }
        }
        removed
    }

    /// Synchronously dispatches an event to every handler attached to
    /// `(target, event)`.
    pub(crate) fn emit(&self, target: &str, event: &str, payload: &EventPayload) {
        let path = if target.is_empty() {
            format!("{}.{}", self.namespace, event)
        } else {
            format!("{}.resource.{}.{}", self.namespace, target, event)
        };

        // Snapshot under the lock; dispatch outside it so handlers can
        // attach and detach freely.
        let snapshot: Vec<EventHandler> = {
            let map = self.handlers.lock().unwrap();
            map.get(&(target.to_string(), event.to_string()))
                .map(|regs| regs.iter().map(|r| r.handler.clone()).collect())
                .unwrap_or_default()
        };

        for handler in snapshot {
            if catch_unwind(AssertUnwindSafe(|| handler(&path, payload))).is_err() {
                tracing::warn!(event = %path, "event handler panicked");
            }
        }
    }
}

// ─── Tests ────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn counter_handler(count: Arc<AtomicUsize>) -> EventHandler {
        Arc::new(move |_, _| {
            count.fetch_add(1, Ordering::SeqCst);
        })
    }

    #[test]
    fn emit_reaches_attached_handler() {
        let bus = EventBus::new("resclient");
        let count = Arc::new(AtomicUsize::new(0));
        bus.on("user.42", "change", counter_handler(count.clone()));

        bus.emit("user.42", "change", &EventPayload::Connect);
        bus.emit("user.43", "change", &EventPayload::Connect);
        bus.emit("user.42", "add", &EventPayload::Connect);

        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn space_separated_events_share_one_id() {
        let bus = EventBus::new("resclient");
        let count = Arc::new(AtomicUsize::new(0));
        let id = bus.on("rooms", "add remove", counter_handler(count.clone()));

        bus.emit("rooms", "add", &EventPayload::Connect);
        bus.emit("rooms", "remove", &EventPayload::Connect);
        assert_eq!(count.load(Ordering::SeqCst), 2);

        assert!(bus.off("rooms", "add remove", id));
        bus.emit("rooms", "add", &EventPayload::Connect);
        assert_eq!(count.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn off_unknown_id_is_noop() {
        let bus = EventBus::new("resclient");
        let count = Arc::new(AtomicUsize::new(0));
        bus.on("rooms", "add", counter_handler(count.clone()));

        assert!(!bus.off("rooms", "add", HandlerId(999)));
        bus.emit("rooms", "add", &EventPayload::Connect);
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn event_path_is_namespaced() {
        let bus = EventBus::new("resclient");
        let seen: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
        let seen2 = seen.clone();
        bus.on(
            "user.42",
            "change",
            Arc::new(move |path, _| seen2.lock().unwrap().push(path.to_string())),
        );
        let seen3 = seen.clone();
        bus.on(
            "",
            "connect",
            Arc::new(move |path, _| seen3.lock().unwrap().push(path.to_string())),
        );

        bus.emit("user.42", "change", &EventPayload::Connect);
        bus.emit("", "connect", &EventPayload::Connect);

        let seen = seen.lock().unwrap();
        assert_eq!(seen[0], "resclient.resource.user.42.change");
        assert_eq!(seen[1], "resclient.connect");
    }

    #[test]
    fn handler_panic_does_not_propagate() {
        let bus = EventBus::new("resclient");
        let count = Arc::new(AtomicUsize::new(0));
        bus.on("user.42", "change", Arc::new(|_, _| panic!("boom")));
        bus.on("user.42", "change", counter_handler(count.clone()));

        bus.emit("user.42", "change", &EventPayload::Connect);
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }
}
