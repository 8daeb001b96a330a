//! EventBus<T>: a type-keyed, ordered, stoppable pub/sub dispatcher.
//!
//! Handler registrations are entries of an internal [`MemoryStore`], so
//! registration order is traversal order and handlers are matched against
//! the triggered topic with the ordinary attribute filters.
//!
//! Dispatch semantics for one `trigger` call:
//!   - The matching registration ids are collected when the call starts; a
//!     handler bound *during* dispatch is not called until the next trigger.
//!   - Each registration is re-read right before its delivery; a handler
//!     unbound during dispatch is skipped (the failed lookup is logged).
//!   - A handler returning `ControlFlow::Break(())` stops delivery for the
//!     rest of the call, wildcard group included.
//!
//! No lock is held while handlers run, so they may `bind`, `unbind` or
//! `trigger` on the same bus.

use std::ops::ControlFlow;
use std::sync::Arc;

use serde_json::{Map, Value};

use crate::query::filter::{attributes_match, Filter};
use crate::storage::memory::{MemoryStore, StoreOptions};
use crate::storage::traits::Store;
use crate::types::{Entry, EntryId};

use super::event::{EventType, Topic};

/// Registration id returned by [`EventBus::bind`].
pub type HandlerId = EntryId;

/// Closure type for bus handlers.
pub type HandlerFn<T> = dyn Fn(&T) -> ControlFlow<()> + Send + Sync;

/// Shared handler reference.
pub type Handler<T> = Arc<HandlerFn<T>>;

// ============================================================================
// Registration
// ============================================================================

/// A `(topic attributes, handler)` pair stored in the bus's internal store.
pub struct Registration<T> {
    attributes: Arc<Map<String, Value>>,
    handler: Handler<T>,
}

impl<T> Clone for Registration<T> {
    fn clone(&self) -> Self {
        Self {
            attributes: Arc::clone(&self.attributes),
            handler: Arc::clone(&self.handler),
        }
    }
}

impl<T: 'static> Entry for Registration<T> {
    fn id(&self) -> Option<EntryId> {
        None
    }

    fn set_id(&mut self, _id: &str) {}

    fn attribute(&self, key: &str) -> Option<&Value> {
        self.attributes.get(key)
    }
}

// ============================================================================
// EventBus
// ============================================================================

pub struct EventBus<T: 'static> {
    name: String,
    registrations: MemoryStore<Registration<T>>,
}

impl<T: 'static> EventBus<T> {
    pub fn new(name: impl Into<String>) -> Self {
        let name = name.into();
        Self {
            registrations: MemoryStore::new(StoreOptions::named(format!("{name}.handlers"))),
            name,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Register `handler` under `topic` and return its registration id.
    pub fn bind(
        &self,
        topic: impl Into<Topic>,
        handler: impl Fn(&T) -> ControlFlow<()> + Send + Sync + 'static,
    ) -> HandlerId {
        self.bind_handler(topic.into(), Arc::new(handler))
    }

    /// Register an already shared handler.
    pub fn bind_handler(&self, topic: Topic, handler: Handler<T>) -> HandlerId {
        let registration = Registration {
            attributes: Arc::new(topic.attributes()),
            handler,
        };
        // The internal store generates ids and never converts, so create
        // cannot fail.
        match self.registrations.create(registration) {
            Ok((id, _)) => id,
            Err(e) => {
                tracing::error!(bus = %self.name, error = %e, "handler registration failed");
                HandlerId::new()
            }
        }
    }

    /// Remove the registration `id` if it was bound under `topic`.
    pub fn unbind(&self, topic: &Topic, id: &str) -> bool {
        let Ok(registration) = self.registrations.read(id) else {
            return false;
        };
        if !attributes_match(&registration, &topic.attributes()) {
            return false;
        }
        self.registrations.remove(id).is_ok()
    }

    /// Remove every registration bound under `topic`. Returns how many were
    /// removed.
    pub fn unbind_all(&self, topic: &Topic) -> usize {
        let ids = self.registrations.find(&Filter::Attributes(topic.attributes()));
        ids.iter()
            .filter(|id| self.registrations.remove(id).is_ok())
            .count()
    }

    /// Deliver `payload` to the handlers of `topic`, then to the wildcard
    /// handlers unless delivery was stopped. Returns the number of handler
    /// invocations.
    pub fn trigger(&self, topic: &Topic, payload: &T) -> usize {
        let (mut count, stopped) = self.dispatch(&topic.attributes(), payload);
        if !stopped && !topic.is_wildcard() {
            let wildcard = Topic::Type(EventType::Any).attributes();
            count += self.dispatch(&wildcard, payload).0;
        }
        count
    }

    /// Number of live registrations.
    pub fn size(&self) -> usize {
        self.registrations.len()
    }

    fn dispatch(&self, attributes: &Map<String, Value>, payload: &T) -> (usize, bool) {
        let ids = self.registrations.find(&Filter::Attributes(attributes.clone()));
        let mut count = 0;

        for id in ids {
            match self.registrations.read(&id) {
                Ok(registration) => {
                    count += 1;
                    if (registration.handler)(payload).is_break() {
                        return (count, true);
                    }
                }
                Err(e) => {
                    tracing::error!(
                        bus = %self.name,
                        handler = %id,
                        error = %e,
                        "handler registration could not be resolved; skipping"
                    );
                }
            }
        }
        (count, false)
    }
}
