//! DeferredStore: a named placeholder for a store that is registered later.
//!
//! Subscriptions made before the named store exists are queued in call order
//! and replayed against it exactly once, when it appears in the [`Registry`].
//! Handler ids handed out while pending are provisional (`deferred-N`) and
//! stay valid for `unbind` after resolution.
//!
//! Data operations need the real store: before resolution they fail with
//! `NotReady`, and `find` yields nothing.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;

use crate::error::{Result, StoreError};
use crate::query::filter::Filter;
use crate::reactive::event::{EventType, StoreEvent, Topic};
use crate::reactive::event_bus::HandlerId;
use crate::reactive::observable::{EventHandler, Observable, ObservableExt};
use crate::storage::traits::{Store, Visitor};
use crate::types::{BrowseSummary, Entry, EntryId, Updated};

use super::directory::{RegisteredStore, Registry, SharedStore};

enum Pending<E> {
    Bind {
        provisional: HandlerId,
        topic: Topic,
        handler: EventHandler<E>,
    },
    Unbind {
        topic: Topic,
        id: HandlerId,
    },
}

enum Backing<E: Entry> {
    Pending(Vec<Pending<E>>),
    Ready(SharedStore<E>),
}

struct Deferred<E: Entry> {
    name: String,
    backing: Mutex<Backing<E>>,
    /// Provisional id → id on the resolved store.
    resolved_ids: Mutex<HashMap<HandlerId, HandlerId>>,
    next_provisional: AtomicU64,
}

impl<E: Entry> Deferred<E> {
    fn ready(&self) -> Option<SharedStore<E>> {
        match &*self.backing.lock() {
            Backing::Ready(store) => Some(Arc::clone(store)),
            Backing::Pending(_) => None,
        }
    }

    fn store(&self) -> Result<SharedStore<E>> {
        self.ready().ok_or_else(|| StoreError::NotReady {
            name: self.name.clone(),
        })
    }

    /// Switch to `store` and replay the queue. Later calls are no-ops.
    fn resolve(&self, store: SharedStore<E>) {
        let queued = {
            let mut backing = self.backing.lock();
            if matches!(*backing, Backing::Ready(_)) {
                return;
            }
            match std::mem::replace(&mut *backing, Backing::Ready(Arc::clone(&store))) {
                Backing::Pending(queue) => queue,
                Backing::Ready(_) => Vec::new(),
            }
        };

        tracing::debug!(store = %self.name, replayed = queued.len(), "deferred store resolved");
        for op in queued {
            match op {
                Pending::Bind {
                    provisional,
                    topic,
                    handler,
                } => {
                    let id = store.bind_handler(topic, handler);
                    self.resolved_ids.lock().insert(provisional, id);
                }
                Pending::Unbind { topic, id } => {
                    let real = self.resolved_ids.lock().remove(&id);
                    if let Some(real) = real {
                        store.unbind(&topic, &real);
                    }
                }
            }
        }
    }
}

/// Placeholder resolving to the store registered under `name`.
pub struct DeferredStore<E: Entry> {
    shared: Arc<Deferred<E>>,
    registry: Weak<Registry<E>>,
    registry_handler: Option<HandlerId>,
}

impl<E: Entry> DeferredStore<E> {
    /// Resolve immediately if `name` is already registered, else wait for
    /// its registration.
    pub fn new(registry: &Arc<Registry<E>>, name: impl Into<String>) -> Self {
        let shared = Arc::new(Deferred {
            name: name.into(),
            backing: Mutex::new(Backing::Pending(Vec::new())),
            resolved_ids: Mutex::new(HashMap::new()),
            next_provisional: AtomicU64::new(1),
        });

        let registry_handler = match registry.lookup(&shared.name) {
            Some(store) => {
                shared.resolve(store);
                None
            }
            None => {
                let weak = Arc::downgrade(&shared);
                Some(registry.directory().on(
                    EventType::Added,
                    move |event: &StoreEvent<RegisteredStore<E>>| {
                        let (Some(shared), Some(registered)) = (weak.upgrade(), event.entry()) else {
                            return;
                        };
                        if registered.name() == shared.name {
                            shared.resolve(Arc::clone(registered.store()));
                        }
                    },
                ))
            }
        };

        Self {
            shared,
            registry: Arc::downgrade(registry),
            registry_handler,
        }
    }

    pub fn is_ready(&self) -> bool {
        self.shared.ready().is_some()
    }

    /// The resolved store, if any.
    pub fn target(&self) -> Option<SharedStore<E>> {
        self.shared.ready()
    }
}

impl<E: Entry> Drop for DeferredStore<E> {
    fn drop(&mut self) {
        if let (Some(registry), Some(id)) = (self.registry.upgrade(), self.registry_handler.take()) {
            registry
                .directory()
                .unbind(&Topic::Type(EventType::Added), &id);
        }
    }
}

// ============================================================================
// Store
// ============================================================================

impl<E: Entry> Store for DeferredStore<E> {
    type Item = E;

    fn name(&self) -> &str {
        &self.shared.name
    }

    fn init(&self) -> Result<()> {
        self.shared.store()?.init()
    }

    fn start(&self) -> Result<()> {
        self.shared.store()?.start()
    }

    fn create(&self, entry: E) -> Result<(EntryId, E)> {
        self.shared.store()?.create(entry)
    }

    fn read(&self, id: &str) -> Result<E> {
        self.shared.store()?.read(id)
    }

    fn update(&self, id: &str, entry: E) -> Result<Updated<E>> {
        self.shared.store()?.update(id, entry)
    }

    fn update_with_old(&self, id: &str, entry: E, old_entry: E) -> Result<Updated<E>> {
        self.shared.store()?.update_with_old(id, entry, old_entry)
    }

    fn remove(&self, id: &str) -> Result<E> {
        self.shared.store()?.remove(id)
    }

    fn remove_with_old(&self, id: &str, old_entry: E) -> Result<E> {
        self.shared.store()?.remove_with_old(id, old_entry)
    }

    fn browse(&self, filter: Option<&Filter<E>>, visit: &mut Visitor<'_, E>) -> Result<BrowseSummary> {
        self.shared.store()?.browse(filter, visit)
    }

    fn find(&self, filter: &Filter<E>) -> Vec<EntryId> {
        match self.shared.ready() {
            Some(store) => store.find(filter),
            None => Vec::new(),
        }
    }

    fn find_once(&self, filter: &Filter<E>) -> Option<EntryId> {
        self.shared.ready()?.find_once(filter)
    }

    fn remove_all(&self) -> Result<usize> {
        self.shared.store()?.remove_all()
    }
}

// ============================================================================
// Observable
// ============================================================================

impl<E: Entry> Observable for DeferredStore<E> {
    fn bind_handler(&self, topic: Topic, handler: EventHandler<E>) -> HandlerId {
        let store = match &mut *self.shared.backing.lock() {
            Backing::Ready(store) => Arc::clone(store),
            Backing::Pending(queue) => {
                let n = self.shared.next_provisional.fetch_add(1, Ordering::Relaxed);
                let provisional = format!("deferred-{n}");
                queue.push(Pending::Bind {
                    provisional: provisional.clone(),
                    topic,
                    handler,
                });
                return provisional;
            }
        };
        store.bind_handler(topic, handler)
    }

    fn unbind(&self, topic: &Topic, id: &str) -> bool {
        let store = match &mut *self.shared.backing.lock() {
            Backing::Ready(store) => Arc::clone(store),
            Backing::Pending(queue) => {
                let known = queue
                    .iter()
                    .any(|op| matches!(op, Pending::Bind { provisional, .. } if provisional == id));
                if known {
                    queue.push(Pending::Unbind {
                        topic: topic.clone(),
                        id: id.to_string(),
                    });
                }
                return known;
            }
        };
        let real = self.shared.resolved_ids.lock().remove(id);
        store.unbind(topic, real.as_deref().unwrap_or(id))
    }

    fn trigger(&self, topic: &Topic, event: &StoreEvent<E>) -> usize {
        match self.shared.ready() {
            Some(store) => store.trigger(topic, event),
            None => {
                tracing::debug!(store = %self.shared.name, ?topic, "trigger before resolution dropped");
                0
            }
        }
    }
}
