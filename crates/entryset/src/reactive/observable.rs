//! The `Observable` seam: a [`Store`] that also dispatches [`StoreEvent`]s.
//!
//! [`Observable`] is object safe so registries can hold
//! `Arc<dyn Observable<Item = E>>`; the generic conveniences live on
//! [`ObservableExt`], implemented for every observable.

use std::ops::ControlFlow;
use std::sync::Arc;

use crate::storage::traits::Store;

use super::event::{EventType, StoreEvent, Topic};
use super::event_bus::{Handler, HandlerId};

/// Handler type for store events.
pub type EventHandler<E> = Handler<StoreEvent<E>>;

pub trait Observable: Store {
    /// Register a shared handler under `topic`.
    fn bind_handler(&self, topic: Topic, handler: EventHandler<Self::Item>) -> HandlerId;

    /// Remove registration `id` bound under `topic`.
    fn unbind(&self, topic: &Topic, id: &str) -> bool;

    /// Dispatch `event` to the handlers of `topic` (then the wildcard group).
    fn trigger(&self, topic: &Topic, event: &StoreEvent<Self::Item>) -> usize;
}

// ============================================================================
// SnapshotBinding
// ============================================================================

/// Handlers for [`ObservableExt::snapshot_bind`]. Unset fields are not bound.
pub struct SnapshotBinding<E> {
    pub added: Option<EventHandler<E>>,
    pub updated: Option<EventHandler<E>>,
    pub removed: Option<EventHandler<E>>,
    pub error: Option<EventHandler<E>>,
    pub initialized: Option<EventHandler<E>>,
    pub started: Option<EventHandler<E>>,
}

impl<E> Default for SnapshotBinding<E> {
    fn default() -> Self {
        Self {
            added: None,
            updated: None,
            removed: None,
            error: None,
            initialized: None,
            started: None,
        }
    }
}

impl<E: 'static> SnapshotBinding<E> {
    pub fn on_added(mut self, f: impl Fn(&StoreEvent<E>) + Send + Sync + 'static) -> Self {
        self.added = Some(continuing(f));
        self
    }

    pub fn on_updated(mut self, f: impl Fn(&StoreEvent<E>) + Send + Sync + 'static) -> Self {
        self.updated = Some(continuing(f));
        self
    }

    pub fn on_removed(mut self, f: impl Fn(&StoreEvent<E>) + Send + Sync + 'static) -> Self {
        self.removed = Some(continuing(f));
        self
    }

    pub fn on_error(mut self, f: impl Fn(&StoreEvent<E>) + Send + Sync + 'static) -> Self {
        self.error = Some(continuing(f));
        self
    }
}

fn continuing<E: 'static>(f: impl Fn(&StoreEvent<E>) + Send + Sync + 'static) -> EventHandler<E> {
    Arc::new(move |event: &StoreEvent<E>| {
        f(event);
        ControlFlow::Continue(())
    })
}

// ============================================================================
// ObservableExt
// ============================================================================

pub trait ObservableExt: Observable {
    /// Bind a handler that may stop propagation.
    fn bind(
        &self,
        topic: impl Into<Topic>,
        handler: impl Fn(&StoreEvent<Self::Item>) -> ControlFlow<()> + Send + Sync + 'static,
    ) -> HandlerId
    where
        Self: Sized,
    {
        self.bind_handler(topic.into(), Arc::new(handler))
    }

    /// Bind a handler that never stops propagation.
    fn on(
        &self,
        topic: impl Into<Topic>,
        handler: impl Fn(&StoreEvent<Self::Item>) + Send + Sync + 'static,
    ) -> HandlerId
    where
        Self: Sized,
    {
        self.bind_handler(topic.into(), continuing(handler))
    }

    /// Trigger `event` under its own type.
    fn emit(&self, event: StoreEvent<Self::Item>) -> usize {
        self.trigger(&Topic::Type(event.event_type()), &event)
    }

    /// Bind the supplied handlers; the `added` handler first receives every
    /// entry currently in the store as a synthetic `added` event, so a late
    /// subscriber misses nothing.
    ///
    /// Returns the registration ids in the order they were bound.
    fn snapshot_bind(&self, binding: SnapshotBinding<Self::Item>) -> Vec<HandlerId> {
        let mut ids = Vec::new();

        if let Some(added) = binding.added {
            let replay = self.browse(None, &mut |id, entry| {
                let event = StoreEvent::Added {
                    entry_id: id.clone(),
                    entry: entry.clone(),
                };
                let _ = added(&event);
                ControlFlow::Continue(())
            });
            if let Err(e) = replay {
                tracing::warn!(store = %self.name(), error = %e, "snapshot replay failed");
            }
            ids.push(self.bind_handler(Topic::Type(EventType::Added), added));
        }

        let rest = [
            (EventType::Updated, binding.updated),
            (EventType::Removed, binding.removed),
            (EventType::Error, binding.error),
            (EventType::Initialized, binding.initialized),
            (EventType::Started, binding.started),
        ];
        for (ty, handler) in rest {
            if let Some(handler) = handler {
                ids.push(self.bind_handler(Topic::Type(ty), handler));
            }
        }
        ids
    }
}

impl<T: Observable + ?Sized> ObservableExt for T {}
