//! ObservableStore<S>: wraps a [`Store`] with an [`EventBus`] so that every
//! successful mutation is announced to subscribers.
//!
//! Failures are both returned to the caller and emitted as `error` events;
//! nothing is thrown past the operation boundary.

use std::ops::ControlFlow;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::error::{Result, StoreError};
use crate::query::filter::Filter;
use crate::storage::memory::{MemoryStore, StoreOptions};
use crate::storage::traits::{Store, Visitor};
use crate::types::{BrowseSummary, Entry, EntryId, Operation, Updated};

use super::event::{ErrorEvent, StoreEvent, Topic};
use super::event_bus::{EventBus, HandlerId};
use super::observable::{EventHandler, Observable, ObservableExt};

// ============================================================================
// ObservableOptions
// ============================================================================

/// Event policy for an [`ObservableStore`].
#[derive(Debug, Clone)]
pub struct ObservableOptions {
    /// Overrides the inner store's name in logs and error descriptors.
    pub name: Option<String>,
    /// Announce every update as `removed` followed by `added`, for observers
    /// that cannot diff.
    pub use_removed_added: bool,
    /// Emit `added`/`updated`/`removed` after mutations (default: true).
    pub events_enabled: bool,
    /// On `start()`, re-read each browsed id before replaying it, for
    /// backings whose listings carry ids only (default: true).
    pub replay_with_read: bool,
}

impl Default for ObservableOptions {
    fn default() -> Self {
        Self {
            name: None,
            use_removed_added: false,
            events_enabled: true,
            replay_with_read: true,
        }
    }
}

// ============================================================================
// ObservableStore
// ============================================================================

pub struct ObservableStore<S: Store> {
    name: String,
    inner: S,
    bus: EventBus<StoreEvent<S::Item>>,
    options: ObservableOptions,
    initialized: AtomicBool,
    started: AtomicBool,
}

impl<E: Entry> ObservableStore<MemoryStore<E>> {
    /// An observable store over a default [`MemoryStore`].
    pub fn in_memory(name: impl Into<String>) -> Self {
        Self::new(MemoryStore::new(StoreOptions::named(name)), ObservableOptions::default())
    }
}

impl<S: Store> ObservableStore<S> {
    pub fn new(inner: S, options: ObservableOptions) -> Self {
        let name = options
            .name
            .clone()
            .unwrap_or_else(|| inner.name().to_string());
        Self {
            bus: EventBus::new(format!("{name}.events")),
            name,
            inner,
            options,
            initialized: AtomicBool::new(false),
            started: AtomicBool::new(false),
        }
    }

    /// The wrapped store. Mutating it directly bypasses event emission.
    pub fn inner(&self) -> &S {
        &self.inner
    }

    pub fn bus(&self) -> &EventBus<StoreEvent<S::Item>> {
        &self.bus
    }

    pub fn options(&self) -> &ObservableOptions {
        &self.options
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::Acquire)
    }

    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::Acquire)
    }

    // -----------------------------------------------------------------------
    // Internal helpers
    // -----------------------------------------------------------------------

    /// Emit an `error` event for `error` and hand it back for the caller.
    fn fail(&self, operation: Operation, entry_id: Option<&str>, error: StoreError) -> StoreError {
        let event = ErrorEvent::new(&self.name, operation, entry_id, error.clone());
        tracing::debug!(store = %self.name, %operation, error = %error, "operation failed");
        self.emit(StoreEvent::Error(event));
        error
    }

    fn announce_update(&self, updated: &Updated<S::Item>) {
        if !self.options.events_enabled {
            return;
        }
        if self.options.use_removed_added {
            self.emit(StoreEvent::Removed {
                entry_id: updated.entry_id.clone(),
                entry: updated.old_entry.clone(),
            });
            self.emit(StoreEvent::Added {
                entry_id: updated.entry_id.clone(),
                entry: updated.entry.clone(),
            });
        } else {
            self.emit(StoreEvent::Updated {
                entry_id: updated.entry_id.clone(),
                entry: updated.entry.clone(),
                old_entry: updated.old_entry.clone(),
            });
        }
    }

    fn announce_removed(&self, id: &str, entry: &S::Item) {
        if self.options.events_enabled {
            self.emit(StoreEvent::Removed {
                entry_id: id.to_string(),
                entry: entry.clone(),
            });
        }
    }
}

// ============================================================================
// Store
// ============================================================================

impl<S: Store> Store for ObservableStore<S> {
    type Item = S::Item;

    fn name(&self) -> &str {
        &self.name
    }

    fn init(&self) -> Result<()> {
        self.inner
            .init()
            .map_err(|e| self.fail(Operation::Init, None, e))?;
        self.initialized.store(true, Ordering::Release);
        self.emit(StoreEvent::Initialized);
        Ok(())
    }

    /// Start the inner store, then replay its current contents as `added`
    /// events for observers that attached after entries already existed.
    fn start(&self) -> Result<()> {
        self.inner
            .start()
            .map_err(|e| self.fail(Operation::Start, None, e))?;

        // Collect first: handlers may write back into this store.
        let mut existing: Vec<(EntryId, S::Item)> = Vec::new();
        self.inner
            .browse(None, &mut |id, entry| {
                existing.push((id.clone(), entry.clone()));
                ControlFlow::Continue(())
            })
            .map_err(|e| self.fail(Operation::Browse, None, e))?;

        tracing::debug!(store = %self.name, count = existing.len(), "replaying entries on start");
        for (id, browsed) in existing {
            let entry = if self.options.replay_with_read {
                match self.inner.read(&id) {
                    Ok(entry) => entry,
                    Err(e) => {
                        self.fail(Operation::Read, Some(&id), e);
                        continue;
                    }
                }
            } else {
                browsed
            };
            self.emit(StoreEvent::Added {
                entry_id: id,
                entry,
            });
        }

        self.started.store(true, Ordering::Release);
        self.emit(StoreEvent::Started);
        Ok(())
    }

    fn create(&self, entry: S::Item) -> Result<(EntryId, S::Item)> {
        let (id, entry) = self
            .inner
            .create(entry)
            .map_err(|e| self.fail(Operation::Create, None, e))?;
        if self.options.events_enabled {
            self.emit(StoreEvent::Added {
                entry_id: id.clone(),
                entry: entry.clone(),
            });
        }
        Ok((id, entry))
    }

    fn read(&self, id: &str) -> Result<S::Item> {
        self.inner
            .read(id)
            .map_err(|e| self.fail(Operation::Read, Some(id), e))
    }

    fn update(&self, id: &str, entry: S::Item) -> Result<Updated<S::Item>> {
        let updated = self
            .inner
            .update(id, entry)
            .map_err(|e| self.fail(Operation::Update, Some(id), e))?;
        self.announce_update(&updated);
        Ok(updated)
    }

    fn update_with_old(
        &self,
        id: &str,
        entry: S::Item,
        old_entry: S::Item,
    ) -> Result<Updated<S::Item>> {
        let updated = self
            .inner
            .update_with_old(id, entry, old_entry)
            .map_err(|e| self.fail(Operation::Update, Some(id), e))?;
        self.announce_update(&updated);
        Ok(updated)
    }

    fn remove(&self, id: &str) -> Result<S::Item> {
        let removed = self
            .inner
            .remove(id)
            .map_err(|e| self.fail(Operation::Remove, Some(id), e))?;
        self.announce_removed(id, &removed);
        Ok(removed)
    }

    fn remove_with_old(&self, id: &str, old_entry: S::Item) -> Result<S::Item> {
        let removed = self
            .inner
            .remove_with_old(id, old_entry)
            .map_err(|e| self.fail(Operation::Remove, Some(id), e))?;
        self.announce_removed(id, &removed);
        Ok(removed)
    }

    fn browse(
        &self,
        filter: Option<&Filter<S::Item>>,
        visit: &mut Visitor<'_, S::Item>,
    ) -> Result<BrowseSummary> {
        self.inner
            .browse(filter, visit)
            .map_err(|e| self.fail(Operation::Browse, None, e))
    }

    fn find(&self, filter: &Filter<S::Item>) -> Vec<EntryId> {
        self.inner.find(filter)
    }

    fn find_once(&self, filter: &Filter<S::Item>) -> Option<EntryId> {
        self.inner.find_once(filter)
    }
}

// ============================================================================
// Observable
// ============================================================================

impl<S: Store> Observable for ObservableStore<S> {
    fn bind_handler(&self, topic: Topic, handler: EventHandler<S::Item>) -> HandlerId {
        self.bus.bind_handler(topic, handler)
    }

    fn unbind(&self, topic: &Topic, id: &str) -> bool {
        self.bus.unbind(topic, id)
    }

    fn trigger(&self, topic: &Topic, event: &StoreEvent<S::Item>) -> usize {
        self.bus.trigger(topic, event)
    }
}
