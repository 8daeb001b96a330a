//! FilteredView: a derived observable store mirroring the upstream entries
//! that satisfy a predicate.
//!
//! The view is kept current two ways:
//!   - live: upstream `added`/`removed`/`updated` events are filtered at
//!     delivery time;
//!   - `refresh()`: the derived set is recomputed from scratch by a sorted
//!     set difference against `upstream.find(predicate)`, which recovers from
//!     missed events or a late attach. Entering ids are added in descending
//!     id order.
//!
//! Reads come from the derived copy; writes are forwarded upstream and come
//! back through the live path.

use std::ops::ControlFlow;
use std::sync::{Arc, Weak};

use serde::{Deserialize, Serialize};

use crate::error::{Result, StoreError};
use crate::query::diff::diff_sorted;
use crate::query::filter::{Filter, PredicateFn};
use crate::reactive::event::{ErrorEvent, EventType, StoreEvent, Topic};
use crate::reactive::event_bus::{EventBus, HandlerId};
use crate::reactive::observable::{EventHandler, Observable};
use crate::storage::memory::MemoryStore;
use crate::storage::traits::{Store, Visitor};
use crate::types::{BrowseSummary, Entry, EntryId, Operation, Updated};

// ============================================================================
// Options
// ============================================================================

/// Configuration for [`FilteredView`].
pub struct ViewOptions<E> {
    /// Defaults to `"<upstream>:view"`.
    pub name: Option<String>,
    /// Selection predicate. `None` mirrors every upstream entry.
    pub predicate: Option<Arc<PredicateFn<E>>>,
    /// Announce in-view updates as `removed` followed by `added`.
    pub use_removed_added: bool,
}

impl<E> Default for ViewOptions<E> {
    fn default() -> Self {
        Self {
            name: None,
            predicate: None,
            use_removed_added: false,
        }
    }
}

impl<E> ViewOptions<E> {
    pub fn with_predicate(f: impl Fn(&E) -> bool + Send + Sync + 'static) -> Self {
        Self {
            predicate: Some(Arc::new(f)),
            ..Default::default()
        }
    }
}

/// What one `refresh()` changed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RefreshReport {
    pub added: usize,
    pub removed: usize,
}

// ============================================================================
// Core
// ============================================================================

struct ViewCore<U: Observable> {
    name: String,
    upstream: Arc<U>,
    derived: MemoryStore<U::Item>,
    bus: EventBus<StoreEvent<U::Item>>,
    predicate: Arc<PredicateFn<U::Item>>,
    use_removed_added: bool,
}

impl<U: Observable> ViewCore<U> {
    fn emit(&self, event: StoreEvent<U::Item>) {
        self.bus.trigger(&Topic::Type(event.event_type()), &event);
    }

    fn fail(&self, operation: Operation, entry_id: Option<&str>, error: StoreError) -> StoreError {
        self.emit(StoreEvent::Error(ErrorEvent::new(
            &self.name,
            operation,
            entry_id,
            error.clone(),
        )));
        error
    }

    fn background_failure(&self, operation: Operation, entry_id: &str, error: StoreError) {
        tracing::warn!(view = %self.name, %operation, id = %entry_id, error = %error, "view maintenance failed");
        self.emit(StoreEvent::Error(ErrorEvent::new(
            &self.name,
            operation,
            Some(entry_id),
            error,
        )));
    }

    fn selects(&self, entry: &U::Item) -> bool {
        (self.predicate)(entry)
    }

    fn filter(&self) -> Filter<U::Item> {
        Filter::Predicate(Arc::clone(&self.predicate))
    }

    fn admit(&self, id: &str, mut entry: U::Item) -> Result<()> {
        entry.set_id(id);
        let (entry_id, entry) = self.derived.create(entry)?;
        self.emit(StoreEvent::Added { entry_id, entry });
        Ok(())
    }

    fn evict(&self, id: &str) -> Result<()> {
        let entry = self.derived.remove(id)?;
        self.emit(StoreEvent::Removed {
            entry_id: id.to_string(),
            entry,
        });
        Ok(())
    }

    fn on_upstream_added(&self, id: &str, entry: &U::Item) {
        if !self.selects(entry) || self.derived.contains(id) {
            return;
        }
        if let Err(e) = self.admit(id, entry.clone()) {
            self.background_failure(Operation::Create, id, e);
        }
    }

    fn on_upstream_removed(&self, id: &str) {
        if !self.derived.contains(id) {
            return;
        }
        if let Err(e) = self.evict(id) {
            self.background_failure(Operation::Remove, id, e);
        }
    }

    /// Re-evaluate membership: entering emits `added`, leaving emits
    /// `removed`, staying emits `updated`.
    fn on_upstream_updated(&self, id: &str, entry: &U::Item, old_entry: &U::Item) {
        let selected = self.selects(entry);
        let present = self.derived.contains(id);

        let outcome = match (present, selected) {
            (false, false) => Ok(()),
            (false, true) => self.admit(id, entry.clone()),
            (true, false) => self.evict(id),
            (true, true) => self
                .derived
                .update_with_old(id, entry.clone(), old_entry.clone())
                .map(|updated| self.announce_update(updated)),
        };
        if let Err(e) = outcome {
            self.background_failure(Operation::Update, id, e);
        }
    }

    fn announce_update(&self, updated: Updated<U::Item>) {
        if self.use_removed_added {
            self.emit(StoreEvent::Removed {
                entry_id: updated.entry_id.clone(),
                entry: updated.old_entry,
            });
            self.emit(StoreEvent::Added {
                entry_id: updated.entry_id,
                entry: updated.entry,
            });
        } else {
            self.emit(StoreEvent::Updated {
                entry_id: updated.entry_id,
                entry: updated.entry,
                old_entry: updated.old_entry,
            });
        }
    }

    fn refresh(&self) -> RefreshReport {
        let mut report = RefreshReport::default();

        let mut current = self.derived.find(&Filter::predicate(|_| true));
        current.sort();
        let mut matched = self.upstream.find(&self.filter());
        matched.sort();

        let diff = diff_sorted(&current, &matched);

        for id in &diff.left {
            match self.evict(id) {
                Ok(()) => report.removed += 1,
                Err(e) if e.is_not_found() => {}
                Err(e) => self.background_failure(Operation::Remove, id, e),
            }
        }

        // Entering ids are added highest id first.
        for id in diff.right.iter().rev() {
            let admitted = self.upstream.read(id).and_then(|entry| self.admit(id, entry));
            match admitted {
                Ok(()) => report.added += 1,
                Err(StoreError::AlreadyExists { .. }) => {}
                Err(e) => self.background_failure(Operation::Read, id, e),
            }
        }

        tracing::debug!(
            view = %self.name,
            added = report.added,
            removed = report.removed,
            kept = diff.both.len(),
            "view refreshed"
        );
        report
    }
}

// ============================================================================
// FilteredView
// ============================================================================

pub struct FilteredView<U: Observable + 'static> {
    core: Arc<ViewCore<U>>,
    upstream_handlers: Vec<(EventType, HandlerId)>,
}

impl<U: Observable + 'static> FilteredView<U> {
    /// Attach to `upstream`. The view starts empty; call [`refresh`] (or
    /// `start`) to pick up entries that already exist.
    ///
    /// [`refresh`]: FilteredView::refresh
    pub fn new(upstream: Arc<U>, options: ViewOptions<U::Item>) -> Self {
        let name = options
            .name
            .unwrap_or_else(|| format!("{}:view", upstream.name()));
        let predicate: Arc<PredicateFn<U::Item>> = match options.predicate {
            Some(predicate) => predicate,
            None => Arc::new(|_: &U::Item| true),
        };
        let core = Arc::new(ViewCore {
            derived: MemoryStore::named(format!("{name}.entries")),
            bus: EventBus::new(format!("{name}.events")),
            predicate,
            use_removed_added: options.use_removed_added,
            name,
            upstream,
        });

        let upstream_handlers = [EventType::Added, EventType::Removed, EventType::Updated]
            .into_iter()
            .map(|ty| {
                let handler = upstream_handler(Arc::downgrade(&core));
                let id = core.upstream.bind_handler(Topic::Type(ty.clone()), handler);
                (ty, id)
            })
            .collect();

        Self {
            core,
            upstream_handlers,
        }
    }

    pub fn upstream(&self) -> &Arc<U> {
        &self.core.upstream
    }

    /// Whether `entry` belongs in this view.
    pub fn selects(&self, entry: &U::Item) -> bool {
        self.core.selects(entry)
    }

    /// Number of entries currently in the view.
    pub fn len(&self) -> usize {
        self.core.derived.len()
    }

    pub fn is_empty(&self) -> bool {
        self.core.derived.is_empty()
    }

    /// Recompute the derived set against the upstream's current matches.
    /// Newly matched ids are added in descending id order.
    pub fn refresh(&self) -> RefreshReport {
        self.core.refresh()
    }
}

fn upstream_handler<U: Observable + 'static>(core: Weak<ViewCore<U>>) -> EventHandler<U::Item> {
    Arc::new(move |event: &StoreEvent<U::Item>| {
        let Some(core) = core.upgrade() else {
            return ControlFlow::Continue(());
        };
        match event {
            StoreEvent::Added { entry_id, entry } => core.on_upstream_added(entry_id, entry),
            StoreEvent::Removed { entry_id, .. } => core.on_upstream_removed(entry_id),
            StoreEvent::Updated {
                entry_id,
                entry,
                old_entry,
            } => core.on_upstream_updated(entry_id, entry, old_entry),
            _ => {}
        }
        ControlFlow::Continue(())
    })
}

impl<U: Observable + 'static> Drop for FilteredView<U> {
    fn drop(&mut self) {
        for (ty, id) in self.upstream_handlers.drain(..) {
            self.core.upstream.unbind(&Topic::Type(ty), &id);
        }
    }
}

// ============================================================================
// Store
// ============================================================================

impl<U: Observable + 'static> Store for FilteredView<U> {
    type Item = U::Item;

    fn name(&self) -> &str {
        &self.core.name
    }

    fn init(&self) -> Result<()> {
        self.core.emit(StoreEvent::Initialized);
        Ok(())
    }

    fn start(&self) -> Result<()> {
        self.core.refresh();
        self.core.emit(StoreEvent::Started);
        Ok(())
    }

    fn create(&self, entry: U::Item) -> Result<(EntryId, U::Item)> {
        self.core
            .upstream
            .create(entry)
            .map_err(|e| self.core.fail(Operation::Create, None, e))
    }

    fn read(&self, id: &str) -> Result<U::Item> {
        self.core
            .derived
            .read(id)
            .map_err(|e| self.core.fail(Operation::Read, Some(id), e))
    }

    fn update(&self, id: &str, entry: U::Item) -> Result<Updated<U::Item>> {
        self.core
            .upstream
            .update(id, entry)
            .map_err(|e| self.core.fail(Operation::Update, Some(id), e))
    }

    fn update_with_old(
        &self,
        id: &str,
        entry: U::Item,
        old_entry: U::Item,
    ) -> Result<Updated<U::Item>> {
        self.core
            .upstream
            .update_with_old(id, entry, old_entry)
            .map_err(|e| self.core.fail(Operation::Update, Some(id), e))
    }

    fn remove(&self, id: &str) -> Result<U::Item> {
        self.core
            .upstream
            .remove(id)
            .map_err(|e| self.core.fail(Operation::Remove, Some(id), e))
    }

    fn remove_with_old(&self, id: &str, old_entry: U::Item) -> Result<U::Item> {
        self.core
            .upstream
            .remove_with_old(id, old_entry)
            .map_err(|e| self.core.fail(Operation::Remove, Some(id), e))
    }

    fn browse(
        &self,
        filter: Option<&Filter<U::Item>>,
        visit: &mut Visitor<'_, U::Item>,
    ) -> Result<BrowseSummary> {
        self.core.derived.browse(filter, visit)
    }

    fn find(&self, filter: &Filter<U::Item>) -> Vec<EntryId> {
        self.core.derived.find(filter)
    }

    fn find_once(&self, filter: &Filter<U::Item>) -> Option<EntryId> {
        self.core.derived.find_once(filter)
    }

    /// Remove every upstream entry the predicate selects; the view empties
    /// through the resulting `removed` events.
    fn remove_all(&self) -> Result<usize> {
        let mut removed = 0;
        for id in self.core.upstream.find(&self.core.filter()) {
            match self.core.upstream.remove(&id) {
                Ok(_) => removed += 1,
                Err(e) if e.is_not_found() => {}
                Err(e) => return Err(self.core.fail(Operation::Remove, Some(&id), e)),
            }
        }
        Ok(removed)
    }
}

// ============================================================================
// Observable
// ============================================================================

impl<U: Observable + 'static> Observable for FilteredView<U> {
    fn bind_handler(&self, topic: Topic, handler: EventHandler<U::Item>) -> HandlerId {
        self.core.bus.bind_handler(topic, handler)
    }

    fn unbind(&self, topic: &Topic, id: &str) -> bool {
        self.core.bus.unbind(topic, id)
    }

    fn trigger(&self, topic: &Topic, event: &StoreEvent<U::Item>) -> usize {
        self.core.bus.trigger(topic, event)
    }
}
