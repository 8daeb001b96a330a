//! MemoryStore<E>: a `Store` that keeps every entry in memory.
//!
//! Traversal order is insertion order, which the event bus relies on for
//! registration-ordered dispatch.
//!
//! Converters, finders and browse visitors are user code. They always run on
//! a snapshot taken under the lock, with the lock released, so they may call
//! back into the same store.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::error::{Result, StoreError};
use crate::query::filter::{modified_or_epoch, Filter, NamedQuery};
use crate::types::{BrowseSummary, Entry, EntryId, Updated};

use super::traits::{Store, Visitor};

/// First id handed out by the default id generator.
pub const FIRST_GENERATED_ID: u64 = 10000;

/// Id assignment hook: receives the entry and the next generated id.
pub type AssignIdFn<E> = dyn Fn(&E, u64) -> Option<EntryId> + Send + Sync;

/// Conversion hook applied on the way in (`entry_in`) or out (`entry_out`).
pub type ConvertFn<E> = dyn Fn(&str, &E) -> Option<E> + Send + Sync;

/// Custom matcher replacing [`Filter::matches`].
pub type FinderFn<E> = dyn Fn(&E, &Filter<E>) -> bool + Send + Sync;

// ============================================================================
// StoreOptions
// ============================================================================

/// Configuration for [`MemoryStore`]. Every hook is optional; the defaults
/// keep an entry's own id (or generate one), copy entries unchanged and use
/// [`Filter::matches`].
pub struct StoreOptions<E> {
    pub name: String,
    /// Returns the id to store the entry under. `None` fails the create.
    pub assign_id: Option<Arc<AssignIdFn<E>>>,
    /// Converts the caller's entry into its stored form.
    pub entry_in: Option<Arc<ConvertFn<E>>>,
    /// Converts the stored form back into what callers see.
    pub entry_out: Option<Arc<ConvertFn<E>>>,
    pub finder: Option<Arc<FinderFn<E>>>,
}

impl<E> StoreOptions<E> {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }
}

impl<E> Default for StoreOptions<E> {
    fn default() -> Self {
        Self {
            name: "memory".to_string(),
            assign_id: None,
            entry_in: None,
            entry_out: None,
            finder: None,
        }
    }
}

// ============================================================================
// MemoryStore
// ============================================================================

struct Slot<E> {
    seq: u64,
    entry: E,
}

struct MemoryState<E> {
    entries: HashMap<EntryId, Slot<E>>,
    /// Insertion sequence → id; iteration yields insertion order.
    order: BTreeMap<u64, EntryId>,
    next_seq: u64,
}

impl<E: Clone> MemoryState<E> {
    fn snapshot(&self) -> Vec<(EntryId, E)> {
        self.order
            .values()
            .filter_map(|id| {
                self.entries
                    .get(id)
                    .map(|slot| (id.clone(), slot.entry.clone()))
            })
            .collect()
    }
}

/// In-memory [`Store`] keyed by [`EntryId`].
pub struct MemoryStore<E: Entry> {
    options: StoreOptions<E>,
    state: Mutex<MemoryState<E>>,
    next_id: AtomicU64,
}

impl<E: Entry> MemoryStore<E> {
    pub fn new(options: StoreOptions<E>) -> Self {
        Self {
            options,
            state: Mutex::new(MemoryState {
                entries: HashMap::new(),
                order: BTreeMap::new(),
                next_seq: 0,
            }),
            next_id: AtomicU64::new(FIRST_GENERATED_ID),
        }
    }

    pub fn named(name: impl Into<String>) -> Self {
        Self::new(StoreOptions::named(name))
    }

    /// Number of stored entries.
    pub fn len(&self) -> usize {
        self.state.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether `id` is present, without running `entry_out`.
    pub fn contains(&self, id: &str) -> bool {
        self.state.lock().entries.contains_key(id)
    }

    // -----------------------------------------------------------------------
    // Internal helpers
    // -----------------------------------------------------------------------

    fn assign_id(&self, entry: &E) -> Option<EntryId> {
        match &self.options.assign_id {
            Some(assign) => {
                let next = self.next_id.fetch_add(1, Ordering::Relaxed);
                assign(entry, next)
            }
            None => entry
                .id()
                .or_else(|| Some(self.next_id.fetch_add(1, Ordering::Relaxed).to_string())),
        }
    }

    fn convert_in(&self, id: &str, entry: &E) -> Result<E> {
        let converted = match &self.options.entry_in {
            Some(f) => f(id, entry),
            None => Some(entry.clone()),
        };
        converted.ok_or_else(|| self.conversion_error(id))
    }

    fn convert_out(&self, id: &str, stored: &E) -> Result<E> {
        let converted = match &self.options.entry_out {
            Some(f) => f(id, stored),
            None => Some(stored.clone()),
        };
        converted.ok_or_else(|| self.conversion_error(id))
    }

    fn conversion_error(&self, id: &str) -> StoreError {
        StoreError::Conversion {
            store: self.options.name.clone(),
            id: id.to_string(),
        }
    }

    fn not_found(&self, id: &str) -> StoreError {
        StoreError::not_found(&self.options.name, id)
    }

    fn stored(&self, id: &str) -> Result<E> {
        self.state
            .lock()
            .entries
            .get(id)
            .map(|slot| slot.entry.clone())
            .ok_or_else(|| self.not_found(id))
    }

    fn matches(&self, entry: &E, filter: &Filter<E>) -> bool {
        match &self.options.finder {
            Some(finder) => finder(entry, filter),
            None => filter.matches(entry),
        }
    }

    /// Snapshot narrowed by `filter`, in traversal order.
    fn select(&self, filter: Option<&Filter<E>>) -> Vec<(EntryId, E)> {
        let snapshot = self.state.lock().snapshot();
        match filter {
            None => snapshot,
            Some(Filter::Named(NamedQuery::LastModified)) => {
                // Ties resolve to the earliest inserted entry.
                let mut latest: Option<(EntryId, E)> = None;
                for (id, entry) in snapshot {
                    let newer = match &latest {
                        None => true,
                        Some((_, current)) => modified_or_epoch(&entry) > modified_or_epoch(current),
                    };
                    if newer {
                        latest = Some((id, entry));
                    }
                }
                latest.into_iter().collect()
            }
            Some(filter) => snapshot
                .into_iter()
                .filter(|(_, entry)| self.matches(entry, filter))
                .collect(),
        }
    }
}

impl<E: Entry> Store for MemoryStore<E> {
    type Item = E;

    fn name(&self) -> &str {
        &self.options.name
    }

    fn create(&self, mut entry: E) -> Result<(EntryId, E)> {
        let id = self.assign_id(&entry).ok_or_else(|| StoreError::MissingId {
            store: self.options.name.clone(),
        })?;
        entry.set_id(&id);
        let content = self.convert_in(&id, &entry)?;

        let mut st = self.state.lock();
        if st.entries.contains_key(&id) {
            return Err(StoreError::AlreadyExists {
                store: self.options.name.clone(),
                id,
            });
        }
        let seq = st.next_seq;
        st.next_seq += 1;
        st.order.insert(seq, id.clone());
        st.entries.insert(id.clone(), Slot { seq, entry: content });
        drop(st);

        Ok((id, entry))
    }

    fn read(&self, id: &str) -> Result<E> {
        let stored = self.stored(id)?;
        self.convert_out(id, &stored)
    }

    fn update(&self, id: &str, entry: E) -> Result<Updated<E>> {
        let stored = self.stored(id)?;
        let old_entry = self.convert_out(id, &stored)?;
        self.update_with_old(id, entry, old_entry)
    }

    fn update_with_old(&self, id: &str, mut entry: E, old_entry: E) -> Result<Updated<E>> {
        // The stored entry always carries the key it is stored under.
        entry.set_id(id);
        let converted = self.convert_in(id, &entry)?;

        let mut st = self.state.lock();
        match st.entries.get_mut(id) {
            Some(slot) => slot.entry = converted,
            None => return Err(self.not_found(id)),
        }
        drop(st);

        Ok(Updated {
            entry_id: id.to_string(),
            entry,
            old_entry,
        })
    }

    fn remove(&self, id: &str) -> Result<E> {
        let removed = {
            let mut st = self.state.lock();
            let slot = st.entries.remove(id).ok_or_else(|| self.not_found(id))?;
            st.order.remove(&slot.seq);
            slot.entry
        };
        self.convert_out(id, &removed)
    }

    fn remove_with_old(&self, id: &str, old_entry: E) -> Result<E> {
        let mut st = self.state.lock();
        let slot = st.entries.remove(id).ok_or_else(|| self.not_found(id))?;
        st.order.remove(&slot.seq);
        Ok(old_entry)
    }

    fn browse(&self, filter: Option<&Filter<E>>, visit: &mut Visitor<'_, E>) -> Result<BrowseSummary> {
        let mut summary = BrowseSummary::default();
        for (id, entry) in self.select(filter) {
            summary.count += 1;
            if visit(&id, &entry).is_break() {
                summary.stopped = true;
                break;
            }
        }
        Ok(summary)
    }

    fn find(&self, filter: &Filter<E>) -> Vec<EntryId> {
        self.select(Some(filter)).into_iter().map(|(id, _)| id).collect()
    }

    fn find_once(&self, filter: &Filter<E>) -> Option<EntryId> {
        match filter {
            Filter::Named(_) => self.find(filter).into_iter().next(),
            _ => {
                let snapshot = self.state.lock().snapshot();
                snapshot
                    .into_iter()
                    .find(|(_, entry)| self.matches(entry, filter))
                    .map(|(id, _)| id)
            }
        }
    }
}
