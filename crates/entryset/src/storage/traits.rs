//! The plain, event-free store contract.
//!
//! `Store` is what every backing implements: the in-memory [`MemoryStore`],
//! remote adapters, local-storage adapters. Event emission belongs to the
//! compositional layer above it (see `reactive`).
//!
//! Every operation completes exactly once with either a value or a
//! [`StoreError`](crate::error::StoreError). Absence of an id is reported as
//! `StoreError::NotFound`, a normal condition callers are expected to branch
//! on.
//!
//! [`MemoryStore`]: super::memory::MemoryStore

use std::ops::ControlFlow;

use crate::error::Result;
use crate::query::filter::Filter;
use crate::types::{BrowseSummary, Entry, EntryId, Updated};

/// Visitor handed to [`Store::browse`]. Returning `ControlFlow::Break(())`
/// stops the traversal.
pub type Visitor<'a, E> = dyn FnMut(&EntryId, &E) -> ControlFlow<()> + 'a;

pub trait Store: Send + Sync {
    type Item: Entry;

    /// Diagnostic name used in errors and logs.
    fn name(&self) -> &str;

    /// One-time setup (open connections, load tables).
    fn init(&self) -> Result<()> {
        Ok(())
    }

    /// Begin serving (replay, connect feeds).
    fn start(&self) -> Result<()> {
        Ok(())
    }

    /// Store a converted copy of `entry`, assigning an id if it has none.
    /// Returns the id and the entry as stored by the caller's view (id set).
    fn create(&self, entry: Self::Item) -> Result<(EntryId, Self::Item)>;

    /// Converted-out copy of the entry stored under `id`.
    fn read(&self, id: &str) -> Result<Self::Item>;

    /// Overwrite the entry under `id`. The previous value reported in
    /// [`Updated::old_entry`] is the converted pre-update entry.
    fn update(&self, id: &str, entry: Self::Item) -> Result<Updated<Self::Item>>;

    /// Overwrite the entry under `id`, reporting `old_entry` as the previous
    /// value instead of reading it back.
    fn update_with_old(
        &self,
        id: &str,
        entry: Self::Item,
        old_entry: Self::Item,
    ) -> Result<Updated<Self::Item>>;

    /// Delete the entry under `id`, returning the removed entry.
    fn remove(&self, id: &str) -> Result<Self::Item>;

    /// Delete the entry under `id`, reporting `old_entry` as what was removed.
    fn remove_with_old(&self, id: &str, old_entry: Self::Item) -> Result<Self::Item> {
        self.remove(id).map(|_| old_entry)
    }

    /// One-shot traversal of every entry, or of the subset `filter` selects.
    ///
    /// The summary is produced once, after exhaustion or an early stop.
    fn browse(
        &self,
        filter: Option<&Filter<Self::Item>>,
        visit: &mut Visitor<'_, Self::Item>,
    ) -> Result<BrowseSummary>;

    /// Ids of all matching entries, in traversal order.
    fn find(&self, filter: &Filter<Self::Item>) -> Vec<EntryId>;

    /// Id of the first matching entry.
    fn find_once(&self, filter: &Filter<Self::Item>) -> Option<EntryId> {
        self.find(filter).into_iter().next()
    }

    /// Remove every entry through `browse` + `remove`. Returns the number of
    /// entries removed.
    fn remove_all(&self) -> Result<usize> {
        let mut ids = Vec::new();
        self.browse(None, &mut |id, _| {
            ids.push(id.clone());
            ControlFlow::Continue(())
        })?;

        let mut removed = 0;
        for id in ids {
            match self.remove(&id) {
                Ok(_) => removed += 1,
                Err(e) if e.is_not_found() => {}
                Err(e) => return Err(e),
            }
        }
        Ok(removed)
    }
}
