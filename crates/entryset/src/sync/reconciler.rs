//! ReconcilingStore: an observable store served from a local cache that is
//! kept consistent with an authoritative source.
//!
//! - Reads hit the cache first and fall back to the source, populating the
//!   cache on the way out.
//! - Writes go to the source first and to the cache only after the source
//!   accepted them. Nothing is rolled back on the source.
//! - Source `added`/`removed`/`updated` events are applied to the cache and
//!   re-emitted on this store's own bus.
//! - `start()` replays the cache, starts the source and runs an incremental
//!   `merge` from a watermark derived from the newest cached entry.
//!
//! Whichever path changes the cache announces the change, so a write that
//! also arrives through the source's event feed is announced exactly once.
//! The same holds for failures: a cache failure the event path already
//! reported is returned by the write that caused it, not emitted again.
//!
//! Entries always enter the cache under the id they are reconciled for,
//! whatever id field the source's copy carries.
//!
//! Failures of caller-initiated operations are returned (and emitted as
//! `error` events). Failures of event-driven maintenance have no waiting
//! caller: they are logged and emitted, never returned. Source and cache may
//! diverge transiently; live events and the next `start()` restore
//! consistency.

use std::collections::HashMap;
use std::ops::ControlFlow;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;

use crate::error::{Result, StoreError};
use crate::query::filter::Filter;
use crate::reactive::event::{ErrorEvent, EventType, StoreEvent, Topic};
use crate::reactive::event_bus::{EventBus, HandlerId};
use crate::reactive::observable::{EventHandler, Observable};
use crate::storage::traits::{Store, Visitor};
use crate::types::{epoch, BrowseSummary, Entry, EntryId, Operation, Updated};

use super::types::{MergeReport, ReconcileOptions};

// ============================================================================
// Shared state
// ============================================================================

/// State shared between the store and the handlers it binds on the source.
/// Handlers hold it weakly, so dropping the store releases it.
struct Shared<S: Observable, C: Store<Item = S::Item>> {
    name: String,
    source: Arc<S>,
    cache: C,
    bus: EventBus<StoreEvent<S::Item>>,
    options: ReconcileOptions,
    started: AtomicBool,
    /// Caller writes between their source call and their cache step.
    writes_in_flight: AtomicUsize,
    /// Failures the event path reported while a write was in flight, keyed
    /// by entry id. The write claims its own and does not report it again.
    event_failures: Mutex<HashMap<EntryId, StoreError>>,
}

/// Marks a caller write as in flight until dropped.
struct WriteGuard<'a, S: Observable, C: Store<Item = S::Item>> {
    shared: &'a Shared<S, C>,
}

impl<S: Observable, C: Store<Item = S::Item>> Drop for WriteGuard<'_, S, C> {
    fn drop(&mut self) {
        if self.shared.writes_in_flight.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.shared.event_failures.lock().clear();
        }
    }
}

impl<S, C> Shared<S, C>
where
    S: Observable,
    S::Item: PartialEq,
    C: Store<Item = S::Item>,
{
    // -----------------------------------------------------------------------
    // Event plumbing
    // -----------------------------------------------------------------------

    fn emit(&self, event: StoreEvent<S::Item>) {
        self.bus.trigger(&Topic::Type(event.event_type()), &event);
    }

    /// Caller-facing failure: emit and hand back.
    fn fail(&self, operation: Operation, entry_id: Option<&str>, error: StoreError) -> StoreError {
        self.emit(StoreEvent::Error(ErrorEvent::new(
            &self.name,
            operation,
            entry_id,
            error.clone(),
        )));
        error
    }

    /// Failure with no waiting caller: log and emit only.
    fn background_failure(&self, operation: Operation, entry_id: &str, error: StoreError) {
        tracing::warn!(
            store = %self.name,
            %operation,
            id = %entry_id,
            error = %error,
            "cache reconciliation failed"
        );
        self.emit(StoreEvent::Error(ErrorEvent::new(
            &self.name,
            operation,
            Some(entry_id),
            error,
        )));
    }

    /// Background failure hit while applying a source event. A caller write
    /// in flight for the same id picks it up through `claim_event_failure`.
    fn event_failure(&self, operation: Operation, entry_id: &str, error: StoreError) {
        if self.writes_in_flight.load(Ordering::Acquire) > 0 {
            self.event_failures
                .lock()
                .insert(entry_id.to_string(), error.clone());
        }
        self.background_failure(operation, entry_id, error);
    }

    fn begin_write(&self) -> WriteGuard<'_, S, C> {
        self.writes_in_flight.fetch_add(1, Ordering::AcqRel);
        WriteGuard { shared: self }
    }

    /// The failure the event path already reported for `id`, if any.
    fn claim_event_failure(&self, id: &str) -> Option<StoreError> {
        self.event_failures.lock().remove(id)
    }

    // -----------------------------------------------------------------------
    // Cache mutations (each announces what it changed)
    // -----------------------------------------------------------------------

    fn cache_contains(&self, id: &str) -> Result<bool> {
        match self.cache.read(id) {
            Ok(_) => Ok(true),
            Err(e) if e.is_not_found() => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Create `entry` in the cache under `id` and announce it. `Ok(false)`
    /// when the cache already held the id.
    fn cache_insert(&self, id: &str, mut entry: S::Item) -> Result<bool> {
        entry.set_id(id);
        match self.cache.create(entry) {
            Ok((entry_id, entry)) => {
                self.emit(StoreEvent::Added { entry_id, entry });
                Ok(true)
            }
            Err(StoreError::AlreadyExists { .. }) => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Create-if-absent, else update. Equal content is left alone and not
    /// announced.
    fn cache_upsert(&self, id: &str, mut entry: S::Item) -> Result<()> {
        entry.set_id(id);
        match self.cache.read(id) {
            Ok(current) if current == entry => Ok(()),
            Ok(current) => {
                let updated = self.cache.update_with_old(id, entry, current)?;
                self.emit(StoreEvent::Updated {
                    entry_id: updated.entry_id,
                    entry: updated.entry,
                    old_entry: updated.old_entry,
                });
                Ok(())
            }
            Err(e) if e.is_not_found() => self.cache_insert(id, entry).map(|_| ()),
            Err(e) => Err(e),
        }
    }

    /// Remove `id` from the cache and announce it. `Ok(false)` when absent.
    fn cache_evict(&self, id: &str) -> Result<bool> {
        match self.cache.remove(id) {
            Ok(entry) => {
                self.emit(StoreEvent::Removed {
                    entry_id: id.to_string(),
                    entry,
                });
                Ok(true)
            }
            Err(e) if e.is_not_found() => Ok(false),
            Err(e) => Err(e),
        }
    }

    // -----------------------------------------------------------------------
    // Source event handlers
    // -----------------------------------------------------------------------

    fn on_source_added(&self, id: &str) {
        match self.cache_contains(id) {
            Ok(true) => {
                // Bootstrap scan and live feed can both deliver the same id.
                let duplicate = StoreError::DuplicateRegistration {
                    store: self.cache.name().to_string(),
                    id: id.to_string(),
                };
                tracing::debug!(store = %self.name, error = %duplicate, "ignoring source add");
            }
            Ok(false) => {
                let inserted = self
                    .source
                    .read(id)
                    .and_then(|entry| self.cache_insert(id, entry));
                if let Err(e) = inserted {
                    self.event_failure(Operation::Reconcile, id, e);
                }
            }
            Err(e) => self.event_failure(Operation::Reconcile, id, e),
        }
    }

    fn on_source_removed(&self, id: &str) {
        match self.cache_evict(id) {
            Ok(true) => {}
            Ok(false) => tracing::warn!(
                store = %self.name,
                id = %id,
                "source removed an entry the cache does not hold; already reconciled or not yet populated"
            ),
            Err(e) => self.event_failure(Operation::Reconcile, id, e),
        }
    }

    fn on_source_updated(&self, id: &str) {
        let upserted = self
            .source
            .read(id)
            .and_then(|entry| self.cache_upsert(id, entry));
        if let Err(e) = upserted {
            self.event_failure(Operation::Reconcile, id, e);
        }
    }

    // -----------------------------------------------------------------------
    // Write-through (after a committed source write)
    // -----------------------------------------------------------------------

    fn write_through_update(&self, id: &str, updated: &Updated<S::Item>) {
        if self.claim_event_failure(id).is_some() {
            return;
        }
        if let Err(e) = self.cache_upsert(id, updated.entry.clone()) {
            self.background_failure(Operation::Update, id, e);
        }
    }

    fn write_through_remove(&self, id: &str) {
        if self.claim_event_failure(id).is_some() {
            return;
        }
        if let Err(e) = self.cache_evict(id) {
            self.background_failure(Operation::Remove, id, e);
        }
    }

    // -----------------------------------------------------------------------
    // Bootstrap
    // -----------------------------------------------------------------------

    fn watermark(&self) -> DateTime<Utc> {
        let mut newest: Option<Option<DateTime<Utc>>> = None;
        let scanned = self
            .cache
            .browse(Some(&Filter::last_modified()), &mut |_, entry| {
                newest = Some(entry.modified());
                ControlFlow::Break(())
            });
        if let Err(e) = scanned {
            tracing::warn!(store = %self.name, error = %e, "last-modified scan failed; resyncing from epoch");
            return epoch();
        }

        match newest {
            Some(Some(modified)) => modified - self.options.watermark_skew,
            Some(None) | None => epoch(),
        }
    }

    fn merge(&self, since: DateTime<Utc>) -> MergeReport {
        let mut report = MergeReport::new(since);

        // Collect first: reconciling an entry may re-enter the source.
        let mut ids: Vec<EntryId> = Vec::new();
        let browsed = self
            .source
            .browse(Some(&Filter::modified_since(since)), &mut |id, _| {
                ids.push(id.clone());
                ControlFlow::Continue(())
            });
        if let Err(e) = browsed {
            tracing::warn!(store = %self.name, error = %e, "merge browse failed");
            self.emit(StoreEvent::Error(ErrorEvent::new(
                &self.name,
                Operation::Merge,
                None,
                e,
            )));
            report.failed += 1;
            return report;
        }

        for id in ids {
            report.scanned += 1;
            match self.cache_contains(&id) {
                Ok(true) => continue,
                Ok(false) => {}
                Err(e) => {
                    report.failed += 1;
                    self.background_failure(Operation::Merge, &id, e);
                    continue;
                }
            }
            match self.source.read(&id).and_then(|entry| self.cache_insert(&id, entry)) {
                Ok(true) => report.added += 1,
                Ok(false) => {}
                Err(e) => {
                    report.failed += 1;
                    self.background_failure(Operation::Merge, &id, e);
                }
            }
        }

        if report.scanned == 0 {
            tracing::debug!(store = %self.name, source = %self.source.name(), %since, "merge found no entries");
        } else {
            tracing::debug!(
                store = %self.name,
                scanned = report.scanned,
                added = report.added,
                failed = report.failed,
                "merged source into cache"
            );
        }
        report
    }
}

// ============================================================================
// ReconcilingStore
// ============================================================================

/// Cache-over-source store. See the module docs for the policies.
pub struct ReconcilingStore<S, C>
where
    S: Observable + 'static,
    S::Item: PartialEq,
    C: Store<Item = S::Item> + 'static,
{
    shared: Arc<Shared<S, C>>,
    source_handlers: Vec<(EventType, HandlerId)>,
}

impl<S, C> ReconcilingStore<S, C>
where
    S: Observable + 'static,
    S::Item: PartialEq,
    C: Store<Item = S::Item> + 'static,
{
    /// Compose `source` and `cache` and subscribe to the source's events.
    ///
    /// The cache must only be mutated through the returned store from here on.
    pub fn new(source: Arc<S>, cache: C, options: ReconcileOptions) -> Self {
        let name = options
            .name
            .clone()
            .unwrap_or_else(|| format!("{}:cached", source.name()));
        let shared = Arc::new(Shared {
            bus: EventBus::new(format!("{name}.events")),
            name,
            source,
            cache,
            options,
            started: AtomicBool::new(false),
            writes_in_flight: AtomicUsize::new(0),
            event_failures: Mutex::new(HashMap::new()),
        });

        let source_handlers = [EventType::Added, EventType::Removed, EventType::Updated]
            .into_iter()
            .map(|ty| {
                let handler = source_handler(Arc::downgrade(&shared), ty.clone());
                let id = shared.source.bind_handler(Topic::Type(ty.clone()), handler);
                (ty, id)
            })
            .collect();

        Self {
            shared,
            source_handlers,
        }
    }

    /// The authoritative store.
    pub fn source(&self) -> &Arc<S> {
        &self.shared.source
    }

    /// The local cache, read-only by convention.
    pub fn cache(&self) -> &C {
        &self.shared.cache
    }

    pub fn is_started(&self) -> bool {
        self.shared.started.load(Ordering::Acquire)
    }

    /// Resynchronization watermark: newest cached `modified` minus the skew,
    /// or time zero when the cache holds nothing dated.
    pub fn watermark(&self) -> DateTime<Utc> {
        self.shared.watermark()
    }

    /// Copy every source entry modified at or after `since` that the cache
    /// lacks. Idempotent: entries already cached are left untouched, so
    /// re-running with the same or an earlier watermark only costs reads.
    pub fn merge(&self, since: DateTime<Utc>) -> MergeReport {
        self.shared.merge(since)
    }
}

fn source_handler<S, C>(shared: Weak<Shared<S, C>>, ty: EventType) -> EventHandler<S::Item>
where
    S: Observable + 'static,
    S::Item: PartialEq,
    C: Store<Item = S::Item> + 'static,
{
    Arc::new(move |event: &StoreEvent<S::Item>| {
        let (Some(shared), Some(id)) = (shared.upgrade(), event.entry_id()) else {
            return ControlFlow::Continue(());
        };
        match &ty {
            EventType::Added => shared.on_source_added(id),
            EventType::Removed => shared.on_source_removed(id),
            EventType::Updated => shared.on_source_updated(id),
            _ => {}
        }
        ControlFlow::Continue(())
    })
}

impl<S, C> Drop for ReconcilingStore<S, C>
where
    S: Observable + 'static,
    S::Item: PartialEq,
    C: Store<Item = S::Item> + 'static,
{
    fn drop(&mut self) {
        for (ty, id) in self.source_handlers.drain(..) {
            self.shared.source.unbind(&Topic::Type(ty), &id);
        }
    }
}

// ============================================================================
// Store
// ============================================================================

impl<S, C> Store for ReconcilingStore<S, C>
where
    S: Observable + 'static,
    S::Item: PartialEq,
    C: Store<Item = S::Item> + 'static,
{
    type Item = S::Item;

    fn name(&self) -> &str {
        &self.shared.name
    }

    fn init(&self) -> Result<()> {
        let sh = &self.shared;
        sh.cache.init().map_err(|e| sh.fail(Operation::Init, None, e))?;
        sh.source.init().map_err(|e| sh.fail(Operation::Init, None, e))?;
        sh.emit(StoreEvent::Initialized);
        Ok(())
    }

    /// Replay the cache, start the source, then merge from the watermark.
    fn start(&self) -> Result<()> {
        let sh = &self.shared;
        sh.cache.start().map_err(|e| sh.fail(Operation::Start, None, e))?;

        let mut cached: Vec<(EntryId, S::Item)> = Vec::new();
        sh.cache
            .browse(None, &mut |id, entry| {
                cached.push((id.clone(), entry.clone()));
                ControlFlow::Continue(())
            })
            .map_err(|e| sh.fail(Operation::Browse, None, e))?;
        for (entry_id, entry) in cached {
            sh.emit(StoreEvent::Added { entry_id, entry });
        }

        sh.source.start().map_err(|e| sh.fail(Operation::Start, None, e))?;

        let since = sh.watermark();
        tracing::debug!(store = %sh.name, %since, "starting incremental merge");
        sh.merge(since);

        sh.started.store(true, Ordering::Release);
        sh.emit(StoreEvent::Started);
        Ok(())
    }

    fn create(&self, entry: S::Item) -> Result<(EntryId, S::Item)> {
        let sh = &self.shared;
        let _write = sh.begin_write();
        let (id, entry) = sh
            .source
            .create(entry)
            .map_err(|e| sh.fail(Operation::Create, None, e))?;

        // The source is authoritative: a cache failure is surfaced but the
        // committed source write stays. The source's own `added` event may
        // already have attempted (and reported) the cache insert.
        if let Some(e) = sh.claim_event_failure(&id) {
            return Err(e);
        }
        sh.cache_insert(&id, entry.clone())
            .map_err(|e| sh.fail(Operation::Create, Some(&id), e))?;
        Ok((id, entry))
    }

    /// Cache hit returns without touching the source; a miss reads the
    /// source and populates the cache.
    fn read(&self, id: &str) -> Result<S::Item> {
        let sh = &self.shared;
        match sh.cache.read(id) {
            Ok(entry) => return Ok(entry),
            Err(e) if e.is_not_found() => {}
            Err(e) => {
                tracing::warn!(store = %sh.name, id = %id, error = %e, "cache read failed; reading source");
            }
        }

        let entry = sh
            .source
            .read(id)
            .map_err(|e| sh.fail(Operation::Read, Some(id), e))?;
        if let Err(e) = sh.cache_insert(id, entry.clone()) {
            sh.background_failure(Operation::Read, id, e);
        }
        Ok(entry)
    }

    fn update(&self, id: &str, entry: S::Item) -> Result<Updated<S::Item>> {
        let sh = &self.shared;
        let _write = sh.begin_write();
        let updated = sh
            .source
            .update(id, entry)
            .map_err(|e| sh.fail(Operation::Update, Some(id), e))?;
        sh.write_through_update(id, &updated);
        Ok(updated)
    }

    fn update_with_old(
        &self,
        id: &str,
        entry: S::Item,
        old_entry: S::Item,
    ) -> Result<Updated<S::Item>> {
        let sh = &self.shared;
        let _write = sh.begin_write();
        let updated = sh
            .source
            .update_with_old(id, entry, old_entry)
            .map_err(|e| sh.fail(Operation::Update, Some(id), e))?;
        sh.write_through_update(id, &updated);
        Ok(updated)
    }

    fn remove(&self, id: &str) -> Result<S::Item> {
        let sh = &self.shared;
        let _write = sh.begin_write();
        let removed = sh
            .source
            .remove(id)
            .map_err(|e| sh.fail(Operation::Remove, Some(id), e))?;
        sh.write_through_remove(id);
        Ok(removed)
    }

    fn remove_with_old(&self, id: &str, old_entry: S::Item) -> Result<S::Item> {
        let sh = &self.shared;
        let _write = sh.begin_write();
        let removed = sh
            .source
            .remove_with_old(id, old_entry)
            .map_err(|e| sh.fail(Operation::Remove, Some(id), e))?;
        sh.write_through_remove(id);
        Ok(removed)
    }

    fn browse(
        &self,
        filter: Option<&Filter<S::Item>>,
        visit: &mut Visitor<'_, S::Item>,
    ) -> Result<BrowseSummary> {
        let sh = &self.shared;
        sh.cache
            .browse(filter, visit)
            .map_err(|e| sh.fail(Operation::Browse, None, e))
    }

    fn find(&self, filter: &Filter<S::Item>) -> Vec<EntryId> {
        self.shared.cache.find(filter)
    }

    fn find_once(&self, filter: &Filter<S::Item>) -> Option<EntryId> {
        self.shared.cache.find_once(filter)
    }
}

// ============================================================================
// Observable
// ============================================================================

impl<S, C> Observable for ReconcilingStore<S, C>
where
    S: Observable + 'static,
    S::Item: PartialEq,
    C: Store<Item = S::Item> + 'static,
{
    fn bind_handler(&self, topic: Topic, handler: EventHandler<S::Item>) -> HandlerId {
        self.shared.bus.bind_handler(topic, handler)
    }

    fn unbind(&self, topic: &Topic, id: &str) -> bool {
        self.shared.bus.unbind(topic, id)
    }

    fn trigger(&self, topic: &Topic, event: &StoreEvent<S::Item>) -> usize {
        self.shared.bus.trigger(topic, event)
    }
}
