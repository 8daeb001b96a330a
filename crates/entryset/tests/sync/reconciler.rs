//! ReconcilingStore tests.
//!
//! Uses a counting mock source (an observable in-memory store that records
//! reads and can be told to fail) and, for failure paths, a cache that
//! refuses writes.

use std::collections::HashSet;
use std::ops::ControlFlow;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use chrono::TimeDelta;
use parking_lot::Mutex;
use serde_json::{json, Value};

use entryset::query::Filter;
use entryset::reactive::{
    EventHandler, EventType, HandlerId, Observable, ObservableExt, ObservableOptions,
    ObservableStore, StoreEvent, Topic,
};
use entryset::storage::memory::ConvertFn;
use entryset::storage::{MemoryStore, Store, StoreOptions, Visitor};
use entryset::sync::{ReconcileOptions, ReconcilingStore};
use entryset::types::{epoch, parse_timestamp};
use entryset::{BrowseSummary, EntryId, Result, StoreError, Updated};

// ============================================================================
// Mock source
// ============================================================================

/// Observable source that counts reads and starts without replaying, like a
/// remote adapter.
struct CountingSource {
    inner: ObservableStore<MemoryStore<Value>>,
    reads: AtomicUsize,
    failing_reads: Mutex<HashSet<String>>,
}

impl CountingSource {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            inner: ObservableStore::in_memory("remote"),
            reads: AtomicUsize::new(0),
            failing_reads: Mutex::new(HashSet::new()),
        })
    }

    /// Put entries in place without emitting events.
    fn seed(&self, entries: &[Value]) {
        for entry in entries {
            self.inner.inner().create(entry.clone()).unwrap();
        }
    }

    fn reads(&self) -> usize {
        self.reads.load(Ordering::SeqCst)
    }

    fn fail_reads_of(&self, id: &str) {
        self.failing_reads.lock().insert(id.to_string());
    }

    fn handler_count(&self) -> usize {
        self.inner.bus().size()
    }
}

impl Store for CountingSource {
    type Item = Value;

    fn name(&self) -> &str {
        self.inner.name()
    }

    fn start(&self) -> Result<()> {
        self.inner.inner().start()
    }

    fn create(&self, entry: Value) -> Result<(EntryId, Value)> {
        self.inner.create(entry)
    }

    fn read(&self, id: &str) -> Result<Value> {
        self.reads.fetch_add(1, Ordering::SeqCst);
        if self.failing_reads.lock().contains(id) {
            return Err(StoreError::backend("remote", "connection reset"));
        }
        self.inner.read(id)
    }

    fn update(&self, id: &str, entry: Value) -> Result<Updated<Value>> {
        self.inner.update(id, entry)
    }

    fn update_with_old(&self, id: &str, entry: Value, old_entry: Value) -> Result<Updated<Value>> {
        self.inner.update_with_old(id, entry, old_entry)
    }

    fn remove(&self, id: &str) -> Result<Value> {
        self.inner.remove(id)
    }

    fn browse(
        &self,
        filter: Option<&Filter<Value>>,
        visit: &mut Visitor<'_, Value>,
    ) -> Result<BrowseSummary> {
        self.inner.browse(filter, visit)
    }

    fn find(&self, filter: &Filter<Value>) -> Vec<EntryId> {
        self.inner.find(filter)
    }
}

impl Observable for CountingSource {
    fn bind_handler(&self, topic: Topic, handler: EventHandler<Value>) -> HandlerId {
        self.inner.bind_handler(topic, handler)
    }

    fn unbind(&self, topic: &Topic, id: &str) -> bool {
        self.inner.unbind(topic, id)
    }

    fn trigger(&self, topic: &Topic, event: &StoreEvent<Value>) -> usize {
        self.inner.trigger(topic, event)
    }
}

// ============================================================================
// Mock cache
// ============================================================================

/// Memory cache whose creates can be switched off.
struct RefusingCache {
    inner: MemoryStore<Value>,
    refuse_creates: AtomicBool,
}

impl RefusingCache {
    fn new() -> Self {
        Self {
            inner: MemoryStore::named("local"),
            refuse_creates: AtomicBool::new(false),
        }
    }
}

impl Store for RefusingCache {
    type Item = Value;

    fn name(&self) -> &str {
        self.inner.name()
    }

    fn create(&self, entry: Value) -> Result<(EntryId, Value)> {
        if self.refuse_creates.load(Ordering::SeqCst) {
            return Err(StoreError::backend("local", "quota exceeded"));
        }
        self.inner.create(entry)
    }

    fn read(&self, id: &str) -> Result<Value> {
        self.inner.read(id)
    }

    fn update(&self, id: &str, entry: Value) -> Result<Updated<Value>> {
        self.inner.update(id, entry)
    }

    fn update_with_old(&self, id: &str, entry: Value, old_entry: Value) -> Result<Updated<Value>> {
        self.inner.update_with_old(id, entry, old_entry)
    }

    fn remove(&self, id: &str) -> Result<Value> {
        self.inner.remove(id)
    }

    fn browse(
        &self,
        filter: Option<&Filter<Value>>,
        visit: &mut Visitor<'_, Value>,
    ) -> Result<BrowseSummary> {
        self.inner.browse(filter, visit)
    }

    fn find(&self, filter: &Filter<Value>) -> Vec<EntryId> {
        self.inner.find(filter)
    }
}

// ============================================================================
// Helpers
// ============================================================================

type Log = Arc<Mutex<Vec<String>>>;

fn record<S: Observable<Item = Value>>(store: &S) -> Log {
    let log: Log = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&log);
    store.on(EventType::Any, move |event| {
        let line = match event.entry_id() {
            Some(id) => format!("{}:{id}", event.event_type()),
            None => event.event_type().to_string(),
        };
        sink.lock().push(line);
    });
    log
}

fn cached(source: &Arc<CountingSource>) -> ReconcilingStore<CountingSource, MemoryStore<Value>> {
    ReconcilingStore::new(
        Arc::clone(source),
        MemoryStore::named("local"),
        ReconcileOptions::default(),
    )
}

fn cache_ids<C: Store<Item = Value>>(cache: &C) -> Vec<String> {
    let mut ids = Vec::new();
    cache
        .browse(None, &mut |id, _| {
            ids.push(id.clone());
            ControlFlow::Continue(())
        })
        .unwrap();
    ids
}

// ============================================================================
// Bootstrap
// ============================================================================

#[test]
fn start_with_empty_cache_merges_from_epoch_and_announces_once() {
    let source = CountingSource::new();
    source.seed(&[json!({ "id": "1", "modified": "2020-01-01T00:00:00Z" })]);
    let store = cached(&source);
    let log = record(&store);

    assert_eq!(store.watermark(), epoch());
    store.start().unwrap();

    assert_eq!(cache_ids(store.cache()), vec!["1"]);
    assert_eq!(store.cache().read("1").unwrap()["modified"], "2020-01-01T00:00:00Z");
    assert_eq!(*log.lock(), vec!["added:1", "started"]);
    assert!(store.is_started());
}

#[test]
fn start_replays_cached_entries_before_merging() {
    let source = CountingSource::new();
    source.seed(&[
        json!({ "id": "a", "modified": "2021-01-01T00:00:00Z" }),
        json!({ "id": "b", "modified": "2021-01-02T00:00:00Z" }),
    ]);
    let cache: MemoryStore<Value> = MemoryStore::named("local");
    cache
        .create(json!({ "id": "a", "modified": "2021-01-01T00:00:00Z" }))
        .unwrap();
    let store = ReconcilingStore::new(Arc::clone(&source), cache, ReconcileOptions::default());
    let log = record(&store);

    store.start().unwrap();

    assert_eq!(*log.lock(), vec!["added:a", "added:b", "started"]);
    assert_eq!(cache_ids(store.cache()), vec!["a", "b"]);
}

#[test]
fn watermark_is_newest_cached_modified_minus_skew() {
    let source = CountingSource::new();
    let cache: MemoryStore<Value> = MemoryStore::named("local");
    cache
        .create(json!({ "id": "old", "modified": "2021-01-01T00:00:00Z" }))
        .unwrap();
    cache
        .create(json!({ "id": "new", "modified": "2021-03-01T12:00:00Z" }))
        .unwrap();
    let store = ReconcilingStore::new(Arc::clone(&source), cache, ReconcileOptions::default());

    assert_eq!(
        store.watermark(),
        parse_timestamp("2021-03-01T11:00:00Z").unwrap()
    );
}

#[test]
fn watermark_skew_is_configurable() {
    let source = CountingSource::new();
    let cache: MemoryStore<Value> = MemoryStore::named("local");
    cache
        .create(json!({ "id": "1", "modified": "2021-03-01T12:00:00Z" }))
        .unwrap();
    let store = ReconcilingStore::new(
        Arc::clone(&source),
        cache,
        ReconcileOptions {
            watermark_skew: TimeDelta::minutes(5),
            ..Default::default()
        },
    );

    assert_eq!(
        store.watermark(),
        parse_timestamp("2021-03-01T11:55:00Z").unwrap()
    );
}

#[test]
fn watermark_ignores_undated_cache_entries() {
    let source = CountingSource::new();
    let cache: MemoryStore<Value> = MemoryStore::named("local");
    cache.create(json!({ "id": "1" })).unwrap();
    let store = ReconcilingStore::new(Arc::clone(&source), cache, ReconcileOptions::default());

    assert_eq!(store.watermark(), epoch());
}

#[test]
fn merge_is_idempotent() {
    let source = CountingSource::new();
    source.seed(&[
        json!({ "id": "1", "modified": "2020-01-01T00:00:00Z" }),
        json!({ "id": "2", "modified": "2020-02-01T00:00:00Z" }),
        json!({ "id": "3" }),
    ]);
    let store = cached(&source);
    let log = record(&store);

    let first = store.merge(epoch());
    let second = store.merge(epoch());

    assert_eq!((first.scanned, first.added, first.failed), (3, 3, 0));
    assert_eq!((second.scanned, second.added, second.failed), (3, 0, 0));
    assert_eq!(cache_ids(store.cache()), vec!["1", "2", "3"]);
    assert_eq!(*log.lock(), vec!["added:1", "added:2", "added:3"]);
}

#[test]
fn merge_only_scans_entries_at_or_after_watermark() {
    let source = CountingSource::new();
    source.seed(&[
        json!({ "id": "old", "modified": "2019-01-01T00:00:00Z" }),
        json!({ "id": "new", "modified": "2020-06-01T00:00:00Z" }),
    ]);
    let store = cached(&source);

    let report = store.merge(parse_timestamp("2020-01-01T00:00:00Z").unwrap());

    assert_eq!(report.scanned, 1);
    assert_eq!(cache_ids(store.cache()), vec!["new"]);
}

#[test]
fn merge_continues_past_failed_entries() {
    let source = CountingSource::new();
    source.seed(&[json!({ "id": "1" }), json!({ "id": "2" }), json!({ "id": "3" })]);
    source.fail_reads_of("2");
    let store = cached(&source);
    let log = record(&store);

    let report = store.merge(epoch());

    assert_eq!((report.scanned, report.added, report.failed), (3, 2, 1));
    assert_eq!(cache_ids(store.cache()), vec!["1", "3"]);
    assert_eq!(*log.lock(), vec!["added:1", "error:2", "added:3"]);
}

#[test]
fn keyless_update_stays_under_its_id_across_merges() {
    let source = CountingSource::new();
    source.seed(&[json!({ "id": "1" })]);
    let store = cached(&source);

    store.update("1", json!({ "name": "b" })).unwrap();
    assert_eq!(cache_ids(store.cache()), vec!["1"]);

    let first = store.merge(epoch());
    let second = store.merge(epoch());

    assert_eq!((first.added, second.added), (0, 0));
    assert_eq!(cache_ids(store.cache()), vec!["1"]);
    assert_eq!(store.cache().read("1").unwrap()["name"], "b");
}

#[test]
fn source_entries_without_ids_are_cached_under_their_key() {
    let strip_id: Arc<ConvertFn<Value>> = Arc::new(|_: &str, entry: &Value| {
        let mut entry = entry.clone();
        entry.as_object_mut()?.remove("id");
        Some(entry)
    });
    let source = Arc::new(ObservableStore::new(
        MemoryStore::new(StoreOptions {
            entry_out: Some(strip_id),
            ..StoreOptions::named("bare")
        }),
        ObservableOptions::default(),
    ));
    source.inner().create(json!({ "id": "1", "v": 1 })).unwrap();
    let store = ReconcilingStore::new(
        Arc::clone(&source),
        MemoryStore::named("local"),
        ReconcileOptions::default(),
    );

    store.read("1").unwrap();
    store.read("1").unwrap();
    let report = store.merge(epoch());

    assert_eq!(report.added, 0);
    assert_eq!(cache_ids(store.cache()), vec!["1"]);
}

// ============================================================================
// Read-through
// ============================================================================

#[test]
fn read_miss_populates_cache_and_skips_source_afterwards() {
    let source = CountingSource::new();
    source.seed(&[json!({ "id": "x", "title": "remote" })]);
    let store = cached(&source);
    let log = record(&store);

    let first = store.read("x").unwrap();
    assert_eq!(first["title"], "remote");
    assert_eq!(source.reads(), 1);
    assert_eq!(cache_ids(store.cache()), vec!["x"]);

    let second = store.read("x").unwrap();
    assert_eq!(second, first);
    assert_eq!(source.reads(), 1, "cache hit must not reach the source");
    assert_eq!(*log.lock(), vec!["added:x"]);
}

#[test]
fn read_missing_everywhere_fails_with_not_found() {
    let source = CountingSource::new();
    let store = cached(&source);
    let log = record(&store);

    assert!(store.read("ghost").unwrap_err().is_not_found());
    assert_eq!(*log.lock(), vec!["error:ghost"]);
}

// ============================================================================
// Write-through
// ============================================================================

#[test]
fn create_writes_source_then_cache_and_announces_once() {
    let source = CountingSource::new();
    let store = cached(&source);
    let log = record(&store);

    let (id, entry) = store.create(json!({ "id": "n1", "body": "hi" })).unwrap();

    assert_eq!(id, "n1");
    assert_eq!(entry["body"], "hi");
    assert_eq!(source.find(&Filter::attribute("id", "n1")), vec!["n1"]);
    assert_eq!(cache_ids(store.cache()), vec!["n1"]);
    assert_eq!(*log.lock(), vec!["added:n1"]);
}

#[test]
fn update_and_remove_announce_once() {
    let source = CountingSource::new();
    let store = cached(&source);
    store.create(json!({ "id": "1", "v": 1 })).unwrap();
    let log = record(&store);

    let updated = store.update("1", json!({ "id": "1", "v": 2 })).unwrap();
    assert_eq!(updated.old_entry["v"], 1);
    assert_eq!(store.cache().read("1").unwrap()["v"], 2);

    store.remove("1").unwrap();
    assert!(store.cache().is_empty());
    assert!(source.read("1").unwrap_err().is_not_found());

    assert_eq!(*log.lock(), vec!["updated:1", "removed:1"]);
}

#[test]
fn failed_source_write_leaves_cache_untouched() {
    let source = CountingSource::new();
    let store = cached(&source);
    store.create(json!({ "id": "1" })).unwrap();
    let log = record(&store);

    let err = store.create(json!({ "id": "1", "v": 9 })).unwrap_err();
    assert!(matches!(err, StoreError::AlreadyExists { .. }));
    assert!(store.update("absent", json!({ "id": "absent" })).is_err());

    assert_eq!(cache_ids(store.cache()), vec!["1"]);
    assert_eq!(*log.lock(), vec!["error", "error:absent"]);
}

#[test]
fn cache_failure_after_source_create_is_surfaced_without_rollback() {
    let source = CountingSource::new();
    let cache = RefusingCache::new();
    cache.refuse_creates.store(true, Ordering::SeqCst);
    let store = ReconcilingStore::new(Arc::clone(&source), cache, ReconcileOptions::default());
    let log = record(&store);

    let err = store.create(json!({ "id": "1" })).unwrap_err();

    assert!(matches!(err, StoreError::Backend { .. }));
    // Only the source's own `added` event attempted the cache insert.
    assert_eq!(source.reads(), 1);
    assert_eq!(*log.lock(), vec!["error:1"]);
    assert!(source.read("1").is_ok(), "source write stays committed");
}

// ============================================================================
// Source events
// ============================================================================

#[test]
fn direct_source_changes_are_mirrored_and_republished() {
    let source = CountingSource::new();
    let store = cached(&source);
    let log = record(&store);

    source.create(json!({ "id": "s1", "v": 1 })).unwrap();
    source.update("s1", json!({ "id": "s1", "v": 2 })).unwrap();
    assert_eq!(store.cache().read("s1").unwrap()["v"], 2);
    source.remove("s1").unwrap();

    assert!(store.cache().is_empty());
    assert_eq!(*log.lock(), vec!["added:s1", "updated:s1", "removed:s1"]);
}

#[test]
fn source_update_for_uncached_entry_falls_back_to_insert() {
    let source = CountingSource::new();
    source.seed(&[json!({ "id": "1", "v": 1 })]);
    let store = cached(&source);
    let log = record(&store);

    source.update("1", json!({ "id": "1", "v": 2 })).unwrap();

    assert_eq!(store.cache().read("1").unwrap()["v"], 2);
    assert_eq!(*log.lock(), vec!["added:1"]);
}

#[test]
fn source_removed_for_uncached_id_is_ignored() {
    let source = CountingSource::new();
    let store = cached(&source);
    let log = record(&store);

    let delivered = source.emit(StoreEvent::Removed {
        entry_id: "ghost".into(),
        entry: json!({ "id": "ghost" }),
    });

    assert!(delivered > 0);
    assert!(log.lock().is_empty());
    assert!(store.cache().is_empty());
}

#[test]
fn duplicate_source_added_is_ignored() {
    let source = CountingSource::new();
    let store = cached(&source);
    store.create(json!({ "id": "1" })).unwrap();
    let log = record(&store);
    let reads = source.reads();

    source.emit(StoreEvent::Added {
        entry_id: "1".into(),
        entry: json!({ "id": "1" }),
    });

    assert!(log.lock().is_empty());
    assert_eq!(source.reads(), reads, "cached id needs no source read");
}

// ============================================================================
// Queries and lifecycle
// ============================================================================

#[test]
fn queries_are_served_by_the_cache() {
    let source = CountingSource::new();
    source.seed(&[json!({ "id": "remote-only", "kind": "a" })]);
    let store = cached(&source);
    store.create(json!({ "id": "both", "kind": "a" })).unwrap();

    assert_eq!(store.find(&Filter::attribute("kind", "a")), vec!["both"]);
    assert_eq!(store.find_once(&Filter::attribute("kind", "a")), Some("both".into()));
}

#[test]
fn init_announces_initialized() {
    let source = CountingSource::new();
    let store = cached(&source);
    let log = record(&store);

    store.init().unwrap();

    assert_eq!(*log.lock(), vec!["initialized"]);
}

#[test]
fn default_name_derives_from_source() {
    let source = CountingSource::new();
    assert_eq!(cached(&source).name(), "remote:cached");
}

#[test]
fn dropping_the_store_releases_source_handlers() {
    let source = CountingSource::new();
    let before = source.handler_count();

    let store = cached(&source);
    assert_eq!(source.handler_count(), before + 3);

    drop(store);
    assert_eq!(source.handler_count(), before);

    source.create(json!({ "id": "after" })).unwrap();
}
