//! Tests for `DeferredStore<E>`.

use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::{json, Value};

use entryset::query::Filter;
use entryset::reactive::{EventType, Observable, ObservableExt, ObservableStore, Topic};
use entryset::registry::{DeferredStore, Registry};
use entryset::storage::{MemoryStore, Store};
use entryset::StoreError;

type Notes = ObservableStore<MemoryStore<Value>>;

fn registry() -> Arc<Registry<Value>> {
    Arc::new(Registry::new("app"))
}

fn notes() -> Arc<Notes> {
    Arc::new(ObservableStore::in_memory("notes"))
}

fn counter() -> Arc<Mutex<Vec<String>>> {
    Arc::new(Mutex::new(Vec::new()))
}

#[test]
fn data_operations_fail_until_registered() {
    let registry = registry();
    let deferred = DeferredStore::new(&registry, "notes");

    assert!(!deferred.is_ready());
    let err = deferred.create(json!({ "id": "1" })).unwrap_err();
    assert!(matches!(err, StoreError::NotReady { ref name } if name == "notes"));
    assert!(matches!(deferred.read("1"), Err(StoreError::NotReady { .. })));
    assert!(deferred.find(&Filter::attribute("id", "1")).is_empty());
    assert_eq!(deferred.find_once(&Filter::attribute("id", "1")), None);
}

#[test]
fn queued_bindings_are_replayed_on_registration() {
    let registry = registry();
    let deferred = DeferredStore::new(&registry, "notes");
    let log = counter();
    {
        let log = Arc::clone(&log);
        deferred.on(EventType::Added, move |event| {
            log.lock().extend(event.entry_id().map(str::to_string));
        });
    }

    let store = notes();
    registry.register("notes", store.clone()).unwrap();
    assert!(deferred.is_ready());

    deferred.create(json!({ "id": "via-deferred" })).unwrap();
    store.create(json!({ "id": "direct" })).unwrap();

    assert_eq!(*log.lock(), vec!["via-deferred", "direct"]);
    assert!(store.read("via-deferred").is_ok());
}

#[test]
fn registrations_under_other_names_are_ignored() {
    let registry = registry();
    let deferred = DeferredStore::new(&registry, "notes");

    registry.register("tasks", notes()).unwrap();

    assert!(!deferred.is_ready());
}

#[test]
fn existing_registration_resolves_immediately() {
    let registry = registry();
    let store = notes();
    registry.register("notes", store.clone()).unwrap();

    let deferred = DeferredStore::new(&registry, "notes");

    assert!(deferred.is_ready());
    assert_eq!(deferred.target().unwrap().name(), "notes");
}

#[test]
fn unbind_before_registration_cancels_the_queued_binding() {
    let registry = registry();
    let deferred = DeferredStore::new(&registry, "notes");
    let log = counter();
    let id = {
        let log = Arc::clone(&log);
        deferred.on(EventType::Added, move |_| log.lock().push("hit".into()))
    };

    assert!(deferred.unbind(&EventType::Added.into(), &id));
    assert!(!deferred.unbind(&EventType::Added.into(), "deferred-999"));

    let store = notes();
    registry.register("notes", store.clone()).unwrap();
    store.create(json!({ "id": "1" })).unwrap();

    assert!(log.lock().is_empty());
    assert_eq!(store.bus().size(), 0);
}

#[test]
fn provisional_ids_stay_valid_after_resolution() {
    let registry = registry();
    let deferred = DeferredStore::new(&registry, "notes");
    let log = counter();
    let id = {
        let log = Arc::clone(&log);
        deferred.on(EventType::Added, move |_| log.lock().push("hit".into()))
    };
    assert!(id.starts_with("deferred-"));

    let store = notes();
    registry.register("notes", store.clone()).unwrap();

    assert!(deferred.unbind(&Topic::Type(EventType::Added), &id));
    store.create(json!({ "id": "1" })).unwrap();

    assert!(log.lock().is_empty());
}

#[test]
fn replay_happens_exactly_once() {
    let registry = registry();
    let deferred = DeferredStore::new(&registry, "notes");
    let log = counter();
    {
        let log = Arc::clone(&log);
        deferred.on(EventType::Added, move |_| log.lock().push("hit".into()));
    }

    let store = notes();
    registry.register("notes", store.clone()).unwrap();
    // Starting the registry replays its entries as `added` again.
    registry.start().unwrap();
    store.create(json!({ "id": "1" })).unwrap();

    assert_eq!(log.lock().len(), 1);
    assert_eq!(store.bus().size(), 1);
}

#[test]
fn dropping_a_pending_store_releases_its_registry_handler() {
    let registry = registry();
    let before = registry.directory().bus().size();

    let deferred = DeferredStore::new(&registry, "notes");
    assert_eq!(registry.directory().bus().size(), before + 1);

    drop(deferred);
    assert_eq!(registry.directory().bus().size(), before);
}
