//! Registry: an explicit, caller-owned directory of named stores.
//!
//! The directory is itself an [`ObservableStore`]: registering a store emits
//! `added`, teardown emits `removed` per store. Lifecycle is
//! `register…` → `init` → `start` → `teardown`.

use std::ops::ControlFlow;
use std::sync::Arc;

use serde_json::{Map, Value};

use crate::error::Result;
use crate::reactive::observable::Observable;
use crate::reactive::store::{ObservableOptions, ObservableStore};
use crate::storage::memory::{MemoryStore, StoreOptions};
use crate::storage::traits::Store;
use crate::types::{Entry, EntryId, ID_ATTRIBUTE};

/// Attribute carrying the registered name.
pub const NAME_ATTRIBUTE: &str = "name";

/// Type-erased handle on a registered store.
pub type SharedStore<E> = Arc<dyn Observable<Item = E>>;

// ============================================================================
// RegisteredStore
// ============================================================================

/// Directory entry: a store under its registered name.
pub struct RegisteredStore<E: Entry> {
    attributes: Map<String, Value>,
    store: SharedStore<E>,
}

impl<E: Entry> RegisteredStore<E> {
    pub fn new(name: impl Into<String>, store: SharedStore<E>) -> Self {
        let name = Value::String(name.into());
        let mut attributes = Map::new();
        attributes.insert(ID_ATTRIBUTE.to_string(), name.clone());
        attributes.insert(NAME_ATTRIBUTE.to_string(), name);
        Self { attributes, store }
    }

    pub fn name(&self) -> &str {
        self.attributes
            .get(NAME_ATTRIBUTE)
            .and_then(Value::as_str)
            .unwrap_or_default()
    }

    pub fn store(&self) -> &SharedStore<E> {
        &self.store
    }
}

impl<E: Entry> Clone for RegisteredStore<E> {
    fn clone(&self) -> Self {
        Self {
            attributes: self.attributes.clone(),
            store: Arc::clone(&self.store),
        }
    }
}

impl<E: Entry> Entry for RegisteredStore<E> {
    fn id(&self) -> Option<EntryId> {
        Some(self.name().to_string())
    }

    /// Registered names are fixed.
    fn set_id(&mut self, _id: &str) {}

    fn attribute(&self, key: &str) -> Option<&Value> {
        self.attributes.get(key)
    }
}

// ============================================================================
// Registry
// ============================================================================

pub struct Registry<E: Entry> {
    stores: ObservableStore<MemoryStore<RegisteredStore<E>>>,
}

impl<E: Entry> Registry<E> {
    pub fn new(name: impl Into<String>) -> Self {
        let options = ObservableOptions {
            replay_with_read: false,
            ..Default::default()
        };
        Self {
            stores: ObservableStore::new(MemoryStore::new(StoreOptions::named(name)), options),
        }
    }

    /// The directory itself, for binding to registration events.
    pub fn directory(&self) -> &ObservableStore<MemoryStore<RegisteredStore<E>>> {
        &self.stores
    }

    /// Register `store` under `name`. A taken name fails with
    /// `AlreadyExists`.
    pub fn register(&self, name: &str, store: SharedStore<E>) -> Result<()> {
        self.stores.create(RegisteredStore::new(name, store))?;
        tracing::debug!(registry = %self.stores.name(), store = %name, "store registered");
        Ok(())
    }

    pub fn lookup(&self, name: &str) -> Option<SharedStore<E>> {
        self.stores
            .inner()
            .read(name)
            .ok()
            .map(|registered| registered.store)
    }

    pub fn unregister(&self, name: &str) -> Result<SharedStore<E>> {
        self.stores.remove(name).map(|registered| registered.store)
    }

    /// Registered names in registration order.
    pub fn names(&self) -> Vec<EntryId> {
        self.registered().into_iter().map(|(name, _)| name).collect()
    }

    /// Initialize every registered store in registration order. All stores
    /// are attempted; the first failure is returned.
    pub fn init(&self) -> Result<()> {
        self.stores.init()?;
        self.each(|store| store.init())
    }

    /// Start every registered store in registration order. All stores are
    /// attempted; the first failure is returned.
    pub fn start(&self) -> Result<()> {
        self.each(|store| store.start())?;
        self.stores.start()
    }

    /// Unregister every store. Returns how many were removed.
    pub fn teardown(&self) -> Result<usize> {
        let removed = self.stores.remove_all()?;
        tracing::debug!(registry = %self.stores.name(), removed, "registry torn down");
        Ok(removed)
    }

    fn registered(&self) -> Vec<(EntryId, SharedStore<E>)> {
        let mut out = Vec::new();
        let browsed = self.stores.inner().browse(None, &mut |name, registered| {
            out.push((name.clone(), Arc::clone(registered.store())));
            ControlFlow::Continue(())
        });
        if let Err(e) = browsed {
            tracing::warn!(registry = %self.stores.name(), error = %e, "registry scan failed");
        }
        out
    }

    fn each(&self, op: impl Fn(&SharedStore<E>) -> Result<()>) -> Result<()> {
        let mut first = None;
        for (name, store) in self.registered() {
            if let Err(e) = op(&store) {
                tracing::warn!(registry = %self.stores.name(), store = %name, error = %e, "registered store failed");
                first.get_or_insert(e);
            }
        }
        match first {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}
