//! Entry filters used by `find`, `find_once` and `browse`.
//!
//! A filter is either a predicate over an entry, an attribute-equality map,
//! or a named query that only a store can evaluate (it needs to see every
//! entry, not one at a time).

use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde_json::{Map, Value};

use crate::types::{epoch, Entry};

/// Predicate closure type for [`Filter::Predicate`].
pub type PredicateFn<E> = dyn Fn(&E) -> bool + Send + Sync;

// ============================================================================
// NamedQuery
// ============================================================================

/// Store-evaluated queries referenced by name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NamedQuery {
    /// At most one entry: the one with the greatest `modified` marker.
    LastModified,
    /// Entries whose `modified` marker is at or after the given instant.
    ModifiedSince(DateTime<Utc>),
}

impl NamedQuery {
    pub fn name(&self) -> &'static str {
        match self {
            Self::LastModified => "last-modified",
            Self::ModifiedSince(_) => "modified-since",
        }
    }
}

// ============================================================================
// Filter
// ============================================================================

/// Selection criteria over entries of type `E`.
pub enum Filter<E> {
    Predicate(Arc<PredicateFn<E>>),
    /// Every listed attribute must be present and equal. An empty map matches
    /// nothing, so an accidental `{}` never turns into a full scan.
    Attributes(Map<String, Value>),
    Named(NamedQuery),
}

impl<E> Filter<E> {
    pub fn predicate(f: impl Fn(&E) -> bool + Send + Sync + 'static) -> Self {
        Self::Predicate(Arc::new(f))
    }

    /// Single attribute equality, e.g. `Filter::attribute("type", "added")`.
    pub fn attribute(key: impl Into<String>, value: impl Into<Value>) -> Self {
        let mut map = Map::new();
        map.insert(key.into(), value.into());
        Self::Attributes(map)
    }

    /// Build an attribute filter from a JSON object. Non-objects yield an
    /// empty (match-nothing) filter.
    pub fn attributes(value: Value) -> Self {
        match value {
            Value::Object(map) => Self::Attributes(map),
            _ => Self::Attributes(Map::new()),
        }
    }

    pub fn last_modified() -> Self {
        Self::Named(NamedQuery::LastModified)
    }

    pub fn modified_since(since: DateTime<Utc>) -> Self {
        Self::Named(NamedQuery::ModifiedSince(since))
    }
}

impl<E: Entry> Filter<E> {
    /// Evaluate the filter against a single entry.
    ///
    /// `LastModified` needs the whole set to decide; evaluated alone it
    /// accepts every entry and stores narrow the result themselves.
    pub fn matches(&self, entry: &E) -> bool {
        match self {
            Self::Predicate(f) => f(entry),
            Self::Attributes(map) => attributes_match(entry, map),
            Self::Named(NamedQuery::ModifiedSince(since)) => modified_or_epoch(entry) >= *since,
            Self::Named(NamedQuery::LastModified) => true,
        }
    }
}

/// `true` when `map` is non-empty and every key is present on `entry` with
/// an equal value.
pub fn attributes_match<E: Entry>(entry: &E, map: &Map<String, Value>) -> bool {
    !map.is_empty()
        && map
            .iter()
            .all(|(key, expected)| entry.attribute(key) == Some(expected))
}

/// The entry's `modified` marker, with absence treated as time zero.
pub fn modified_or_epoch<E: Entry>(entry: &E) -> DateTime<Utc> {
    entry.modified().unwrap_or_else(epoch)
}

impl<E> Clone for Filter<E> {
    fn clone(&self) -> Self {
        match self {
            Self::Predicate(f) => Self::Predicate(Arc::clone(f)),
            Self::Attributes(map) => Self::Attributes(map.clone()),
            Self::Named(q) => Self::Named(*q),
        }
    }
}

impl<E> fmt::Debug for Filter<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Predicate(_) => f.write_str("Filter::Predicate(..)"),
            Self::Attributes(map) => f.debug_tuple("Filter::Attributes").field(map).finish(),
            Self::Named(q) => f.debug_tuple("Filter::Named").field(q).finish(),
        }
    }
}
