//! Core data types shared by every store: entries, ids, traversal summaries.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Key of an entry within one store.
pub type EntryId = String;

/// Attribute holding the entry key on JSON entries.
pub const ID_ATTRIBUTE: &str = "id";

/// Attribute holding the ISO 8601 freshness marker.
pub const MODIFIED_ATTRIBUTE: &str = "modified";

// ============================================================================
// Entry
// ============================================================================

/// A record that can live inside a [`Store`](crate::storage::traits::Store).
///
/// Attribute access is what attribute-equality filters and named queries
/// operate on; everything else about the entry is opaque to the stores.
pub trait Entry: Clone + Send + Sync + 'static {
    /// The identifying key carried by the entry itself, if any.
    fn id(&self) -> Option<EntryId>;

    /// Stamp an assigned key onto the entry. Entries that cannot carry a key
    /// ignore this.
    fn set_id(&mut self, id: &str);

    /// Look up a named attribute.
    fn attribute(&self, key: &str) -> Option<&Value>;

    /// The `modified` marker parsed as an RFC 3339 timestamp.
    ///
    /// Missing or unparseable markers are `None`, which callers treat as
    /// "never modified".
    fn modified(&self) -> Option<DateTime<Utc>> {
        self.attribute(MODIFIED_ATTRIBUTE)
            .and_then(Value::as_str)
            .and_then(parse_timestamp)
    }
}

impl Entry for Value {
    fn id(&self) -> Option<EntryId> {
        match self.get(ID_ATTRIBUTE)? {
            Value::String(s) => Some(s.clone()),
            Value::Number(n) => Some(n.to_string()),
            _ => None,
        }
    }

    fn set_id(&mut self, id: &str) {
        if let Value::Object(map) = self {
            map.insert(ID_ATTRIBUTE.to_string(), Value::String(id.to_string()));
        }
    }

    fn attribute(&self, key: &str) -> Option<&Value> {
        self.as_object().and_then(|map| map.get(key))
    }
}

/// Parse an ISO 8601 timestamp, accepting fractional seconds of any width.
pub fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw.trim())
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

/// The time-zero watermark (`1970-01-01T00:00:00Z`).
pub fn epoch() -> DateTime<Utc> {
    DateTime::<Utc>::UNIX_EPOCH
}

// ============================================================================
// Operation results
// ============================================================================

/// Result of a successful `update`.
#[derive(Debug, Clone, PartialEq)]
pub struct Updated<E> {
    pub entry_id: EntryId,
    pub entry: E,
    /// The caller-supplied previous entry, or the converted pre-update value.
    pub old_entry: E,
}

/// Summary delivered once a `browse` traversal ends.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BrowseSummary {
    /// Number of entries handed to the visitor.
    pub count: usize,
    /// Whether the visitor stopped the traversal early.
    pub stopped: bool,
}

/// Which store operation an error or report refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Operation {
    Init,
    Start,
    Create,
    Read,
    Update,
    Remove,
    Browse,
    Reconcile,
    Merge,
}

impl Operation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Init => "init",
            Self::Start => "start",
            Self::Create => "create",
            Self::Read => "read",
            Self::Update => "update",
            Self::Remove => "remove",
            Self::Browse => "browse",
            Self::Reconcile => "reconcile",
            Self::Merge => "merge",
        }
    }
}

impl std::fmt::Display for Operation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
