//! Event tags and payloads dispatched by observable stores.
//!
//! Events are transient: they are delivered synchronously to the handlers
//! registered at trigger time and never persisted.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::StoreError;
use crate::types::{EntryId, Operation};

/// Attribute under which a registration records its event type.
pub const TYPE_ATTRIBUTE: &str = "type";

/// Tag of the wildcard group, delivered after every typed group.
pub const WILDCARD: &str = "*";

// ============================================================================
// EventType
// ============================================================================

/// Event type tags understood by the bus.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "String", from = "String")]
pub enum EventType {
    Added,
    Updated,
    Removed,
    Error,
    Initialized,
    Started,
    /// Application-defined tag.
    Named(String),
    /// The wildcard `*`.
    Any,
}

impl EventType {
    pub fn as_str(&self) -> &str {
        match self {
            Self::Added => "added",
            Self::Updated => "updated",
            Self::Removed => "removed",
            Self::Error => "error",
            Self::Initialized => "initialized",
            Self::Started => "started",
            Self::Named(name) => name,
            Self::Any => WILDCARD,
        }
    }
}

impl From<&str> for EventType {
    fn from(tag: &str) -> Self {
        match tag {
            "added" => Self::Added,
            "updated" => Self::Updated,
            "removed" => Self::Removed,
            "error" => Self::Error,
            "initialized" => Self::Initialized,
            "started" => Self::Started,
            WILDCARD => Self::Any,
            other => Self::Named(other.to_string()),
        }
    }
}

impl From<String> for EventType {
    fn from(tag: String) -> Self {
        Self::from(tag.as_str())
    }
}

impl From<EventType> for String {
    fn from(ty: EventType) -> Self {
        ty.as_str().to_string()
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// Topic
// ============================================================================

/// What a handler is bound to: a type tag, or an attribute filter over the
/// registration (which always includes a `type` attribute when bound by tag).
#[derive(Debug, Clone, PartialEq)]
pub enum Topic {
    Type(EventType),
    Filter(Map<String, Value>),
}

impl Topic {
    /// Attribute form used both to store a registration and to find it.
    pub fn attributes(&self) -> Map<String, Value> {
        match self {
            Self::Type(ty) => {
                let mut map = Map::new();
                map.insert(TYPE_ATTRIBUTE.to_string(), Value::String(ty.to_string()));
                map
            }
            Self::Filter(map) => map.clone(),
        }
    }

    pub fn is_wildcard(&self) -> bool {
        matches!(self, Self::Type(EventType::Any))
    }
}

impl From<EventType> for Topic {
    fn from(ty: EventType) -> Self {
        Self::Type(ty)
    }
}

impl From<&str> for Topic {
    fn from(tag: &str) -> Self {
        Self::Type(EventType::from(tag))
    }
}

// ============================================================================
// StoreEvent
// ============================================================================

/// An `error` event payload. Emitted instead of throwing, so callers that
/// passed no explicit failure handling still observe the failure.
#[derive(Debug, Clone)]
pub struct ErrorEvent {
    pub operation: Operation,
    pub entry_id: Option<EntryId>,
    /// The original failure.
    pub error: StoreError,
    /// Locally generated descriptor naming the store and operation.
    pub description: String,
}

impl ErrorEvent {
    pub fn new(store: &str, operation: Operation, entry_id: Option<&str>, error: StoreError) -> Self {
        let description = match entry_id {
            Some(id) => format!("{store}.{operation}({id}) failed: {error}"),
            None => format!("{store}.{operation}() failed: {error}"),
        };
        Self {
            operation,
            entry_id: entry_id.map(str::to_string),
            error,
            description,
        }
    }
}

/// Mutation and lifecycle notifications emitted by observable stores.
#[derive(Debug, Clone)]
pub enum StoreEvent<E> {
    Added {
        entry_id: EntryId,
        entry: E,
    },
    Updated {
        entry_id: EntryId,
        entry: E,
        old_entry: E,
    },
    Removed {
        entry_id: EntryId,
        entry: E,
    },
    Error(ErrorEvent),
    Initialized,
    Started,
}

impl<E> StoreEvent<E> {
    pub fn event_type(&self) -> EventType {
        match self {
            Self::Added { .. } => EventType::Added,
            Self::Updated { .. } => EventType::Updated,
            Self::Removed { .. } => EventType::Removed,
            Self::Error(_) => EventType::Error,
            Self::Initialized => EventType::Initialized,
            Self::Started => EventType::Started,
        }
    }

    pub fn entry_id(&self) -> Option<&str> {
        match self {
            Self::Added { entry_id, .. }
            | Self::Updated { entry_id, .. }
            | Self::Removed { entry_id, .. } => Some(entry_id),
            Self::Error(e) => e.entry_id.as_deref(),
            Self::Initialized | Self::Started => None,
        }
    }

    /// The current entry for `added`/`updated`, the removed one for `removed`.
    pub fn entry(&self) -> Option<&E> {
        match self {
            Self::Added { entry, .. } | Self::Updated { entry, .. } | Self::Removed { entry, .. } => {
                Some(entry)
            }
            _ => None,
        }
    }

    pub fn old_entry(&self) -> Option<&E> {
        match self {
            Self::Updated { old_entry, .. } => Some(old_entry),
            _ => None,
        }
    }
}
