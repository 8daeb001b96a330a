use std::sync::Arc;

use thiserror::Error;

// ---------------------------------------------------------------------------
// StoreError
// ---------------------------------------------------------------------------

/// Failure of a store operation.
///
/// Cloneable so the same failure can be returned to the caller and carried
/// by an `error` event at the same time.
#[derive(Debug, Clone, Error)]
pub enum StoreError {
    #[error("Entry not found: {store}/{id}")]
    NotFound { store: String, id: String },

    #[error("Entry conversion failed in {store} for {id}")]
    Conversion { store: String, id: String },

    #[error("No id could be assigned to the entry in {store}")]
    MissingId { store: String },

    #[error("Entry already exists: {store}/{id}")]
    AlreadyExists { store: String, id: String },

    #[error("Entry {store}/{id} is already cached")]
    DuplicateRegistration { store: String, id: String },

    #[error("Store \"{name}\" has not been registered yet")]
    NotReady { name: String },

    #[error("Backend failure in {store}: {message}")]
    Backend {
        store: String,
        message: String,
        #[source]
        source: Option<Arc<dyn std::error::Error + Send + Sync>>,
    },
}

impl StoreError {
    pub fn not_found(store: impl Into<String>, id: impl Into<String>) -> Self {
        Self::NotFound {
            store: store.into(),
            id: id.into(),
        }
    }

    pub fn backend(store: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Backend {
            store: store.into(),
            message: message.into(),
            source: None,
        }
    }

    /// Wrap an adapter-specific error as an opaque backend failure.
    pub fn from_backend<E>(store: impl Into<String>, error: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        Self::Backend {
            store: store.into(),
            message: error.to_string(),
            source: Some(Arc::new(error)),
        }
    }

    /// Absence of an id is a normal condition; callers branch on it.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }
}

/// Convenience alias: the default error type is `StoreError`.
pub type Result<T, E = StoreError> = std::result::Result<T, E>;

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
