//! Named-store directory and late-bound store handles.

pub mod deferred;
pub mod directory;

pub use deferred::DeferredStore;
pub use directory::{RegisteredStore, Registry, SharedStore, NAME_ATTRIBUTE};
