pub mod error;
pub mod types;

pub mod query;
pub mod reactive;
pub mod registry;
pub mod storage;
pub mod sync;
pub mod view;

pub use error::{Result, StoreError};
pub use types::{BrowseSummary, Entry, EntryId, Operation, Updated};
