//! Derived, read-mostly views over an observable store.
//!
//! - [`filtered`]: [`FilteredView`], the predicate-selected subset.
//! - [`selection`]: [`SelectionView`], one entry and its members.

pub mod filtered;
pub mod selection;

pub use filtered::{FilteredView, RefreshReport, ViewOptions};
pub use selection::{SelectionView, CHILDREN_ATTRIBUTE, CONTAINER_ATTRIBUTE};
