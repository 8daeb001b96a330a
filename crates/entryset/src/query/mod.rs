//! Filtering and set arithmetic over entry ids.
//!
//! - [`filter`]: [`Filter`] and [`NamedQuery`] evaluation.
//! - [`diff`]: sorted three-way set difference used by view refreshes.

pub mod diff;
pub mod filter;

pub use diff::{diff_sorted, diff_unsorted, SetDiff};
pub use filter::{attributes_match, modified_or_epoch, Filter, NamedQuery, PredicateFn};
