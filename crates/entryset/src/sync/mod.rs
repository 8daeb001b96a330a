//! Cache/source reconciliation.

pub mod reconciler;
pub mod types;

pub use reconciler::ReconcilingStore;
pub use types::{MergeReport, ReconcileOptions, DEFAULT_WATERMARK_SKEW_SECS};
