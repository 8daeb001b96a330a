//! Options and reports for cache/source reconciliation.

use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};

/// Safety margin subtracted from the newest cached `modified` marker before
/// an incremental merge, to tolerate clock drift and near-boundary writes.
pub const DEFAULT_WATERMARK_SKEW_SECS: i64 = 60 * 60;

/// Configuration for `ReconcilingStore`.
#[derive(Debug, Clone)]
pub struct ReconcileOptions {
    /// Name used in logs and error descriptors (default: `"<source>:cached"`).
    pub name: Option<String>,
    /// Skew subtracted from the newest cached `modified` marker
    /// (default: one hour, [`DEFAULT_WATERMARK_SKEW_SECS`]).
    pub watermark_skew: TimeDelta,
}

impl Default for ReconcileOptions {
    fn default() -> Self {
        Self {
            name: None,
            watermark_skew: TimeDelta::seconds(DEFAULT_WATERMARK_SKEW_SECS),
        }
    }
}

/// Outcome of one `merge(watermark)` pass. Per-entry failures are counted,
/// logged and emitted as `error` events; they never abort the pass.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MergeReport {
    pub since: DateTime<Utc>,
    /// Source entries visited at or after `since`.
    pub scanned: usize,
    /// Entries copied into the cache (each announced once as `added`).
    pub added: usize,
    /// Entries whose reconciliation failed.
    pub failed: usize,
}

impl MergeReport {
    pub fn new(since: DateTime<Utc>) -> Self {
        Self {
            since,
            scanned: 0,
            added: 0,
            failed: 0,
        }
    }
}
