//! Aggregate cache statistics (C6).

use serde::{Deserialize, Serialize};

/// Aggregate counters over the whole catalog.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Stats {
    /// Row count.
    pub total_packages: u64,
    /// Sum of blob sizes.
    pub total_size: u64,
    /// Sum of access counts across all records.
    pub total_accesses: u64,
    /// Rows with a non-empty parsed package name.
    pub unique_packages: u64,
    /// Bytes served without a WAN fetch: `sum(size * (access_count - 1))`.
    pub bandwidth_saved: u64,
    /// Configured size ceiling.
    pub max_size: u64,
}
