//! The metadata row corresponding to one stored blob.

use serde::{Deserialize, Serialize};

/// Durable metadata for a single cached package blob.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Record {
    pub digest: String,
    pub size: u64,
    pub filename: String,
    pub added_at: i64,
    pub last_accessed: i64,
    pub access_count: u64,
    pub announced_at: i64,
    pub package_name: String,
    pub package_version: String,
    pub architecture: String,
}

/// Eviction score: recency dominates, with a one-hour bonus per access.
///
/// Kept as a simple linear surrogate for LRU-with-popularity since the
/// catalog has no `LOG` function to express a curve cheaply.
pub fn eviction_score(record: &Record) -> i64 {
    record.last_accessed + record.access_count as i64 * 3600
}

/// Splits a Debian package filename into name / version / architecture.
///
/// Strips leading directory components and a trailing case-insensitive
/// `.deb`, then splits on `_`. At least 3 `_`-delimited parts are
/// required: the last is architecture, the second-to-last is version,
/// and everything before is rejoined with `_` to form the name. All three
/// must be non-empty or the whole parse fails -- never a mixed outcome.
pub fn parse_filename(filename: &str) -> Option<(String, String, String)> {
    let base = filename.rsplit(['/', '\\']).next().unwrap_or(filename);

    let stem = if base.len() >= 4 && base[base.len() - 4..].eq_ignore_ascii_case(".deb") {
        &base[..base.len() - 4]
    } else {
        base
    };

    let parts: Vec<&str> = stem.split('_').collect();
    if parts.len() < 3 {
        return None;
    }

    let architecture = parts[parts.len() - 1];
    let version = parts[parts.len() - 2];
    let name = parts[..parts.len() - 2].join("_");

    if name.is_empty() || version.is_empty() || architecture.is_empty() {
        return None;
    }

    Some((name, version.to_string(), architecture.to_string()))
}
