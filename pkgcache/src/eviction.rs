//! Admission control and eviction (C4).
//!
//! Two gates run before every blob commit: a free-disk-space floor, then
//! a size ceiling. Crossing the ceiling triggers an inline eviction scan
//! over cold (>= 7 days unaccessed) candidates, ordered by the score in
//! [`crate::record::eviction_score`] (ascending, so the coldest and
//! least popular record goes first). Hot records are never evicted, even
//! if the cache is over quota.

use std::path::Path;

use crate::catalog::Catalog;
use crate::error::{Error, Result};

pub const HOT_WINDOW_SECS: i64 = 7 * 24 * 3600;

/// Queries available bytes on the filesystem hosting `path`. Returns
/// `None` on probe failure so callers can fail open rather than block
/// admission on a transient `statvfs` error.
fn free_bytes(path: &Path) -> Option<u64> {
    match nix::sys::statvfs::statvfs(path) {
        Ok(stat) => Some(stat.blocks_available() as u64 * stat.fragment_size() as u64),
        Err(err) => {
            log::warn!("failed to probe free disk space at {path:?}: {err}");
            None
        }
    }
}

/// Runs admission control for an incoming blob of `incoming` bytes,
/// evicting cold candidates via `delete` if the size ceiling would be
/// exceeded. `delete` must implement the same `InUse`-aware removal the
/// public API uses, so live readers block eviction of their blob.
pub fn admit(
    base: &Path,
    catalog: &Catalog,
    incoming: u64,
    max_size: u64,
    min_free_bytes: u64,
    now: i64,
    mut delete: impl FnMut(&str) -> Result<()>,
) -> Result<()> {
    if min_free_bytes > 0 {
        if let Some(free) = free_bytes(base) {
            if free < incoming + min_free_bytes {
                return Err(Error::InsufficientDiskSpace);
            }
        }
    }

    let current = catalog.current_size();
    if current + incoming <= max_size {
        return Ok(());
    }

    log::debug!(
        "admission over quota (current={current}, incoming={incoming}, max={max_size}), evicting"
    );

    let candidates = catalog
        .cold_candidates(now, HOT_WINDOW_SECS)
        .map_err(|err| Error::Io(std::io::Error::new(std::io::ErrorKind::Other, err)))?;

    for candidate in candidates {
        if catalog.current_size() + incoming <= max_size {
            break;
        }
        match delete(&candidate.digest) {
            Ok(()) => {
                log::debug!("evicted {} ({} bytes)", candidate.digest, candidate.size);
            }
            Err(Error::InUse(_)) => {
                log::warn!("skipping eviction candidate {} still in use", candidate.digest);
            }
            Err(err) => return Err(err),
        }
    }

    if catalog.current_size() + incoming > max_size {
        return Err(Error::CacheFull);
    }

    Ok(())
}
