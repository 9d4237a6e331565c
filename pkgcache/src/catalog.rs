//! Durable metadata catalog (C2) and corruption recovery (C5).
//!
//! Backed by a write-ahead-logged embedded SQL database. The core owns a
//! single `packages` table plus indexes on `(last_accessed)` and
//! `(announced_at)`; collaborators are free to create their own tables in
//! the same file via [`Catalog::raw_handle`].
//!
//! A single [`rusqlite::Connection`] is not `Sync`, so every operation --
//! read or write -- takes the same mutex. Genuine concurrent readers are
//! available to collaborators that open their own connection against the
//! WAL-mode file; within this process the mutex is the catalog's `L`.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Mutex;

use anyhow::{Context, Error};
use rusqlite::{params, Connection, OptionalExtension};

use crate::record::{parse_filename, Record};

const SCHEMA: &str = "\
    CREATE TABLE IF NOT EXISTS packages (
        digest          TEXT PRIMARY KEY,
        size            INTEGER NOT NULL,
        filename        TEXT NOT NULL,
        added_at        INTEGER NOT NULL,
        last_accessed   INTEGER NOT NULL,
        access_count    INTEGER NOT NULL,
        announced_at    INTEGER NOT NULL DEFAULT 0,
        package_name    TEXT NOT NULL DEFAULT '',
        package_version TEXT NOT NULL DEFAULT '',
        architecture    TEXT NOT NULL DEFAULT ''
    );
    CREATE INDEX IF NOT EXISTS idx_packages_last_accessed ON packages(last_accessed);
    CREATE INDEX IF NOT EXISTS idx_packages_announced_at ON packages(announced_at);
";

const UNANNOUNCED_WINDOW_SECS: i64 = 12 * 3600;

pub struct Catalog {
    conn: Mutex<Connection>,
    current_size: AtomicI64,
}

fn row_to_record(row: &rusqlite::Row) -> rusqlite::Result<Record> {
    Ok(Record {
        digest: row.get("digest")?,
        size: row.get::<_, i64>("size")? as u64,
        filename: row.get("filename")?,
        added_at: row.get("added_at")?,
        last_accessed: row.get("last_accessed")?,
        access_count: row.get::<_, i64>("access_count")? as u64,
        announced_at: row.get("announced_at")?,
        package_name: row.get("package_name")?,
        package_version: row.get("package_version")?,
        architecture: row.get("architecture")?,
    })
}

fn apply_schema(conn: &Connection) -> Result<(), Error> {
    conn.execute_batch("PRAGMA journal_mode=WAL;")
        .context("unable to enable WAL mode")?;
    conn.execute_batch(SCHEMA).context("unable to apply schema")?;
    Ok(())
}

fn integrity_ok(conn: &Connection) -> bool {
    let result: rusqlite::Result<String> =
        conn.query_row("PRAGMA integrity_check", [], |row| row.get(0));
    matches!(result, Ok(ref s) if s == "ok")
}

fn backup_suffix(now: i64) -> String {
    format!("corrupted.{now}")
}

impl Catalog {
    /// Opens the catalog at `path`, recovering from corruption first if
    /// the integrity probe fails. Recovery closes the faulty catalog,
    /// renames it (and its WAL/SHM siblings, best effort) aside with a
    /// `.corrupted.<unix-seconds>` suffix, and creates a fresh, empty
    /// catalog. Blob files on disk are untouched by recovery.
    pub fn open(path: &Path) -> Result<Self, Error> {
        let now = proxmox_time::epoch_i64();

        if path.exists() {
            let needs_recovery = match Connection::open(path) {
                Ok(conn) => !integrity_ok(&conn),
                Err(_) => true,
            };

            if needs_recovery {
                log::warn!("metadata catalog at {path:?} failed integrity probe, recovering");
                Self::quarantine(path, now)?;
            }
        }

        let conn = Connection::open(path)
            .with_context(|| format!("unable to open metadata catalog {path:?}"))?;
        apply_schema(&conn)?;

        let current_size: i64 = conn
            .query_row("SELECT COALESCE(SUM(size), 0) FROM packages", [], |row| {
                row.get(0)
            })
            .context("unable to compute current cache size")?;

        Ok(Catalog {
            conn: Mutex::new(conn),
            current_size: AtomicI64::new(current_size),
        })
    }

    fn quarantine(path: &Path, now: i64) -> Result<(), Error> {
        let suffix = backup_suffix(now);
        std::fs::rename(path, format!("{}.{suffix}", path.display()))
            .context("unable to rename corrupted catalog aside")?;

        for ext in ["-wal", "-shm", "-journal"] {
            let sibling = PathBuf::from(format!("{}{ext}", path.display()));
            if sibling.exists() {
                let _ = std::fs::rename(&sibling, format!("{}{ext}.{suffix}", path.display()));
            }
        }

        log::info!(
            "metadata catalog recovered: blobs on disk are preserved; \
             run a rebuild to repopulate metadata"
        );
        Ok(())
    }

    /// Runs the integrity probe on demand. Recovery is only attempted at
    /// [`Catalog::open`].
    pub fn check_integrity(&self) -> Result<(), crate::error::Error> {
        let conn = self.conn.lock().unwrap();
        if integrity_ok(&conn) {
            Ok(())
        } else {
            Err(crate::error::Error::Corrupted)
        }
    }

    pub fn current_size(&self) -> u64 {
        self.current_size.load(Ordering::SeqCst).max(0) as u64
    }

    /// Upserts a row for `digest`. Preserves `added_at`/`announced_at` and
    /// any previously parsed identity fields when the new filename fails
    /// to parse.
    pub fn upsert(&self, digest: &str, size: u64, filename: &str, now: i64) -> Result<(), Error> {
        let conn = self.conn.lock().unwrap();
        let parsed = parse_filename(filename);

        let existing: Option<i64> = conn
            .query_row(
                "SELECT size FROM packages WHERE digest = ?1",
                params![digest],
                |row| row.get(0),
            )
            .optional()?;

        if let Some(old_size) = existing {
            let delta = size as i64 - old_size;
            match parsed {
                Some((name, version, arch)) => conn.execute(
                    "UPDATE packages SET size = ?2, filename = ?3, last_accessed = ?4,
                         access_count = access_count + 1,
                         package_name = ?5, package_version = ?6, architecture = ?7
                     WHERE digest = ?1",
                    params![digest, size as i64, filename, now, name, version, arch],
                )?,
                None => conn.execute(
                    "UPDATE packages SET size = ?2, filename = ?3, last_accessed = ?4,
                         access_count = access_count + 1
                     WHERE digest = ?1",
                    params![digest, size as i64, filename, now],
                )?,
            };
            self.current_size.fetch_add(delta, Ordering::SeqCst);
        } else {
            let (name, version, arch) = parsed.unwrap_or_default();
            conn.execute(
                "INSERT INTO packages
                     (digest, size, filename, added_at, last_accessed, access_count,
                      announced_at, package_name, package_version, architecture)
                 VALUES (?1, ?2, ?3, ?4, ?4, 1, 0, ?5, ?6, ?7)",
                params![digest, size as i64, filename, now, name, version, arch],
            )?;
            self.current_size.fetch_add(size as i64, Ordering::SeqCst);
        }

        Ok(())
    }

    /// Bumps `last_accessed`/`access_count` for a read. Logged and
    /// continued on failure -- a read still succeeds even if the counter
    /// update fails.
    pub fn bump_access(&self, digest: &str, now: i64) {
        let conn = self.conn.lock().unwrap();
        let result = conn.execute(
            "UPDATE packages SET last_accessed = ?2, access_count = access_count + 1
             WHERE digest = ?1",
            params![digest, now],
        );
        if let Err(err) = result {
            log::warn!("failed to update last_accessed for {digest}: {err}");
        }
    }

    pub fn get(&self, digest: &str) -> Result<Option<Record>, Error> {
        let conn = self.conn.lock().unwrap();
        let record = conn
            .query_row(
                "SELECT * FROM packages WHERE digest = ?1",
                params![digest],
                row_to_record,
            )
            .optional()?;
        Ok(record)
    }

    /// Removes the row for `digest`, if any, updating the cached size.
    pub fn remove(&self, digest: &str) -> Result<(), Error> {
        let conn = self.conn.lock().unwrap();
        let size: Option<i64> = conn
            .query_row(
                "SELECT size FROM packages WHERE digest = ?1",
                params![digest],
                |row| row.get(0),
            )
            .optional()?;
        conn.execute("DELETE FROM packages WHERE digest = ?1", params![digest])?;
        if let Some(size) = size {
            self.current_size.fetch_sub(size, Ordering::SeqCst);
        }
        Ok(())
    }

    pub fn mark_announced(&self, digest: &str, now: i64) -> Result<(), Error> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE packages SET announced_at = ?2 WHERE digest = ?1",
            params![digest, now],
        )?;
        Ok(())
    }

    pub fn list(&self) -> Result<Vec<Record>, Error> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare("SELECT * FROM packages")?;
        let rows = stmt.query_map([], row_to_record)?;
        Ok(rows.collect::<rusqlite::Result<_>>()?)
    }

    pub fn unannounced(&self, now: i64) -> Result<Vec<Record>, Error> {
        let conn = self.conn.lock().unwrap();
        let mut stmt =
            conn.prepare("SELECT * FROM packages WHERE announced_at < ?1")?;
        let rows = stmt.query_map(params![now - UNANNOUNCED_WINDOW_SECS], row_to_record)?;
        Ok(rows.collect::<rusqlite::Result<_>>()?)
    }

    pub fn by_package_name(&self, name: &str) -> Result<Vec<Record>, Error> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare("SELECT * FROM packages WHERE package_name = ?1")?;
        let rows = stmt.query_map(params![name], row_to_record)?;
        Ok(rows.collect::<rusqlite::Result<_>>()?)
    }

    pub fn get_by_nva(
        &self,
        name: &str,
        version: &str,
        arch: &str,
    ) -> Result<Option<Record>, Error> {
        let conn = self.conn.lock().unwrap();
        let record = conn
            .query_row(
                "SELECT * FROM packages
                 WHERE package_name = ?1 AND package_version = ?2 AND architecture = ?3",
                params![name, version, arch],
                row_to_record,
            )
            .optional()?;
        Ok(record)
    }

    pub fn popular(&self, limit: i64) -> Result<Vec<Record>, Error> {
        let limit = if limit <= 0 { 10 } else { limit };
        let conn = self.conn.lock().unwrap();
        let mut stmt =
            conn.prepare("SELECT * FROM packages ORDER BY access_count DESC LIMIT ?1")?;
        let rows = stmt.query_map(params![limit], row_to_record)?;
        Ok(rows.collect::<rusqlite::Result<_>>()?)
    }

    pub fn recent(&self, limit: i64) -> Result<Vec<Record>, Error> {
        let limit = if limit <= 0 { 10 } else { limit };
        let conn = self.conn.lock().unwrap();
        let mut stmt =
            conn.prepare("SELECT * FROM packages ORDER BY added_at DESC LIMIT ?1")?;
        let rows = stmt.query_map(params![limit], row_to_record)?;
        Ok(rows.collect::<rusqlite::Result<_>>()?)
    }

    /// Candidates for eviction: cold (not accessed within the last seven
    /// days), ordered ascending by recency+popularity score so the
    /// coldest, least-popular record is tried first.
    pub fn cold_candidates(&self, now: i64, hot_window_secs: i64) -> Result<Vec<Record>, Error> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT * FROM packages WHERE last_accessed < ?1
             ORDER BY (last_accessed + access_count * 3600) ASC",
        )?;
        let rows = stmt.query_map(params![now - hot_window_secs], row_to_record)?;
        Ok(rows.collect::<rusqlite::Result<_>>()?)
    }

    /// Re-parses the filename of every row with an empty package name.
    /// Returns the number of rows updated.
    pub fn populate_missing_metadata(&self) -> Result<u64, Error> {
        let conn = self.conn.lock().unwrap();
        let mut stmt =
            conn.prepare("SELECT digest, filename FROM packages WHERE package_name = ''")?;
        let candidates: Vec<(String, String)> = stmt
            .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?
            .collect::<rusqlite::Result<_>>()?;
        drop(stmt);

        let mut updated = 0u64;
        for (digest, filename) in candidates {
            if let Some((name, version, arch)) = parse_filename(&filename) {
                conn.execute(
                    "UPDATE packages SET package_name = ?2, package_version = ?3, architecture = ?4
                     WHERE digest = ?1",
                    params![digest, name, version, arch],
                )?;
                updated += 1;
            }
        }
        Ok(updated)
    }

    pub fn total_packages(&self) -> Result<u64, Error> {
        let conn = self.conn.lock().unwrap();
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM packages", [], |row| row.get(0))?;
        Ok(count as u64)
    }

    pub fn total_accesses(&self) -> Result<u64, Error> {
        let conn = self.conn.lock().unwrap();
        let total: i64 =
            conn.query_row("SELECT COALESCE(SUM(access_count), 0) FROM packages", [], |row| {
                row.get(0)
            })?;
        Ok(total as u64)
    }

    pub fn unique_packages(&self) -> Result<u64, Error> {
        let conn = self.conn.lock().unwrap();
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM packages WHERE package_name != ''",
            [],
            |row| row.get(0),
        )?;
        Ok(count as u64)
    }

    pub fn bandwidth_saved(&self) -> Result<u64, Error> {
        let conn = self.conn.lock().unwrap();
        let total: i64 = conn.query_row(
            "SELECT COALESCE(SUM(size * (access_count - 1)), 0) FROM packages",
            [],
            |row| row.get(0),
        )?;
        Ok(total.max(0) as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn upsert_then_get_round_trips() {
        let tmp = tempfile::tempdir().unwrap();
        let catalog = Catalog::open(&tmp.path().join("state.db")).unwrap();
        catalog
            .upsert("d1", 20, "curl_7.88.1-10_amd64.deb", 1000)
            .unwrap();
        let record = catalog.get("d1").unwrap().unwrap();
        assert_eq!(record.size, 20);
        assert_eq!(record.package_name, "curl");
        assert_eq!(record.access_count, 1);
        assert_eq!(catalog.current_size(), 20);
    }

    #[test]
    fn repeat_upsert_preserves_identity_on_bad_filename() {
        let tmp = tempfile::tempdir().unwrap();
        let catalog = Catalog::open(&tmp.path().join("state.db")).unwrap();
        catalog
            .upsert("d1", 20, "curl_7.88.1-10_amd64.deb", 1000)
            .unwrap();
        catalog.upsert("d1", 25, "not-a-deb-name", 1001).unwrap();
        let record = catalog.get("d1").unwrap().unwrap();
        assert_eq!(record.package_name, "curl");
        assert_eq!(record.size, 25);
        assert_eq!(record.access_count, 2);
        assert_eq!(catalog.current_size(), 25);
    }

    #[test]
    fn populate_missing_metadata_fills_and_is_idempotent() {
        let tmp = tempfile::tempdir().unwrap();
        let catalog = Catalog::open(&tmp.path().join("state.db")).unwrap();
        catalog.upsert("d1", 20, "garbage", 1000).unwrap();
        {
            let conn = catalog.conn.lock().unwrap();
            conn.execute(
                "UPDATE packages SET filename = 'curl_7.88.1-10_amd64.deb' WHERE digest = 'd1'",
                [],
            )
            .unwrap();
        }
        assert_eq!(catalog.populate_missing_metadata().unwrap(), 1);
        assert_eq!(catalog.populate_missing_metadata().unwrap(), 0);
        let record = catalog.get_by_nva("curl", "7.88.1-10", "amd64").unwrap();
        assert!(record.is_some());
    }

    #[test]
    fn recovers_from_corrupted_catalog_file() {
        let tmp = tempfile::tempdir().unwrap();
        let db_path = tmp.path().join("state.db");
        std::fs::write(&db_path, b"not a sqlite file at all").unwrap();

        let catalog = Catalog::open(&db_path).unwrap();
        assert_eq!(catalog.total_packages().unwrap(), 0);

        let mut found_backup = false;
        for entry in std::fs::read_dir(tmp.path()).unwrap() {
            let name = entry.unwrap().file_name();
            if name.to_string_lossy().contains("corrupted") {
                found_backup = true;
            }
        }
        assert!(found_backup);
    }
}
