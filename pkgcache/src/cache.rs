//! Top-level orchestration: wires the blob store, metadata catalog,
//! reader tracker and admission/eviction engine into one public contract
//! and exposes the aggregate statistics callers pull for reporting.

use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::blob_store::BlobStore;
use crate::catalog::Catalog;
use crate::error::{Digest, Error, Result};
use crate::eviction;
use crate::handle::ReadHandle;
use crate::readers::ReaderTracker;
use crate::record::Record;
use crate::stats::Stats;

/// Construction parameters for a [`Cache`]. Parsing these out of an
/// on-disk configuration file is a collaborator's job; the cache itself
/// only needs the resolved values.
#[derive(Debug, Clone)]
pub struct CacheConfig {
    pub base: PathBuf,
    pub max_size: u64,
    /// Minimum free bytes to keep on the filesystem hosting `base`.
    /// `0` disables the check.
    pub min_free_bytes: u64,
}

/// A content-addressed local cache for Debian binary package blobs.
pub struct Cache {
    base: PathBuf,
    store: BlobStore,
    catalog: Catalog,
    readers: Arc<ReaderTracker>,
    max_size: u64,
    min_free_bytes: u64,
}

fn now() -> i64 {
    proxmox_time::epoch_i64()
}

impl Cache {
    /// Opens (creating if necessary) a cache rooted at `config.base`.
    /// Runs catalog corruption recovery if needed -- see
    /// [`Catalog::open`].
    pub fn open(config: CacheConfig) -> Result<Self> {
        std::fs::create_dir_all(&config.base)?;
        std::fs::create_dir_all(config.base.join("indices"))?;

        let store = BlobStore::open(&config.base)
            .map_err(|err| Error::Io(std::io::Error::new(std::io::ErrorKind::Other, err)))?;
        let catalog = Catalog::open(&config.base.join("state.db"))
            .map_err(|err| Error::Io(std::io::Error::new(std::io::ErrorKind::Other, err)))?;

        Ok(Cache {
            base: config.base,
            store,
            catalog,
            readers: Arc::new(ReaderTracker::new()),
            max_size: config.max_size,
            min_free_bytes: config.min_free_bytes,
        })
    }

    /// The raw metadata database handle, exposed for collaborators
    /// (index-cache state, download state) that create their own tables
    /// in the same file. The core does not validate what they do with it.
    pub fn raw_handle(&self) -> &Catalog {
        &self.catalog
    }

    /// Scratch directory root, exposed for collaborators that need a
    /// place on the same filesystem to stage their own files.
    pub fn scratch_dir(&self) -> &Path {
        &self.base
    }

    pub fn has(&self, digest: &str) -> bool {
        match Digest::parse(digest) {
            Ok(digest) => self.store.has(&digest),
            Err(_) => false,
        }
    }

    /// Opens `digest` for reading, bumping its access counters and
    /// registering a reader. Fails with [`Error::NotFound`] if no blob
    /// file is present.
    pub fn get(&self, digest: &str) -> Result<(ReadHandle, Record)> {
        let parsed = Digest::parse(digest)?;
        if !self.store.has(&parsed) {
            return Err(Error::NotFound(digest.to_string()));
        }

        self.catalog.bump_access(digest, now());
        let record = self
            .catalog
            .get(digest)?
            .ok_or_else(|| Error::NotFound(digest.to_string()))?;

        let file = self.store.open_blob(&parsed)?;
        let handle = ReadHandle::new(file, digest.to_string(), self.readers.clone());
        Ok((handle, record))
    }

    /// Streams `reader` into the store, verifying it hashes to `digest`,
    /// then upserts the catalog row. Runs admission control (free-disk
    /// floor, then size ceiling with inline eviction) before committing.
    pub fn put_stream(
        &self,
        reader: &mut dyn Read,
        digest: &str,
        filename: &str,
    ) -> Result<Record> {
        let parsed = Digest::parse(digest)?;
        let now = now();

        // Pre-admit on the assumption of a same-size replacement; an
        // existing blob of equal size is a no-op for disk usage, but we
        // don't know the incoming size until the stream is hashed. Since
        // digests are content-addressed, reuse the existing size as the
        // estimate if present; otherwise assume 0 extra headroom isn't
        // knowable up front, and compensate by running a post-write
        // ceiling check before allowing eviction to run on assumption.
        let already_present = self.store.has(&parsed);
        if !already_present {
            self.run_admission(0, now)?;
        }

        let size = self.store.stage_and_commit(reader, &parsed)?;
        self.catalog.upsert(digest, size, filename, now)?;

        if !already_present {
            // Now that the real size is known, enforce the ceiling for
            // real; if we're still over, evict additional cold entries.
            self.run_admission(0, now)?;
        }

        self.catalog
            .get(digest)?
            .ok_or_else(|| Error::NotFound(digest.to_string()))
    }

    /// Publishes a pre-verified file (already hashed by the caller) by
    /// renaming it into place without re-hashing.
    pub fn put_file(
        &self,
        path: &Path,
        digest: &str,
        filename: &str,
        size: u64,
    ) -> Result<Record> {
        let parsed = Digest::parse(digest)?;
        let now = now();

        let already_present = self.store.has(&parsed);
        if !already_present {
            self.run_admission(size, now)?;
        }

        self.store.commit_file(path, &parsed)?;
        self.catalog.upsert(digest, size, filename, now)?;

        self.catalog
            .get(digest)?
            .ok_or_else(|| Error::NotFound(digest.to_string()))
    }

    fn run_admission(&self, incoming: u64, now: i64) -> Result<()> {
        eviction::admit(
            &self.base,
            &self.catalog,
            incoming,
            self.max_size,
            self.min_free_bytes,
            now,
            |digest| self.delete(digest),
        )
    }

    /// Removes a blob and its row. Refuses with [`Error::InUse`] while
    /// any reader holds the digest open. Removing a nonexistent digest
    /// succeeds.
    pub fn delete(&self, digest: &str) -> Result<()> {
        if self.readers.count(digest) > 0 {
            return Err(Error::InUse(digest.to_string()));
        }

        let parsed = Digest::parse(digest)?;
        self.store.unlink(&parsed)?;
        self.catalog.remove(digest)?;
        Ok(())
    }

    pub fn mark_announced(&self, digest: &str) -> Result<()> {
        self.catalog.mark_announced(digest, now())?;
        Ok(())
    }

    pub fn list(&self) -> Result<Vec<Record>> {
        Ok(self.catalog.list()?)
    }

    pub fn unannounced(&self) -> Result<Vec<Record>> {
        Ok(self.catalog.unannounced(now())?)
    }

    pub fn by_package_name(&self, name: &str) -> Result<Vec<Record>> {
        Ok(self.catalog.by_package_name(name)?)
    }

    pub fn get_by_nva(&self, name: &str, version: &str, arch: &str) -> Result<Record> {
        self.catalog
            .get_by_nva(name, version, arch)?
            .ok_or_else(|| Error::NotFound(format!("{name}_{version}_{arch}")))
    }

    pub fn popular(&self, limit: i64) -> Result<Vec<Record>> {
        Ok(self.catalog.popular(limit)?)
    }

    pub fn recent(&self, limit: i64) -> Result<Vec<Record>> {
        Ok(self.catalog.recent(limit)?)
    }

    pub fn populate_missing_metadata(&self) -> Result<u64> {
        Ok(self.catalog.populate_missing_metadata()?)
    }

    pub fn check_integrity(&self) -> Result<()> {
        self.catalog.check_integrity()
    }

    pub fn stats(&self) -> Result<Stats> {
        Ok(Stats {
            total_packages: self.catalog.total_packages()?,
            total_size: self.catalog.current_size(),
            total_accesses: self.catalog.total_accesses()?,
            unique_packages: self.catalog.unique_packages()?,
            bandwidth_saved: self.catalog.bandwidth_saved()?,
            max_size: self.max_size,
        })
    }

    pub fn absolute_path(&self, digest: &str) -> Result<PathBuf> {
        let parsed = Digest::parse(digest)?;
        Ok(self.store.absolute_path(&parsed))
    }

    pub fn partial_dir(&self, digest: &str) -> Result<PathBuf> {
        let parsed = Digest::parse(digest)?;
        Ok(self.store.partial_dir(&parsed))
    }

    pub fn ensure_partial_dir(&self, digest: &str) -> Result<PathBuf> {
        let parsed = Digest::parse(digest)?;
        self.store
            .ensure_partial_dir(&parsed)
            .map_err(|err| Error::Io(std::io::Error::new(std::io::ErrorKind::Other, err)))
    }

    pub fn clean_partial_dir(&self, digest: &str) -> Result<()> {
        let parsed = Digest::parse(digest)?;
        self.store
            .clean_partial_dir(&parsed)
            .map_err(|err| Error::Io(std::io::Error::new(std::io::ErrorKind::Other, err)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use openssl::sha::Sha256;
    use std::io::Cursor;

    fn sha256_hex(bytes: &[u8]) -> String {
        let mut hasher = Sha256::new();
        hasher.update(bytes);
        hex::encode(hasher.finish())
    }

    fn open_cache(tmp: &tempfile::TempDir, max_size: u64) -> Cache {
        Cache::open(CacheConfig {
            base: tmp.path().to_path_buf(),
            max_size,
            min_free_bytes: 0,
        })
        .unwrap()
    }

    #[test]
    fn p1_round_trip() {
        let tmp = tempfile::tempdir().unwrap();
        let cache = open_cache(&tmp, 1_000_000);

        let data = b"test package content";
        let digest = sha256_hex(data);
        cache
            .put_stream(&mut Cursor::new(data.to_vec()), &digest, "curl_7.88.1-10_amd64.deb")
            .unwrap();

        let (mut handle, record) = cache.get(&digest).unwrap();
        assert_eq!(record.size, data.len() as u64);
        assert_eq!(record.filename, "curl_7.88.1-10_amd64.deb");

        let mut contents = Vec::new();
        handle.read_to_end(&mut contents).unwrap();
        assert_eq!(contents, data);
    }

    #[test]
    fn p2_hash_gate() {
        let tmp = tempfile::tempdir().unwrap();
        let cache = open_cache(&tmp, 1_000_000);

        let data = b"test package content";
        let wrong = "0".repeat(64);
        let err = cache
            .put_stream(&mut Cursor::new(data.to_vec()), &wrong, "x.deb")
            .unwrap_err();
        assert!(matches!(err, Error::HashMismatch { .. }));
        assert!(!cache.has(&wrong));
    }

    #[test]
    fn p3_idempotent_publish() {
        let tmp = tempfile::tempdir().unwrap();
        let cache = open_cache(&tmp, 1_000_000);

        let data = b"abc";
        let digest = sha256_hex(data);
        cache
            .put_stream(&mut Cursor::new(data.to_vec()), &digest, "a_1.0_amd64.deb")
            .unwrap();
        cache
            .put_stream(&mut Cursor::new(data.to_vec()), &digest, "a_1.0_amd64.deb")
            .unwrap();

        assert_eq!(cache.list().unwrap().len(), 1);
        let (_handle, _) = cache.get(&digest).unwrap();
        let record = cache.catalog.get(&digest).unwrap().unwrap();
        assert!(record.access_count >= 2);
    }

    #[test]
    fn p4_delete_blocks_on_readers() {
        let tmp = tempfile::tempdir().unwrap();
        let cache = open_cache(&tmp, 1_000_000);

        let data = b"abc";
        let digest = sha256_hex(data);
        cache
            .put_stream(&mut Cursor::new(data.to_vec()), &digest, "a_1.0_amd64.deb")
            .unwrap();

        let (handle, _) = cache.get(&digest).unwrap();
        let err = cache.delete(&digest).unwrap_err();
        assert!(matches!(err, Error::InUse(_)));

        drop(handle);
        cache.delete(&digest).unwrap();
        assert!(!cache.has(&digest));
    }

    #[test]
    fn p5_double_close_is_benign() {
        let tmp = tempfile::tempdir().unwrap();
        let cache = open_cache(&tmp, 1_000_000);

        let data = b"abc";
        let digest = sha256_hex(data);
        cache
            .put_stream(&mut Cursor::new(data.to_vec()), &digest, "a_1.0_amd64.deb")
            .unwrap();

        let (mut handle, _) = cache.get(&digest).unwrap();
        handle.close();
        handle.close();
        drop(handle);
        cache.delete(&digest).unwrap();
    }

    #[test]
    fn p6_size_accounting_survives_reopen() {
        let tmp = tempfile::tempdir().unwrap();
        {
            let cache = open_cache(&tmp, 1_000_000);
            let data = b"abcdefgh";
            let digest = sha256_hex(data);
            cache
                .put_stream(&mut Cursor::new(data.to_vec()), &digest, "a_1.0_amd64.deb")
                .unwrap();
            assert_eq!(cache.stats().unwrap().total_size, data.len() as u64);
        }
        let cache = open_cache(&tmp, 1_000_000);
        assert_eq!(cache.stats().unwrap().total_size, 8);
    }

    #[test]
    fn p9_eviction_safety_full_when_hot() {
        let tmp = tempfile::tempdir().unwrap();
        let cache = open_cache(&tmp, 1024);

        let a = vec![0u8; 300];
        let b = vec![1u8; 300];
        let da = sha256_hex(&a);
        let db = sha256_hex(&b);
        cache
            .put_stream(&mut Cursor::new(a.clone()), &da, "a_1.0_amd64.deb")
            .unwrap();
        cache
            .put_stream(&mut Cursor::new(b.clone()), &db, "b_1.0_amd64.deb")
            .unwrap();

        let c = vec![2u8; 600];
        let dc = sha256_hex(&c);
        let err = cache
            .put_stream(&mut Cursor::new(c), &dc, "c_1.0_amd64.deb")
            .unwrap_err();
        assert!(matches!(err, Error::CacheFull));
        assert!(cache.has(&da));
        assert!(cache.has(&db));
    }

    #[test]
    fn delete_of_nonexistent_digest_succeeds() {
        let tmp = tempfile::tempdir().unwrap();
        let cache = open_cache(&tmp, 1_000_000);
        cache.delete(&"f".repeat(64)).unwrap();
    }

    #[test]
    fn by_package_name_and_nva_lookup() {
        let tmp = tempfile::tempdir().unwrap();
        let cache = open_cache(&tmp, 1_000_000);

        let data = b"curl-bytes";
        let digest = sha256_hex(data);
        cache
            .put_stream(&mut Cursor::new(data.to_vec()), &digest, "curl_7.88.1-10_amd64.deb")
            .unwrap();

        assert_eq!(cache.by_package_name("curl").unwrap().len(), 1);
        let record = cache.get_by_nva("curl", "7.88.1-10", "amd64").unwrap();
        assert_eq!(record.digest, digest);
    }
}
