//! Content-addressed blob store (C1).
//!
//! Layout rooted at `<base>`:
//!
//! ```text
//! <base>/packages/sha256/<first-2-hex>/<full-hex>    published blobs
//! <base>/packages/pending/<digest>                    staging files
//! <base>/packages/partial/<digest>/...                downloader scratch
//! ```
//!
//! Sharding by the first two hex characters keeps directory fan-out at
//! most 256 entries. Publication is atomic via `rename(2)` within the
//! same filesystem, so staging and published blobs must share one.

use std::fs::{self, File};
use std::io::Write;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use anyhow::{format_err, Context, Error};
use openssl::sha::Sha256;

use crate::error::Digest;

const DIR_MODE: u32 = 0o750;
const FILE_MODE: u32 = 0o600;

pub struct BlobStore {
    base: PathBuf,
    published_dir: PathBuf,
    pending_dir: PathBuf,
    partial_dir: PathBuf,
}

fn set_mode(path: &Path, mode: u32) -> std::io::Result<()> {
    let perm = std::fs::Permissions::from_mode(mode);
    fs::set_permissions(path, perm)
}

fn ensure_dir(path: &Path) -> Result<(), Error> {
    if !path.exists() {
        fs::create_dir_all(path)
            .with_context(|| format!("unable to create directory {path:?}"))?;
        set_mode(path, DIR_MODE)
            .with_context(|| format!("unable to set permissions on {path:?}"))?;
    }
    Ok(())
}

impl BlobStore {
    /// Opens (creating if necessary) the blob store rooted at `base`.
    pub fn open(base: &Path) -> Result<Self, Error> {
        if !base.is_absolute() {
            return Err(format_err!("expected absolute base path, got {base:?}"));
        }

        let published_dir = base.join("packages").join("sha256");
        let pending_dir = base.join("packages").join("pending");
        let partial_dir = base.join("packages").join("partial");

        ensure_dir(&published_dir)?;
        ensure_dir(&pending_dir)?;
        ensure_dir(&partial_dir)?;

        Ok(BlobStore {
            base: base.to_path_buf(),
            published_dir,
            pending_dir,
            partial_dir,
        })
    }

    pub fn base(&self) -> &Path {
        &self.base
    }

    fn shard_dir(&self, digest: &Digest) -> PathBuf {
        self.published_dir.join(digest.shard())
    }

    /// Absolute path a published blob has (or would have) on disk.
    pub fn absolute_path(&self, digest: &Digest) -> PathBuf {
        self.shard_dir(digest).join(digest.as_str())
    }

    fn pending_path(&self, digest: &Digest) -> PathBuf {
        self.pending_dir.join(digest.as_str())
    }

    pub fn partial_dir(&self, digest: &Digest) -> PathBuf {
        self.partial_dir.join(digest.as_str())
    }

    /// Creates (idempotently) the per-digest scratch directory for an
    /// external downloader.
    pub fn ensure_partial_dir(&self, digest: &Digest) -> Result<PathBuf, Error> {
        let path = self.partial_dir(digest);
        ensure_dir(&path)?;
        Ok(path)
    }

    /// Recursively removes the per-digest scratch directory. Idempotent.
    pub fn clean_partial_dir(&self, digest: &Digest) -> Result<(), Error> {
        let path = self.partial_dir(digest);
        match fs::remove_dir_all(&path) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    pub fn has(&self, digest: &Digest) -> bool {
        self.absolute_path(digest).is_file()
    }

    /// Opens a published blob for reading.
    pub fn open_blob(&self, digest: &Digest) -> std::io::Result<File> {
        File::open(self.absolute_path(digest))
    }

    /// Removes a published blob. A no-op if it does not exist.
    pub fn unlink(&self, digest: &Digest) -> std::io::Result<()> {
        match fs::remove_file(self.absolute_path(digest)) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err),
        }
    }

    /// Streams `reader` into a staging file while hashing it, verifies the
    /// digest, and publishes it via atomic rename. On any failure (I/O or
    /// hash mismatch) the staging file is unlinked and no row change is
    /// observable -- the caller's catalog upsert only happens after this
    /// returns `Ok`.
    ///
    /// Returns the number of bytes written.
    pub fn stage_and_commit(
        &self,
        reader: &mut dyn std::io::Read,
        expected: &Digest,
    ) -> Result<u64, crate::error::Error> {
        let pending_path = self.pending_path(expected);
        let result = self.write_staging(reader, &pending_path);

        let (size, actual) = match result {
            Ok(v) => v,
            Err(err) => {
                let _ = fs::remove_file(&pending_path);
                return Err(err.into());
            }
        };

        if actual != *expected.as_str() {
            let _ = fs::remove_file(&pending_path);
            return Err(crate::error::Error::HashMismatch {
                expected: expected.as_str().to_string(),
                actual,
            });
        }

        let shard_dir = self.shard_dir(expected);
        if let Err(err) = ensure_dir(&shard_dir) {
            let _ = fs::remove_file(&pending_path);
            return Err(std::io::Error::new(std::io::ErrorKind::Other, err).into());
        }

        if let Err(err) = fs::rename(&pending_path, self.absolute_path(expected)) {
            let _ = fs::remove_file(&pending_path);
            return Err(err.into());
        }

        Ok(size)
    }

    /// Publishes a pre-verified file (already hashed by the caller) by
    /// renaming it into place without re-reading its bytes.
    pub fn commit_file(&self, path: &Path, digest: &Digest) -> std::io::Result<()> {
        let shard_dir = self.shard_dir(digest);
        fs::create_dir_all(&shard_dir)?;
        set_mode(&shard_dir, DIR_MODE)?;
        fs::rename(path, self.absolute_path(digest))
    }

    fn write_staging(
        &self,
        reader: &mut dyn std::io::Read,
        pending_path: &Path,
    ) -> std::io::Result<(u64, String)> {
        let mut file = File::create(pending_path)?;
        set_mode(pending_path, FILE_MODE)?;

        let mut hasher = Sha256::new();
        let mut buffer = vec![0u8; 256 * 1024];
        let mut size: u64 = 0;

        loop {
            let count = match reader.read(&mut buffer) {
                Ok(0) => break,
                Ok(count) => count,
                Err(ref err) if err.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(err) => return Err(err),
            };
            hasher.update(&buffer[..count]);
            file.write_all(&buffer[..count])?;
            size += count as u64;
        }
        file.sync_all()?;

        let digest = hasher.finish();
        Ok((size, hex::encode(digest)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn sha256_hex(bytes: &[u8]) -> String {
        let mut hasher = Sha256::new();
        hasher.update(bytes);
        hex::encode(hasher.finish())
    }

    #[test]
    fn round_trip_publish_and_open() {
        let tmp = tempfile::tempdir().unwrap();
        let store = BlobStore::open(tmp.path()).unwrap();

        let data = b"test package content";
        let digest = Digest::parse(&sha256_hex(data)).unwrap();

        let mut cursor = Cursor::new(data.to_vec());
        let size = store.stage_and_commit(&mut cursor, &digest).unwrap();
        assert_eq!(size, data.len() as u64);
        assert!(store.has(&digest));

        let mut file = store.open_blob(&digest).unwrap();
        let mut contents = Vec::new();
        std::io::Read::read_to_end(&mut file, &mut contents).unwrap();
        assert_eq!(contents, data);
    }

    #[test]
    fn hash_mismatch_leaves_no_trace() {
        let tmp = tempfile::tempdir().unwrap();
        let store = BlobStore::open(tmp.path()).unwrap();

        let data = b"some bytes";
        let wrong_digest = Digest::parse(&"0".repeat(64)).unwrap();
        let mut cursor = Cursor::new(data.to_vec());
        let err = store.stage_and_commit(&mut cursor, &wrong_digest).unwrap_err();
        assert!(matches!(err, crate::error::Error::HashMismatch { .. }));
        assert!(!store.has(&wrong_digest));
        assert!(!store.pending_path(&wrong_digest).exists());
    }

    #[test]
    fn unlink_nonexistent_is_noop() {
        let tmp = tempfile::tempdir().unwrap();
        let store = BlobStore::open(tmp.path()).unwrap();
        let digest = Digest::parse(&"a".repeat(64)).unwrap();
        store.unlink(&digest).unwrap();
    }

    #[test]
    fn partial_dir_create_and_clean_is_idempotent() {
        let tmp = tempfile::tempdir().unwrap();
        let store = BlobStore::open(tmp.path()).unwrap();
        let digest = Digest::parse(&"b".repeat(64)).unwrap();

        let path = store.ensure_partial_dir(&digest).unwrap();
        assert!(path.is_dir());
        store.ensure_partial_dir(&digest).unwrap();
        store.clean_partial_dir(&digest).unwrap();
        assert!(!path.exists());
        store.clean_partial_dir(&digest).unwrap();
    }
}
