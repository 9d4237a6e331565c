//! Read handles returned by [`crate::Cache::get`].

use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom};
use std::sync::Arc;

use crate::readers::ReaderTracker;

/// An open read handle on a published blob.
///
/// Registers one reader with the cache's [`ReaderTracker`] on
/// construction and releases it exactly once on drop, so closing twice
/// (or never explicitly closing at all) is always safe.
pub struct ReadHandle {
    file: File,
    digest: String,
    tracker: Arc<ReaderTracker>,
    released: bool,
}

impl ReadHandle {
    pub(crate) fn new(file: File, digest: String, tracker: Arc<ReaderTracker>) -> Self {
        tracker.acquire(&digest);
        ReadHandle {
            file,
            digest,
            tracker,
            released: false,
        }
    }

    pub fn digest(&self) -> &str {
        &self.digest
    }

    /// Explicitly closes the handle, releasing its reader reference.
    /// Idempotent -- calling this more than once (or dropping afterward)
    /// is a no-op.
    pub fn close(&mut self) {
        if !self.released {
            self.tracker.release(&self.digest);
            self.released = true;
        }
    }
}

impl Read for ReadHandle {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.file.read(buf)
    }
}

impl Seek for ReadHandle {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        self.file.seek(pos)
    }
}

impl Drop for ReadHandle {
    fn drop(&mut self) {
        self.close();
    }
}
