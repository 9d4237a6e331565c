//! Process-local reader-reference tracking (C3).
//!
//! Independent of the catalog's reader-writer lock: a single RW-lock can't
//! express "delete is blocked by open read handles that outlive the `get`
//! call that created them", so open handle counts live in their own short
//! lived map instead. `delete` consults this map to refuse with `InUse`.

use std::collections::HashMap;
use std::sync::Mutex;

#[derive(Default)]
pub struct ReaderTracker {
    counts: Mutex<HashMap<String, u32>>,
}

impl ReaderTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers one more open reader for `digest`.
    pub fn acquire(&self, digest: &str) {
        let mut counts = self.counts.lock().unwrap();
        *counts.entry(digest.to_string()).or_insert(0) += 1;
    }

    /// Releases one reader for `digest`. Idempotent: releasing a digest
    /// with no registered readers is a no-op, so double-close is benign.
    pub fn release(&self, digest: &str) {
        let mut counts = self.counts.lock().unwrap();
        if let Some(count) = counts.get_mut(digest) {
            if *count <= 1 {
                counts.remove(digest);
            } else {
                *count -= 1;
            }
        }
    }

    /// Current number of open readers for `digest`.
    pub fn count(&self, digest: &str) -> u32 {
        let counts = self.counts.lock().unwrap();
        counts.get(digest).copied().unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tracks_acquire_and_release() {
        let tracker = ReaderTracker::new();
        assert_eq!(tracker.count("d"), 0);
        tracker.acquire("d");
        tracker.acquire("d");
        assert_eq!(tracker.count("d"), 2);
        tracker.release("d");
        assert_eq!(tracker.count("d"), 1);
        tracker.release("d");
        assert_eq!(tracker.count("d"), 0);
    }

    #[test]
    fn double_release_is_benign() {
        let tracker = ReaderTracker::new();
        tracker.acquire("d");
        tracker.release("d");
        tracker.release("d");
        assert_eq!(tracker.count("d"), 0);
    }
}
