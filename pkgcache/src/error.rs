//! Error taxonomy exposed at the cache's public boundary.

use std::fmt;

/// Errors returned by [`crate::Cache`](crate::Cache) operations.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// No blob exists at the given digest.
    #[error("no such blob: {0}")]
    NotFound(String),

    /// The computed digest of a streamed write did not match the caller's
    /// expectation.
    #[error("hash mismatch: expected {expected}, got {actual}")]
    HashMismatch { expected: String, actual: String },

    /// `delete` was refused because readers still hold the blob open.
    #[error("blob {0} is still in use")]
    InUse(String),

    /// Admitting the incoming blob would violate the configured
    /// minimum-free-disk-space floor.
    #[error("insufficient disk space")]
    InsufficientDiskSpace,

    /// Eviction could not free enough space within the cold window.
    #[error("cache is full")]
    CacheFull,

    /// The metadata catalog failed its integrity probe.
    #[error("metadata catalog is corrupted")]
    Corrupted,

    /// Underlying I/O error.
    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// Underlying catalog (SQLite) error.
    #[error(transparent)]
    Db(#[from] rusqlite::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

/// A 64-character lowercase hex SHA-256 digest, newtyped so callers cannot
/// accidentally pass an unrelated string where a digest is expected.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Digest(String);

impl Digest {
    /// Validates and wraps a lowercase hex digest string.
    pub fn parse(s: &str) -> Result<Self> {
        if s.len() == 64 && s.bytes().all(|b| b.is_ascii_hexdigit() && !b.is_ascii_uppercase()) {
            Ok(Digest(s.to_string()))
        } else {
            Err(Error::NotFound(s.to_string()))
        }
    }

    pub fn from_bytes(bytes: &[u8; 32]) -> Self {
        Digest(hex::encode(bytes))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The first two hex characters, used for directory sharding.
    pub fn shard(&self) -> &str {
        &self.0[0..2]
    }
}

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Debug for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for Digest {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_short_or_uppercase() {
        assert!(Digest::parse("abc").is_err());
        assert!(Digest::parse(&"A".repeat(64)).is_err());
        assert!(Digest::parse(&"f".repeat(64)).is_ok());
    }
}
