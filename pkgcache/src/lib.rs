//! Content-addressed local cache for Debian binary packages.
//!
//! This crate implements the cache subsystem that backs a peer-to-peer
//! package distribution agent: a content-addressed blob store keyed by
//! SHA-256 digest, a durable metadata catalog, reader-reference tracking
//! that gates deletion, an admission/eviction engine enforcing a bounded
//! total footprint, corruption recovery for the metadata database, and a
//! derived query surface (lookup by identity, popularity, recency,
//! aggregate statistics).
//!
//! # Layout
//!
//! ```text
//! <base>/packages/sha256/<first-2-hex>/<full-hex>    published blobs
//! <base>/packages/pending/<digest>                    staging files
//! <base>/packages/partial/<digest>/...                downloader scratch
//! <base>/indices/                                     reserved for collaborators
//! <base>/state.db                                     metadata catalog
//! ```
//!
//! # Concurrency
//!
//! All catalog access is serialized through a single internal mutex (see
//! [`catalog`] for why a plain reader-writer lock doesn't fit a
//! non-`Sync` SQLite connection). Reader-reference counts that gate
//! deletion live in a separate, short-lived lock (see [`readers`]) so a
//! `delete` racing against open `get` handles is always resolved
//! correctly: the delete is refused with [`Error::InUse`] until every
//! reader closes.
//!
//! Out of scope: wire protocols, repository index parsing, DHT
//! announcement scheduling, and chunked-download state machines. Those
//! collaborators are expected to drive this crate's public contract and
//! use [`Cache::scratch_dir`] / [`Cache::raw_handle`] for their own
//! on-disk and in-database state.

mod blob_store;
mod cache;
mod catalog;
mod error;
mod eviction;
mod handle;
mod readers;
mod record;
mod stats;

pub use cache::{Cache, CacheConfig};
pub use catalog::Catalog;
pub use error::{Digest, Error, Result};
pub use handle::ReadHandle;
pub use record::Record;
pub use stats::Stats;
