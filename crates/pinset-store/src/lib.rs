//! Local cache storage for pinset.
//!
//! This crate provides the on-disk acceleration layer: `CacheLayout` for the
//! directory structure (git mirrors, blob hash records, deployed package
//! instances), `CacheLock` for cross-process advisory locking, and
//! `BlobHashCache`, the verification cache keyed by (bucket, object, generation).
//! Nothing here is part of the correctness contract: every entry is validated
//! before use and discarded when it does not check out.

pub mod blob_cache;
pub mod layout;
pub mod lock;

pub use blob_cache::{BlobCacheRecord, BlobHashCache};
pub use layout::{cache_key, CacheLayout};
pub use lock::CacheLock;

use std::path::Path;
use thiserror::Error;

/// Fsync a directory to ensure that a preceding `rename()` is durable.
pub(crate) fn fsync_dir(dir: &Path) -> Result<(), std::io::Error> {
    let f = std::fs::File::open(dir)?;
    f.sync_all()
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("cache I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("lock acquisition failed: {0}")]
    LockFailed(String),
    #[error("cache format version mismatch: expected {expected}, found {found}")]
    VersionMismatch { expected: u32, found: u32 },
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}
