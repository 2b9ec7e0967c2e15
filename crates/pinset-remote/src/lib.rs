//! Backends that turn mutable references into immutable pins.
//!
//! This crate provides the I/O layer behind three traits: `GitBackend`
//! (remote ref queries plus offline reads against lazily fetched bare mirrors),
//! `BlobStore` (cloud object metadata and single-pass streaming with sha1 and
//! sha256 computed in parallel), and `PackageRegistry` (version resolution and
//! single-file extraction from package instances). Real implementations shell
//! out to `git`/`cipd` or speak HTTP; the `mock` module holds in-memory doubles.

pub mod blob;
pub mod cipd;
pub mod config;
pub mod git;
pub mod mock;
pub mod once_map;

pub use blob::{hash_stream, HttpBlobStore};
pub use cipd::CipdCli;
pub use config::RemoteConfig;
pub use git::{normalize_git_url, parse_ls_remote, parse_trailers, GitMirrors, GitRepoState};
pub use once_map::OnceMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::io::Read;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RemoteError {
    #[error("remote I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("git error: {0}")]
    Git(String),
    #[error("HTTP error: {0}")]
    Http(String),
    #[error("package registry error: {0}")]
    Package(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("serialization error: {0}")]
    Serialization(String),
    #[error("cache error: {0}")]
    Store(#[from] pinset_store::StoreError),
    #[error("invalid glob pattern: {0}")]
    Glob(#[from] globset::Error),
}

/// One line of a remote ref listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteRef {
    pub commit: String,
    pub name: String,
}

/// Structured metadata of one commit.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CommitInfo {
    pub hash: String,
    pub author: String,
    pub author_time: DateTime<Utc>,
    pub message: String,
    /// Footer key/value pairs of the message, in order of appearance per key.
    pub trailers: BTreeMap<String, Vec<String>>,
}

impl CommitInfo {
    pub fn subject(&self) -> &str {
        self.message.lines().next().unwrap_or_default()
    }

    pub fn trailer(&self, key: &str) -> Option<&str> {
        self.trailers
            .get(key)
            .and_then(|v| v.last())
            .map(String::as_str)
    }
}

/// Access to git repositories by URL.
pub trait GitBackend: Send + Sync {
    /// List remote refs matching `patterns` (all refs when empty).
    fn ls_remote(&self, url: &str, patterns: &[String]) -> Result<Vec<RemoteRef>, RemoteError>;

    /// Read one file at a commit. `Ok(None)` when the path does not exist there.
    fn read_blob(&self, url: &str, commit: &str, path: &str)
        -> Result<Option<Vec<u8>>, RemoteError>;

    /// List files under `dir` at a commit whose `dir`-relative path matches any
    /// of `globs` (every file when empty). Paths are repository-relative.
    fn list_files(
        &self,
        url: &str,
        commit: &str,
        dir: &str,
        globs: &[String],
    ) -> Result<Vec<String>, RemoteError>;

    /// Metadata of `commit`, or of the newest ancestor whose message matches `grep`.
    fn read_commit(
        &self,
        url: &str,
        commit: &str,
        grep: Option<&str>,
    ) -> Result<CommitInfo, RemoteError>;
}

/// Store-reported identity of a blob.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ObjectMeta {
    pub generation: i64,
    pub size: u64,
}

/// Read access to a cloud blob store.
pub trait BlobStore: Send + Sync {
    fn stat(&self, bucket: &str, object: &str) -> Result<ObjectMeta, RemoteError>;

    /// Open the bytes of a specific generation for a single streaming read.
    fn open(
        &self,
        bucket: &str,
        object: &str,
        generation: i64,
    ) -> Result<Box<dyn Read + Send>, RemoteError>;
}

/// A package registry resolving versions to immutable instances.
pub trait PackageRegistry: Send + Sync {
    /// Identity recorded as provenance for live resolutions.
    fn service_identity(&self) -> String;

    fn resolve_version(&self, package: &str, version: &str) -> Result<String, RemoteError>;

    /// Read one file out of a package instance. `Ok(None)` when absent.
    fn read_file(
        &self,
        package: &str,
        instance_id: &str,
        path: &str,
    ) -> Result<Option<Vec<u8>>, RemoteError>;
}
