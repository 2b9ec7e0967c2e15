use crate::StoreError;
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;

/// Current cache format version. Incremented on incompatible layout changes.
pub const CACHE_FORMAT_VERSION: u32 = 1;
const VERSION_FILE: &str = "version";

/// Directory layout for the pinset local cache.
///
/// Manages paths for git mirrors, the blob verification cache, deployed package
/// instances, and the cache version marker. All subdirectories are created
/// lazily on [`initialize`](Self::initialize).
#[derive(Debug, Clone)]
pub struct CacheLayout {
    root: PathBuf,
}

#[derive(Debug, Serialize, Deserialize)]
struct CacheVersion {
    format_version: u32,
}

impl CacheLayout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    #[inline]
    pub fn root(&self) -> &Path {
        &self.root
    }

    #[inline]
    pub fn git_dir(&self) -> PathBuf {
        self.root.join("git")
    }

    /// Bare mirror directory for a (normalized) repository URL.
    pub fn git_mirror(&self, url: &str) -> PathBuf {
        self.git_dir().join(cache_key(url))
    }

    #[inline]
    pub fn blob_cache_dir(&self) -> PathBuf {
        self.root.join("blobs")
    }

    #[inline]
    pub fn packages_dir(&self) -> PathBuf {
        self.root.join("packages")
    }

    /// Deployment directory of one package instance.
    pub fn package_instance(&self, package: &str, instance_id: &str) -> PathBuf {
        self.packages_dir()
            .join(cache_key(&format!("{package}@{instance_id}")))
    }

    pub fn initialize(&self) -> Result<(), StoreError> {
        fs::create_dir_all(self.git_dir())?;
        fs::create_dir_all(self.blob_cache_dir())?;
        fs::create_dir_all(self.packages_dir())?;

        let version_path = self.root.join(VERSION_FILE);
        if version_path.exists() {
            self.verify_version()?;
        } else {
            let ver = CacheVersion {
                format_version: CACHE_FORMAT_VERSION,
            };
            let content = serde_json::to_string_pretty(&ver)?;
            let mut tmp = NamedTempFile::new_in(&self.root)?;
            tmp.write_all(content.as_bytes())?;
            tmp.as_file().sync_all()?;
            tmp.persist(&version_path)
                .map_err(|e| StoreError::Io(e.error))?;
            crate::fsync_dir(&self.root)?;
        }

        Ok(())
    }

    pub fn verify_version(&self) -> Result<(), StoreError> {
        let version_path = self.root.join(VERSION_FILE);
        let content = fs::read_to_string(&version_path)?;
        let ver: CacheVersion = serde_json::from_str(&content)?;

        if ver.format_version != CACHE_FORMAT_VERSION {
            return Err(StoreError::VersionMismatch {
                expected: CACHE_FORMAT_VERSION,
                found: ver.format_version,
            });
        }
        Ok(())
    }
}

/// Filesystem-safe key: a readable prefix plus a blake3 digest for uniqueness.
pub fn cache_key(name: &str) -> String {
    let readable: String = name
        .rsplit('/')
        .find(|s| !s.is_empty())
        .unwrap_or("x")
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .take(32)
        .collect();
    let digest = blake3::hash(name.as_bytes()).to_hex();
    format!("{readable}-{}", &digest[..16])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn layout_paths_are_correct() {
        let layout = CacheLayout::new("/tmp/pinset-test");
        assert_eq!(layout.git_dir(), PathBuf::from("/tmp/pinset-test/git"));
        assert_eq!(
            layout.blob_cache_dir(),
            PathBuf::from("/tmp/pinset-test/blobs")
        );
        assert_eq!(
            layout.packages_dir(),
            PathBuf::from("/tmp/pinset-test/packages")
        );
        assert!(layout
            .git_mirror("https://chromium.googlesource.com/chromium/src")
            .starts_with("/tmp/pinset-test/git/src-"));
    }

    #[test]
    fn cache_keys_are_distinct_and_safe() {
        let a = cache_key("https://host/a/repo");
        let b = cache_key("https://host/b/repo");
        assert_ne!(a, b);
        assert!(a.starts_with("repo-"));
        assert!(cache_key("pkg/${platform}@x:y")
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_'));
    }

    #[test]
    fn initialize_creates_directories() {
        let dir = tempfile::tempdir().unwrap();
        let layout = CacheLayout::new(dir.path());
        layout.initialize().unwrap();

        assert!(layout.git_dir().is_dir());
        assert!(layout.blob_cache_dir().is_dir());
        assert!(layout.packages_dir().is_dir());
    }

    #[test]
    fn initialize_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let layout = CacheLayout::new(dir.path());
        layout.initialize().unwrap();
        layout.initialize().unwrap();
        layout.verify_version().unwrap();
    }

    #[test]
    fn version_mismatch_detected() {
        let dir = tempfile::tempdir().unwrap();
        let layout = CacheLayout::new(dir.path());
        layout.initialize().unwrap();
        fs::write(dir.path().join(VERSION_FILE), r#"{"format_version": 99}"#).unwrap();
        assert!(matches!(
            layout.verify_version(),
            Err(StoreError::VersionMismatch { found: 99, .. })
        ));
    }
}
