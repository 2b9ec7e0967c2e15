use crate::layout::{cache_key, CacheLayout};
use crate::{fsync_dir, StoreError};
use pinset_schema::BlobHash;
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::Write;
use std::path::PathBuf;
use tempfile::NamedTempFile;
use tracing::debug;

/// A fully verified hash record for one (bucket, object, generation).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct BlobCacheRecord {
    pub bucket: String,
    pub object: String,
    pub generation: i64,
    pub size: u64,
    pub sha1: String,
    pub sha256: String,
    /// blake3 checksum over the record content (excluding this field).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checksum: Option<String>,
}

impl BlobCacheRecord {
    /// Build a record from a computed hash; `None` unless every component is known.
    pub fn from_hash(bucket: &str, object: &str, generation: i64, hash: &BlobHash) -> Option<Self> {
        Some(Self {
            bucket: bucket.to_owned(),
            object: object.to_owned(),
            generation,
            size: hash.size?,
            sha1: hash.sha1.clone()?,
            sha256: hash.sha256.clone()?,
            checksum: None,
        })
    }

    pub fn hash(&self) -> BlobHash {
        BlobHash {
            size: Some(self.size),
            sha1: Some(self.sha1.clone()),
            sha256: Some(self.sha256.clone()),
        }
    }

    fn is_complete(&self) -> bool {
        !self.sha1.is_empty() && !self.sha256.is_empty()
    }

    fn compute_checksum(&self) -> Result<String, StoreError> {
        let mut copy = self.clone();
        copy.checksum = None;
        let json = serde_json::to_string_pretty(&copy)?;
        Ok(blake3::hash(json.as_bytes()).to_hex().to_string())
    }
}

/// Best-effort local cache of verified blob hashes.
///
/// A hit is only returned for a complete, checksum-valid record whose
/// generation equals the live one. Unreadable or partial records are removed
/// and reported as misses, never as errors.
pub struct BlobHashCache {
    layout: CacheLayout,
}

impl BlobHashCache {
    pub fn new(layout: CacheLayout) -> Self {
        Self { layout }
    }

    fn record_path(&self, bucket: &str, object: &str) -> PathBuf {
        self.layout
            .blob_cache_dir()
            .join(cache_key(&format!("{bucket}/{object}")))
    }

    pub fn get(&self, bucket: &str, object: &str, generation: i64) -> Option<BlobCacheRecord> {
        let path = self.record_path(bucket, object);
        let content = fs::read_to_string(&path).ok()?;
        let record = match serde_json::from_str::<BlobCacheRecord>(&content) {
            Ok(r) => r,
            Err(e) => {
                debug!("discarding unreadable blob cache entry {}: {e}", path.display());
                let _ = fs::remove_file(&path);
                return None;
            }
        };

        let checksum_ok = match (&record.checksum, record.compute_checksum()) {
            (Some(expected), Ok(actual)) => *expected == actual,
            _ => false,
        };
        if !checksum_ok || !record.is_complete() {
            debug!("discarding partial blob cache entry {}", path.display());
            let _ = fs::remove_file(&path);
            return None;
        }
        if record.bucket != bucket || record.object != object {
            return None;
        }
        if record.generation != generation {
            debug!(
                "blob cache entry for gs://{bucket}/{object} is stale (generation {} != {generation})",
                record.generation
            );
            return None;
        }
        Some(record)
    }

    pub fn put(&self, record: &BlobCacheRecord) -> Result<(), StoreError> {
        let dir = self.layout.blob_cache_dir();
        fs::create_dir_all(&dir)?;
        let dest = self.record_path(&record.bucket, &record.object);

        let mut with_checksum = record.clone();
        with_checksum.checksum = Some(with_checksum.compute_checksum()?);
        let content = serde_json::to_string_pretty(&with_checksum)?;

        let mut tmp = NamedTempFile::new_in(&dir)?;
        tmp.write_all(content.as_bytes())?;
        tmp.as_file().sync_all()?;
        tmp.persist(&dest).map_err(|e| StoreError::Io(e.error))?;
        fsync_dir(&dir)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_cache() -> (tempfile::TempDir, BlobHashCache) {
        let dir = tempfile::tempdir().unwrap();
        let layout = CacheLayout::new(dir.path());
        layout.initialize().unwrap();
        (dir, BlobHashCache::new(layout))
    }

    fn record(generation: i64) -> BlobCacheRecord {
        BlobCacheRecord {
            bucket: "b".to_owned(),
            object: "dir/obj".to_owned(),
            generation,
            size: 5,
            sha1: "1".repeat(40),
            sha256: "2".repeat(64),
            checksum: None,
        }
    }

    #[test]
    fn put_and_get_roundtrip() {
        let (_dir, cache) = test_cache();
        cache.put(&record(7)).unwrap();
        let got = cache.get("b", "dir/obj", 7).unwrap();
        assert_eq!(got.size, 5);
        assert_eq!(got.hash(), record(7).hash());
    }

    #[test]
    fn stale_generation_is_a_miss() {
        let (_dir, cache) = test_cache();
        cache.put(&record(7)).unwrap();
        assert!(cache.get("b", "dir/obj", 8).is_none());
        assert!(cache.get("b", "dir/obj", 7).is_some());
    }

    #[test]
    fn missing_entry_is_a_miss() {
        let (_dir, cache) = test_cache();
        assert!(cache.get("b", "nope", 1).is_none());
    }

    #[test]
    fn corrupt_entry_is_discarded() {
        let (_dir, cache) = test_cache();
        cache.put(&record(7)).unwrap();
        let path = cache.record_path("b", "dir/obj");
        fs::write(&path, b"{ not json").unwrap();
        assert!(cache.get("b", "dir/obj", 7).is_none());
        assert!(!path.exists());
    }

    #[test]
    fn tampered_entry_is_discarded() {
        let (_dir, cache) = test_cache();
        cache.put(&record(7)).unwrap();
        let path = cache.record_path("b", "dir/obj");
        let content = fs::read_to_string(&path).unwrap();
        fs::write(&path, content.replace("\"size\": 5", "\"size\": 6")).unwrap();
        assert!(cache.get("b", "dir/obj", 7).is_none());
        assert!(!path.exists());
    }

    #[test]
    fn incomplete_hash_builds_no_record() {
        let partial = BlobHash {
            size: Some(1),
            sha1: None,
            sha256: Some("x".to_owned()),
        };
        assert!(BlobCacheRecord::from_hash("b", "o", 1, &partial).is_none());
    }
}
