//! In-memory backends with call counters, for tests.

use crate::git::{build_globs, normalize_git_url};
use crate::{
    BlobStore, CommitInfo, GitBackend, ObjectMeta, PackageRegistry, RemoteError, RemoteRef,
};
use chrono::{DateTime, Utc};
use pinset_schema::is_instance_id;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::io::{Cursor, Read};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

#[derive(Debug, Clone, Default)]
struct MockCommit {
    files: BTreeMap<String, Vec<u8>>,
    message: String,
    author_time: DateTime<Utc>,
    parent: Option<String>,
}

#[derive(Default)]
struct MockGitState {
    refs: HashMap<String, Vec<RemoteRef>>,
    commits: HashMap<(String, String), MockCommit>,
    failing: HashSet<String>,
}

/// Git backend over hand-built repositories keyed by normalized URL.
#[derive(Default)]
pub struct MockGit {
    state: Mutex<MockGitState>,
    latency: Mutex<Duration>,
    ls_remote_calls: AtomicUsize,
    read_calls: AtomicUsize,
}

fn grep_matches(message: &str, pattern: &str) -> bool {
    match pattern.strip_prefix('^') {
        Some(anchored) => message.lines().any(|l| l.starts_with(anchored)),
        None => message.contains(pattern),
    }
}

impl MockGit {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> std::sync::MutexGuard<'_, MockGitState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn add_ref(&self, url: &str, name: &str, commit: &str) {
        self.state()
            .refs
            .entry(normalize_git_url(url))
            .or_default()
            .push(RemoteRef {
                commit: commit.to_owned(),
                name: name.to_owned(),
            });
    }

    pub fn add_commit(&self, url: &str, commit: &str, files: &[(&str, &str)]) {
        let mut state = self.state();
        let entry = state
            .commits
            .entry((normalize_git_url(url), commit.to_owned()))
            .or_default();
        if entry.message.is_empty() {
            entry.message = format!("Commit {commit}");
        }
        for (path, content) in files {
            entry
                .files
                .insert((*path).to_owned(), content.as_bytes().to_vec());
        }
    }

    pub fn set_message(&self, url: &str, commit: &str, message: &str, parent: Option<&str>) {
        let mut state = self.state();
        let entry = state
            .commits
            .entry((normalize_git_url(url), commit.to_owned()))
            .or_default();
        message.clone_into(&mut entry.message);
        entry.parent = parent.map(str::to_owned);
    }

    /// Make every operation against `url` fail.
    pub fn fail_url(&self, url: &str) {
        self.state().failing.insert(normalize_git_url(url));
    }

    /// Delay applied to every file read.
    pub fn set_latency(&self, latency: Duration) {
        *self.latency.lock().unwrap_or_else(PoisonError::into_inner) = latency;
    }

    pub fn ls_remote_calls(&self) -> usize {
        self.ls_remote_calls.load(Ordering::SeqCst)
    }

    pub fn read_calls(&self) -> usize {
        self.read_calls.load(Ordering::SeqCst)
    }

    fn commit(&self, url: &str, commit: &str) -> Result<MockCommit, RemoteError> {
        let url = normalize_git_url(url);
        let state = self.state();
        if state.failing.contains(&url) {
            return Err(RemoteError::Git(format!("{url}: simulated failure")));
        }
        state
            .commits
            .get(&(url.clone(), commit.to_owned()))
            .cloned()
            .ok_or_else(|| RemoteError::Git(format!("commit {commit} is not available from {url}")))
    }
}

impl GitBackend for MockGit {
    fn ls_remote(&self, url: &str, patterns: &[String]) -> Result<Vec<RemoteRef>, RemoteError> {
        self.ls_remote_calls.fetch_add(1, Ordering::SeqCst);
        let url = normalize_git_url(url);
        let state = self.state();
        if state.failing.contains(&url) {
            return Err(RemoteError::Git(format!("{url}: simulated failure")));
        }
        let refs = state.refs.get(&url).cloned().unwrap_or_default();
        Ok(refs
            .into_iter()
            .filter(|r| {
                patterns.is_empty()
                    || patterns
                        .iter()
                        .any(|p| r.name == *p || r.name.ends_with(&format!("/{p}")))
            })
            .collect())
    }

    fn read_blob(
        &self,
        url: &str,
        commit: &str,
        path: &str,
    ) -> Result<Option<Vec<u8>>, RemoteError> {
        self.read_calls.fetch_add(1, Ordering::SeqCst);
        let latency = *self.latency.lock().unwrap_or_else(PoisonError::into_inner);
        if !latency.is_zero() {
            std::thread::sleep(latency);
        }
        Ok(self.commit(url, commit)?.files.get(path).cloned())
    }

    fn list_files(
        &self,
        url: &str,
        commit: &str,
        dir: &str,
        globs: &[String],
    ) -> Result<Vec<String>, RemoteError> {
        let c = self.commit(url, commit)?;
        let dir = dir.trim_matches('/');
        let prefix = if dir.is_empty() {
            String::new()
        } else {
            format!("{dir}/")
        };
        let matcher = build_globs(globs)?;
        Ok(c.files
            .keys()
            .filter(|p| {
                p.strip_prefix(&prefix)
                    .is_some_and(|rel| matcher.as_ref().is_none_or(|m| m.is_match(rel)))
            })
            .cloned()
            .collect())
    }

    fn read_commit(
        &self,
        url: &str,
        commit: &str,
        grep: Option<&str>,
    ) -> Result<CommitInfo, RemoteError> {
        let mut current = commit.to_owned();
        loop {
            let c = self.commit(url, &current)?;
            if grep.is_none_or(|p| grep_matches(&c.message, p)) {
                return Ok(CommitInfo {
                    hash: current,
                    author: "Mock Author <mock@example.com>".to_owned(),
                    author_time: c.author_time,
                    trailers: crate::parse_trailers(&c.message),
                    message: c.message,
                });
            }
            let Some(parent) = c.parent else {
                return Err(RemoteError::NotFound(format!(
                    "no commit matching '{}' at or below {commit}",
                    grep.unwrap_or_default()
                )));
            };
            current = parent;
        }
    }
}

/// Blob store over in-memory objects.
#[derive(Default)]
pub struct MockBlobStore {
    objects: Mutex<HashMap<(String, String), (i64, Vec<u8>)>>,
    stat_calls: AtomicUsize,
    open_calls: AtomicUsize,
}

impl MockBlobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_object(&self, bucket: &str, object: &str, generation: i64, data: &[u8]) {
        self.objects
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(
                (bucket.to_owned(), object.to_owned()),
                (generation, data.to_vec()),
            );
    }

    pub fn stat_calls(&self) -> usize {
        self.stat_calls.load(Ordering::SeqCst)
    }

    pub fn open_calls(&self) -> usize {
        self.open_calls.load(Ordering::SeqCst)
    }

    fn get(&self, bucket: &str, object: &str) -> Result<(i64, Vec<u8>), RemoteError> {
        self.objects
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&(bucket.to_owned(), object.to_owned()))
            .cloned()
            .ok_or_else(|| RemoteError::NotFound(format!("gs://{bucket}/{object}")))
    }
}

impl BlobStore for MockBlobStore {
    fn stat(&self, bucket: &str, object: &str) -> Result<ObjectMeta, RemoteError> {
        self.stat_calls.fetch_add(1, Ordering::SeqCst);
        let (generation, data) = self.get(bucket, object)?;
        Ok(ObjectMeta {
            generation,
            size: data.len() as u64,
        })
    }

    fn open(
        &self,
        bucket: &str,
        object: &str,
        generation: i64,
    ) -> Result<Box<dyn Read + Send>, RemoteError> {
        self.open_calls.fetch_add(1, Ordering::SeqCst);
        let (current, data) = self.get(bucket, object)?;
        if current != generation {
            return Err(RemoteError::NotFound(format!(
                "gs://{bucket}/{object}#{generation}"
            )));
        }
        Ok(Box::new(Cursor::new(data)))
    }
}

/// Package registry over in-memory versions and instance files.
pub struct MockRegistry {
    identity: String,
    versions: Mutex<HashMap<(String, String), String>>,
    files: Mutex<HashMap<(String, String), HashMap<String, Vec<u8>>>>,
    resolve_calls: AtomicUsize,
    read_calls: AtomicUsize,
}

impl Default for MockRegistry {
    fn default() -> Self {
        Self {
            identity: "https://packages.example.com".to_owned(),
            versions: Mutex::new(HashMap::new()),
            files: Mutex::new(HashMap::new()),
            resolve_calls: AtomicUsize::new(0),
            read_calls: AtomicUsize::new(0),
        }
    }
}

impl MockRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_version(&self, package: &str, version: &str, instance_id: &str) {
        self.versions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(
                (package.to_owned(), version.to_owned()),
                instance_id.to_owned(),
            );
    }

    pub fn add_file(&self, package: &str, instance_id: &str, path: &str, data: &[u8]) {
        self.files
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry((package.to_owned(), instance_id.to_owned()))
            .or_default()
            .insert(path.to_owned(), data.to_vec());
    }

    pub fn resolve_calls(&self) -> usize {
        self.resolve_calls.load(Ordering::SeqCst)
    }

    pub fn read_calls(&self) -> usize {
        self.read_calls.load(Ordering::SeqCst)
    }
}

impl PackageRegistry for MockRegistry {
    fn service_identity(&self) -> String {
        self.identity.clone()
    }

    fn resolve_version(&self, package: &str, version: &str) -> Result<String, RemoteError> {
        self.resolve_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(iid) = self
            .versions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&(package.to_owned(), version.to_owned()))
        {
            return Ok(iid.clone());
        }
        if is_instance_id(version) {
            return Ok(version.to_owned());
        }
        Err(RemoteError::NotFound(format!("{package}@{version}")))
    }

    fn read_file(
        &self,
        package: &str,
        instance_id: &str,
        path: &str,
    ) -> Result<Option<Vec<u8>>, RemoteError> {
        self.read_calls.fetch_add(1, Ordering::SeqCst);
        let files = self.files.lock().unwrap_or_else(PoisonError::into_inner);
        match files.get(&(package.to_owned(), instance_id.to_owned())) {
            Some(instance) => Ok(instance.get(path).cloned()),
            None => Err(RemoteError::NotFound(format!("{package}@{instance_id}"))),
        }
    }
}
