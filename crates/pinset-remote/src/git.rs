use crate::{CommitInfo, GitBackend, OnceMap, RemoteError, RemoteRef};
use chrono::{DateTime, Utc};
use globset::{GlobBuilder, GlobSet, GlobSetBuilder};
use pinset_store::{CacheLayout, CacheLock};
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::process::{Command, Output, Stdio};
use std::sync::{Arc, Mutex, OnceLock, PoisonError};
use tracing::{debug, info};

/// Hosts whose URLs are equivalent with and without a trailing `.git`.
const KNOWN_HOSTS: &[&str] = &["googlesource.com", "github.com", "gitlab.com"];

/// Commits added to a shallow mirror when a message search misses.
const DEEPEN_STEP: u32 = 1000;

const LOG_FORMAT: &str = "--format=%H%x00%an <%ae>%x00%aI%x00%B";

/// Canonical form of a repository URL, used as the mirror key.
pub fn normalize_git_url(url: &str) -> String {
    let trimmed = url.trim().trim_end_matches('/');
    let host = trimmed
        .split_once("://")
        .and_then(|(_, rest)| rest.split('/').next())
        .map(|h| h.rsplit('@').next().unwrap_or(h))
        .unwrap_or_default();
    let known = KNOWN_HOSTS
        .iter()
        .any(|k| host == *k || host.ends_with(&format!(".{k}")));
    if known {
        if let Some(stripped) = trimmed.strip_suffix(".git") {
            return stripped.to_owned();
        }
    }
    trimmed.to_owned()
}

/// Parse `git ls-remote` output (`<sha>\t<ref>` per line).
pub fn parse_ls_remote(output: &str) -> Result<Vec<RemoteRef>, RemoteError> {
    output
        .lines()
        .filter(|l| !l.trim().is_empty())
        .map(|line| {
            let (commit, name) = line
                .split_once('\t')
                .ok_or_else(|| RemoteError::Git(format!("malformed ls-remote line: '{line}'")))?;
            Ok(RemoteRef {
                commit: commit.trim().to_owned(),
                name: name.trim().to_owned(),
            })
        })
        .collect()
}

/// Footer `Key: value` lines of the last paragraph of a commit message.
pub fn parse_trailers(message: &str) -> BTreeMap<String, Vec<String>> {
    let mut trailers: BTreeMap<String, Vec<String>> = BTreeMap::new();
    let paragraphs: Vec<&str> = message
        .trim()
        .split("\n\n")
        .filter(|p| !p.trim().is_empty())
        .collect();
    if paragraphs.len() < 2 {
        return trailers;
    }
    let Some(last) = paragraphs.last() else {
        return trailers;
    };
    for line in last.lines() {
        let Some((key, value)) = line.split_once(':') else {
            continue;
        };
        if key.is_empty() || key.contains(char::is_whitespace) {
            continue;
        }
        trailers
            .entry(key.to_owned())
            .or_default()
            .push(value.trim().to_owned());
    }
    trailers
}

fn run_git(binary: &str, dir: Option<&Path>, args: &[&str]) -> Result<Output, RemoteError> {
    let mut cmd = Command::new(binary);
    if let Some(dir) = dir {
        cmd.arg("-C").arg(dir);
    }
    cmd.args(args)
        .env("GIT_TERMINAL_PROMPT", "0")
        .stdin(Stdio::null());
    debug!("git {}", args.join(" "));
    cmd.output()
        .map_err(|e| RemoteError::Git(format!("failed to run {binary}: {e}")))
}

fn run_git_ok(binary: &str, dir: Option<&Path>, args: &[&str]) -> Result<Vec<u8>, RemoteError> {
    let out = run_git(binary, dir, args)?;
    if !out.status.success() {
        return Err(RemoteError::Git(format!(
            "git {} failed: {}",
            args.join(" "),
            String::from_utf8_lossy(&out.stderr).trim()
        )));
    }
    Ok(out.stdout)
}

fn parse_log_record(raw: &[u8]) -> Result<CommitInfo, RemoteError> {
    let text = String::from_utf8_lossy(raw);
    let mut fields = text.splitn(4, '\0');
    let (Some(hash), Some(author), Some(time), Some(message)) =
        (fields.next(), fields.next(), fields.next(), fields.next())
    else {
        return Err(RemoteError::Git(format!("malformed git log output: '{text}'")));
    };
    let author_time = DateTime::parse_from_rfc3339(time.trim())
        .map_err(|e| RemoteError::Git(format!("bad commit time '{time}': {e}")))?
        .with_timezone(&Utc);
    let message = message.trim_end().to_owned();
    Ok(CommitInfo {
        hash: hash.trim().to_owned(),
        author: author.to_owned(),
        author_time,
        trailers: parse_trailers(&message),
        message,
    })
}

pub(crate) fn build_globs(globs: &[String]) -> Result<Option<GlobSet>, RemoteError> {
    if globs.is_empty() {
        return Ok(None);
    }
    let mut builder = GlobSetBuilder::new();
    for g in globs {
        builder.add(GlobBuilder::new(g).literal_separator(true).build()?);
    }
    Ok(Some(builder.build()?))
}

/// One bare, blobless, shallow mirror of a remote repository.
///
/// Commits are fetched on first use and remembered per instance; blobs are
/// pulled lazily from the promisor remote when read.
pub struct GitRepoState {
    url: String,
    dir: PathBuf,
    binary: String,
    init: OnceLock<Result<(), String>>,
    fetched: OnceMap<()>,
}

impl GitRepoState {
    fn new(url: String, dir: PathBuf, binary: String) -> Self {
        Self {
            url,
            dir,
            binary,
            init: OnceLock::new(),
            fetched: OnceMap::new(),
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn git(&self, args: &[&str]) -> Result<Vec<u8>, RemoteError> {
        run_git_ok(&self.binary, Some(&self.dir), args)
    }

    fn lock_path(&self) -> PathBuf {
        self.dir.with_extension("lock")
    }

    /// Exclusive lock on the mirror, shared with other pinset processes.
    fn lock_mirror(&self) -> Result<CacheLock, RemoteError> {
        let path = self.lock_path();
        if let Some(lock) = CacheLock::try_acquire(&path)? {
            return Ok(lock);
        }
        debug!("waiting for the mirror lock of {}", self.url);
        Ok(CacheLock::acquire(&path)?)
    }

    fn ensure_initialized(&self) -> Result<(), RemoteError> {
        self.init
            .get_or_init(|| self.initialize().map_err(|e| e.to_string()))
            .clone()
            .map_err(RemoteError::Git)
    }

    fn initialize(&self) -> Result<(), RemoteError> {
        let _lock = self.lock_mirror()?;
        if self.dir.join("HEAD").is_file() {
            return Ok(());
        }
        let parent = self
            .dir
            .parent()
            .ok_or_else(|| RemoteError::Git(format!("invalid mirror path {}", self.dir.display())))?;
        std::fs::create_dir_all(parent)?;

        info!("creating mirror of {}", self.url);
        let staging = tempfile::Builder::new()
            .prefix(".mirror-")
            .tempdir_in(parent)?;
        let b = self.binary.as_str();
        let s = Some(staging.path());
        run_git_ok(b, s, &["init", "--bare", "--quiet"])?;
        run_git_ok(b, s, &["remote", "add", "origin", &self.url])?;
        run_git_ok(b, s, &["config", "remote.origin.promisor", "true"])?;
        run_git_ok(b, s, &["config", "remote.origin.partialclonefilter", "blob:none"])?;
        std::fs::rename(staging.path(), &self.dir)?;
        Ok(())
    }

    fn has_commit(&self, commit: &str) -> bool {
        run_git(
            &self.binary,
            Some(&self.dir),
            &["cat-file", "-e", &format!("{commit}^{{commit}}")],
        )
        .is_ok_and(|o| o.status.success())
    }

    /// Make `commit` available locally, fetching it at most once per instance.
    pub fn ensure_commit(&self, commit: &str) -> Result<(), RemoteError> {
        self.ensure_initialized()?;
        self.fetched
            .get_or_init(commit, || self.fetch_commit(commit).map_err(|e| e.to_string()))
            .map_err(RemoteError::Git)
    }

    fn fetch_commit(&self, commit: &str) -> Result<(), RemoteError> {
        if self.has_commit(commit) {
            debug!("{commit} already present in mirror of {}", self.url);
            return Ok(());
        }
        let _lock = self.lock_mirror()?;
        info!("fetching {commit} from {}", self.url);
        self.git(&[
            "fetch",
            "--quiet",
            "--no-tags",
            "--depth=1",
            "--filter=blob:none",
            "origin",
            commit,
        ])?;
        if !self.has_commit(commit) {
            return Err(RemoteError::Git(format!(
                "commit {commit} is not available from {}",
                self.url
            )));
        }
        Ok(())
    }

    fn deepen(&self, commit: &str) -> Result<(), RemoteError> {
        let _lock = self.lock_mirror()?;
        info!("deepening history of {} below {commit}", self.url);
        self.git(&[
            "fetch",
            "--quiet",
            "--no-tags",
            "--filter=blob:none",
            &format!("--deepen={DEEPEN_STEP}"),
            "origin",
            commit,
        ])?;
        Ok(())
    }

    fn is_shallow(&self) -> bool {
        self.dir.join("shallow").is_file()
    }

    pub fn read_blob(&self, commit: &str, path: &str) -> Result<Option<Vec<u8>>, RemoteError> {
        self.ensure_commit(commit)?;
        let listing = self.git(&["ls-tree", "-z", commit, "--", path])?;
        let listing = String::from_utf8_lossy(&listing);
        let Some(entry) = listing.split('\0').find(|e| !e.is_empty()) else {
            return Ok(None);
        };
        // "<mode> <type> <oid>\t<path>"
        let mut meta = entry.split('\t').next().unwrap_or_default().split(' ');
        let (Some(_mode), Some(kind), Some(oid)) = (meta.next(), meta.next(), meta.next()) else {
            return Err(RemoteError::Git(format!("malformed ls-tree entry: '{entry}'")));
        };
        if kind != "blob" {
            return Ok(None);
        }
        self.git(&["cat-file", "blob", oid]).map(Some)
    }

    pub fn list_files(
        &self,
        commit: &str,
        dir: &str,
        globs: &[String],
    ) -> Result<Vec<String>, RemoteError> {
        self.ensure_commit(commit)?;
        let dir = dir.trim_matches('/');
        let mut args = vec!["ls-tree", "-r", "-z", "--name-only", commit];
        if !dir.is_empty() {
            args.extend(["--", dir]);
        }
        let listing = self.git(&args)?;
        let matcher = build_globs(globs)?;
        let prefix = if dir.is_empty() {
            String::new()
        } else {
            format!("{dir}/")
        };

        Ok(String::from_utf8_lossy(&listing)
            .split('\0')
            .filter(|p| !p.is_empty())
            .filter_map(|p| {
                let rel = p.strip_prefix(&prefix)?;
                match &matcher {
                    Some(set) if !set.is_match(rel) => None,
                    _ => Some(p.to_owned()),
                }
            })
            .collect())
    }

    pub fn read_commit(&self, commit: &str, grep: Option<&str>) -> Result<CommitInfo, RemoteError> {
        self.ensure_commit(commit)?;
        let grep_arg = grep.map(|p| format!("--grep={p}"));
        let mut args = vec!["log", "-1", "-E", LOG_FORMAT];
        if let Some(g) = &grep_arg {
            args.push(g);
        }
        args.push(commit);

        let mut deepened = false;
        loop {
            let out = self.git(&args)?;
            if !out.is_empty() {
                return parse_log_record(&out);
            }
            if grep.is_none() || deepened || !self.is_shallow() {
                return Err(RemoteError::NotFound(format!(
                    "no commit matching '{}' at or below {commit} in {}",
                    grep.unwrap_or_default(),
                    self.url
                )));
            }
            self.deepen(commit)?;
            deepened = true;
        }
    }
}

/// `GitBackend` over a directory of local mirrors, one per normalized URL.
pub struct GitMirrors {
    layout: CacheLayout,
    binary: String,
    repos: Mutex<HashMap<String, Arc<GitRepoState>>>,
}

impl GitMirrors {
    pub fn new(layout: CacheLayout) -> Self {
        Self {
            layout,
            binary: "git".to_owned(),
            repos: Mutex::new(HashMap::new()),
        }
    }

    #[must_use]
    pub fn with_binary(mut self, binary: &str) -> Self {
        binary.clone_into(&mut self.binary);
        self
    }

    pub fn repo(&self, url: &str) -> Arc<GitRepoState> {
        let normalized = normalize_git_url(url);
        let mut repos = self.repos.lock().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(repos.entry(normalized.clone()).or_insert_with(|| {
            let dir = self.layout.git_mirror(&normalized);
            Arc::new(GitRepoState::new(normalized, dir, self.binary.clone()))
        }))
    }
}

impl GitBackend for GitMirrors {
    fn ls_remote(&self, url: &str, patterns: &[String]) -> Result<Vec<RemoteRef>, RemoteError> {
        let url = normalize_git_url(url);
        let mut args = vec!["ls-remote", url.as_str()];
        args.extend(patterns.iter().map(String::as_str));
        let out = run_git_ok(&self.binary, None, &args)?;
        parse_ls_remote(&String::from_utf8_lossy(&out))
    }

    fn read_blob(
        &self,
        url: &str,
        commit: &str,
        path: &str,
    ) -> Result<Option<Vec<u8>>, RemoteError> {
        self.repo(url).read_blob(commit, path)
    }

    fn list_files(
        &self,
        url: &str,
        commit: &str,
        dir: &str,
        globs: &[String],
    ) -> Result<Vec<String>, RemoteError> {
        self.repo(url).list_files(commit, dir, globs)
    }

    fn read_commit(
        &self,
        url: &str,
        commit: &str,
        grep: Option<&str>,
    ) -> Result<CommitInfo, RemoteError> {
        self.repo(url).read_commit(commit, grep)
    }
}
