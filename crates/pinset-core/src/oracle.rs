use crate::concurrency::{CancelToken, TaskGroup};
use crate::issues::IssueTracker;
use crate::parser::{TomlVenvSpecParser, VenvSpecParser};
use crate::{paths, CoreError, ResultExt};
use pinset_remote::{hash_stream, BlobStore, CommitInfo, GitBackend, OnceMap, PackageRegistry};
use pinset_schema::venv::{
    infer_python_version, pep425_platform, python_major_minor, spec_hash, tag_matches,
    wheel_platform,
};
use pinset_schema::{
    expand_template, is_full_commit_hash, is_instance_id, is_short_commit_hash, ArchiveFormat,
    ArchiveSource, BlobObject, EnsureFile, GitSource, GlobalVariables, Manifest,
    PackageDef, PackageSource, PinnedPackage, Platform, RawSource, Source, SpecHash, SystemDeps,
    VenvSpec, VersionPair, VersionsFile, VirtualEnv, PROVENANCE_GIT_REMOTE,
};
use pinset_store::{BlobCacheRecord, BlobHashCache};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::{debug, info, warn};

/// The three backends the oracle resolves against.
#[derive(Clone)]
pub struct Backends {
    pub git: Arc<dyn GitBackend>,
    pub blobs: Arc<dyn BlobStore>,
    pub packages: Arc<dyn PackageRegistry>,
}

/// A resolved-versions lock file and the checkout path it was read from.
#[derive(Debug, Clone)]
pub struct ResolvedVersions {
    pub path: String,
    pub versions: VersionsFile,
}

/// Shared registry of resolved sources for one run.
///
/// Every pin writes one `Source` at a checkout-relative path; reads resolve
/// the nearest pinned ancestor of a path and fall through to the next one up
/// when that source does not contain the file. The manifest lock is only held
/// for single map operations, never across backend I/O.
pub struct Oracle {
    backends: Backends,
    manifest: Mutex<Manifest>,
    blob_cache: BlobHashCache,
    venv_parser: Box<dyn VenvSpecParser>,
    platform: Platform,
    issues: Arc<IssueTracker>,
    venvs: OnceMap<VirtualEnv>,
    sysroots: Mutex<BTreeMap<String, String>>,
}

impl Oracle {
    pub fn new(
        backends: Backends,
        blob_cache: BlobHashCache,
        variables: GlobalVariables,
        issues: Arc<IssueTracker>,
    ) -> Self {
        let platform = Platform::from_build(&variables.host_os, &variables.host_cpu);
        Self {
            backends,
            manifest: Mutex::new(Manifest::new(variables)),
            blob_cache,
            venv_parser: Box::new(TomlVenvSpecParser),
            platform,
            issues,
            venvs: OnceMap::new(),
            sysroots: Mutex::new(BTreeMap::new()),
        }
    }

    #[must_use]
    pub fn with_venv_parser(mut self, parser: Box<dyn VenvSpecParser>) -> Self {
        self.venv_parser = parser;
        self
    }

    pub fn issues(&self) -> &Arc<IssueTracker> {
        &self.issues
    }

    pub fn platform(&self) -> &Platform {
        &self.platform
    }

    pub fn variables(&self) -> GlobalVariables {
        self.manifest().variables.clone()
    }

    fn manifest(&self) -> MutexGuard<'_, Manifest> {
        // Every critical section is a single map operation, so a poisoned
        // guard still holds a consistent manifest.
        self.manifest.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn source_at(&self, path: &str) -> Option<Source> {
        self.manifest().sources.get(&paths::clean(path)).cloned()
    }

    pub fn snapshot(&self) -> Manifest {
        self.manifest().clone()
    }

    pub fn into_manifest(self) -> Manifest {
        self.manifest
            .into_inner()
            .unwrap_or_else(PoisonError::into_inner)
    }

    pub fn set_system_deps(&self, deps: SystemDeps) {
        self.manifest().system_deps = Some(deps);
    }

    /// Remember a sysroot installed for `arch`. The resolver folds these into
    /// the system-dependency record once the host is known to be supported.
    pub fn record_sysroot(&self, arch: &str, path: &str) {
        self.sysroots
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(arch.to_owned(), path.to_owned());
    }

    pub fn sysroots(&self) -> BTreeMap<String, String> {
        self.sysroots
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn set_source(&self, path: &str, source: Source) {
        let previous = self.manifest().sources.insert(path.to_owned(), source.clone());
        if let Some(previous) = previous {
            self.report_overwrite(path, &previous, &source);
        }
    }

    fn report_overwrite(&self, path: &str, previous: &Source, current: &Source) {
        if previous != current {
            self.issues.notice(format!(
                "{path} pinned twice: {} replaced by {}",
                previous.origin(),
                current.origin()
            ));
        }
    }

    fn upsert_package(&self, path: &str, package: PinnedPackage) {
        let replaced = {
            let mut manifest = self.manifest();
            let entry = manifest
                .sources
                .entry(path.to_owned())
                .or_insert_with(|| Source::Package(PackageSource::default()));
            match entry {
                Source::Package(existing) => {
                    existing.upsert(package);
                    None
                }
                other => {
                    let previous = other.clone();
                    let mut fresh = PackageSource::default();
                    fresh.upsert(package);
                    *other = Source::Package(fresh);
                    Some((previous, other.clone()))
                }
            }
        };
        if let Some((previous, current)) = replaced {
            self.report_overwrite(path, &previous, &current);
        }
    }

    // --- git ---

    /// Pin a git repository at `path`.
    ///
    /// A full commit hash is taken as-is. Anything else costs exactly one
    /// remote ref query and must match exactly one ref. Nothing is written on
    /// failure.
    pub fn pin_git(
        &self,
        token: &CancelToken,
        path: &str,
        url: &str,
        requested: &str,
    ) -> Result<GitSource, CoreError> {
        let path = paths::clean(path);
        let version = self
            .resolve_git_ref(token, url, requested)
            .with_context(|| format!("pin git {path}"))?;
        let source = GitSource {
            url: url.to_owned(),
            version,
        };
        debug!("pinned {path} to {url}@{}", source.version.resolved);
        self.set_source(&path, Source::Git(source.clone()));
        Ok(source)
    }

    fn resolve_git_ref(
        &self,
        token: &CancelToken,
        url: &str,
        requested: &str,
    ) -> Result<VersionPair, CoreError> {
        if is_full_commit_hash(requested) {
            return Ok(VersionPair::pinned(requested));
        }
        if is_short_commit_hash(requested) {
            return Err(CoreError::Resolution(format!(
                "abbreviated commit '{requested}' for {url}: a full 40-character hash is required"
            )));
        }

        let wanted: Vec<String> = if requested == "HEAD" || requested.starts_with("refs/") {
            vec![requested.to_owned()]
        } else if let Some(branch) = requested.strip_prefix("origin/") {
            vec![format!("refs/heads/{branch}")]
        } else {
            warn!("'{requested}' at {url} is not namespaced; scanning every remote ref (slow)");
            vec![
                format!("refs/heads/{requested}"),
                format!("refs/tags/{requested}"),
            ]
        };
        let patterns = if wanted.len() == 1 {
            wanted.clone()
        } else {
            Vec::new()
        };

        token.check()?;
        let refs = self.backends.git.ls_remote(url, &patterns)?;

        // Annotated tags list the tag object first and the commit as `^{}`.
        let mut commits: BTreeMap<&str, &str> = BTreeMap::new();
        for r in &refs {
            match r.name.strip_suffix("^{}") {
                Some(base) => {
                    commits.insert(base, r.commit.as_str());
                }
                None => {
                    commits.entry(r.name.as_str()).or_insert(r.commit.as_str());
                }
            }
        }
        let matches: Vec<(&str, &str)> = commits
            .into_iter()
            .filter(|(name, _)| wanted.iter().any(|w| w == name))
            .collect();

        match matches.as_slice() {
            [] => Err(CoreError::Resolution(format!(
                "no refs match '{requested}' at {url}"
            ))),
            [(_, commit)] => Ok(VersionPair::resolved(
                requested,
                *commit,
                PROVENANCE_GIT_REMOTE,
            )),
            many => Err(CoreError::Resolution(format!(
                "too many refs match '{requested}' at {url}: {}",
                many.iter().map(|(n, _)| *n).collect::<Vec<_>>().join(", ")
            ))),
        }
    }

    // --- packages ---

    /// Pin one package into the package source at `path`.
    ///
    /// Returns `None` when the package name's template excludes this platform.
    pub fn pin_package(
        &self,
        token: &CancelToken,
        path: &str,
        def: &PackageDef,
        lock: Option<&ResolvedVersions>,
    ) -> Result<Option<PinnedPackage>, CoreError> {
        let path = paths::clean(path);
        let pinned = self
            .resolve_package(token, def, lock, &BTreeMap::new())
            .with_context(|| format!("pin package {} at {path}", def.name))?;
        if let Some(package) = &pinned {
            self.upsert_package(&path, package.clone());
        }
        Ok(pinned)
    }

    fn resolve_package(
        &self,
        token: &CancelToken,
        def: &PackageDef,
        lock: Option<&ResolvedVersions>,
        extra: &BTreeMap<String, String>,
    ) -> Result<Option<PinnedPackage>, CoreError> {
        let Some(name) = expand_template(&def.name, &self.platform, extra)? else {
            debug!("{} does not apply to {}", def.name, self.platform.name());
            return Ok(None);
        };
        if is_instance_id(&def.version) {
            return Ok(Some(PinnedPackage {
                name,
                version: VersionPair::pinned(&def.version),
            }));
        }
        let version = match lock {
            Some(lock) => {
                let instance = lock.versions.resolve(&name, &def.version).ok_or_else(|| {
                    CoreError::Resolution(format!(
                        "{name}@{} is not listed in {}",
                        def.version, lock.path
                    ))
                })?;
                VersionPair::resolved(&def.version, instance, &lock.path)
            }
            None => {
                token.check()?;
                let instance = self.backends.packages.resolve_version(&name, &def.version)?;
                VersionPair::resolved(
                    &def.version,
                    instance,
                    self.backends.packages.service_identity(),
                )
            }
        };
        Ok(Some(PinnedPackage { name, version }))
    }

    /// Pin every package an ensure file lists, below `root`.
    pub fn pin_packages_from_ensure_file(
        &self,
        token: &CancelToken,
        root: &str,
        ensure_path: &str,
    ) -> Result<(), CoreError> {
        let ensure_path = paths::clean(ensure_path);
        let text = self.read_full_string(token, &ensure_path)?;
        let ensure = EnsureFile::parse(&text).with_context(|| format!("parse {ensure_path}"))?;
        self.check_ensure_directives(&ensure_path, &ensure);

        let lock = match &ensure.resolved_versions {
            Some(rel) => {
                let lock_path = paths::join(paths::parent(&ensure_path), rel);
                let text = self.read_full_string(token, &lock_path)?;
                let versions =
                    VersionsFile::parse(&text).with_context(|| format!("parse {lock_path}"))?;
                Some(ResolvedVersions {
                    path: lock_path,
                    versions,
                })
            }
            None => None,
        };

        let mut group = TaskGroup::new(token);
        for (subdir, packages) in &ensure.sections {
            let dir = paths::join(root, subdir);
            for def in packages {
                let dir = dir.clone();
                let lock = lock.as_ref();
                group.spawn(move |t| self.pin_package(t, &dir, def, lock).map(|_| ()));
            }
        }
        group
            .wait()
            .with_context(|| format!("ensure file {ensure_path}"))
    }

    /// Packages always resolve against the configured registry; directives
    /// that disagree with it or with the host are surfaced as notices.
    fn check_ensure_directives(&self, ensure_path: &str, ensure: &EnsureFile) {
        if let Some(declared) = &ensure.service_url {
            let registry = self.backends.packages.service_identity();
            if declared.trim_end_matches('/') != registry.trim_end_matches('/') {
                self.issues.notice(format!(
                    "{ensure_path}: declares service {declared}, resolved against {registry}"
                ));
            }
        }
        let platform = self.platform.name();
        if !ensure.verified_platforms.is_empty() && !ensure.verified_platforms.contains(&platform) {
            self.issues.notice(format!(
                "{ensure_path}: {platform} is not a verified platform ({})",
                ensure.verified_platforms.join(", ")
            ));
        }
    }

    // --- blobs ---

    /// Pin a single blob at `path`. `request.hash` and `request.generation`
    /// carry whatever is already known about the object.
    pub fn pin_blob(
        &self,
        token: &CancelToken,
        path: &str,
        request: BlobObject,
    ) -> Result<BlobObject, CoreError> {
        let path = paths::clean(path);
        let what = format!("pin blob gs://{}/{} at {path}", request.bucket, request.object);
        let blob = self.resolve_blob(token, request).context(what)?;
        self.set_source(&path, Source::Blob(blob.clone()));
        Ok(blob)
    }

    /// Pin an archive at `path`, to be unpacked into `extract_dir` beneath it.
    pub fn pin_archive(
        &self,
        token: &CancelToken,
        path: &str,
        request: BlobObject,
        format: ArchiveFormat,
        extract_dir: Option<String>,
    ) -> Result<ArchiveSource, CoreError> {
        let path = paths::clean(path);
        let what = format!(
            "pin archive gs://{}/{} at {path}",
            request.bucket, request.object
        );
        let blob = self.resolve_blob(token, request).context(what)?;
        let archive = ArchiveSource {
            blob,
            format,
            extract_dir,
        };
        self.set_source(&path, Source::Archive(archive.clone()));
        Ok(archive)
    }

    fn resolve_blob(
        &self,
        token: &CancelToken,
        request: BlobObject,
    ) -> Result<BlobObject, CoreError> {
        if request.hash.is_complete() {
            return Ok(request);
        }
        let BlobObject {
            bucket,
            object,
            hash: known,
            generation,
        } = request;
        let url = format!("gs://{bucket}/{object}");

        token.check()?;
        let (generation, live_size) = match generation {
            Some(g) => (g, None),
            None => {
                let meta = self.backends.blobs.stat(&bucket, &object)?;
                (meta.generation, Some(meta.size))
            }
        };

        if let Some(record) = self.blob_cache.get(&bucket, &object, generation) {
            let cached = record.hash();
            match known.check_consistent(&cached) {
                Ok(()) => {
                    debug!("{url}#{generation}: verified hash from cache");
                    return Ok(BlobObject {
                        bucket,
                        object,
                        hash: cached,
                        generation: Some(generation),
                    });
                }
                Err(detail) => debug!("{url}: ignoring cached hash ({detail})"),
            }
        }

        token.check()?;
        info!("hashing {url}#{generation}");
        let reader = self.backends.blobs.open(&bucket, &object, generation)?;
        let actual = hash_stream(reader)?;
        if let (Some(expected), Some(got)) = (live_size, actual.size) {
            if expected != got {
                return Err(CoreError::Resolution(format!(
                    "{url}: read {got} bytes, store reported {expected}"
                )));
            }
        }
        known
            .check_consistent(&actual)
            .map_err(|detail| CoreError::HashMismatch {
                object: url.clone(),
                detail,
            })?;

        if let Some(record) = BlobCacheRecord::from_hash(&bucket, &object, generation, &actual) {
            if let Err(e) = self.blob_cache.put(&record) {
                warn!("could not cache hash of {url}: {e}");
            }
        }
        Ok(BlobObject {
            bucket,
            object,
            hash: actual,
            generation: Some(generation),
        })
    }

    // --- raw files ---

    pub fn pin_raw_file(&self, path: &str, content: impl Into<String>, provenance: impl Into<String>) {
        let path = paths::clean(path);
        self.set_source(
            &path,
            Source::Raw(RawSource {
                content: content.into(),
                provenance: provenance.into(),
            }),
        );
    }

    // --- virtualenvs ---

    /// Resolve the virtualenv described by the spec at `spec_path`.
    ///
    /// Resolution is keyed by the hash of the spec text: a second spec with
    /// identical content returns the first result without any lookups.
    pub fn pin_virtual_env(
        &self,
        token: &CancelToken,
        spec_path: &str,
    ) -> Result<VirtualEnv, CoreError> {
        let spec_path = paths::clean(spec_path);
        let text = self.read_full_string(token, &spec_path)?;
        let hash = spec_hash(&text);
        if let Some(Ok(env)) = self.venvs.get(hash.as_str()) {
            debug!("{spec_path}: virtualenv {} already resolved", hash.as_str());
            return Ok(env);
        }
        let spec = self
            .venv_parser
            .parse(&text)
            .with_context(|| format!("parse {spec_path}"))?;

        let mut failure = None;
        let result = self.venvs.get_or_init(hash.as_str(), || {
            self.resolve_virtual_env(token, &spec_path, &hash, &spec)
                .map_err(|e| {
                    let message = e.to_string();
                    failure = Some(e);
                    message
                })
        });
        let env = match result {
            Ok(env) => env,
            Err(message) => {
                return Err(failure.unwrap_or(CoreError::Resolution(message)))
                    .with_context(|| format!("pin virtualenv {spec_path}"))
            }
        };
        self.manifest()
            .virtualenvs
            .entry(hash)
            .or_insert_with(|| env.clone());
        Ok(env)
    }

    fn resolve_virtual_env(
        &self,
        token: &CancelToken,
        spec_path: &str,
        hash: &SpecHash,
        spec: &VenvSpec,
    ) -> Result<VirtualEnv, CoreError> {
        let version = spec
            .python_version
            .clone()
            .unwrap_or_else(|| infer_python_version(spec_path).to_owned());
        let (major, _) = python_major_minor(&version)?;
        let platform_tag = pep425_platform(&self.platform);
        let extra = BTreeMap::from([(
            "vpython_platform".to_owned(),
            wheel_platform(&self.platform, &version)?,
        )]);

        let interpreter_def = spec.interpreter.clone().unwrap_or_else(|| PackageDef {
            name: format!(
                "infra/3pp/tools/cpython{}/${{platform}}",
                if major == 2 { "" } else { "3" }
            ),
            version: format!("version:{version}"),
        });
        let interpreter = self
            .resolve_package(token, &interpreter_def, None, &extra)?
            .ok_or_else(|| {
                CoreError::Unsupported(format!(
                    "no interpreter package for {}",
                    self.platform.name()
                ))
            })?;

        let mut packages = Vec::new();
        for wheel in &spec.wheels {
            if let Some(tag) = &wheel.match_tag {
                if !tag_matches(tag, &platform_tag)? {
                    debug!("{}: skipping {} ({tag} does not match)", spec_path, wheel.name);
                    continue;
                }
            }
            match self.resolve_package(token, &wheel.package(), None, &extra) {
                Ok(Some(package)) => packages.push(package),
                Ok(None) => {}
                Err(e) if wheel.match_tag.is_some() && !e.is_cancelled() => {
                    warn!("{spec_path}: dropping optional wheel {}: {e}", wheel.name);
                }
                Err(e) => return Err(e).with_context(|| format!("wheel {}", wheel.name)),
            }
        }

        Ok(VirtualEnv {
            spec_path: spec_path.to_owned(),
            spec_hash: hash.clone(),
            python_version: version,
            interpreter,
            packages,
        })
    }

    // --- reads ---

    /// Pinned sources covering `path`, nearest first.
    fn covering_sources(&self, path: &str) -> Vec<(String, Source)> {
        let mut prefixes = Vec::new();
        let mut current = path;
        loop {
            prefixes.push(current.to_owned());
            if current.is_empty() {
                break;
            }
            current = paths::parent(current);
        }
        let manifest = self.manifest();
        prefixes
            .into_iter()
            .filter_map(|p| manifest.sources.get(&p).cloned().map(|s| (p, s)))
            .collect()
    }

    fn nearest_source(&self, path: &str) -> Result<(String, Source), CoreError> {
        self.covering_sources(path)
            .into_iter()
            .next()
            .ok_or_else(|| CoreError::NotFound(path.to_owned()))
    }

    /// Read a file through the nearest source that contains it.
    pub fn read_file(&self, token: &CancelToken, path: &str) -> Result<Vec<u8>, CoreError> {
        let path = paths::clean(path);
        for (prefix, source) in self.covering_sources(&path) {
            token.check()?;
            let rel = paths::strip_ancestor(&path, &prefix).unwrap_or_default();
            let found = self
                .read_from_source(&source, rel)
                .with_context(|| format!("read {path} from {}", source.origin()))?;
            if let Some(bytes) = found {
                return Ok(bytes);
            }
            debug!("{path}: not in {} source at '{prefix}'", source.kind());
        }
        Err(CoreError::NotFound(path))
    }

    pub fn read_full_string(&self, token: &CancelToken, path: &str) -> Result<String, CoreError> {
        let bytes = self.read_file(token, path)?;
        String::from_utf8(bytes)
            .map_err(|e| CoreError::Resolution(format!("{path} is not valid UTF-8: {e}")))
    }

    fn read_from_source(&self, source: &Source, rel: &str) -> Result<Option<Vec<u8>>, CoreError> {
        match source {
            Source::Raw(raw) => Ok(rel.is_empty().then(|| raw.content.clone().into_bytes())),
            _ if rel.is_empty() => Ok(None),
            Source::Git(git) => Ok(self
                .backends
                .git
                .read_blob(&git.url, &git.version.resolved, rel)?),
            Source::Package(pkgs) => {
                for package in &pkgs.packages {
                    let found = self.backends.packages.read_file(
                        &package.name,
                        &package.version.resolved,
                        rel,
                    )?;
                    if found.is_some() {
                        return Ok(found);
                    }
                }
                Ok(None)
            }
            Source::Blob(_) | Source::Archive(_) => Ok(None),
        }
    }

    /// List files below `path` matching `globs`, as checkout-relative paths.
    pub fn walk_directory(
        &self,
        token: &CancelToken,
        path: &str,
        globs: &[String],
    ) -> Result<Vec<String>, CoreError> {
        let path = paths::clean(path);
        let (prefix, source) = self.nearest_source(&path)?;
        let Source::Git(git) = &source else {
            return Err(CoreError::Unsupported(format!(
                "walking {path}: {} sources cannot be listed",
                source.kind()
            )));
        };
        token.check()?;
        let rel = paths::strip_ancestor(&path, &prefix).unwrap_or_default();
        let files = self
            .backends
            .git
            .list_files(&git.url, &git.version.resolved, rel, globs)
            .with_context(|| format!("walk {path}"))?;
        Ok(files.iter().map(|f| paths::join(&prefix, f)).collect())
    }

    /// Metadata of the commit pinned for `path`, or of its newest ancestor
    /// whose message matches `grep`.
    /// Revision requested for the git checkout covering `path`.
    pub fn requested_revision(&self, path: &str) -> Option<String> {
        match self.nearest_source(&paths::clean(path)) {
            Ok((_, Source::Git(git))) => Some(git.version.requested),
            _ => None,
        }
    }

    pub fn get_commit_metadata(
        &self,
        token: &CancelToken,
        path: &str,
        grep: Option<&str>,
    ) -> Result<CommitInfo, CoreError> {
        let path = paths::clean(path);
        let (_, source) = self.nearest_source(&path)?;
        let Source::Git(git) = &source else {
            return Err(CoreError::Unsupported(format!(
                "commit metadata for {path}: {} sources have no history",
                source.kind()
            )));
        };
        token.check()?;
        self.backends
            .git
            .read_commit(&git.url, &git.version.resolved, grep)
            .with_context(|| format!("commit metadata for {path}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pinset_remote::mock::{MockBlobStore, MockGit, MockRegistry};
    use pinset_schema::BlobHash;
    use pinset_store::CacheLayout;

    const SHA_A: &str = "aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa";
    const SHA_B: &str = "bbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbb";
    const URL: &str = "https://git.example.com/repo";

    struct Fixture {
        _dir: tempfile::TempDir,
        git: Arc<MockGit>,
        blobs: Arc<MockBlobStore>,
        registry: Arc<MockRegistry>,
        oracle: Oracle,
    }

    fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let git = Arc::new(MockGit::new());
        let blobs = Arc::new(MockBlobStore::new());
        let registry = Arc::new(MockRegistry::new());
        let backends = Backends {
            git: git.clone(),
            blobs: blobs.clone(),
            packages: registry.clone(),
        };
        let vars = GlobalVariables {
            host_os: "linux".to_owned(),
            host_cpu: "x64".to_owned(),
            target_os: "linux".to_owned(),
            target_cpu: "x64".to_owned(),
            ..GlobalVariables::default()
        };
        let cache = BlobHashCache::new(CacheLayout::new(dir.path()));
        let oracle = Oracle::new(backends, cache, vars, Arc::new(IssueTracker::new(false)));
        Fixture {
            _dir: dir,
            git,
            blobs,
            registry,
            oracle,
        }
    }

    #[test]
    fn full_hash_needs_no_remote() {
        let f = fixture();
        let src = f.oracle.pin_git(&CancelToken::new(), "src", URL, SHA_A).unwrap();
        assert_eq!(src.version.resolved, SHA_A);
        assert_eq!(src.version.provenance, "pin");
        assert_eq!(f.git.ls_remote_calls(), 0);
    }

    #[test]
    fn short_hash_rejected() {
        let f = fixture();
        let err = f
            .oracle
            .pin_git(&CancelToken::new(), "src", URL, "aaaaaaa")
            .unwrap_err();
        assert!(err.to_string().contains("abbreviated"));
        assert!(f.oracle.source_at("src").is_none());
    }

    #[test]
    fn origin_prefix_maps_to_branch() {
        let f = fixture();
        f.git.add_ref(URL, "refs/heads/main", SHA_A);
        let src = f
            .oracle
            .pin_git(&CancelToken::new(), "src", URL, "origin/main")
            .unwrap();
        assert_eq!(src.version.resolved, SHA_A);
        assert_eq!(src.version.requested, "origin/main");
    }

    #[test]
    fn peeled_tag_wins() {
        let f = fixture();
        f.git.add_ref(URL, "refs/tags/v1", SHA_A);
        f.git.add_ref(URL, "refs/tags/v1^{}", SHA_B);
        let src = f
            .oracle
            .pin_git(&CancelToken::new(), "src", URL, "refs/tags/v1")
            .unwrap();
        assert_eq!(src.version.resolved, SHA_B);
    }

    #[test]
    fn unscoped_name_matching_branch_and_tag_is_ambiguous() {
        let f = fixture();
        f.git.add_ref(URL, "refs/heads/stable", SHA_A);
        f.git.add_ref(URL, "refs/tags/stable", SHA_B);
        let err = f
            .oracle
            .pin_git(&CancelToken::new(), "src", URL, "stable")
            .unwrap_err();
        assert!(err.to_string().contains("too many refs match"));
        assert!(f.oracle.source_at("src").is_none());
    }

    #[test]
    fn instance_id_version_is_a_pin() {
        let f = fixture();
        let def = PackageDef {
            name: "tools/gn/${platform}".to_owned(),
            version: SHA_A.to_owned(),
        };
        let pkg = f
            .oracle
            .pin_package(&CancelToken::new(), "src/buildtools", &def, None)
            .unwrap()
            .unwrap();
        assert_eq!(pkg.name, "tools/gn/linux-amd64");
        assert_eq!(pkg.version.provenance, "pin");
        assert_eq!(f.registry.resolve_calls(), 0);
    }

    #[test]
    fn platform_excluded_package_is_skipped() {
        let f = fixture();
        let def = PackageDef {
            name: "tools/xcode/${os=mac}".to_owned(),
            version: "latest".to_owned(),
        };
        let pinned = f
            .oracle
            .pin_package(&CancelToken::new(), "src/xcode", &def, None)
            .unwrap();
        assert!(pinned.is_none());
        assert!(f.oracle.source_at("src/xcode").is_none());
    }

    #[test]
    fn lock_file_resolution_uses_lock_path_as_provenance() {
        let f = fixture();
        let mut versions = VersionsFile::default();
        versions.insert("tools/gn/linux-amd64", "latest", SHA_B);
        let lock = ResolvedVersions {
            path: "src/cipd.versions".to_owned(),
            versions,
        };
        let def = PackageDef {
            name: "tools/gn/${platform}".to_owned(),
            version: "latest".to_owned(),
        };
        let pkg = f
            .oracle
            .pin_package(&CancelToken::new(), "src/gn", &def, Some(&lock))
            .unwrap()
            .unwrap();
        assert_eq!(pkg.version.resolved, SHA_B);
        assert_eq!(pkg.version.provenance, "src/cipd.versions");
        assert_eq!(f.registry.resolve_calls(), 0);
    }

    #[test]
    fn ensure_directives_outside_the_registry_are_noticed() {
        let f = fixture();
        f.registry.add_version("tools/gn/linux-amd64", "latest", SHA_A);
        let ensure = "$ServiceURL https://other-packages.example.com\n\
                      $VerifiedPlatform mac-amd64 windows-amd64\n\
                      tools/gn/${platform} latest\n";
        f.oracle.pin_raw_file("src/tools.ensure", ensure, "test");
        f.oracle
            .pin_packages_from_ensure_file(&CancelToken::new(), "src/tools", "src/tools.ensure")
            .unwrap();

        let Some(Source::Package(pkgs)) = f.oracle.source_at("src/tools") else {
            panic!("expected package source");
        };
        assert_eq!(pkgs.packages[0].version.resolved, SHA_A);
        let notices = f.oracle.issues().notices();
        assert_eq!(notices.len(), 2, "{notices:?}");
        assert!(notices[0].contains("https://other-packages.example.com"));
        assert!(notices[1].contains("linux-amd64 is not a verified platform"));
    }

    #[test]
    fn matching_ensure_directives_are_silent() {
        let f = fixture();
        f.registry.add_version("tools/gn/linux-amd64", "latest", SHA_A);
        let ensure = "$ServiceURL https://packages.example.com/\n\
                      $VerifiedPlatform linux-amd64\n\
                      tools/gn/${platform} latest\n";
        f.oracle.pin_raw_file("src/tools.ensure", ensure, "test");
        f.oracle
            .pin_packages_from_ensure_file(&CancelToken::new(), "src/tools", "src/tools.ensure")
            .unwrap();
        assert!(f.oracle.issues().notices().is_empty());
    }

    #[test]
    fn packages_accumulate_at_one_path() {
        let f = fixture();
        f.registry.add_version("a", "1", SHA_A);
        f.registry.add_version("b", "1", SHA_B);
        let token = CancelToken::new();
        for name in ["a", "b"] {
            let def = PackageDef {
                name: name.to_owned(),
                version: "1".to_owned(),
            };
            f.oracle.pin_package(&token, "src/tools", &def, None).unwrap();
        }
        let Some(Source::Package(pkgs)) = f.oracle.source_at("src/tools") else {
            panic!("expected package source");
        };
        assert_eq!(pkgs.packages.len(), 2);
        assert_eq!(pkgs.packages[0].version.provenance, "https://packages.example.com");
    }

    #[test]
    fn complete_hash_skips_store() {
        let f = fixture();
        let request = BlobObject {
            bucket: "b".to_owned(),
            object: "o".to_owned(),
            hash: BlobHash {
                size: Some(1),
                sha1: Some("x".to_owned()),
                sha256: Some("y".to_owned()),
            },
            generation: None,
        };
        f.oracle
            .pin_blob(&CancelToken::new(), "src/o", request.clone())
            .unwrap();
        assert_eq!(f.blobs.stat_calls(), 0);
        assert_eq!(f.oracle.source_at("src/o"), Some(Source::Blob(request)));
    }

    #[test]
    fn repin_with_different_source_emits_notice() {
        let f = fixture();
        let token = CancelToken::new();
        f.oracle.pin_git(&token, "src/x", URL, SHA_A).unwrap();
        f.oracle.pin_git(&token, "src/x", URL, SHA_A).unwrap();
        assert!(f.oracle.issues().notices().is_empty());
        f.oracle.pin_git(&token, "src/x", URL, SHA_B).unwrap();
        let notices = f.oracle.issues().notices();
        assert_eq!(notices.len(), 1);
        assert!(notices[0].contains(SHA_A) && notices[0].contains(SHA_B));
    }

    #[test]
    fn raw_file_is_readable() {
        let f = fixture();
        f.oracle.pin_raw_file("src/build/LASTCHANGE", "LASTCHANGE=x\n", "test");
        let text = f
            .oracle
            .read_full_string(&CancelToken::new(), "src/build/LASTCHANGE")
            .unwrap();
        assert_eq!(text, "LASTCHANGE=x\n");
    }

    #[test]
    fn read_without_any_source_is_not_found() {
        let f = fixture();
        let err = f
            .oracle
            .read_file(&CancelToken::new(), "src/nothing")
            .unwrap_err();
        assert!(err.is_not_found());
    }

    #[test]
    fn walk_joins_source_prefix() {
        let f = fixture();
        f.git
            .add_commit(URL, SHA_A, &[("build/a.json", "1"), ("build/b.txt", "2")]);
        let token = CancelToken::new();
        f.oracle.pin_git(&token, "src", URL, SHA_A).unwrap();
        let files = f
            .oracle
            .walk_directory(&token, "src/build", &["*.json".to_owned()])
            .unwrap();
        assert_eq!(files, vec!["src/build/a.json"]);
    }

    #[test]
    fn walk_over_non_git_source_is_unsupported() {
        let f = fixture();
        f.oracle.pin_raw_file("src/gen", "x", "test");
        let err = f
            .oracle
            .walk_directory(&CancelToken::new(), "src/gen", &[])
            .unwrap_err();
        assert!(matches!(err, CoreError::Unsupported(_)));
    }

    #[test]
    fn sysroots_are_collected_outside_the_manifest() {
        let f = fixture();
        f.oracle.record_sysroot("amd64", "src/build/linux/debian_bullseye_amd64-sysroot");
        assert!(f.oracle.snapshot().system_deps.is_none());
        let sysroots = f.oracle.sysroots();
        assert_eq!(sysroots.len(), 1);
        assert_eq!(sysroots["amd64"], "src/build/linux/debian_bullseye_amd64-sysroot");
    }
}
