use crate::concurrency::{CancelToken, TaskGroup};
use crate::hooks::{HookChain, HookContext};
use crate::oracle::Oracle;
use crate::parser::DepsParser;
use crate::{paths, CoreError, ResultExt};
use pinset_schema::{ArchiveFormat, BlobHash, BlobObject, GcsDepObject};
use std::collections::HashSet;
use std::sync::{Mutex, PoisonError};
use tracing::{debug, info};

/// Recursive walk over the dependency-manifest graph.
///
/// Per manifest: parse, pin every declared dependency concurrently and wait,
/// then recurse into sub-manifests and dispatch hooks concurrently. Only
/// recursedeps naming a git dependency of the same manifest are followed.
pub struct Walker<'a> {
    oracle: &'a Oracle,
    parser: &'a dyn DepsParser,
    hooks: &'a HookChain,
    deps_file: String,
    visited: Mutex<HashSet<(String, String)>>,
}

impl<'a> Walker<'a> {
    pub fn new(
        oracle: &'a Oracle,
        parser: &'a dyn DepsParser,
        hooks: &'a HookChain,
        deps_file: impl Into<String>,
    ) -> Self {
        Self {
            oracle,
            parser,
            hooks,
            deps_file: deps_file.into(),
            visited: Mutex::new(HashSet::new()),
        }
    }

    /// Walk the graph rooted at the manifest in `root_dir`.
    pub fn walk(&self, token: &CancelToken, root_dir: &str) -> Result<(), CoreError> {
        self.process(token, root_dir, &self.deps_file, true)
    }

    /// Number of manifests processed so far.
    pub fn visited(&self) -> usize {
        self.visited
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    fn process(
        &self,
        token: &CancelToken,
        dir: &str,
        deps_file: &str,
        is_root: bool,
    ) -> Result<(), CoreError> {
        let dir = paths::clean(dir);
        let deps_path = paths::join(&dir, deps_file);
        let fresh = self
            .visited
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert((dir.clone(), deps_file.to_owned()));
        if !fresh {
            debug!("{deps_path} already walked");
            return Ok(());
        }
        token.check()?;

        let text = self.oracle.read_full_string(token, &deps_path)?;
        let vars = self.oracle.variables().as_vars();
        let deps = self
            .parser
            .parse(&text, &vars)
            .with_context(|| format!("parse {deps_path}"))?;
        info!(
            "{deps_path}: {} git, {} package, {} storage deps, {} hooks",
            deps.git_deps.len(),
            deps.package_deps.len(),
            deps.gcs_deps.len(),
            deps.hooks.len()
        );
        let base = if deps.use_relative_paths {
            dir.clone()
        } else {
            String::new()
        };

        let mut pins = TaskGroup::new(token);
        for (path, dep) in &deps.git_deps {
            let path = paths::join(&base, path);
            pins.spawn(move |t| {
                self.oracle
                    .pin_git(t, &path, &dep.url, dep.requested_ref())
                    .map(|_| ())
            });
        }
        for (path, packages) in &deps.package_deps {
            for def in packages {
                let path = paths::join(&base, path);
                pins.spawn(move |t| self.oracle.pin_package(t, &path, def, None).map(|_| ()));
            }
        }
        for (path, gcs) in &deps.gcs_deps {
            let dir = paths::join(&base, path);
            let several = gcs.objects.len() > 1;
            for object in &gcs.objects {
                let dir = dir.clone();
                let bucket = gcs.bucket.as_str();
                pins.spawn(move |t| self.pin_storage_object(t, &dir, bucket, object, several));
            }
        }
        pins.wait()
            .with_context(|| format!("pin dependencies of {deps_path}"))?;

        let mut rest = TaskGroup::new(token);
        for sub in &deps.recursedeps {
            if !deps.git_deps.contains_key(sub.path()) {
                debug!("{deps_path}: not recursing into {}, not a git dependency", sub.path());
                continue;
            }
            let sub_dir = paths::join(&base, sub.path());
            let sub_file = sub.deps_file().unwrap_or(&self.deps_file).to_owned();
            rest.spawn(move |t| self.process(t, &sub_dir, &sub_file, false));
        }
        for hook in &deps.hooks {
            let cwd = base.as_str();
            let deps_path = deps_path.as_str();
            rest.spawn(move |t| {
                let ctx = HookContext {
                    oracle: self.oracle,
                    token: t,
                    cwd,
                    deps_path,
                };
                self.hooks.dispatch(&ctx, hook)
            });
        }
        if is_root {
            if let Some(gn_args) = &deps.gn_args {
                self.oracle.pin_raw_file(
                    &paths::join(&base, &gn_args.file),
                    gn_args.render(&deps_path),
                    format!("generated from {deps_path}"),
                );
            }
        }
        rest.wait().with_context(|| format!("walk {deps_path}"))
    }

    /// Archives unpack into `dir` (or a per-object subdirectory when the
    /// entry lists several); plain objects land at `dir/<output_file>`.
    fn pin_storage_object(
        &self,
        token: &CancelToken,
        dir: &str,
        bucket: &str,
        object: &GcsDepObject,
        several: bool,
    ) -> Result<(), CoreError> {
        let name = paths::file_name(&object.object_name);
        let request = BlobObject {
            bucket: bucket.to_owned(),
            object: object.object_name.clone(),
            hash: BlobHash {
                size: object.size_bytes,
                sha1: None,
                sha256: object.sha256sum.clone(),
            },
            generation: object.generation,
        };
        match ArchiveFormat::from_object_name(&object.object_name) {
            Some(format) => {
                let target = if several {
                    paths::join(dir, name)
                } else {
                    dir.to_owned()
                };
                self.oracle
                    .pin_archive(token, &target, request, format, None)
                    .map(|_| ())
            }
            None => {
                let target = paths::join(dir, object.output_file.as_deref().unwrap_or(name));
                self.oracle.pin_blob(token, &target, request).map(|_| ())
            }
        }
    }
}
