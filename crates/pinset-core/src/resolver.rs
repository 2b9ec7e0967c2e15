use crate::concurrency::{CancelToken, TaskGroup};
use crate::config::ResolverConfig;
use crate::handlers::{CipdEnsureHandler, GcsDownloadHandler, LastChangeHandler, SysrootHandler};
use crate::hooks::HookChain;
use crate::issues::IssueTracker;
use crate::oracle::{Backends, Oracle};
use crate::parser::{deps_parser, DepsParser, VenvSpecParser};
use crate::walker::Walker;
use crate::{CoreError, ResultExt};
use pinset_remote::{CipdCli, GitMirrors, HttpBlobStore};
use pinset_schema::{Manifest, SystemDeps};
use pinset_store::{BlobHashCache, CacheLayout};
use std::sync::Arc;
use std::time::Instant;
use tracing::info;

/// Target platforms whose system dependencies a Linux host can describe.
const LINUX_FAMILY_TARGETS: &[&str] = &["linux", "android", "chromeos"];

/// Result of a completed run.
#[derive(Debug)]
pub struct ResolveOutcome {
    pub manifest: Manifest,
    pub gaps: Vec<String>,
    pub notices: Vec<String>,
}

impl ResolveOutcome {
    pub fn gap_count(&self) -> usize {
        self.gaps.len()
    }
}

/// The default handler chain.
pub fn default_hooks() -> HookChain {
    HookChain::new()
        .with(GcsDownloadHandler)
        .with(CipdEnsureHandler)
        .with(LastChangeHandler)
        .with(SysrootHandler)
}

/// One resolution run: pin the root checkout, walk its manifest graph,
/// resolve virtualenv specs, record system dependencies.
pub struct Resolver {
    config: ResolverConfig,
    oracle: Oracle,
    parser: Box<dyn DepsParser>,
    hooks: HookChain,
}

impl Resolver {
    pub fn new(config: ResolverConfig, backends: Backends) -> Result<Self, CoreError> {
        config.validate()?;
        let layout = CacheLayout::new(&config.cache_dir);
        layout.initialize()?;
        let issues = Arc::new(IssueTracker::new(config.fail_fast));
        let oracle = Oracle::new(
            backends,
            BlobHashCache::new(layout),
            config.global_variables(),
            issues,
        );
        Ok(Self {
            parser: deps_parser(&config.parser),
            hooks: default_hooks(),
            oracle,
            config,
        })
    }

    /// Resolver over the real backends: git mirrors and deployed packages
    /// under the cache directory, HTTP cloud storage.
    pub fn from_config(config: ResolverConfig) -> Result<Self, CoreError> {
        config.validate()?;
        let layout = CacheLayout::new(&config.cache_dir);
        layout.initialize()?;
        let remote = config.remote.clone().with_env_token();
        let backends = Backends {
            git: Arc::new(GitMirrors::new(layout.clone()).with_binary(&remote.git_binary)),
            blobs: Arc::new(HttpBlobStore::new(&remote)),
            packages: Arc::new(CipdCli::new(&remote, layout)),
        };
        Self::new(config, backends)
    }

    #[must_use]
    pub fn with_parser(mut self, parser: Box<dyn DepsParser>) -> Self {
        self.parser = parser;
        self
    }

    #[must_use]
    pub fn with_hooks(mut self, hooks: HookChain) -> Self {
        self.hooks = hooks;
        self
    }

    #[must_use]
    pub fn with_venv_parser(mut self, parser: Box<dyn VenvSpecParser>) -> Self {
        self.oracle = self.oracle.with_venv_parser(parser);
        self
    }

    pub fn oracle(&self) -> &Oracle {
        &self.oracle
    }

    pub fn config(&self) -> &ResolverConfig {
        &self.config
    }

    pub fn run(self, token: &CancelToken) -> Result<ResolveOutcome, CoreError> {
        let started = Instant::now();
        let cfg = &self.config;
        info!(
            "resolving {}@{} for {}-{} on {}-{}",
            cfg.root_url, cfg.revision, cfg.target_os, cfg.target_cpu, cfg.host_os, cfg.host_cpu
        );

        self.oracle
            .pin_git(token, &cfg.root_path, &cfg.root_url, &cfg.revision)
            .context("pin root checkout")?;

        {
            let walker =
                Walker::new(&self.oracle, self.parser.as_ref(), &self.hooks, &cfg.deps_file);
            walker.walk(token, &cfg.root_path)?;
            info!("walked {} dependency manifests", walker.visited());
        }

        let mut venvs = TaskGroup::new(token);
        for spec in &cfg.virtualenv_specs {
            let oracle = &self.oracle;
            venvs.spawn(move |t| oracle.pin_virtual_env(t, spec).map(|_| ()));
        }
        venvs.wait()?;

        self.record_system_deps()?;

        let outcome = ResolveOutcome {
            gaps: self.oracle.issues().gaps(),
            notices: self.oracle.issues().notices(),
            manifest: self.oracle.into_manifest(),
        };
        outcome.manifest.verify_resolved()?;
        info!(
            "resolved {} sources, {} virtualenvs, {} gaps in {:.1}s",
            outcome.manifest.sources.len(),
            outcome.manifest.virtualenvs.len(),
            outcome.gap_count(),
            started.elapsed().as_secs_f64()
        );
        Ok(outcome)
    }

    fn record_system_deps(&self) -> Result<(), CoreError> {
        let cfg = &self.config;
        if cfg.host_os != "linux" || !LINUX_FAMILY_TARGETS.contains(&cfg.target_os.as_str()) {
            return self.oracle.issues().gap(format!(
                "system dependencies for host {} targeting {}",
                cfg.host_os, cfg.target_os
            ));
        }
        self.oracle.set_system_deps(SystemDeps {
            host_os: cfg.host_os.clone(),
            host_cpu: cfg.host_cpu.clone(),
            target_os: cfg.target_os.clone(),
            target_cpu: cfg.target_cpu.clone(),
            sysroots: self.oracle.sysroots(),
        });
        Ok(())
    }
}
