use crate::CoreError;
use pinset_remote::RemoteConfig;
use pinset_schema::{GlobalVariables, Platform};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// How dependency manifests are turned into records.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ParserConfig {
    /// Built-in `DEPS.toml` dialect.
    #[default]
    Toml,
    /// External program speaking JSON on stdin/stdout.
    Command(Vec<String>),
}

/// Options for one resolution run. Loaded from TOML; CLI flags override fields.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ResolverConfig {
    pub root_url: String,
    pub revision: String,
    pub root_path: String,
    pub deps_file: String,
    pub cache_dir: PathBuf,
    pub fail_fast: bool,
    pub host_os: String,
    pub host_cpu: String,
    pub target_os: String,
    pub target_cpu: String,
    pub vars: BTreeMap<String, String>,
    pub bool_vars: BTreeMap<String, bool>,
    pub parser: ParserConfig,
    pub virtualenv_specs: Vec<String>,
    #[serde(flatten)]
    pub remote: RemoteConfig,
}

impl Default for ResolverConfig {
    fn default() -> Self {
        let os = host_os();
        let cpu = host_cpu();
        Self {
            root_url: String::new(),
            revision: "HEAD".to_owned(),
            root_path: "src".to_owned(),
            deps_file: "DEPS".to_owned(),
            cache_dir: default_cache_dir(),
            fail_fast: false,
            host_os: os.to_owned(),
            host_cpu: cpu.to_owned(),
            target_os: os.to_owned(),
            target_cpu: cpu.to_owned(),
            vars: BTreeMap::new(),
            bool_vars: BTreeMap::new(),
            parser: ParserConfig::Toml,
            virtualenv_specs: Vec::new(),
            remote: RemoteConfig::default(),
        }
    }
}

/// Build-system name of the running OS.
pub fn host_os() -> &'static str {
    match std::env::consts::OS {
        "macos" => "mac",
        "windows" => "win",
        other => other,
    }
}

/// Build-system name of the running CPU.
pub fn host_cpu() -> &'static str {
    match std::env::consts::ARCH {
        "x86_64" => "x64",
        "x86" => "x86",
        "aarch64" => "arm64",
        "arm" => "arm",
        other => other,
    }
}

fn default_cache_dir() -> PathBuf {
    match std::env::var_os("XDG_CACHE_HOME") {
        Some(dir) if !dir.is_empty() => PathBuf::from(dir).join("pinset"),
        _ => match std::env::var_os("HOME") {
            Some(home) => PathBuf::from(home).join(".cache/pinset"),
            None => PathBuf::from(".pinset-cache"),
        },
    }
}

impl ResolverConfig {
    pub fn load(path: &Path) -> Result<Self, CoreError> {
        let content = std::fs::read_to_string(path)?;
        toml::from_str(&content)
            .map_err(|e| CoreError::Config(format!("{}: {e}", path.display())))
    }

    pub fn validate(&self) -> Result<(), CoreError> {
        if self.root_url.is_empty() {
            return Err(CoreError::Config("root_url is required".to_owned()));
        }
        if self.revision.is_empty() {
            return Err(CoreError::Config("revision must not be empty".to_owned()));
        }
        if self.deps_file.is_empty() || self.deps_file.contains('/') {
            return Err(CoreError::Config(format!(
                "deps_file must be a plain file name, got '{}'",
                self.deps_file
            )));
        }
        if let ParserConfig::Command(argv) = &self.parser {
            if argv.is_empty() {
                return Err(CoreError::Config("parser command is empty".to_owned()));
            }
        }
        Ok(())
    }

    pub fn global_variables(&self) -> GlobalVariables {
        GlobalVariables {
            host_os: self.host_os.clone(),
            host_cpu: self.host_cpu.clone(),
            target_os: self.target_os.clone(),
            target_cpu: self.target_cpu.clone(),
            strings: self.vars.clone(),
            bools: self.bool_vars.clone(),
        }
    }

    /// Package-registry platform of the host.
    pub fn platform(&self) -> Platform {
        Platform::from_build(&self.host_os, &self.host_cpu)
    }
}
