use super::{spin_fail, spin_ok, spinner, Failure, EXIT_GAPS, EXIT_SUCCESS};
use clap::Args;
use console::Style;
use pinset_core::{CancelToken, CoreError, ParserConfig, Resolver, ResolverConfig};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Command-line overrides for fields of the resolver configuration.
#[derive(Debug, Default, Args)]
pub struct ConfigOverrides {
    /// Git URL of the root checkout.
    #[arg(long)]
    pub root_url: Option<String>,
    /// Revision of the root checkout: full hash, ref, or branch name.
    #[arg(long)]
    pub revision: Option<String>,
    /// Checkout-relative path the root repository is pinned at.
    #[arg(long)]
    pub root_path: Option<String>,
    /// File name of dependency manifests.
    #[arg(long)]
    pub deps_file: Option<String>,
    /// Directory holding git mirrors, blob hashes and deployed packages.
    #[arg(long)]
    pub cache_dir: Option<PathBuf>,
    /// Abort on the first unresolved gap.
    #[arg(long, default_value_t = false)]
    pub fail_fast: bool,
    #[arg(long)]
    pub host_os: Option<String>,
    #[arg(long)]
    pub host_cpu: Option<String>,
    #[arg(long)]
    pub target_os: Option<String>,
    #[arg(long)]
    pub target_cpu: Option<String>,
    /// String variable override, as NAME=VALUE (repeatable).
    #[arg(long = "var", value_name = "NAME=VALUE")]
    pub vars: Vec<String>,
    /// Boolean variable override, as NAME=true|false (repeatable).
    #[arg(long = "bool-var", value_name = "NAME=BOOL")]
    pub bool_vars: Vec<String>,
    /// Virtualenv spec to resolve after the walk (repeatable).
    #[arg(long = "venv-spec", value_name = "PATH")]
    pub venv_specs: Vec<String>,
    /// External dependency-manifest parser, as a whitespace-separated command line.
    #[arg(long)]
    pub parser_command: Option<String>,
}

fn split_assignment(arg: &str) -> Result<(&str, &str), String> {
    match arg.split_once('=') {
        Some((name, value)) if !name.is_empty() => Ok((name, value)),
        _ => Err(format!("expected NAME=VALUE, got '{arg}'")),
    }
}

impl ConfigOverrides {
    pub fn apply(self, mut config: ResolverConfig) -> Result<ResolverConfig, String> {
        let fields = [
            (self.root_url, &mut config.root_url),
            (self.revision, &mut config.revision),
            (self.root_path, &mut config.root_path),
            (self.deps_file, &mut config.deps_file),
            (self.host_os, &mut config.host_os),
            (self.host_cpu, &mut config.host_cpu),
            (self.target_os, &mut config.target_os),
            (self.target_cpu, &mut config.target_cpu),
        ];
        for (value, field) in fields {
            if let Some(value) = value {
                *field = value;
            }
        }
        if let Some(dir) = self.cache_dir {
            config.cache_dir = dir;
        }
        config.fail_fast |= self.fail_fast;
        for arg in &self.vars {
            let (name, value) = split_assignment(arg)?;
            config.vars.insert(name.to_owned(), value.to_owned());
        }
        for arg in &self.bool_vars {
            let (name, value) = split_assignment(arg)?;
            let value = match value {
                "true" | "True" => true,
                "false" | "False" => false,
                other => return Err(format!("--bool-var {name}: '{other}' is not a boolean")),
            };
            config.bool_vars.insert(name.to_owned(), value);
        }
        config.virtualenv_specs.extend(self.venv_specs);
        if let Some(command) = self.parser_command {
            config.parser =
                ParserConfig::Command(command.split_whitespace().map(str::to_owned).collect());
        }
        Ok(config)
    }
}

pub fn load_config(path: Option<&Path>, overrides: ConfigOverrides) -> Result<ResolverConfig, Failure> {
    let base = match path {
        Some(p) => {
            debug!("loading configuration from {}", p.display());
            ResolverConfig::load(p)?
        }
        None => ResolverConfig::default(),
    };
    Ok(overrides.apply(base)?)
}

pub fn run(config: ResolverConfig, output: Option<&Path>) -> Result<u8, Failure> {
    let pb = spinner(&format!("resolving {}@{}", config.root_url, config.revision));
    let token = CancelToken::new();
    let outcome = match Resolver::from_config(config).and_then(|r| r.run(&token)) {
        Ok(outcome) => outcome,
        Err(e) => {
            spin_fail(&pb, "resolution failed");
            return Err(e.into());
        }
    };
    spin_ok(
        &pb,
        &format!(
            "resolved {} sources and {} virtualenvs",
            outcome.manifest.sources.len(),
            outcome.manifest.virtualenvs.len()
        ),
    );

    match output {
        Some(path) => {
            outcome
                .manifest
                .write_to_file(path)
                .map_err(CoreError::from)?;
            info!("manifest written to {}", path.display());
        }
        None => println!("{}", outcome.manifest.to_json().map_err(CoreError::from)?),
    }

    let dim = Style::new().dim();
    for notice in &outcome.notices {
        eprintln!("{}", dim.apply_to(format!("note: {notice}")));
    }
    if outcome.gap_count() == 0 {
        return Ok(EXIT_SUCCESS);
    }
    let warn = Style::new().yellow();
    for gap in &outcome.gaps {
        eprintln!("{} {gap}", warn.apply_to("unresolved:"));
    }
    eprintln!("{} unresolved gap(s)", outcome.gap_count());
    Ok(EXIT_GAPS)
}
