//! Turning dependency-manifest and virtualenv-spec text into records.

use crate::condition;
use crate::config::ParserConfig;
use pinset_schema::{
    DepsError, DepsFile, GcsDep, GcsDepObject, GitDep, GnArgs, Hook, PackageDef, RecurseDep,
    VarValue, VenvSpec, VenvSpecError,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::io::Write;
use std::process::{Command, Stdio};
use tracing::debug;

/// Produces `DepsFile` records from dependency-manifest text.
pub trait DepsParser: Send + Sync {
    fn parse(&self, text: &str, vars: &BTreeMap<String, VarValue>) -> Result<DepsFile, DepsError>;
}

pub trait VenvSpecParser: Send + Sync {
    fn parse(&self, text: &str) -> Result<VenvSpec, VenvSpecError>;
}

pub fn deps_parser(config: &ParserConfig) -> Box<dyn DepsParser> {
    match config {
        ParserConfig::Toml => Box::new(TomlDepsParser),
        ParserConfig::Command(argv) => Box::new(CommandDepsParser::new(argv.clone())),
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct TomlVenvSpecParser;

impl VenvSpecParser for TomlVenvSpecParser {
    fn parse(&self, text: &str) -> Result<VenvSpec, VenvSpecError> {
        VenvSpec::from_toml(text)
    }
}

// --- TOML dialect ---

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawDeps {
    #[serde(default)]
    use_relative_paths: bool,
    #[serde(default)]
    vars: BTreeMap<String, toml::Value>,
    #[serde(default)]
    deps: BTreeMap<String, RawDep>,
    #[serde(default)]
    recursedeps: Vec<RecurseDep>,
    #[serde(default)]
    hooks: Vec<Hook>,
    #[serde(default)]
    gclient_gn_args_file: Option<String>,
    #[serde(default)]
    gclient_gn_args: Vec<String>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum RawDep {
    Url(String),
    Table(RawDepTable),
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawDepTable {
    #[serde(default)]
    dep_type: Option<String>,
    #[serde(default)]
    url: Option<String>,
    #[serde(default)]
    revision: Option<String>,
    #[serde(default)]
    packages: Vec<RawPackage>,
    #[serde(default)]
    bucket: Option<String>,
    #[serde(default)]
    objects: Vec<GcsDepObject>,
    #[serde(default)]
    condition: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawPackage {
    package: String,
    version: String,
}

/// Built-in `DEPS.toml` dialect.
///
/// Top-level keys: `use_relative_paths`, `[vars]`, `[deps]`, `recursedeps`,
/// `[[hooks]]`, `gclient_gn_args_file` and `gclient_gn_args`. A dep is either
/// a `"url@revision"` string or a table whose `dep_type` is `git` (default),
/// `cipd` or `gcs`. Strings may reference variables as `{name}`; `{{` and
/// `}}` are literal braces and `${...}` package templates pass through.
/// Entries and hooks whose `condition` evaluates false are dropped.
#[derive(Debug, Clone, Copy, Default)]
pub struct TomlDepsParser;

impl DepsParser for TomlDepsParser {
    fn parse(&self, text: &str, vars: &BTreeMap<String, VarValue>) -> Result<DepsFile, DepsError> {
        let raw: RawDeps = toml::from_str(text)?;

        let mut scope: BTreeMap<String, VarValue> = raw
            .vars
            .into_iter()
            .map(|(k, v)| (k, toml_var(v)))
            .collect();
        scope.extend(vars.iter().map(|(k, v)| (k.clone(), v.clone())));

        let mut out = DepsFile {
            use_relative_paths: raw.use_relative_paths,
            recursedeps: raw.recursedeps,
            ..DepsFile::default()
        };

        for (path, dep) in raw.deps {
            let table = match dep {
                RawDep::Url(url) => {
                    out.git_deps.insert(path, split_url(&substitute(&url, &scope)?));
                    continue;
                }
                RawDep::Table(table) => table,
            };
            if let Some(cond) = &table.condition {
                if !condition::evaluate(cond, &scope)? {
                    debug!("dropping {path}: condition '{cond}' is false");
                    continue;
                }
            }
            let invalid = |reason: &str| DepsError::InvalidEntry {
                path: path.clone(),
                reason: reason.to_owned(),
            };
            match table.dep_type.as_deref().unwrap_or("git") {
                "git" => {
                    let url = table.url.as_deref().ok_or_else(|| invalid("missing url"))?;
                    let mut dep = split_url(&substitute(url, &scope)?);
                    if let Some(rev) = &table.revision {
                        dep.revision = substitute(rev, &scope)?;
                    }
                    out.git_deps.insert(path, dep);
                }
                "cipd" => {
                    if table.packages.is_empty() {
                        return Err(invalid("cipd entry lists no packages"));
                    }
                    let packages = table
                        .packages
                        .iter()
                        .map(|p| {
                            Ok(PackageDef {
                                name: substitute(&p.package, &scope)?,
                                version: substitute(&p.version, &scope)?,
                            })
                        })
                        .collect::<Result<Vec<_>, DepsError>>()?;
                    out.package_deps.insert(path, packages);
                }
                "gcs" => {
                    let bucket = table.bucket.as_deref().ok_or_else(|| invalid("missing bucket"))?;
                    if table.objects.is_empty() {
                        return Err(invalid("gcs entry lists no objects"));
                    }
                    out.gcs_deps.insert(
                        path,
                        GcsDep {
                            bucket: substitute(bucket, &scope)?,
                            objects: table.objects,
                        },
                    );
                }
                other => return Err(invalid(&format!("unknown dep_type '{other}'"))),
            }
        }

        for hook in raw.hooks {
            if let Some(cond) = &hook.condition {
                if !condition::evaluate(cond, &scope)? {
                    debug!("dropping hook {}: condition is false", hook.display_name());
                    continue;
                }
            }
            out.hooks.push(hook);
        }

        if let Some(file) = raw.gclient_gn_args_file {
            let mut values = BTreeMap::new();
            for name in raw.gclient_gn_args {
                let value = scope
                    .get(&name)
                    .cloned()
                    .ok_or_else(|| DepsError::UndefinedVar(name.clone()))?;
                values.insert(name, value);
            }
            out.gn_args = Some(GnArgs { file, values });
        }
        Ok(out)
    }
}

fn toml_var(value: toml::Value) -> VarValue {
    match value {
        toml::Value::Boolean(b) => VarValue::Bool(b),
        toml::Value::String(s) => VarValue::Str(s),
        other => VarValue::Str(other.to_string()),
    }
}

/// Split `url@revision`; the revision is empty when absent.
fn split_url(spec: &str) -> GitDep {
    // An '@' inside the authority is userinfo, not a revision separator.
    let authority = spec.find("://").map_or(0, |i| i + 3);
    let path_start = spec[authority..]
        .find('/')
        .map_or(spec.len(), |j| authority + j);
    let (url, revision) = match spec[path_start..].rfind('@') {
        Some(k) => (&spec[..path_start + k], &spec[path_start + k + 1..]),
        None => (spec, ""),
    };
    GitDep {
        url: url.to_owned(),
        revision: revision.to_owned(),
    }
}

/// Expand `{name}` references against `vars`.
fn substitute(input: &str, vars: &BTreeMap<String, VarValue>) -> Result<String, DepsError> {
    let mut out = String::with_capacity(input.len());
    let mut rest = input;
    while let Some(i) = rest.find(['{', '}', '$']) {
        out.push_str(&rest[..i]);
        let tail = &rest[i..];
        if let Some(after) = tail.strip_prefix("${") {
            let end = after.find('}').map_or(after.len(), |e| e + 1);
            out.push_str("${");
            out.push_str(&after[..end]);
            rest = &after[end..];
        } else if let Some(after) = tail.strip_prefix("{{") {
            out.push('{');
            rest = after;
        } else if let Some(after) = tail.strip_prefix("}}") {
            out.push('}');
            rest = after;
        } else if let Some(after) = tail.strip_prefix('{') {
            let end = after
                .find('}')
                .ok_or_else(|| DepsError::UnterminatedVar(input.to_owned()))?;
            let name = &after[..end];
            let value = vars
                .get(name)
                .ok_or_else(|| DepsError::UndefinedVar(name.to_owned()))?;
            out.push_str(&value.to_string());
            rest = &after[end + 1..];
        } else {
            out.push_str(&tail[..1]);
            rest = &tail[1..];
        }
    }
    out.push_str(rest);
    Ok(out)
}

// --- external command ---

#[derive(Serialize)]
struct ParseRequest<'a> {
    text: &'a str,
    vars: &'a BTreeMap<String, VarValue>,
}

/// Delegates parsing to an external program.
///
/// The program receives `{"text": ..., "vars": {...}}` on stdin and must
/// print a JSON `DepsFile` on stdout.
#[derive(Debug, Clone)]
pub struct CommandDepsParser {
    argv: Vec<String>,
}

impl CommandDepsParser {
    pub fn new(argv: Vec<String>) -> Self {
        Self { argv }
    }
}

impl DepsParser for CommandDepsParser {
    fn parse(&self, text: &str, vars: &BTreeMap<String, VarValue>) -> Result<DepsFile, DepsError> {
        let (program, args) = self
            .argv
            .split_first()
            .ok_or_else(|| DepsError::Command("empty parser command".to_owned()))?;
        let request = serde_json::to_vec(&ParseRequest { text, vars })?;

        let mut child = Command::new(program)
            .args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| DepsError::Command(format!("{program}: {e}")))?;
        let mut stdin = child
            .stdin
            .take()
            .ok_or_else(|| DepsError::Command(format!("{program}: stdin unavailable")))?;

        let output = std::thread::scope(|s| {
            let writer = s.spawn(move || stdin.write_all(&request));
            let output = child.wait_with_output();
            let written = writer
                .join()
                .unwrap_or_else(|_| Err(std::io::Error::other("stdin writer panicked")));
            (written, output)
        });
        let output = match output {
            (_, Err(e)) => return Err(DepsError::Command(format!("{program}: {e}"))),
            (Err(e), Ok(out)) if out.status.success() => {
                return Err(DepsError::Command(format!("{program}: writing request: {e}")))
            }
            (_, Ok(out)) => out,
        };
        if !output.status.success() {
            return Err(DepsError::Command(format!(
                "{program} exited with {}: {}",
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        DepsFile::from_json(&String::from_utf8_lossy(&output.stdout))
    }
}
