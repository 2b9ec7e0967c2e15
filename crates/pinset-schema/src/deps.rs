//! Structured records produced by parsing one dependency manifest.

use crate::manifest::VarValue;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum DepsError {
    #[error("failed to parse dependency manifest: {0}")]
    Toml(#[from] toml::de::Error),
    #[error("failed to decode dependency records: {0}")]
    Json(#[from] serde_json::Error),
    #[error("undefined variable '{0}'")]
    UndefinedVar(String),
    #[error("unterminated variable reference in '{0}'")]
    UnterminatedVar(String),
    #[error("invalid condition '{condition}': {reason}")]
    InvalidCondition { condition: String, reason: String },
    #[error("invalid dependency entry '{path}': {reason}")]
    InvalidEntry { path: String, reason: String },
    #[error("parser command failed: {0}")]
    Command(String),
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct GitDep {
    pub url: String,
    /// Branch, tag, full ref or commit. Empty means the remote's `HEAD`.
    #[serde(default)]
    pub revision: String,
}

impl GitDep {
    pub fn requested_ref(&self) -> &str {
        if self.revision.is_empty() {
            "HEAD"
        } else {
            &self.revision
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PackageDef {
    pub name: String,
    pub version: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct GcsDepObject {
    pub object_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sha256sum: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size_bytes: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub generation: Option<i64>,
    /// File name to write the object as; archives are extracted instead.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_file: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct GcsDep {
    pub bucket: String,
    pub objects: Vec<GcsDepObject>,
}

/// A sub-manifest to recurse into, optionally with a non-default file name.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(untagged)]
pub enum RecurseDep {
    Path(String),
    WithFile { path: String, deps_file: String },
}

impl RecurseDep {
    pub fn path(&self) -> &str {
        match self {
            RecurseDep::Path(p) | RecurseDep::WithFile { path: p, .. } => p,
        }
    }

    pub fn deps_file(&self) -> Option<&str> {
        match self {
            RecurseDep::Path(_) => None,
            RecurseDep::WithFile { deps_file, .. } => Some(deps_file),
        }
    }
}

/// A non-declarative build step declared by a dependency manifest.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Hook {
    #[serde(default)]
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pattern: Option<String>,
    pub action: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<String>,
}

impl Hook {
    /// Name for log lines: the declared name, or the action when unnamed.
    pub fn display_name(&self) -> String {
        if self.name.is_empty() {
            self.action.join(" ")
        } else {
            self.name.clone()
        }
    }
}

/// Build arguments the root manifest asks to have written to a file.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct GnArgs {
    pub file: String,
    #[serde(default)]
    pub values: BTreeMap<String, VarValue>,
}

impl GnArgs {
    /// The generated file: a provenance header, then the sorted assignments.
    pub fn render(&self, deps_path: &str) -> String {
        format!("# Generated from '{deps_path}'\n{self}")
    }
}

/// `key = value` lines sorted by key.
impl fmt::Display for GnArgs {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (key, value) in &self.values {
            match value {
                VarValue::Bool(b) => writeln!(f, "{key} = {b}")?,
                VarValue::Str(s) => writeln!(f, "{key} = \"{}\"", s.replace('"', "\\\""))?,
            }
        }
        Ok(())
    }
}

/// Everything one dependency manifest declares.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct DepsFile {
    #[serde(default)]
    pub use_relative_paths: bool,
    #[serde(default)]
    pub git_deps: BTreeMap<String, GitDep>,
    #[serde(default)]
    pub package_deps: BTreeMap<String, Vec<PackageDef>>,
    #[serde(default)]
    pub gcs_deps: BTreeMap<String, GcsDep>,
    #[serde(default)]
    pub recursedeps: Vec<RecurseDep>,
    #[serde(default)]
    pub hooks: Vec<Hook>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gn_args: Option<GnArgs>,
}

impl DepsFile {
    pub fn from_json(input: &str) -> Result<Self, DepsError> {
        Ok(serde_json::from_str(input)?)
    }
}
