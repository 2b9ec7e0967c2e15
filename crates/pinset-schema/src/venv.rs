use crate::deps::PackageDef;
use crate::template::Platform;
use crate::types::SpecHash;
use globset::Glob;
use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;

/// Runtime version assumed for specs named `.vpython3` (or anything not `.vpython`).
pub const DEFAULT_PYTHON3_VERSION: &str = "3.11";
/// Runtime version assumed for legacy specs named `.vpython`.
pub const DEFAULT_PYTHON2_VERSION: &str = "2.7";

#[derive(Debug, Error)]
pub enum VenvSpecError {
    #[error("failed to parse virtualenv spec: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid python version '{0}'")]
    InvalidVersion(String),
    #[error("invalid match_tag '{pattern}': {reason}")]
    InvalidTag { pattern: String, reason: String },
}

/// A package requirement that only applies when `match_tag` matches the runtime platform.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct WheelRequirement {
    pub name: String,
    pub version: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub match_tag: Option<String>,
}

impl WheelRequirement {
    pub fn package(&self) -> PackageDef {
        PackageDef {
            name: self.name.clone(),
            version: self.version.clone(),
        }
    }
}

/// Structured form of a virtualenv spec document.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct VenvSpec {
    #[serde(default)]
    pub python_version: Option<String>,
    #[serde(default)]
    pub interpreter: Option<PackageDef>,
    #[serde(default, rename = "wheel")]
    pub wheels: Vec<WheelRequirement>,
}

impl VenvSpec {
    pub fn from_toml(input: &str) -> Result<Self, VenvSpecError> {
        Ok(toml::from_str(input)?)
    }
}

/// Content key of a spec: blake3 of its raw text.
pub fn spec_hash(text: &str) -> SpecHash {
    SpecHash::new(blake3::hash(text.as_bytes()).to_hex().to_string())
}

/// Pick the runtime version for a spec that does not declare one.
pub fn infer_python_version(spec_path: &str) -> &'static str {
    let file_name = Path::new(spec_path)
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or_default();
    if file_name == ".vpython" {
        DEFAULT_PYTHON2_VERSION
    } else {
        DEFAULT_PYTHON3_VERSION
    }
}

/// Split `major.minor[.patch]` into `(major, minor)`.
pub fn python_major_minor(version: &str) -> Result<(u32, u32), VenvSpecError> {
    let mut parts = version.split('.');
    let major = parts.next().and_then(|p| p.parse().ok());
    let minor = parts.next().and_then(|p| p.parse().ok());
    match (major, minor) {
        (Some(major), Some(minor)) => Ok((major, minor)),
        _ => Err(VenvSpecError::InvalidVersion(version.to_owned())),
    }
}

/// Wheel-package platform token substituted for `${vpython_platform}` in
/// package names, e.g. `linux-amd64_cp311_cp311`.
pub fn wheel_platform(platform: &Platform, version: &str) -> Result<String, VenvSpecError> {
    let (major, minor) = python_major_minor(version)?;
    let interpreter = format!("cp{major}{minor}");
    let abi = match (major, platform.os.as_str()) {
        (2, "linux") => format!("{interpreter}mu"),
        (2, _) => format!("{interpreter}m"),
        _ => interpreter.clone(),
    };
    Ok(format!("{}_{interpreter}_{abi}", platform.name()))
}

/// PEP 425 platform tag that `match_tag` patterns are matched against,
/// e.g. `linux_x86_64`, `macosx_11_0_arm64` or `win_amd64`.
pub fn pep425_platform(platform: &Platform) -> String {
    let tag = match (platform.os.as_str(), platform.arch.as_str()) {
        ("linux", "amd64") => "linux_x86_64",
        ("linux", "arm64") => "linux_aarch64",
        ("linux", "386") => "linux_i686",
        ("mac", "amd64") => "macosx_10_10_x86_64",
        ("mac", "arm64") => "macosx_11_0_arm64",
        ("windows", "amd64") => "win_amd64",
        ("windows", "arm64") => "win_arm64",
        ("windows", "386") => "win32",
        ("mac", arch) => return format!("macosx_11_0_{arch}"),
        (os, arch) => return format!("{os}_{arch}"),
    };
    tag.to_owned()
}

/// Match a `match_tag` glob against a PEP 425 platform tag.
pub fn tag_matches(pattern: &str, tag: &str) -> Result<bool, VenvSpecError> {
    let glob = Glob::new(pattern).map_err(|e| VenvSpecError::InvalidTag {
        pattern: pattern.to_owned(),
        reason: e.kind().to_string(),
    })?;
    Ok(glob.compile_matcher().is_match(tag))
}
