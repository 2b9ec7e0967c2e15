use crate::types::SpecHash;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use thiserror::Error;

/// Provenance for a version that was already immutable when requested.
pub const PROVENANCE_PIN: &str = "pin";
/// Provenance for a git ref resolved by querying the remote.
pub const PROVENANCE_GIT_REMOTE: &str = "git remote";

#[derive(Debug, Error)]
pub enum ManifestError {
    #[error("failed to read manifest file: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse manifest: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("unresolved version for '{0}' in finished manifest")]
    Unresolved(String),
}

/// A requested version and the immutable identifier it resolved to.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct VersionPair {
    pub requested: String,
    pub resolved: String,
    pub provenance: String,
}

impl VersionPair {
    /// A request that was already immutable: resolved to itself, provenance `pin`.
    pub fn pinned(value: impl Into<String>) -> Self {
        let value = value.into();
        Self {
            requested: value.clone(),
            resolved: value,
            provenance: PROVENANCE_PIN.to_owned(),
        }
    }

    pub fn resolved(
        requested: impl Into<String>,
        resolved: impl Into<String>,
        provenance: impl Into<String>,
    ) -> Self {
        Self {
            requested: requested.into(),
            resolved: resolved.into(),
            provenance: provenance.into(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct GitSource {
    pub url: String,
    pub version: VersionPair,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PinnedPackage {
    pub name: String,
    pub version: VersionPair,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct PackageSource {
    pub packages: Vec<PinnedPackage>,
}

impl PackageSource {
    /// Insert a package, replacing any earlier pin of the same name.
    pub fn upsert(&mut self, package: PinnedPackage) {
        match self.packages.iter_mut().find(|p| p.name == package.name) {
            Some(existing) => *existing = package,
            None => self.packages.push(package),
        }
    }
}

/// Content hashes of a blob. Any component may be unknown until the object is streamed.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct BlobHash {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sha1: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sha256: Option<String>,
}

impl BlobHash {
    pub fn is_complete(&self) -> bool {
        self.size.is_some() && self.sha1.is_some() && self.sha256.is_some()
    }

    /// Check every component that `self` knows against the fully computed `actual`.
    ///
    /// Returns a description of the first mismatching component.
    pub fn check_consistent(&self, actual: &BlobHash) -> Result<(), String> {
        if let (Some(want), Some(got)) = (self.size, actual.size) {
            if want != got {
                return Err(format!("size: expected {want}, got {got}"));
            }
        }
        if let (Some(want), Some(got)) = (&self.sha1, &actual.sha1) {
            if !want.eq_ignore_ascii_case(got) {
                return Err(format!("sha1: expected {want}, got {got}"));
            }
        }
        if let (Some(want), Some(got)) = (&self.sha256, &actual.sha256) {
            if !want.eq_ignore_ascii_case(got) {
                return Err(format!("sha256: expected {want}, got {got}"));
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct BlobObject {
    pub bucket: String,
    pub object: String,
    pub hash: BlobHash,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub generation: Option<i64>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ArchiveFormat {
    Tar,
    TarGz,
    TarXz,
    Zip,
}

impl ArchiveFormat {
    /// Infer the archive format from an object name's extension.
    pub fn from_object_name(name: &str) -> Option<Self> {
        let lower = name.to_ascii_lowercase();
        if lower.ends_with(".tar.gz") || lower.ends_with(".tgz") {
            Some(Self::TarGz)
        } else if lower.ends_with(".tar.xz") || lower.ends_with(".txz") {
            Some(Self::TarXz)
        } else if lower.ends_with(".tar") {
            Some(Self::Tar)
        } else if lower.ends_with(".zip") {
            Some(Self::Zip)
        } else {
            None
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ArchiveSource {
    pub blob: BlobObject,
    pub format: ArchiveFormat,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extract_dir: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RawSource {
    pub content: String,
    pub provenance: String,
}

/// The resolved origin of one checkout path. Exactly one variant is populated.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Source {
    Git(GitSource),
    Package(PackageSource),
    Blob(BlobObject),
    Archive(ArchiveSource),
    Raw(RawSource),
}

impl Source {
    pub fn kind(&self) -> &'static str {
        match self {
            Source::Git(_) => "git",
            Source::Package(_) => "package",
            Source::Blob(_) => "blob",
            Source::Archive(_) => "archive",
            Source::Raw(_) => "raw",
        }
    }

    /// Short human-readable description of where this source comes from.
    pub fn origin(&self) -> String {
        match self {
            Source::Git(g) => format!("{}@{}", g.url, g.version.resolved),
            Source::Package(p) => p
                .packages
                .iter()
                .map(|pkg| format!("{}@{}", pkg.name, pkg.version.resolved))
                .collect::<Vec<_>>()
                .join(","),
            Source::Blob(b) => format!("gs://{}/{}", b.bucket, b.object),
            Source::Archive(a) => format!("gs://{}/{}", a.blob.bucket, a.blob.object),
            Source::Raw(r) => format!("raw ({})", r.provenance),
        }
    }

    fn unresolved_versions(&self) -> Vec<&str> {
        match self {
            Source::Git(g) if g.version.resolved.is_empty() => vec![g.url.as_str()],
            Source::Package(p) => p
                .packages
                .iter()
                .filter(|pkg| pkg.version.resolved.is_empty())
                .map(|pkg| pkg.name.as_str())
                .collect(),
            _ => Vec::new(),
        }
    }
}

/// A resolved language-runtime virtual environment, keyed by its spec hash.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct VirtualEnv {
    pub spec_path: String,
    pub spec_hash: SpecHash,
    pub python_version: String,
    pub interpreter: PinnedPackage,
    #[serde(default)]
    pub packages: Vec<PinnedPackage>,
}

/// A dependency-manifest variable value as seen by manifest parsing.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(untagged)]
pub enum VarValue {
    Bool(bool),
    Str(String),
}

impl std::fmt::Display for VarValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            VarValue::Bool(b) => write!(f, "{b}"),
            VarValue::Str(s) => f.write_str(s),
        }
    }
}

/// Free-form variables used while resolving.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct GlobalVariables {
    pub host_os: String,
    pub host_cpu: String,
    pub target_os: String,
    pub target_cpu: String,
    #[serde(default)]
    pub strings: BTreeMap<String, String>,
    #[serde(default)]
    pub bools: BTreeMap<String, bool>,
}

impl GlobalVariables {
    /// Flatten into the variable map handed to the dependency-manifest parser.
    ///
    /// Platform values are exposed as `host_os`/`host_cpu`/`target_os`/`target_cpu`
    /// and `checkout_<os>` booleans; explicit overrides win.
    pub fn as_vars(&self) -> BTreeMap<String, VarValue> {
        let mut vars = BTreeMap::new();
        vars.insert("host_os".to_owned(), VarValue::Str(self.host_os.clone()));
        vars.insert("host_cpu".to_owned(), VarValue::Str(self.host_cpu.clone()));
        vars.insert("target_os".to_owned(), VarValue::Str(self.target_os.clone()));
        vars.insert(
            "target_cpu".to_owned(),
            VarValue::Str(self.target_cpu.clone()),
        );
        for os in ["linux", "mac", "win", "android", "ios", "chromeos", "fuchsia"] {
            vars.insert(
                format!("checkout_{os}"),
                VarValue::Bool(self.target_os == os || self.host_os == os),
            );
        }
        for (k, v) in &self.strings {
            vars.insert(k.clone(), VarValue::Str(v.clone()));
        }
        for (k, v) in &self.bools {
            vars.insert(k.clone(), VarValue::Bool(*v));
        }
        vars
    }
}

/// Host system requirements derived for the checkout.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct SystemDeps {
    pub host_os: String,
    pub host_cpu: String,
    pub target_os: String,
    pub target_cpu: String,
    /// Sysroot checkout path per target architecture.
    #[serde(default)]
    pub sysroots: BTreeMap<String, String>,
}

/// The resolved, fully pinned input manifest of a checkout.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Manifest {
    pub sources: BTreeMap<String, Source>,
    #[serde(default)]
    pub virtualenvs: BTreeMap<SpecHash, VirtualEnv>,
    pub variables: GlobalVariables,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system_deps: Option<SystemDeps>,
}

impl Manifest {
    pub fn new(variables: GlobalVariables) -> Self {
        Self {
            variables,
            ..Self::default()
        }
    }

    /// Check that no version pair was left half-resolved.
    pub fn verify_resolved(&self) -> Result<(), ManifestError> {
        for (path, source) in &self.sources {
            if let Some(what) = source.unresolved_versions().first() {
                return Err(ManifestError::Unresolved(format!("{path}: {what}")));
            }
        }
        for venv in self.virtualenvs.values() {
            let unresolved = std::iter::once(&venv.interpreter)
                .chain(&venv.packages)
                .find(|pkg| pkg.version.resolved.is_empty());
            if let Some(pkg) = unresolved {
                return Err(ManifestError::Unresolved(format!(
                    "{}: {}",
                    venv.spec_path, pkg.name
                )));
            }
        }
        Ok(())
    }

    pub fn to_json(&self) -> Result<String, ManifestError> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn from_json(input: &str) -> Result<Self, ManifestError> {
        Ok(serde_json::from_str(input)?)
    }

    pub fn write_to_file(&self, path: impl AsRef<Path>) -> Result<(), ManifestError> {
        let path = path.as_ref();
        let content = self.to_json()?;
        let dir = match path.parent() {
            Some(p) if !p.as_os_str().is_empty() => p,
            _ => Path::new("."),
        };
        let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
        std::io::Write::write_all(&mut tmp, content.as_bytes())?;
        tmp.as_file().sync_all()?;
        tmp.persist(path).map_err(|e| ManifestError::Io(e.error))?;
        Ok(())
    }

    pub fn read_from_file(path: impl AsRef<Path>) -> Result<Self, ManifestError> {
        let content = fs::read_to_string(path)?;
        Self::from_json(&content)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_manifest() -> Manifest {
        let mut m = Manifest::new(GlobalVariables {
            host_os: "linux".to_owned(),
            host_cpu: "x64".to_owned(),
            target_os: "android".to_owned(),
            target_cpu: "arm64".to_owned(),
            strings: BTreeMap::from([("checkout_pgo".to_owned(), "yes".to_owned())]),
            bools: BTreeMap::from([("checkout_nacl".to_owned(), false)]),
        });
        m.sources.insert(
            "src".to_owned(),
            Source::Git(GitSource {
                url: "https://example.googlesource.com/root".to_owned(),
                version: VersionPair::resolved("refs/heads/main", "a".repeat(40), "git remote"),
            }),
        );
        m.sources.insert(
            "src/tools/pkg".to_owned(),
            Source::Package(PackageSource {
                packages: vec![PinnedPackage {
                    name: "tools/pkg/linux-amd64".to_owned(),
                    version: VersionPair::resolved("latest", "1".repeat(40), "https://registry"),
                }],
            }),
        );
        m.sources.insert(
            "src/data.bin".to_owned(),
            Source::Blob(BlobObject {
                bucket: "bucket".to_owned(),
                object: "data/obj".to_owned(),
                hash: BlobHash {
                    size: Some(12),
                    sha1: Some("b".repeat(40)),
                    sha256: Some("c".repeat(64)),
                },
                generation: Some(1_700_000_000_000_000),
            }),
        );
        m.sources.insert(
            "src/sysroot".to_owned(),
            Source::Archive(ArchiveSource {
                blob: BlobObject {
                    bucket: "sysroots".to_owned(),
                    object: "abc/sysroot.tar.xz".to_owned(),
                    hash: BlobHash::default(),
                    generation: None,
                },
                format: ArchiveFormat::TarXz,
                extract_dir: Some("debian_bullseye_amd64-sysroot".to_owned()),
            }),
        );
        m.sources.insert(
            "src/build/util/LASTCHANGE".to_owned(),
            Source::Raw(RawSource {
                content: "LASTCHANGE=abc\n".to_owned(),
                provenance: "lastchange hook".to_owned(),
            }),
        );
        m.virtualenvs.insert(
            SpecHash::new("f".repeat(64)),
            VirtualEnv {
                spec_path: "src/.vpython3".to_owned(),
                spec_hash: SpecHash::new("f".repeat(64)),
                python_version: "3.11".to_owned(),
                interpreter: PinnedPackage {
                    name: "infra/cpython3/linux-amd64".to_owned(),
                    version: VersionPair::pinned("2".repeat(40)),
                },
                packages: Vec::new(),
            },
        );
        m.system_deps = Some(SystemDeps {
            host_os: "linux".to_owned(),
            host_cpu: "x64".to_owned(),
            target_os: "android".to_owned(),
            target_cpu: "arm64".to_owned(),
            sysroots: BTreeMap::from([("amd64".to_owned(), "src/sysroot".to_owned())]),
        });
        m
    }

    #[test]
    fn json_roundtrip_is_lossless() {
        let m = sample_manifest();
        let json = m.to_json().unwrap();
        let back = Manifest::from_json(&json).unwrap();
        assert_eq!(m, back);
    }

    #[test]
    fn file_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("inputs.json");
        let m = sample_manifest();
        m.write_to_file(&path).unwrap();
        assert_eq!(Manifest::read_from_file(&path).unwrap(), m);
    }

    #[test]
    fn source_tag_is_serialized() {
        let m = sample_manifest();
        let json: serde_json::Value = serde_json::from_str(&m.to_json().unwrap()).unwrap();
        assert_eq!(json["sources"]["src"]["type"], "git");
        assert_eq!(json["sources"]["src/data.bin"]["type"], "blob");
        assert_eq!(json["sources"]["src/sysroot"]["format"], "tar_xz");
    }

    #[test]
    fn pinned_version_pair() {
        let v = VersionPair::pinned("abc");
        assert_eq!(v.requested, v.resolved);
        assert_eq!(v.provenance, PROVENANCE_PIN);
    }

    #[test]
    fn verify_resolved_rejects_empty_resolution() {
        let mut m = sample_manifest();
        assert!(m.verify_resolved().is_ok());
        m.sources.insert(
            "src/half".to_owned(),
            Source::Git(GitSource {
                url: "https://x/y".to_owned(),
                version: VersionPair::resolved("main", "", ""),
            }),
        );
        assert!(m.verify_resolved().is_err());
    }

    #[test]
    fn verify_resolved_covers_virtualenv_packages() {
        let mut m = sample_manifest();
        let venv = m.virtualenvs.values_mut().next().unwrap();
        venv.packages.push(PinnedPackage {
            name: "infra/python/wheels/six-py3".to_owned(),
            version: VersionPair::resolved("version:1.16", "", ""),
        });
        let err = m.verify_resolved().unwrap_err().to_string();
        assert!(err.contains("src/.vpython3: infra/python/wheels/six-py3"), "{err}");
    }

    #[test]
    fn verify_resolved_covers_the_interpreter() {
        let mut m = sample_manifest();
        let venv = m.virtualenvs.values_mut().next().unwrap();
        venv.interpreter.version.resolved.clear();
        let err = m.verify_resolved().unwrap_err().to_string();
        assert!(err.contains("infra/cpython3/linux-amd64"), "{err}");
    }

    #[test]
    fn blob_hash_consistency() {
        let known = BlobHash {
            size: None,
            sha1: None,
            sha256: Some("AB".to_owned()),
        };
        let actual = BlobHash {
            size: Some(3),
            sha1: Some("00".to_owned()),
            sha256: Some("ab".to_owned()),
        };
        assert!(known.check_consistent(&actual).is_ok());
        let wrong = BlobHash {
            sha256: Some("cd".to_owned()),
            ..BlobHash::default()
        };
        let err = wrong.check_consistent(&actual).unwrap_err();
        assert!(err.contains("sha256"));
    }

    #[test]
    fn package_upsert_replaces_same_name() {
        let mut p = PackageSource::default();
        p.upsert(PinnedPackage {
            name: "a".to_owned(),
            version: VersionPair::pinned("1"),
        });
        p.upsert(PinnedPackage {
            name: "b".to_owned(),
            version: VersionPair::pinned("2"),
        });
        p.upsert(PinnedPackage {
            name: "a".to_owned(),
            version: VersionPair::pinned("3"),
        });
        assert_eq!(p.packages.len(), 2);
        assert_eq!(p.packages[0].version.resolved, "3");
    }

    #[test]
    fn archive_format_inference() {
        assert_eq!(
            ArchiveFormat::from_object_name("a/b.tar.gz"),
            Some(ArchiveFormat::TarGz)
        );
        assert_eq!(
            ArchiveFormat::from_object_name("x.TGZ"),
            Some(ArchiveFormat::TarGz)
        );
        assert_eq!(
            ArchiveFormat::from_object_name("x.tar.xz"),
            Some(ArchiveFormat::TarXz)
        );
        assert_eq!(ArchiveFormat::from_object_name("x.zip"), Some(ArchiveFormat::Zip));
        assert_eq!(ArchiveFormat::from_object_name("x.bin"), None);
    }

    #[test]
    fn vars_include_platform_and_overrides() {
        let vars = sample_manifest().variables.as_vars();
        assert_eq!(vars["target_os"], VarValue::Str("android".to_owned()));
        assert_eq!(vars["checkout_android"], VarValue::Bool(true));
        assert_eq!(vars["checkout_linux"], VarValue::Bool(true));
        assert_eq!(vars["checkout_mac"], VarValue::Bool(false));
        assert_eq!(vars["checkout_nacl"], VarValue::Bool(false));
        assert_eq!(vars["checkout_pgo"], VarValue::Str("yes".to_owned()));
    }
}
