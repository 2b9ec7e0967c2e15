//! Ensure files (subdirectory → package list) and their resolved-versions lock files.

use crate::deps::PackageDef;
use std::collections::BTreeMap;
use std::fmt;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum EnsureError {
    #[error("ensure file line {line}: {reason}")]
    Syntax { line: usize, reason: String },
    #[error("versions file line {line}: {reason}")]
    Versions { line: usize, reason: String },
}

/// A parsed ensure file.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EnsureFile {
    /// Companion resolved-versions file, relative to the ensure file.
    pub resolved_versions: Option<String>,
    pub verified_platforms: Vec<String>,
    pub service_url: Option<String>,
    /// Packages per subdirectory; the root subdirectory is `""`.
    pub sections: BTreeMap<String, Vec<PackageDef>>,
}

impl EnsureFile {
    pub fn parse(input: &str) -> Result<Self, EnsureError> {
        let mut file = EnsureFile::default();
        let mut subdir = String::new();
        for (idx, raw) in input.lines().enumerate() {
            let line_no = idx + 1;
            let line = raw.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            if let Some(directive) = line.strip_prefix('$') {
                let (name, value) = split_word(directive);
                match name {
                    "ResolvedVersions" => file.resolved_versions = Some(value.to_owned()),
                    "VerifiedPlatform" => file
                        .verified_platforms
                        .extend(value.split_whitespace().map(str::to_owned)),
                    "ServiceURL" => file.service_url = Some(value.to_owned()),
                    "ParanoidMode" | "OverrideInstallMode" => {}
                    other => {
                        return Err(EnsureError::Syntax {
                            line: line_no,
                            reason: format!("unknown directive '${other}'"),
                        })
                    }
                }
                continue;
            }
            if let Some(setting) = line.strip_prefix('@') {
                let (name, value) = split_word(setting);
                if name != "Subdir" {
                    return Err(EnsureError::Syntax {
                        line: line_no,
                        reason: format!("unknown setting '@{name}'"),
                    });
                }
                subdir = value.trim_matches('/').to_owned();
                continue;
            }
            let mut parts = line.split_whitespace();
            let (Some(name), Some(version), None) = (parts.next(), parts.next(), parts.next())
            else {
                return Err(EnsureError::Syntax {
                    line: line_no,
                    reason: format!("expected '<package> <version>', got '{line}'"),
                });
            };
            file.sections
                .entry(subdir.clone())
                .or_default()
                .push(PackageDef {
                    name: name.to_owned(),
                    version: version.to_owned(),
                });
        }
        Ok(file)
    }
}

fn split_word(s: &str) -> (&str, &str) {
    match s.split_once(char::is_whitespace) {
        Some((name, rest)) => (name, rest.trim()),
        None => (s, ""),
    }
}

/// Resolved-versions lock: (package, version) → instance id.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VersionsFile {
    entries: BTreeMap<(String, String), String>,
}

impl VersionsFile {
    pub fn parse(input: &str) -> Result<Self, EnsureError> {
        let mut out = VersionsFile::default();
        let mut block: Vec<(usize, &str)> = Vec::new();
        let lines = input
            .lines()
            .enumerate()
            .map(|(i, l)| (i + 1, l.trim()))
            .chain(std::iter::once((0, "")));
        for (line_no, line) in lines {
            if line.starts_with('#') {
                continue;
            }
            if !line.is_empty() {
                block.push((line_no, line));
                continue;
            }
            match block.as_slice() {
                [] => {}
                [(_, pkg), (_, version), (_, iid)] => {
                    out.insert(pkg, version, iid);
                }
                [(first, _), ..] => {
                    return Err(EnsureError::Versions {
                        line: *first,
                        reason: format!(
                            "expected package, version and instance id, got {} lines",
                            block.len()
                        ),
                    })
                }
            }
            block.clear();
        }
        Ok(out)
    }

    pub fn insert(&mut self, package: &str, version: &str, instance_id: &str) {
        self.entries.insert(
            (package.to_owned(), version.to_owned()),
            instance_id.to_owned(),
        );
    }

    pub fn resolve(&self, package: &str, version: &str) -> Option<&str> {
        self.entries
            .get(&(package.to_owned(), version.to_owned()))
            .map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl fmt::Display for VersionsFile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "# This file is auto-generated by pinset.")?;
        writeln!(f, "# Do not modify manually. All changes will be overwritten.")?;
        for ((pkg, version), iid) in &self.entries {
            writeln!(f)?;
            writeln!(f, "{pkg}")?;
            writeln!(f, "\t{version}")?;
            writeln!(f, "\t{iid}")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ENSURE: &str = r"
# tools
$ResolvedVersions tools.versions
$VerifiedPlatform linux-amd64 mac-amd64
$ParanoidMode CheckPresence

infra/tools/luci/vpython/${platform} git_revision:abc

@Subdir third_party/ninja
infra/3pp/tools/ninja/${platform} version:2@1.11.1
infra/3pp/tools/extra/${os=linux} latest
";

    #[test]
    fn parses_sections_and_directives() {
        let f = EnsureFile::parse(ENSURE).unwrap();
        assert_eq!(f.resolved_versions.as_deref(), Some("tools.versions"));
        assert_eq!(f.verified_platforms, vec!["linux-amd64", "mac-amd64"]);
        assert_eq!(f.sections[""].len(), 1);
        let ninja = &f.sections["third_party/ninja"];
        assert_eq!(ninja.len(), 2);
        assert_eq!(ninja[0].version, "version:2@1.11.1");
    }

    #[test]
    fn rejects_unknown_directive() {
        let err = EnsureFile::parse("$Bogus x\n").unwrap_err();
        assert!(matches!(err, EnsureError::Syntax { line: 1, .. }));
    }

    #[test]
    fn rejects_malformed_package_line() {
        assert!(EnsureFile::parse("only/name\n").is_err());
        assert!(EnsureFile::parse("a b c\n").is_err());
    }

    #[test]
    fn versions_parse_and_resolve() {
        let text = "# header\n\npkg/a/linux-amd64\n\tlatest\n\tIID_A\n\npkg/b\n\tversion:1\n\tIID_B\n";
        let v = VersionsFile::parse(text).unwrap();
        assert_eq!(v.len(), 2);
        assert_eq!(v.resolve("pkg/a/linux-amd64", "latest"), Some("IID_A"));
        assert_eq!(v.resolve("pkg/b", "version:1"), Some("IID_B"));
        assert_eq!(v.resolve("pkg/b", "version:2"), None);
    }

    #[test]
    fn versions_rejects_partial_block() {
        let err = VersionsFile::parse("pkg/a\n\tlatest\n").unwrap_err();
        assert!(matches!(err, EnsureError::Versions { line: 1, .. }));
    }

    #[test]
    fn versions_written_form_parses_back() {
        let mut v = VersionsFile::default();
        v.insert("pkg/z", "latest", "IID_Z");
        v.insert("pkg/a", "version:3", "IID_A");
        let text = v.to_string();
        assert!(text.starts_with("# This file is auto-generated"));
        assert_eq!(VersionsFile::parse(&text).unwrap(), v);
    }
}
