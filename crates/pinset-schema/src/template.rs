//! Platform template expansion for package names.
//!
//! Package names may contain `${var}` tokens (`${platform}`, `${os}`, `${arch}`
//! and any extra variables supplied by the caller). A token may also carry an
//! allow-list, `${os=linux,mac}`: when the current value is not in the list the
//! whole package does not apply to this platform and expansion yields `None`.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TemplateError {
    #[error("unknown template variable '{var}' in '{template}'")]
    UnknownVariable { var: String, template: String },
    #[error("malformed template '{0}'")]
    Malformed(String),
}

/// Package-registry platform of the host doing the resolution.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Platform {
    pub os: String,
    pub arch: String,
}

impl Platform {
    /// Map build-system OS/CPU names onto registry platform names.
    pub fn from_build(os: &str, cpu: &str) -> Self {
        let os = match os {
            "win" | "windows" => "windows",
            "mac" | "darwin" | "macos" => "mac",
            other => other,
        };
        let arch = match cpu {
            "x64" | "x86_64" | "amd64" => "amd64",
            "x86" | "i386" | "386" => "386",
            "arm64" | "aarch64" => "arm64",
            "arm" | "armv6l" => "armv6l",
            other => other,
        };
        Self {
            os: os.to_owned(),
            arch: arch.to_owned(),
        }
    }

    pub fn name(&self) -> String {
        format!("{}-{}", self.os, self.arch)
    }

    fn lookup(&self, var: &str, extra: &BTreeMap<String, String>) -> Option<String> {
        match var {
            "platform" => Some(self.name()),
            "os" => Some(self.os.clone()),
            "arch" => Some(self.arch.clone()),
            other => extra.get(other).cloned(),
        }
    }
}

/// Expand every `${...}` token in `template`.
///
/// Returns `Ok(None)` when an allow-listed token excludes the current platform.
pub fn expand_template(
    template: &str,
    platform: &Platform,
    extra: &BTreeMap<String, String>,
) -> Result<Option<String>, TemplateError> {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;
    while let Some(start) = rest.find("${") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        let end = after
            .find('}')
            .ok_or_else(|| TemplateError::Malformed(template.to_owned()))?;
        let token = &after[..end];
        let (var, allowed) = match token.split_once('=') {
            Some((var, list)) => (var, Some(list)),
            None => (token, None),
        };
        if var.is_empty() {
            return Err(TemplateError::Malformed(template.to_owned()));
        }
        let value =
            platform
                .lookup(var, extra)
                .ok_or_else(|| TemplateError::UnknownVariable {
                    var: var.to_owned(),
                    template: template.to_owned(),
                })?;
        if let Some(list) = allowed {
            if !list.split(',').any(|v| v.trim() == value) {
                return Ok(None);
            }
        }
        out.push_str(&value);
        rest = &after[end + 1..];
    }
    out.push_str(rest);
    Ok(Some(out))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn linux() -> Platform {
        Platform::from_build("linux", "x64")
    }

    #[test]
    fn maps_build_names() {
        assert_eq!(Platform::from_build("win", "x86").name(), "windows-386");
        assert_eq!(Platform::from_build("mac", "arm64").name(), "mac-arm64");
        assert_eq!(linux().name(), "linux-amd64");
    }

    #[test]
    fn expands_platform_tokens() {
        let got = expand_template("infra/tools/${platform}", &linux(), &BTreeMap::new()).unwrap();
        assert_eq!(got.as_deref(), Some("infra/tools/linux-amd64"));
        let got = expand_template("a/${os}/${arch}", &linux(), &BTreeMap::new()).unwrap();
        assert_eq!(got.as_deref(), Some("a/linux/amd64"));
    }

    #[test]
    fn plain_names_pass_through() {
        let got = expand_template("no/templates", &linux(), &BTreeMap::new()).unwrap();
        assert_eq!(got.as_deref(), Some("no/templates"));
    }

    #[test]
    fn allow_list_skips_other_platforms() {
        let got = expand_template("x/${os=mac,windows}", &linux(), &BTreeMap::new()).unwrap();
        assert_eq!(got, None);
        let got = expand_template("x/${os=mac,linux}", &linux(), &BTreeMap::new()).unwrap();
        assert_eq!(got.as_deref(), Some("x/linux"));
    }

    #[test]
    fn extra_variables() {
        let extra = BTreeMap::from([("py_platform".to_owned(), "linux_x86_64".to_owned())]);
        let got = expand_template("wheels/six/${py_platform}", &linux(), &extra).unwrap();
        assert_eq!(got.as_deref(), Some("wheels/six/linux_x86_64"));
    }

    #[test]
    fn unknown_variable_is_error() {
        let err = expand_template("x/${nope}", &linux(), &BTreeMap::new()).unwrap_err();
        assert!(matches!(err, TemplateError::UnknownVariable { .. }));
    }

    #[test]
    fn unterminated_token_is_error() {
        assert!(expand_template("x/${os", &linux(), &BTreeMap::new()).is_err());
        assert!(expand_template("x/${}", &linux(), &BTreeMap::new()).is_err());
    }
}
