//! Built-in hook handlers, registered by the resolver in this order:
//! cloud-storage downloads, package ensure files, `LASTCHANGE` generation,
//! and Linux sysroot installation.

use crate::hooks::{flag_value, script_index, HookContext, HookHandler};
use crate::{paths, CoreError, ResultExt};
use pinset_schema::{ArchiveFormat, BlobHash, BlobObject, Hook};
use serde::Deserialize;
use std::collections::BTreeMap;
use tracing::debug;

fn handler_gap(ctx: &HookContext<'_>, handler: &str, hook: &Hook, why: &str) -> Result<bool, CoreError> {
    ctx.oracle
        .issues()
        .gap(format!("{handler}: hook '{}' {why}", hook.display_name()))?;
    Ok(true)
}

/// Python `sys.platform` of the build host.
fn sys_platform(host_os: &str) -> &str {
    match host_os {
        "mac" => "darwin",
        "win" => "win32",
        other => other,
    }
}

/// `download_from_google_storage.py --bucket B -s file.sha1`
/// pins `file` to the object named by the sha1 it contains.
/// With `-d dir` every `*.sha1` file below `dir` is pinned the same way.
#[derive(Debug, Default)]
pub struct GcsDownloadHandler;

impl GcsDownloadHandler {
    fn pin_sha1_file(
        ctx: &HookContext<'_>,
        bucket: &str,
        sha1_path: &str,
        extract: bool,
    ) -> Result<(), CoreError> {
        let sha1 = ctx.oracle.read_full_string(ctx.token, sha1_path)?;
        let sha1 = sha1.trim().to_ascii_lowercase();
        let target = sha1_path.strip_suffix(".sha1").unwrap_or(sha1_path);
        let request = BlobObject {
            bucket: bucket.to_owned(),
            object: sha1.clone(),
            hash: BlobHash {
                sha1: Some(sha1),
                ..BlobHash::default()
            },
            generation: None,
        };
        match ArchiveFormat::from_object_name(target).filter(|_| extract) {
            Some(format) => {
                let dir = paths::parent(target).to_owned();
                let extract_dir = (!dir.is_empty()).then_some(dir);
                ctx.oracle
                    .pin_archive(ctx.token, target, request, format, extract_dir)?;
            }
            None => {
                ctx.oracle.pin_blob(ctx.token, target, request)?;
            }
        }
        Ok(())
    }
}

impl HookHandler for GcsDownloadHandler {
    fn name(&self) -> &'static str {
        "gcs-download"
    }

    fn handle_hook(&self, ctx: &HookContext<'_>, hook: &Hook) -> Result<bool, CoreError> {
        let Some(i) = hook.action.iter().position(|a| {
            let name = paths::file_name(a);
            name == "download_from_google_storage.py" || name == "download_from_google_storage"
        }) else {
            return Ok(false);
        };
        let args = &hook.action[i + 1..];

        if let Some(pattern) = flag_value(args, "--platform") {
            let host = sys_platform(&ctx.oracle.variables().host_os).to_owned();
            let prefix = pattern.trim_start_matches('^').trim_end_matches(['*', '.', '$']);
            ctx.oracle.issues().notice(format!(
                "--platform patterns are matched as prefixes ('{pattern}')"
            ));
            if !host.starts_with(prefix) {
                debug!("hook '{}' skipped on {host}", hook.display_name());
                return Ok(true);
            }
        }

        let Some(bucket) = flag_value(args, "--bucket").or_else(|| flag_value(args, "-b")) else {
            return handler_gap(ctx, self.name(), hook, "names no bucket");
        };
        let extract = args.iter().any(|a| a == "--extract" || a == "-u");

        if let Some(file) = flag_value(args, "-s").or_else(|| flag_value(args, "--sha1_file")) {
            let sha1_path = ctx.resolve(file);
            Self::pin_sha1_file(ctx, bucket, &sha1_path, extract)
                .with_context(|| format!("hook '{}'", hook.display_name()))?;
            return Ok(true);
        }
        if let Some(dir) = flag_value(args, "-d").or_else(|| flag_value(args, "--directory")) {
            let dir = ctx.resolve(dir);
            let files = ctx
                .oracle
                .walk_directory(ctx.token, &dir, &["**/*.sha1".to_owned()])?;
            for sha1_path in files {
                Self::pin_sha1_file(ctx, bucket, &sha1_path, extract)
                    .with_context(|| format!("hook '{}'", hook.display_name()))?;
            }
            return Ok(true);
        }
        handler_gap(ctx, self.name(), hook, "names neither a sha1 file nor a directory")
    }
}

/// `cipd ensure -root R -ensure-file F`
#[derive(Debug, Default)]
pub struct CipdEnsureHandler;

impl HookHandler for CipdEnsureHandler {
    fn name(&self) -> &'static str {
        "cipd-ensure"
    }

    fn handle_hook(&self, ctx: &HookContext<'_>, hook: &Hook) -> Result<bool, CoreError> {
        let Some(i) = hook.action.iter().position(|a| {
            let name = paths::file_name(a);
            name == "cipd" || name == "cipd.bat"
        }) else {
            return Ok(false);
        };
        let args = &hook.action[i + 1..];
        if args.first().map(String::as_str) != Some("ensure") {
            return Ok(false);
        }
        let (Some(root), Some(file)) = (flag_value(args, "-root"), flag_value(args, "-ensure-file"))
        else {
            return handler_gap(ctx, self.name(), hook, "lacks -root or -ensure-file");
        };
        let root = ctx.resolve(root);
        let file = ctx.resolve(file);
        ctx.oracle
            .pin_packages_from_ensure_file(ctx.token, &root, &file)
            .with_context(|| format!("hook '{}'", hook.display_name()))?;
        Ok(true)
    }
}

const COMMIT_POSITION: &str = "Cr-Commit-Position";

/// `lastchange.py -o OUT`: writes `LASTCHANGE=<sha>-<position>` and
/// `OUT.committime` from the metadata of the repository holding the script
/// (or the one named by `-s`).
#[derive(Debug, Default)]
pub struct LastChangeHandler;

impl HookHandler for LastChangeHandler {
    fn name(&self) -> &'static str {
        "lastchange"
    }

    fn handle_hook(&self, ctx: &HookContext<'_>, hook: &Hook) -> Result<bool, CoreError> {
        let Some(i) = script_index(&hook.action, "lastchange.py") else {
            return Ok(false);
        };
        let args = &hook.action[i + 1..];
        let Some(out) = flag_value(args, "-o").or_else(|| flag_value(args, "--output")) else {
            return handler_gap(ctx, self.name(), hook, "has no -o output");
        };
        let out = ctx.resolve(out);
        let repo = match flag_value(args, "-s").or_else(|| flag_value(args, "--source-dir")) {
            Some(dir) => ctx.resolve(dir),
            None => ctx.resolve(&hook.action[i]),
        };

        let grep = format!("^{COMMIT_POSITION}:");
        let info = match ctx.oracle.get_commit_metadata(ctx.token, &repo, Some(&grep)) {
            Ok(info) => info,
            Err(e) if e.is_not_found() => {
                ctx.oracle.issues().notice(format!(
                    "{repo}: no commit carries {COMMIT_POSITION}; LASTCHANGE uses the pinned commit"
                ));
                ctx.oracle.get_commit_metadata(ctx.token, &repo, None)?
            }
            Err(e) => return Err(e).with_context(|| format!("hook '{}'", hook.display_name())),
        };
        let position = match info.trailer(COMMIT_POSITION) {
            Some(position) => position.to_owned(),
            None => {
                let branch = ctx
                    .oracle
                    .requested_revision(&repo)
                    .filter(|r| r.starts_with("refs/"))
                    .unwrap_or_else(|| "HEAD".to_owned());
                format!("{branch}@{{#0}}")
            }
        };
        ctx.oracle.issues().notice(
            "LASTCHANGE is derived from commit metadata rather than by running lastchange.py",
        );

        let provenance = format!("commit metadata of {}", info.hash);
        ctx.oracle.pin_raw_file(
            &out,
            format!("LASTCHANGE={}-{position}\n", info.hash),
            provenance.clone(),
        );
        ctx.oracle.pin_raw_file(
            &format!("{out}.committime"),
            info.author_time.timestamp().to_string(),
            provenance,
        );
        Ok(true)
    }
}

#[derive(Debug, Deserialize)]
struct SysrootEntry {
    #[serde(rename = "Key", default)]
    key: Option<String>,
    #[serde(rename = "Sha256Sum", default)]
    sha256: Option<String>,
    #[serde(rename = "SysrootDir")]
    sysroot_dir: String,
    #[serde(rename = "Tarball")]
    tarball: String,
    #[serde(rename = "URL")]
    url: String,
}

/// Debian architecture name for a build-system CPU name.
fn debian_arch(arch: &str) -> &str {
    match arch {
        "x64" => "amd64",
        "x86" => "i386",
        "arm" => "armhf",
        "mips" => "mipsel",
        other => other,
    }
}

/// Split a storage URL into bucket and object prefix.
fn storage_location(url: &str) -> Option<(String, String)> {
    let rest = url.split_once("://").map_or(url, |(_, r)| r);
    let (host, path) = rest.split_once('/')?;
    let path = path.trim_matches('/');
    if host.starts_with("storage.googleapis.com") || host.starts_with("commondatastorage.googleapis.com") {
        let (bucket, prefix) = path.split_once('/').unwrap_or((path, ""));
        let prefix = if prefix.is_empty() {
            String::new()
        } else {
            format!("{prefix}/")
        };
        return (!bucket.is_empty()).then(|| (bucket.to_owned(), prefix));
    }
    None
}

/// `install-sysroot.py --arch=A`: pins the sysroot tarball listed in
/// `sysroots.json` next to the script and records it as a system dependency.
#[derive(Debug, Default)]
pub struct SysrootHandler;

impl HookHandler for SysrootHandler {
    fn name(&self) -> &'static str {
        "sysroot"
    }

    fn handle_hook(&self, ctx: &HookContext<'_>, hook: &Hook) -> Result<bool, CoreError> {
        let Some(i) = script_index(&hook.action, "install-sysroot.py") else {
            return Ok(false);
        };
        let Some(arch) = flag_value(&hook.action[i + 1..], "--arch") else {
            return handler_gap(ctx, self.name(), hook, "has no --arch");
        };
        let arch = debian_arch(arch);
        let script = ctx.resolve(&hook.action[i]);
        let script_dir = paths::parent(&script);
        let listing = paths::join(script_dir, "sysroots.json");

        let text = ctx.oracle.read_full_string(ctx.token, &listing)?;
        let entries: BTreeMap<String, SysrootEntry> = serde_json::from_str(&text)
            .map_err(|e| CoreError::Resolution(format!("{listing}: {e}")))?;
        let suffix = format!("_{arch}");
        let Some((name, entry)) = entries.iter().find(|(k, _)| k.ends_with(&suffix)) else {
            return handler_gap(ctx, self.name(), hook, &format!("has no sysroot for {arch}"));
        };
        let Some((bucket, prefix)) = storage_location(&entry.url) else {
            return Err(CoreError::Unsupported(format!(
                "{listing}: sysroot {name} is not hosted in cloud storage ({})",
                entry.url
            )));
        };
        let object = format!("{prefix}{}", entry.key.as_deref().unwrap_or(&entry.tarball));
        let format = ArchiveFormat::from_object_name(&entry.tarball).ok_or_else(|| {
            CoreError::Unsupported(format!("{listing}: unknown archive type of {}", entry.tarball))
        })?;

        let target = paths::join(paths::parent(script_dir), &entry.sysroot_dir);
        let request = BlobObject {
            bucket,
            object,
            hash: BlobHash {
                sha256: entry.sha256.clone(),
                ..BlobHash::default()
            },
            generation: None,
        };
        ctx.oracle
            .pin_archive(ctx.token, &target, request, format, None)
            .with_context(|| format!("hook '{}'", hook.display_name()))?;
        ctx.oracle.record_sysroot(arch, &target);
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn storage_urls() {
        assert_eq!(
            storage_location("https://commondatastorage.googleapis.com/chrome-linux-sysroot"),
            Some(("chrome-linux-sysroot".to_owned(), String::new()))
        );
        assert_eq!(
            storage_location("https://storage.googleapis.com/b/toolchain/v2"),
            Some(("b".to_owned(), "toolchain/v2/".to_owned()))
        );
        assert_eq!(storage_location("https://example.com/b"), None);
    }

    #[test]
    fn arch_names() {
        assert_eq!(debian_arch("x64"), "amd64");
        assert_eq!(debian_arch("arm"), "armhf");
        assert_eq!(debian_arch("arm64"), "arm64");
        assert_eq!(sys_platform("mac"), "darwin");
    }
}
