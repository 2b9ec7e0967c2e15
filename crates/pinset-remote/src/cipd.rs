use crate::{OnceMap, PackageRegistry, RemoteConfig, RemoteError};
use pinset_store::{CacheLayout, CacheLock};
use serde_json::Value;
use std::io::Write;
use std::path::{Component, Path, PathBuf};
use std::process::{Command, Stdio};
use tracing::{debug, info};

const DEPLOYED_MARKER: &str = ".pinset-deployed";

/// First `instance_id` found anywhere in a `-json-output` document.
fn find_instance_id(v: &Value) -> Option<String> {
    match v {
        Value::Object(map) => map
            .get("instance_id")
            .and_then(Value::as_str)
            .map(str::to_owned)
            .or_else(|| map.values().find_map(find_instance_id)),
        Value::Array(items) => items.iter().find_map(find_instance_id),
        _ => None,
    }
}

fn is_safe_relative(path: &str) -> bool {
    !path.is_empty()
        && Path::new(path)
            .components()
            .all(|c| matches!(c, Component::Normal(_) | Component::CurDir))
}

/// `PackageRegistry` backed by the `cipd` command-line client.
///
/// Instances are exported once into the cache and files are read from there.
pub struct CipdCli {
    binary: String,
    service_url: String,
    layout: CacheLayout,
    deployed: OnceMap<PathBuf>,
}

impl CipdCli {
    pub fn new(config: &RemoteConfig, layout: CacheLayout) -> Self {
        Self {
            binary: config.cipd_binary.clone(),
            service_url: config.cipd_service_url.clone(),
            layout,
            deployed: OnceMap::new(),
        }
    }

    fn run(&self, args: &[&str], stdin: Option<&str>) -> Result<Vec<u8>, RemoteError> {
        debug!("{} {}", self.binary, args.join(" "));
        let mut child = Command::new(&self.binary)
            .args(args)
            .stdin(if stdin.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| RemoteError::Package(format!("failed to run {}: {e}", self.binary)))?;
        if let (Some(input), Some(mut pipe)) = (stdin, child.stdin.take()) {
            pipe.write_all(input.as_bytes())?;
        }
        let out = child.wait_with_output()?;
        if !out.status.success() {
            return Err(RemoteError::Package(format!(
                "{} {} failed: {}",
                self.binary,
                args.first().unwrap_or(&""),
                String::from_utf8_lossy(&out.stderr).trim()
            )));
        }
        Ok(out.stdout)
    }

    fn deploy(&self, package: &str, instance_id: &str) -> Result<PathBuf, RemoteError> {
        let dest = self.layout.package_instance(package, instance_id);
        if dest.join(DEPLOYED_MARKER).is_file() {
            return Ok(dest);
        }
        let _lock = CacheLock::acquire(&dest.with_extension("lock"))?;
        if dest.join(DEPLOYED_MARKER).is_file() {
            return Ok(dest);
        }

        info!("deploying {package}@{instance_id}");
        let parent = self.layout.packages_dir();
        std::fs::create_dir_all(&parent)?;
        let staging = tempfile::Builder::new()
            .prefix(".deploy-")
            .tempdir_in(&parent)?;
        let root = staging.path().to_string_lossy();
        self.run(
            &[
                "export",
                "-root",
                &root,
                "-ensure-file",
                "-",
                "-service-url",
                &self.service_url,
            ],
            Some(&format!("{package} {instance_id}\n")),
        )?;
        std::fs::write(staging.path().join(DEPLOYED_MARKER), instance_id)?;
        if dest.exists() {
            std::fs::remove_dir_all(&dest)?;
        }
        std::fs::rename(staging.path(), &dest)?;
        Ok(dest)
    }
}

impl PackageRegistry for CipdCli {
    fn service_identity(&self) -> String {
        self.service_url.clone()
    }

    fn resolve_version(&self, package: &str, version: &str) -> Result<String, RemoteError> {
        let out = tempfile::NamedTempFile::new()?;
        let out_path = out.path().to_string_lossy();
        self.run(
            &[
                "resolve",
                package,
                "-version",
                version,
                "-service-url",
                &self.service_url,
                "-json-output",
                &out_path,
            ],
            None,
        )?;
        let text = std::fs::read_to_string(out.path())?;
        let doc: Value = serde_json::from_str(&text)
            .map_err(|e| RemoteError::Serialization(format!("cipd resolve output: {e}")))?;
        find_instance_id(&doc).ok_or_else(|| {
            RemoteError::NotFound(format!("{package}@{version}: no instance in resolve output"))
        })
    }

    fn read_file(
        &self,
        package: &str,
        instance_id: &str,
        path: &str,
    ) -> Result<Option<Vec<u8>>, RemoteError> {
        if !is_safe_relative(path) {
            return Err(RemoteError::Package(format!(
                "refusing to read '{path}' from {package}: not a relative path"
            )));
        }
        let root = self
            .deployed
            .get_or_init(&format!("{package}@{instance_id}"), || {
                self.deploy(package, instance_id).map_err(|e| e.to_string())
            })
            .map_err(RemoteError::Package)?;
        match std::fs::read(root.join(path)) {
            Ok(data) => Ok(Some(data)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}
