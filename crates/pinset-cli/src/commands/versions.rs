use super::{Failure, EXIT_SUCCESS};
use pinset_core::CoreError;
use pinset_schema::{Manifest, PinnedPackage, Source, VersionsFile};
use std::path::Path;

/// Every package pin of a manifest as a resolved-versions file, so the
/// versions of a finished run can be frozen next to an ensure file.
pub fn collect(manifest: &Manifest) -> VersionsFile {
    let mut versions = VersionsFile::default();
    let mut add = |p: &PinnedPackage| {
        versions.insert(&p.name, &p.version.requested, &p.version.resolved);
    };
    for source in manifest.sources.values() {
        if let Source::Package(pkgs) = source {
            pkgs.packages.iter().for_each(&mut add);
        }
    }
    for env in manifest.virtualenvs.values() {
        add(&env.interpreter);
        env.packages.iter().for_each(&mut add);
    }
    versions
}

pub fn run(manifest_path: &Path, output: Option<&Path>) -> Result<u8, Failure> {
    let manifest = Manifest::read_from_file(manifest_path).map_err(CoreError::from)?;
    let versions = collect(&manifest);
    match output {
        Some(path) => std::fs::write(path, versions.to_string())
            .map_err(|e| format!("failed to write {}: {e}", path.display()))?,
        None => print!("{versions}"),
    }
    Ok(EXIT_SUCCESS)
}
