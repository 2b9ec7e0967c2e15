use super::{colorize_kind, json_pretty, Failure, EXIT_FAILURE, EXIT_SUCCESS};
use pinset_core::CoreError;
use pinset_schema::Manifest;
use std::collections::BTreeMap;
use std::path::Path;

/// Summarize a manifest document written by `pinset resolve`.
pub fn run(manifest_path: &Path, json: bool) -> Result<u8, Failure> {
    let manifest = Manifest::read_from_file(manifest_path).map_err(CoreError::from)?;
    let unresolved = manifest.verify_resolved().err();

    if json {
        let mut kinds: BTreeMap<&str, usize> = BTreeMap::new();
        for source in manifest.sources.values() {
            *kinds.entry(source.kind()).or_default() += 1;
        }
        let payload = serde_json::json!({
            "sources": manifest.sources.len(),
            "kinds": kinds,
            "virtualenvs": manifest.virtualenvs.len(),
            "variables": manifest.variables,
            "system_deps": manifest.system_deps,
            "unresolved": unresolved.as_ref().map(ToString::to_string),
        });
        println!("{}", json_pretty(&payload)?);
    } else {
        let v = &manifest.variables;
        println!(
            "host {}-{}  target {}-{}",
            v.host_os, v.host_cpu, v.target_os, v.target_cpu
        );
        println!();
        let width = manifest.sources.keys().map(String::len).max().unwrap_or(0);
        for (path, source) in &manifest.sources {
            println!(
                "  {path:<width$}  {:<8}  {}",
                colorize_kind(source.kind()),
                source.origin()
            );
        }
        if !manifest.virtualenvs.is_empty() {
            println!();
            for env in manifest.virtualenvs.values() {
                println!(
                    "  {}  python {}  {} package(s)",
                    env.spec_path,
                    env.python_version,
                    env.packages.len() + 1
                );
            }
        }
        if let Some(deps) = &manifest.system_deps {
            println!();
            for (arch, path) in &deps.sysroots {
                println!("  sysroot {arch}: {path}");
            }
        }
        if let Some(e) = &unresolved {
            eprintln!("error: {e}");
        }
    }
    Ok(if unresolved.is_some() {
        EXIT_FAILURE
    } else {
        EXIT_SUCCESS
    })
}
