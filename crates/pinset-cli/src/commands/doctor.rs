use super::{Failure, EXIT_FAILURE, EXIT_SUCCESS};
use pinset_core::ResolverConfig;
use pinset_store::CacheLayout;
use std::process::{Command, Stdio};

pub fn run(config: &ResolverConfig, json_output: bool) -> Result<u8, Failure> {
    let mut checks: Vec<Check> = Vec::new();
    let mut all_pass = true;

    match config.validate() {
        Ok(()) => checks.push(Check::pass("config", "Configuration is valid")),
        Err(e) => {
            all_pass = false;
            checks.push(Check::fail("config", &e.to_string()));
        }
    }

    check_tools(config, &mut checks, &mut all_pass);
    check_cache(&CacheLayout::new(&config.cache_dir), &mut checks, &mut all_pass);

    print_results(&checks, all_pass, json_output)
}

fn tool_version(binary: &str, arg: &str) -> Option<String> {
    let output = Command::new(binary)
        .arg(arg)
        .stdin(Stdio::null())
        .output()
        .ok()?;
    if !output.status.success() {
        return None;
    }
    let text = String::from_utf8_lossy(&output.stdout);
    Some(text.lines().next().unwrap_or_default().trim().to_owned())
}

fn check_tools(config: &ResolverConfig, checks: &mut Vec<Check>, all_pass: &mut bool) {
    let git = &config.remote.git_binary;
    match tool_version(git, "--version") {
        Some(v) => checks.push(Check::pass("git", &format!("{git}: {v}"))),
        None => {
            *all_pass = false;
            checks.push(Check::fail("git", &format!("{git} is not runnable")));
        }
    }

    // Only package-backed dependencies need the client.
    let cipd = &config.remote.cipd_binary;
    match tool_version(cipd, "version") {
        Some(v) => checks.push(Check::pass("cipd", &format!("{cipd}: {v}"))),
        None => checks.push(Check::warn(
            "cipd",
            &format!("{cipd} is not runnable; package dependencies will fail"),
        )),
    }
}

fn check_cache(layout: &CacheLayout, checks: &mut Vec<Check>, all_pass: &mut bool) {
    if !layout.root().exists() {
        checks.push(Check::info(
            "cache",
            &format!(
                "Cache {} not initialized (created on first run)",
                layout.root().display()
            ),
        ));
        return;
    }
    match layout.verify_version() {
        Ok(()) => checks.push(Check::pass("cache_version", "Cache format version valid")),
        Err(e) => {
            *all_pass = false;
            checks.push(Check::fail(
                "cache_version",
                &format!("Cache version check failed: {e}"),
            ));
        }
    }
    let count = |dir: std::path::PathBuf| std::fs::read_dir(dir).map_or(0, Iterator::count);
    checks.push(Check::info(
        "cache_contents",
        &format!(
            "{} git mirrors, {} blob hashes, {} deployed packages",
            count(layout.git_dir()),
            count(layout.blob_cache_dir()),
            count(layout.packages_dir())
        ),
    ));
}

fn print_results(checks: &[Check], all_pass: bool, json_output: bool) -> Result<u8, Failure> {
    if json_output {
        let json = serde_json::json!({
            "healthy": all_pass,
            "checks": checks.iter().map(|c| serde_json::json!({
                "name": c.name,
                "status": c.status,
                "message": c.message,
            })).collect::<Vec<_>>(),
        });
        println!("{}", super::json_pretty(&json)?);
    } else {
        println!("pinset doctor\n");
        for check in checks {
            let icon = match check.status {
                "pass" => "✓",
                "fail" => "✗",
                "warn" => "⚠",
                _ => "ℹ",
            };
            println!("  {icon} {}", check.message);
        }
        println!();
        if all_pass {
            println!("All checks passed.");
        } else {
            println!("Some checks failed. See above for details.");
        }
    }
    Ok(if all_pass { EXIT_SUCCESS } else { EXIT_FAILURE })
}

struct Check {
    name: &'static str,
    status: &'static str,
    message: String,
}

impl Check {
    fn new(name: &'static str, status: &'static str, message: &str) -> Self {
        Self {
            name,
            status,
            message: message.to_owned(),
        }
    }

    fn pass(name: &'static str, message: &str) -> Self {
        Self::new(name, "pass", message)
    }

    fn fail(name: &'static str, message: &str) -> Self {
        Self::new(name, "fail", message)
    }

    fn warn(name: &'static str, message: &str) -> Self {
        Self::new(name, "warn", message)
    }

    fn info(name: &'static str, message: &str) -> Self {
        Self::new(name, "info", message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn uninitialized_cache_is_informational() {
        let dir = tempfile::tempdir().unwrap();
        let layout = CacheLayout::new(dir.path().join("absent"));
        let mut checks = Vec::new();
        let mut all_pass = true;
        check_cache(&layout, &mut checks, &mut all_pass);
        assert!(all_pass);
        assert_eq!(checks.len(), 1);
        assert_eq!(checks[0].status, "info");
    }

    #[test]
    fn initialized_cache_passes() {
        let dir = tempfile::tempdir().unwrap();
        let layout = CacheLayout::new(dir.path());
        layout.initialize().unwrap();
        let mut checks = Vec::new();
        let mut all_pass = true;
        check_cache(&layout, &mut checks, &mut all_pass);
        assert!(all_pass);
        assert!(checks.iter().any(|c| c.name == "cache_version" && c.status == "pass"));
    }

    #[test]
    fn missing_binary_is_not_runnable() {
        assert!(tool_version("/nonexistent/pinset-test-binary", "--version").is_none());
    }
}
