use pinset_core::hooks::ends_with_tokens;
use pinset_core::{
    Backends, CancelToken, CoreError, HookChain, HookContext, HookHandler, IssueTracker, Oracle,
    TomlDepsParser, Walker,
};
use pinset_remote::mock::{MockBlobStore, MockGit, MockRegistry};
use pinset_schema::{GlobalVariables, Hook, Source};
use pinset_store::{BlobHashCache, CacheLayout};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

const ROOT_SHA: &str = "1111111111111111111111111111111111111111";
const A_SHA: &str = "2222222222222222222222222222222222222222";
const B_SHA: &str = "3333333333333333333333333333333333333333";
const NESTED_SHA: &str = "4444444444444444444444444444444444444444";
const IID: &str = "5555555555555555555555555555555555555555";
const ROOT_URL: &str = "https://git.example.com/src";

const ROOT_DEPS: &str = r#"
use_relative_paths = true
recursedeps = ["third_party/a", "third_party/pkg", "third_party/missing"]
gclient_gn_args_file = "build/config/gclient_args.gni"
gclient_gn_args = ["checkout_linux", "build_with_tflite"]

[vars]
git_base = "https://git.example.com"
build_with_tflite = true

[deps]
"third_party/a" = "{git_base}/a@2222222222222222222222222222222222222222"
"third_party/b" = { url = "{git_base}/b", revision = "3333333333333333333333333333333333333333", condition = "checkout_linux" }
"third_party/mac" = { url = "{git_base}/mac", condition = "checkout_mac" }
"third_party/pkg" = { dep_type = "cipd", packages = [{ package = "tools/x/${platform}", version = "5555555555555555555555555555555555555555" }] }

[[hooks]]
name = "custom"
action = ["python3", "tools/custom.py"]

[[hooks]]
name = "unknown"
action = ["python3", "tools/unknown.py", "--flag"]
"#;

const A_DEPS: &str = r#"
gclient_gn_args_file = "src/third_party/a/args.gni"
gclient_gn_args = ["checkout_linux"]

[deps]
"src/third_party/a/nested" = "https://git.example.com/nested@4444444444444444444444444444444444444444"
"#;

struct Counting {
    name: &'static str,
    script: &'static str,
    calls: Arc<AtomicUsize>,
}

impl HookHandler for Counting {
    fn name(&self) -> &'static str {
        self.name
    }

    fn handle_hook(&self, _ctx: &HookContext<'_>, hook: &Hook) -> Result<bool, CoreError> {
        if !ends_with_tokens(&hook.action, &[self.script]) {
            return Ok(false);
        }
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(true)
    }
}

fn counting(name: &'static str, script: &'static str) -> (Counting, Arc<AtomicUsize>) {
    let calls = Arc::new(AtomicUsize::new(0));
    (
        Counting {
            name,
            script,
            calls: calls.clone(),
        },
        calls,
    )
}

struct World {
    _cache: tempfile::TempDir,
    git: Arc<MockGit>,
    oracle: Oracle,
}

fn world(fail_fast: bool) -> World {
    let cache = tempfile::tempdir().unwrap();
    let git = Arc::new(MockGit::new());
    git.add_commit(ROOT_URL, ROOT_SHA, &[("DEPS", ROOT_DEPS)]);
    git.add_commit("https://git.example.com/a", A_SHA, &[("DEPS", A_DEPS)]);
    let backends = Backends {
        git: git.clone(),
        blobs: Arc::new(MockBlobStore::new()),
        packages: Arc::new(MockRegistry::new()),
    };
    let vars = GlobalVariables {
        host_os: "linux".to_owned(),
        host_cpu: "x64".to_owned(),
        target_os: "linux".to_owned(),
        target_cpu: "x64".to_owned(),
        ..GlobalVariables::default()
    };
    let oracle = Oracle::new(
        backends,
        BlobHashCache::new(CacheLayout::new(cache.path())),
        vars,
        Arc::new(IssueTracker::new(fail_fast)),
    );
    oracle
        .pin_git(&CancelToken::new(), "src", ROOT_URL, ROOT_SHA)
        .unwrap();
    World {
        _cache: cache,
        git,
        oracle,
    }
}

fn git_commit(oracle: &Oracle, path: &str) -> Option<String> {
    match oracle.source_at(path) {
        Some(Source::Git(g)) => Some(g.version.resolved),
        _ => None,
    }
}

#[test]
fn walk_pins_declared_deps_and_follows_git_recursedeps() {
    let w = world(false);
    let (custom, _) = counting("custom", "custom.py");
    let hooks = HookChain::new().with(custom);
    let walker = Walker::new(&w.oracle, &TomlDepsParser, &hooks, "DEPS");
    walker.walk(&CancelToken::new(), "src").unwrap();

    assert_eq!(git_commit(&w.oracle, "src/third_party/a").as_deref(), Some(A_SHA));
    assert_eq!(git_commit(&w.oracle, "src/third_party/b").as_deref(), Some(B_SHA));
    assert!(w.oracle.source_at("src/third_party/mac").is_none());
    assert_eq!(
        git_commit(&w.oracle, "src/third_party/a/nested").as_deref(),
        Some(NESTED_SHA)
    );
    let Some(Source::Package(pkgs)) = w.oracle.source_at("src/third_party/pkg") else {
        panic!("expected package source");
    };
    assert_eq!(pkgs.packages[0].name, "tools/x/linux-amd64");
    assert_eq!(pkgs.packages[0].version.resolved, IID);

    // Root and third_party/a only: pkg is not a git dep, missing is undeclared.
    assert_eq!(walker.visited(), 2);
    assert_eq!(w.git.read_calls(), 2);
    assert_eq!(w.git.ls_remote_calls(), 0);
}

#[test]
fn cancelled_walk_reads_no_further_manifests() {
    let w = world(false);
    w.git.set_latency(Duration::from_millis(200));
    let token = CancelToken::new();
    let canceller = {
        let token = token.clone();
        std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(20));
            token.cancel();
        })
    };
    let hooks = HookChain::new();
    let err = Walker::new(&w.oracle, &TomlDepsParser, &hooks, "DEPS")
        .walk(&token, "src")
        .unwrap_err();
    canceller.join().unwrap();
    assert!(err.is_cancelled(), "{err}");
    assert_eq!(w.git.read_calls(), 1);
}

#[test]
fn gn_args_written_for_root_manifest_only() {
    let w = world(false);
    let hooks = HookChain::new();
    let walker = Walker::new(&w.oracle, &TomlDepsParser, &hooks, "DEPS");
    walker.walk(&CancelToken::new(), "src").unwrap();

    let Some(Source::Raw(raw)) = w.oracle.source_at("src/build/config/gclient_args.gni") else {
        panic!("expected generated gn args");
    };
    assert!(raw.content.starts_with("# Generated from 'src/DEPS'"));
    assert!(raw.content.contains("build_with_tflite = true"));
    assert!(raw.content.contains("checkout_linux = true"));
    assert!(w.oracle.source_at("src/third_party/a/args.gni").is_none());
}

#[test]
fn first_claiming_handler_wins() {
    let w = world(false);
    let (first, first_calls) = counting("first", "custom.py");
    let (second, second_calls) = counting("second", "custom.py");
    let hooks = HookChain::new().with(first).with(second);
    Walker::new(&w.oracle, &TomlDepsParser, &hooks, "DEPS")
        .walk(&CancelToken::new(), "src")
        .unwrap();
    assert_eq!(first_calls.load(Ordering::SeqCst), 1);
    assert_eq!(second_calls.load(Ordering::SeqCst), 0);
}

#[test]
fn unclaimed_hooks_are_counted_as_gaps() {
    let w = world(false);
    let hooks = HookChain::new();
    Walker::new(&w.oracle, &TomlDepsParser, &hooks, "DEPS")
        .walk(&CancelToken::new(), "src")
        .unwrap();
    let gaps = w.oracle.issues().gaps();
    assert_eq!(gaps.len(), 2);
    assert!(gaps
        .iter()
        .any(|g| g.contains("tools/unknown.py --flag") && g.contains("src/DEPS")));
}

#[test]
fn fail_fast_turns_first_gap_into_error() {
    let w = world(true);
    let (custom, _) = counting("custom", "custom.py");
    let hooks = HookChain::new().with(custom);
    let err = Walker::new(&w.oracle, &TomlDepsParser, &hooks, "DEPS")
        .walk(&CancelToken::new(), "src")
        .unwrap_err();
    assert!(matches!(err.root_cause(), CoreError::Unresolved(_)), "{err}");
    assert_eq!(w.oracle.issues().gap_count(), 1);
}

#[test]
fn parse_failure_names_the_manifest() {
    let w = world(false);
    w.git.add_commit(ROOT_URL, ROOT_SHA, &[("DEPS", "[deps]\n\"x\" = { dep_type = \"svn\" }\n")]);
    let hooks = HookChain::new();
    let err = Walker::new(&w.oracle, &TomlDepsParser, &hooks, "DEPS")
        .walk(&CancelToken::new(), "src")
        .unwrap_err();
    assert!(err.is_parse_error(), "{err}");
    assert!(err.to_string().contains("parse src/DEPS"), "{err}");
}

#[test]
fn missing_root_manifest_is_not_found() {
    let w = world(false);
    let hooks = HookChain::new();
    let err = Walker::new(&w.oracle, &TomlDepsParser, &hooks, "DEPS.missing")
        .walk(&CancelToken::new(), "src")
        .unwrap_err();
    assert!(err.is_not_found(), "{err}");
}

#[test]
fn recursedeps_can_name_another_manifest_file() {
    let w = world(false);
    let root = r#"
recursedeps = [{ path = "src/lib", deps_file = "DEPS.lib" }]
[deps]
"src/lib" = "https://git.example.com/lib@6666666666666666666666666666666666666666"
"#;
    w.git.add_commit(ROOT_URL, ROOT_SHA, &[("DEPS", root)]);
    w.git.add_commit(
        "https://git.example.com/lib",
        "6666666666666666666666666666666666666666",
        &[(
            "DEPS.lib",
            "[deps]\n\"src/lib/sub\" = \"https://git.example.com/sub@7777777777777777777777777777777777777777\"\n",
        )],
    );
    let hooks = HookChain::new();
    let walker = Walker::new(&w.oracle, &TomlDepsParser, &hooks, "DEPS");
    walker.walk(&CancelToken::new(), "src").unwrap();
    assert!(git_commit(&w.oracle, "src/lib/sub").is_some());
    assert_eq!(walker.visited(), 2);
}
