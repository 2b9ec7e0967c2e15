use crate::concurrency::CancelToken;
use crate::oracle::Oracle;
use crate::{paths, CoreError};
use pinset_schema::Hook;
use tracing::debug;

/// Everything a handler may need while translating one hook.
pub struct HookContext<'a> {
    pub oracle: &'a Oracle,
    pub token: &'a CancelToken,
    /// Checkout-relative directory the hook runs in.
    pub cwd: &'a str,
    /// Path of the dependency manifest that declared the hook.
    pub deps_path: &'a str,
}

impl HookContext<'_> {
    /// Resolve a hook argument against the hook's working directory.
    pub fn resolve(&self, arg: &str) -> String {
        paths::join(self.cwd, arg)
    }
}

/// One recognizer of non-declarative build steps.
///
/// `Ok(false)` means the hook is not this handler's. `Ok(true)` and `Err`
/// both claim the hook and stop the chain.
pub trait HookHandler: Send + Sync {
    fn name(&self) -> &'static str;

    fn handle_hook(&self, ctx: &HookContext<'_>, hook: &Hook) -> Result<bool, CoreError>;
}

/// Ordered list of handlers; the first one to claim a hook wins.
#[derive(Default)]
pub struct HookChain {
    handlers: Vec<Box<dyn HookHandler>>,
}

impl HookChain {
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with(mut self, handler: impl HookHandler + 'static) -> Self {
        self.handlers.push(Box::new(handler));
        self
    }

    pub fn push(&mut self, handler: Box<dyn HookHandler>) {
        self.handlers.push(handler);
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    /// Offer `hook` to each handler in order. A hook nobody claims is
    /// recorded as a gap, which is only an error under fail-fast.
    pub fn dispatch(&self, ctx: &HookContext<'_>, hook: &Hook) -> Result<(), CoreError> {
        for handler in &self.handlers {
            if handler.handle_hook(ctx, hook)? {
                debug!("hook '{}' handled by {}", hook.display_name(), handler.name());
                return Ok(());
            }
        }
        ctx.oracle.issues().gap(format!(
            "hook '{}' in {}: {}",
            hook.display_name(),
            ctx.deps_path,
            hook.action.join(" ")
        ))
    }
}

/// Whether `action` ends with `tail`, comparing the first tail token by file name.
///
/// `["python3", "src/build/x.py", "--y"]` ends with `["x.py", "--y"]`.
pub fn ends_with_tokens(action: &[String], tail: &[&str]) -> bool {
    if tail.is_empty() || action.len() < tail.len() {
        return false;
    }
    let start = action.len() - tail.len();
    action[start..].iter().zip(tail).enumerate().all(|(i, (a, t))| {
        a.as_str() == *t || (i == 0 && paths::file_name(a) == *t)
    })
}

/// Index of the first token whose file name is `script`.
pub fn script_index(action: &[String], script: &str) -> Option<usize> {
    action.iter().position(|a| paths::file_name(a) == script)
}

/// Value of `flag` given as `flag=value` or `flag value`.
pub fn flag_value<'a>(args: &'a [String], flag: &str) -> Option<&'a str> {
    let mut iter = args.iter();
    while let Some(arg) = iter.next() {
        if arg == flag {
            return iter.next().map(String::as_str);
        }
        if let Some(value) = arg.strip_prefix(flag).and_then(|r| r.strip_prefix('=')) {
            return Some(value);
        }
    }
    None
}
