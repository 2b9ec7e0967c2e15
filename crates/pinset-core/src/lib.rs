//! Resolution engine for pinset.
//!
//! This crate ties the schema, cache, and backends together: the `Oracle`
//! (shared registry of resolved sources with pinning and hierarchical read
//! operations), the manifest-graph `Walker`, the `HookChain` of special-case
//! handlers, fan-out/join `TaskGroup`s with cooperative cancellation, gap and
//! notice tracking, and the top-level `Resolver` that runs one resolution.

pub mod concurrency;
pub mod condition;
pub mod config;
pub mod handlers;
pub mod hooks;
pub mod issues;
pub mod oracle;
pub mod parser;
pub mod paths;
pub mod resolver;
pub mod walker;

pub use concurrency::{install_signal_handler, shutdown_requested, CancelToken, TaskGroup};
pub use config::{ParserConfig, ResolverConfig};
pub use handlers::{CipdEnsureHandler, GcsDownloadHandler, LastChangeHandler, SysrootHandler};
pub use hooks::{HookChain, HookContext, HookHandler};
pub use issues::IssueTracker;
pub use oracle::{Backends, Oracle, ResolvedVersions};
pub use parser::{CommandDepsParser, DepsParser, TomlDepsParser, TomlVenvSpecParser, VenvSpecParser};
pub use resolver::{default_hooks, ResolveOutcome, Resolver};
pub use walker::Walker;

use pinset_remote::RemoteError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CoreError {
    #[error("manifest error: {0}")]
    Manifest(#[from] pinset_schema::ManifestError),
    #[error("dependency manifest error: {0}")]
    Deps(#[from] pinset_schema::DepsError),
    #[error("ensure file error: {0}")]
    Ensure(#[from] pinset_schema::EnsureError),
    #[error("virtualenv spec error: {0}")]
    VenvSpec(#[from] pinset_schema::VenvSpecError),
    #[error("template error: {0}")]
    Template(#[from] pinset_schema::TemplateError),
    #[error("store error: {0}")]
    Store(#[from] pinset_store::StoreError),
    #[error("remote error: {0}")]
    Remote(#[from] RemoteError),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid configuration: {0}")]
    Config(String),
    #[error("{0}")]
    Resolution(String),
    #[error("hash mismatch for {object}: {detail}")]
    HashMismatch { object: String, detail: String },
    #[error("'{0}' is not provided by any pinned source")]
    NotFound(String),
    #[error("not supported: {0}")]
    Unsupported(String),
    #[error("unresolved gap (fail-fast): {0}")]
    Unresolved(String),
    #[error("cancelled")]
    Cancelled,
    #[error("{context}: {source}")]
    Context {
        context: String,
        source: Box<CoreError>,
    },
}

impl CoreError {
    /// The innermost error beneath any number of context annotations.
    pub fn root_cause(&self) -> &CoreError {
        match self {
            CoreError::Context { source, .. } => source.root_cause(),
            other => other,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self.root_cause(), CoreError::Cancelled)
    }

    /// Malformed dependency manifest, ensure file, or virtualenv spec.
    pub fn is_parse_error(&self) -> bool {
        matches!(
            self.root_cause(),
            CoreError::Deps(_) | CoreError::Ensure(_) | CoreError::VenvSpec(_)
        )
    }

    pub fn is_store_error(&self) -> bool {
        matches!(self.root_cause(), CoreError::Store(_))
            || matches!(self.root_cause(), CoreError::Remote(RemoteError::Store(_)))
    }

    pub fn is_not_found(&self) -> bool {
        matches!(
            self.root_cause(),
            CoreError::NotFound(_) | CoreError::Remote(RemoteError::NotFound(_))
        )
    }
}

/// Annotate errors with the operation and path they occurred under.
pub trait ResultExt<T> {
    fn context(self, context: impl Into<String>) -> Result<T, CoreError>;
    fn with_context(self, f: impl FnOnce() -> String) -> Result<T, CoreError>;
}

impl<T, E: Into<CoreError>> ResultExt<T> for Result<T, E> {
    fn context(self, context: impl Into<String>) -> Result<T, CoreError> {
        self.map_err(|e| CoreError::Context {
            context: context.into(),
            source: Box::new(e.into()),
        })
    }

    fn with_context(self, f: impl FnOnce() -> String) -> Result<T, CoreError> {
        self.map_err(|e| CoreError::Context {
            context: f(),
            source: Box::new(e.into()),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn context_renders_causal_chain() {
        let inner: Result<(), CoreError> = Err(CoreError::Resolution("no refs match 'x'".to_owned()));
        let err = inner
            .context("pin git src/foo")
            .context("walk src/DEPS")
            .unwrap_err();
        assert_eq!(err.to_string(), "walk src/DEPS: pin git src/foo: no refs match 'x'");
        assert!(matches!(err.root_cause(), CoreError::Resolution(_)));
    }

    #[test]
    fn classification_looks_through_context() {
        let parse: Result<(), pinset_schema::DepsError> =
            Err(pinset_schema::DepsError::UndefinedVar("v".to_owned()));
        let err = parse.context("parse src/DEPS").unwrap_err();
        assert!(err.is_parse_error());
        assert!(!err.is_store_error());

        let cancelled: Result<(), CoreError> = Err(CoreError::Cancelled);
        assert!(cancelled.context("x").unwrap_err().is_cancelled());
    }

    #[test]
    fn not_found_includes_remote_misses() {
        let e = CoreError::Remote(RemoteError::NotFound("gs://b/o".to_owned()));
        assert!(e.is_not_found());
        assert!(CoreError::NotFound("a/b".to_owned()).is_not_found());
    }
}
