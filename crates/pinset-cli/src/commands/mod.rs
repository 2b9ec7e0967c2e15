pub mod doctor;
pub mod inspect;
pub mod resolve;
pub mod versions;

use indicatif::{ProgressBar, ProgressStyle};
use pinset_core::CoreError;
use std::fmt;
use std::time::Duration;

pub const EXIT_SUCCESS: u8 = 0;
pub const EXIT_FAILURE: u8 = 1;
pub const EXIT_PARSE_ERROR: u8 = 2;
pub const EXIT_STORE_ERROR: u8 = 3;
pub const EXIT_GAPS: u8 = 4;

/// A failed command: the message for stderr and the process exit code.
#[derive(Debug)]
pub struct Failure {
    pub code: u8,
    pub message: String,
}

impl fmt::Display for Failure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

impl From<String> for Failure {
    fn from(message: String) -> Self {
        Self {
            code: EXIT_FAILURE,
            message,
        }
    }
}

impl From<CoreError> for Failure {
    fn from(err: CoreError) -> Self {
        Self {
            code: exit_code(&err),
            message: err.to_string(),
        }
    }
}

pub fn exit_code(err: &CoreError) -> u8 {
    if err.is_parse_error() {
        EXIT_PARSE_ERROR
    } else if err.is_store_error() {
        EXIT_STORE_ERROR
    } else {
        EXIT_FAILURE
    }
}

pub fn json_pretty(value: &impl serde::Serialize) -> Result<String, String> {
    serde_json::to_string_pretty(value).map_err(|e| format!("JSON serialization failed: {e}"))
}

fn plain_style() -> ProgressStyle {
    ProgressStyle::with_template("{msg}").unwrap_or_else(|_| ProgressStyle::default_spinner())
}

pub fn spinner(msg: &str) -> ProgressBar {
    let style = ProgressStyle::with_template("{spinner:.cyan} {msg}")
        .unwrap_or_else(|_| ProgressStyle::default_spinner())
        .tick_strings(&["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏"]);
    let pb = ProgressBar::new_spinner();
    pb.set_style(style);
    pb.set_message(msg.to_owned());
    pb.enable_steady_tick(Duration::from_millis(80));
    pb
}

pub fn spin_ok(pb: &ProgressBar, msg: &str) {
    pb.set_style(plain_style());
    pb.finish_with_message(format!("✓ {msg}"));
}

pub fn spin_fail(pb: &ProgressBar, msg: &str) {
    pb.set_style(plain_style());
    pb.finish_with_message(format!("✗ {msg}"));
}

pub fn colorize_kind(kind: &str) -> String {
    use console::Style;
    match kind {
        "git" => Style::new().green().apply_to(kind).to_string(),
        "package" => Style::new().cyan().apply_to(kind).to_string(),
        "blob" | "archive" => Style::new().blue().apply_to(kind).to_string(),
        "raw" => Style::new().yellow().apply_to(kind).to_string(),
        other => other.to_owned(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn json_pretty_serializes_object() {
        let val = serde_json::json!({"key": "value"});
        let result = json_pretty(&val).unwrap();
        assert!(result.contains("\"key\""));
        assert!(result.contains("\"value\""));
    }

    #[test]
    fn colorize_keeps_kind_text() {
        for kind in ["git", "package", "blob", "archive", "raw"] {
            assert!(colorize_kind(kind).contains(kind));
        }
        assert_eq!(colorize_kind("other"), "other");
    }

    #[test]
    fn exit_codes_are_distinct() {
        let codes = [
            EXIT_SUCCESS,
            EXIT_FAILURE,
            EXIT_PARSE_ERROR,
            EXIT_STORE_ERROR,
            EXIT_GAPS,
        ];
        for (i, a) in codes.iter().enumerate() {
            for b in &codes[i + 1..] {
                assert_ne!(a, b);
            }
        }
    }

    #[test]
    fn failures_classify_core_errors() {
        let parse = CoreError::Context {
            context: "parse src/DEPS".to_owned(),
            source: Box::new(CoreError::Deps(pinset_schema::DepsError::UndefinedVar(
                "x".to_owned(),
            ))),
        };
        assert_eq!(Failure::from(parse).code, EXIT_PARSE_ERROR);

        let store = CoreError::Store(pinset_store::StoreError::LockFailed("busy".to_owned()));
        assert_eq!(Failure::from(store).code, EXIT_STORE_ERROR);

        let other = Failure::from(CoreError::NotFound("src/x".to_owned()));
        assert_eq!(other.code, EXIT_FAILURE);
        assert!(other.message.contains("src/x"));
    }

    #[test]
    fn spinner_finishes() {
        let pb = spinner("testing...");
        spin_ok(&pb, "done");
        let pb = spinner("testing...");
        spin_fail(&pb, "failed");
    }
}
