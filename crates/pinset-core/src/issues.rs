use crate::CoreError;
use std::collections::HashSet;
use std::sync::{Mutex, PoisonError};
use tracing::{info, warn};

/// Central record of unresolved gaps and soft-assumption notices.
///
/// Gaps never travel as errors unless fail-fast is set, in which case the
/// first one is returned as `CoreError::Unresolved`. Notices are logged once
/// per distinct message.
#[derive(Debug, Default)]
pub struct IssueTracker {
    fail_fast: bool,
    gaps: Mutex<Vec<String>>,
    notices: Mutex<Vec<String>>,
    seen_notices: Mutex<HashSet<String>>,
}

impl IssueTracker {
    pub fn new(fail_fast: bool) -> Self {
        Self {
            fail_fast,
            ..Self::default()
        }
    }

    pub fn fail_fast(&self) -> bool {
        self.fail_fast
    }

    /// Record an unresolved gap.
    pub fn gap(&self, what: impl Into<String>) -> Result<(), CoreError> {
        let what = what.into();
        warn!("unresolved: {what}");
        self.gaps
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(what.clone());
        if self.fail_fast {
            return Err(CoreError::Unresolved(what));
        }
        Ok(())
    }

    pub fn notice(&self, message: impl Into<String>) {
        let message = message.into();
        let fresh = self
            .seen_notices
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(message.clone());
        if fresh {
            info!("note: {message}");
            self.notices
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .push(message);
        }
    }

    pub fn gap_count(&self) -> usize {
        self.gaps
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn gaps(&self) -> Vec<String> {
        self.gaps
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn notices(&self) -> Vec<String> {
        self.notices
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}
