use crate::CoreError;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tracing::debug;

static SHUTDOWN_REQUESTED: AtomicBool = AtomicBool::new(false);

pub fn install_signal_handler() {
    let _ = ctrlc::set_handler(move || {
        if SHUTDOWN_REQUESTED.load(Ordering::SeqCst) {
            std::process::exit(1);
        }
        SHUTDOWN_REQUESTED.store(true, Ordering::SeqCst);
        eprintln!("\nshutdown requested, waiting for running lookups...");
    });
}

pub fn shutdown_requested() -> bool {
    SHUTDOWN_REQUESTED.load(Ordering::SeqCst)
}

#[derive(Debug, Default)]
struct TokenInner {
    cancelled: AtomicBool,
    parent: Option<CancelToken>,
}

/// Cooperative cancellation flag shared by one fan-out/join group.
///
/// A token reports cancelled when it, any ancestor, or the process-wide
/// shutdown flag is set. Cancelling a token never affects its parent.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    inner: Arc<TokenInner>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn child(&self) -> Self {
        Self {
            inner: Arc::new(TokenInner {
                cancelled: AtomicBool::new(false),
                parent: Some(self.clone()),
            }),
        }
    }

    pub fn cancel(&self) {
        self.inner.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        shutdown_requested()
            || self.inner.cancelled.load(Ordering::SeqCst)
            || self
                .inner
                .parent
                .as_ref()
                .is_some_and(CancelToken::is_cancelled)
    }

    /// `Err(Cancelled)` once cancellation was requested; call before starting I/O.
    pub fn check(&self) -> Result<(), CoreError> {
        if self.is_cancelled() {
            Err(CoreError::Cancelled)
        } else {
            Ok(())
        }
    }
}

type Task<'a> = Box<dyn FnOnce(&CancelToken) -> Result<(), CoreError> + Send + 'a>;

/// Fan-out/join group of tasks running on scoped threads.
///
/// The first failing task cancels the group's token; tasks that already
/// started run to completion. `wait` returns once every task finished, with
/// the first real error (a `Cancelled` never masks it).
pub struct TaskGroup<'a> {
    token: CancelToken,
    tasks: Vec<Task<'a>>,
}

impl<'a> TaskGroup<'a> {
    pub fn new(parent: &CancelToken) -> Self {
        Self {
            token: parent.child(),
            tasks: Vec::new(),
        }
    }

    pub fn spawn(
        &mut self,
        task: impl FnOnce(&CancelToken) -> Result<(), CoreError> + Send + 'a,
    ) {
        self.tasks.push(Box::new(task));
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    pub fn wait(self) -> Result<(), CoreError> {
        let first: Mutex<Option<CoreError>> = Mutex::new(None);
        let token = &self.token;

        if self.tasks.len() <= 1 {
            // Run inline; a thread buys nothing for a single task.
            return match self.tasks.into_iter().next() {
                Some(task) => token.check().and_then(|()| task(token)),
                None => Ok(()),
            };
        }

        std::thread::scope(|s| {
            let handles: Vec<_> = self
                .tasks
                .into_iter()
                .map(|task| {
                    let first = &first;
                    s.spawn(move || {
                        if let Err(e) = token.check().and_then(|()| task(token)) {
                            token.cancel();
                            record_error(first, e);
                        }
                    })
                })
                .collect();
            for handle in handles {
                if handle.join().is_err() {
                    token.cancel();
                    record_error(&first, CoreError::Resolution("task panicked".to_owned()));
                }
            }
        });

        match first.into_inner().unwrap_or_else(PoisonError::into_inner) {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

fn record_error(slot: &Mutex<Option<CoreError>>, err: CoreError) {
    let mut slot = slot.lock().unwrap_or_else(PoisonError::into_inner);
    match slot.as_ref() {
        None => *slot = Some(err),
        Some(existing) if existing.is_cancelled() && !err.is_cancelled() => *slot = Some(err),
        Some(_) => debug!("additional task failure: {err}"),
    }
}
