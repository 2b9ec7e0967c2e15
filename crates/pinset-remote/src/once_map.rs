use std::collections::HashMap;
use std::sync::{Arc, Mutex, OnceLock, PoisonError};

/// Keyed at-most-once computation.
///
/// Concurrent callers for the same key block on a single initializer and all
/// observe its result, including a failure. The map lock is held only to look
/// up the per-key cell, never while the initializer runs.
pub struct OnceMap<V> {
    cells: Mutex<HashMap<String, Arc<OnceLock<Result<V, String>>>>>,
}

impl<V> Default for OnceMap<V> {
    fn default() -> Self {
        Self {
            cells: Mutex::new(HashMap::new()),
        }
    }
}

impl<V: Clone> OnceMap<V> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get_or_init(
        &self,
        key: &str,
        init: impl FnOnce() -> Result<V, String>,
    ) -> Result<V, String> {
        let cell = {
            let mut cells = self.cells.lock().unwrap_or_else(PoisonError::into_inner);
            Arc::clone(cells.entry(key.to_owned()).or_default())
        };
        cell.get_or_init(init).clone()
    }

    /// Completed result for `key`, if any.
    pub fn get(&self, key: &str) -> Option<Result<V, String>> {
        let cells = self.cells.lock().unwrap_or_else(PoisonError::into_inner);
        cells.get(key).and_then(|c| c.get().cloned())
    }

    pub fn len(&self) -> usize {
        self.cells
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn initializer_runs_once_per_key() {
        let map = OnceMap::new();
        let calls = AtomicUsize::new(0);
        for _ in 0..3 {
            let v = map.get_or_init("k", || {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(42)
            });
            assert_eq!(v, Ok(42));
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(map.len(), 1);
    }

    #[test]
    fn failure_is_memoized() {
        let map: OnceMap<u32> = OnceMap::new();
        assert!(map.get_or_init("k", || Err("boom".to_owned())).is_err());
        let again = map.get_or_init("k", || Ok(1));
        assert_eq!(again, Err("boom".to_owned()));
    }

    #[test]
    fn concurrent_callers_share_one_result() {
        let map = OnceMap::new();
        let calls = AtomicUsize::new(0);
        std::thread::scope(|s| {
            for _ in 0..8 {
                s.spawn(|| {
                    let v = map.get_or_init("shared", || {
                        calls.fetch_add(1, Ordering::SeqCst);
                        std::thread::sleep(std::time::Duration::from_millis(20));
                        Ok("value".to_owned())
                    });
                    assert_eq!(v.as_deref(), Ok("value"));
                });
            }
        });
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(map.get("shared"), Some(Ok("value".to_owned())));
        assert!(map.get("other").is_none());
    }
}
