//! Per-key mutual exclusion.
//!
//! Two syncs of the same instrument+adjustment must not interleave their
//! read-merge-write of the full history, but syncs of different keys must
//! not wait on each other. Each key gets its own mutex, handed out on demand
//! and dropped again once no caller holds it.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;

#[derive(Debug, Default)]
pub struct KeyLocks {
    slots: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl KeyLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// The mutex for `key`. Prefer [`KeyLocks::with_lock`], which also
    /// releases the slot afterwards.
    pub fn handle(&self, key: &str) -> Arc<Mutex<()>> {
        let mut slots = self.slots.lock();
        slots.entry(key.to_string()).or_default().clone()
    }

    /// Run `f` while holding the lock for `key`.
    ///
    /// ```ignore
    /// let history = locks.with_lock("600519.SH|qfq", || sync_history(...))?;
    /// ```
    pub fn with_lock<T>(&self, key: &str, f: impl FnOnce() -> T) -> T {
        let slot = self.handle(key);
        let out = {
            let _guard = slot.lock();
            f()
        };
        drop(slot);
        self.release(key);
        out
    }

    /// Forget `key` unless another caller still holds or waits on it.
    fn release(&self, key: &str) {
        let mut slots = self.slots.lock();
        if slots.get(key).is_some_and(|slot| Arc::strong_count(slot) == 1) {
            slots.remove(key);
        }
    }

    pub fn len(&self) -> usize {
        self.slots.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
