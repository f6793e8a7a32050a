//! Per-slug mutual exclusion for version allocation.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use codepad_core::Slug;

/// Lazily created lock per slug; entries are dropped once uncontended.
#[derive(Default)]
pub(crate) struct SlugLocks {
    locks: Mutex<HashMap<Slug, Arc<Mutex<()>>>>,
}

impl SlugLocks {
    /// Run `f` while holding the lock for `slug`.
    pub(crate) fn with_lock<T>(&self, slug: &Slug, f: impl FnOnce() -> T) -> T {
        let entry = {
            let mut map = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
            map.entry(slug.clone()).or_default().clone()
        };

        let out = {
            let _guard = entry.lock().unwrap_or_else(PoisonError::into_inner);
            f()
        };

        // Map + our clone: nobody else is waiting on this slug.
        let mut map = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
        if Arc::strong_count(&entry) == 2 {
            map.remove(slug);
        }
        out
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.locks.lock().unwrap_or_else(PoisonError::into_inner).len()
    }
}
