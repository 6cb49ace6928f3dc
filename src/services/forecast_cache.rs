use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::models::forecast::{ArrayForecastResult, CacheEntry, FailureRecord};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PutOutcome {
    Stored,
    /// An entry with the same or a newer `computed_at` is already cached.
    Superseded,
}

/// Point-in-time copy of the cache used by read-side computations.
#[derive(Debug, Clone, Default)]
pub struct CacheSnapshot {
    pub entries: HashMap<String, CacheEntry>,
    pub pending_failures: HashMap<String, FailureRecord>,
}

impl CacheSnapshot {
    pub fn last_failure(&self, name: &str) -> Option<&FailureRecord> {
        match self.entries.get(name) {
            Some(entry) => entry.last_error.as_ref(),
            None => self.pending_failures.get(name),
        }
    }
}

#[derive(Debug, Default)]
struct CacheState {
    entries: HashMap<String, CacheEntry>,
    /// Last failure of arrays that have never refreshed successfully
    pending_failures: HashMap<String, FailureRecord>,
}

/// Last good forecast per array.
///
/// Entries are replaced whole under the write lock, so a reader sees either the
/// previous or the new entry of an array, never a mix. Absence of an entry means
/// the array never refreshed successfully.
#[derive(Debug, Clone, Default)]
pub struct ForecastCache {
    inner: Arc<RwLock<CacheState>>,
}

impl ForecastCache {
    pub fn new() -> Self {
        Self::default()
    }

    // Every critical section leaves the state consistent, so a poisoned lock is still usable.
    fn read(&self) -> RwLockReadGuard<'_, CacheState> {
        self.inner.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, CacheState> {
        self.inner.write().unwrap_or_else(PoisonError::into_inner)
    }

    #[cfg(test)]
    pub fn get(&self, name: &str) -> Option<CacheEntry> {
        self.read().entries.get(name).cloned()
    }

    /// Stores a successful result unless the cached one is at least as new.
    pub fn put(&self, name: &str, result: ArrayForecastResult) -> PutOutcome {
        let mut state = self.write();

        let last_error = match state.entries.get(name) {
            Some(existing) if existing.result.computed_at >= result.computed_at => {
                return PutOutcome::Superseded;
            }
            Some(existing) => existing.last_error.clone(),
            None => state.pending_failures.remove(name),
        };

        let entry = CacheEntry {
            last_success_at: result.computed_at,
            result: Arc::new(result),
            last_error,
        };
        state.entries.insert(name.to_string(), entry);
        PutOutcome::Stored
    }

    /// Records a failed refresh. Returns `true` when a previous successful
    /// forecast exists and keeps being served.
    pub fn mark_failed(&self, name: &str, failure: FailureRecord) -> bool {
        let mut state = self.write();
        match state.entries.get_mut(name) {
            Some(entry) => {
                entry.last_error = Some(failure);
                true
            }
            None => {
                state.pending_failures.insert(name.to_string(), failure);
                false
            }
        }
    }

    /// Most recent failure of an array, with or without cached data.
    #[cfg(test)]
    pub fn last_failure(&self, name: &str) -> Option<FailureRecord> {
        let state = self.read();
        match state.entries.get(name) {
            Some(entry) => entry.last_error.clone(),
            None => state.pending_failures.get(name).cloned(),
        }
    }

    /// Drops every array for which `keep` returns false.
    pub fn retain(&self, keep: impl Fn(&str) -> bool) {
        let mut state = self.write();
        state.entries.retain(|name, _| keep(name));
        state.pending_failures.retain(|name, _| keep(name));
    }

    pub fn snapshot(&self) -> CacheSnapshot {
        let state = self.read();
        CacheSnapshot {
            entries: state.entries.clone(),
            pending_failures: state.pending_failures.clone(),
        }
    }

    pub fn len(&self) -> usize {
        self.read().entries.len()
    }
}
