//! Query result cache.
//!
//! Results are cached under the rendered query text. Each entry owns an async
//! lock so that concurrent cache misses for the same query coalesce into a
//! single database fetch, while fetches for different queries proceed in
//! parallel. Eviction is LRU over insertion order, and staleness is judged
//! against each entry's own max_age, with a twist: an entry that is stale by
//! its own max_age but fresh by a caller's larger max_age is adopted by the
//! caller and its max_age extended in place.

use crate::rows::{Cell, Column};
use indexmap::IndexMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tracing::debug;

/// Default max_age for placeholder entries created by `get_lock`, before the
/// populating fetch stores a result with the caller's real max_age.
const PLACEHOLDER_MAX_AGE: Duration = Duration::from_secs(60);

/// A fully decoded result set, shared between the cache and its readers.
#[derive(Debug)]
pub struct CachedResult {
    pub columns: Arc<Vec<Column>>,
    pub rows: Vec<Vec<Cell>>,
}

#[derive(Debug)]
struct EntryState {
    max_age: Duration,
    created_at: Instant,
    /// None while the entry is a placeholder awaiting its first population.
    result: Option<Arc<CachedResult>>,
}

/// One cache slot. The async lock serializes population; the state mutex
/// guards freshness bookkeeping.
#[derive(Debug)]
pub struct CacheEntry {
    query: String,
    lock: tokio::sync::Mutex<()>,
    state: Mutex<EntryState>,
}

impl CacheEntry {
    fn placeholder(query: &str) -> Self {
        Self {
            query: query.to_string(),
            lock: tokio::sync::Mutex::new(()),
            state: Mutex::new(EntryState {
                max_age: PLACEHOLDER_MAX_AGE,
                created_at: Instant::now(),
                result: None,
            }),
        }
    }

    /// Acquire this entry's population lock.
    pub async fn lock(&self) -> tokio::sync::MutexGuard<'_, ()> {
        self.lock.lock().await
    }

    fn state(&self) -> MutexGuard<'_, EntryState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn is_stale(&self) -> bool {
        let state = self.state();
        state.created_at.elapsed() > state.max_age
    }

    /// Shift this entry's creation time into the past. Freshness tests use
    /// this instead of sleeping.
    #[cfg(test)]
    pub(crate) fn backdate(&self, by: Duration) {
        let mut state = self.state();
        if let Some(t) = state.created_at.checked_sub(by) {
            state.created_at = t;
        }
    }
}

/// Query-text-keyed result cache with per-entry population locks.
#[derive(Debug)]
pub struct QueryCache {
    entries: Mutex<IndexMap<String, Arc<CacheEntry>>>,
    max_size: usize,
}

impl QueryCache {
    pub fn new(max_size: usize) -> Self {
        Self {
            entries: Mutex::new(IndexMap::new()),
            max_size,
        }
    }

    fn entries(&self) -> MutexGuard<'_, IndexMap<String, Arc<CacheEntry>>> {
        match self.entries.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Look up a populated, fresh entry. An entry stale by its own max_age
    /// but fresh by the caller's is adopted: its max_age is raised to the
    /// caller's and the hit stands.
    pub fn lookup(&self, key: &str, max_age: Duration) -> Option<Arc<CachedResult>> {
        let entry = self.entries().get(key).cloned()?;
        let mut state = entry.state();
        let result = state.result.clone()?;
        let age = state.created_at.elapsed();
        if age > state.max_age {
            if age <= max_age {
                state.max_age = max_age;
            } else {
                return None;
            }
        }
        Some(result)
    }

    /// Get the entry for a key, creating a placeholder if absent. Callers
    /// acquire the entry's lock, re-check `lookup`, and populate on miss.
    pub fn get_lock(&self, key: &str) -> Arc<CacheEntry> {
        let mut entries = self.entries();
        if let Some(entry) = entries.get(key) {
            return entry.clone();
        }
        let entry = Arc::new(CacheEntry::placeholder(key));
        entries.insert(key.to_string(), entry.clone());
        entry
    }

    /// Store a result into an entry and (re)insert the entry at the fresh end
    /// of the LRU order, evicting from the stale end past capacity.
    pub fn insert(
        &self,
        key: &str,
        entry: &Arc<CacheEntry>,
        max_age: Duration,
        result: Arc<CachedResult>,
    ) {
        {
            let mut state = entry.state();
            state.max_age = max_age;
            state.created_at = Instant::now();
            state.result = Some(result);
        }
        let mut entries = self.entries();
        entries.shift_remove(key);
        entries.insert(key.to_string(), entry.clone());
        while entries.len() > self.max_size {
            if let Some((evicted, _)) = entries.shift_remove_index(0) {
                debug!(query = %evicted, "evicted cache entry");
            }
        }
    }

    /// Remove an entry under its own lock. If a different entry has raced
    /// into the slot since, the newcomer is restored. With `blocking` false,
    /// a busy entry is skipped rather than waited on.
    pub async fn pop_entry(&self, entry: &Arc<CacheEntry>, blocking: bool) {
        let _guard = if blocking {
            entry.lock.lock().await
        } else {
            match entry.lock.try_lock() {
                Ok(guard) => guard,
                Err(_) => return,
            }
        };
        let mut entries = self.entries();
        if let Some(popped) = entries.shift_remove(&entry.query) {
            if !Arc::ptr_eq(&popped, entry) {
                entries.insert(popped.query.clone(), popped);
            }
        }
    }

    /// Drop every stale entry, skipping entries whose lock is held.
    pub async fn prune(&self) {
        let snapshot: Vec<Arc<CacheEntry>> = self.entries().values().cloned().collect();
        for entry in snapshot {
            if entry.is_stale() {
                self.pop_entry(&entry, false).await;
            }
        }
    }

    /// Remove every entry unconditionally.
    pub fn clear(&self) {
        self.entries().clear();
    }

    pub fn len(&self) -> usize {
        self.entries().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rows::Cell;
    use serde_json::json;

    fn result(rows: usize) -> Arc<CachedResult> {
        Arc::new(CachedResult {
            columns: Arc::new(vec![Column {
                name: "n".to_string(),
                type_name: "int4".to_string(),
            }]),
            rows: (0..rows).map(|i| vec![Cell::from(json!(i))]).collect(),
        })
    }

    fn populate(cache: &QueryCache, key: &str, max_age: Duration) -> Arc<CacheEntry> {
        let entry = cache.get_lock(key);
        cache.insert(key, &entry, max_age, result(1));
        entry
    }

    #[test]
    fn test_placeholder_is_not_a_hit() {
        let cache = QueryCache::new(8);
        cache.get_lock("SELECT 1");
        assert!(cache.lookup("SELECT 1", Duration::from_secs(5)).is_none());
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_populated_entry_hits_while_fresh() {
        let cache = QueryCache::new(8);
        populate(&cache, "SELECT 1", Duration::from_secs(5));
        assert!(cache.lookup("SELECT 1", Duration::from_secs(5)).is_some());
    }

    #[test]
    fn test_stale_entry_misses() {
        let cache = QueryCache::new(8);
        let entry = populate(&cache, "SELECT 1", Duration::from_secs(5));
        entry.backdate(Duration::from_secs(10));
        assert!(cache.lookup("SELECT 1", Duration::from_secs(5)).is_none());
    }

    #[test]
    fn test_larger_caller_max_age_adopts_stale_entry() {
        let cache = QueryCache::new(8);
        let entry = populate(&cache, "SELECT 1", Duration::from_secs(5));
        entry.backdate(Duration::from_secs(10));
        // Stale by its own max_age, fresh by the caller's larger one.
        assert!(cache.lookup("SELECT 1", Duration::from_secs(60)).is_some());
        // The extension is monotonic: the original max_age no longer misses.
        assert!(cache.lookup("SELECT 1", Duration::from_secs(30)).is_some());
    }

    #[test]
    fn test_lru_eviction_past_capacity() {
        let cache = QueryCache::new(2);
        populate(&cache, "a", Duration::from_secs(60));
        populate(&cache, "b", Duration::from_secs(60));
        populate(&cache, "c", Duration::from_secs(60));
        assert_eq!(cache.len(), 2);
        assert!(cache.lookup("a", Duration::from_secs(60)).is_none());
        assert!(cache.lookup("b", Duration::from_secs(60)).is_some());
        assert!(cache.lookup("c", Duration::from_secs(60)).is_some());
    }

    #[test]
    fn test_reinsert_moves_entry_to_fresh_end() {
        let cache = QueryCache::new(2);
        populate(&cache, "a", Duration::from_secs(60));
        populate(&cache, "b", Duration::from_secs(60));
        populate(&cache, "a", Duration::from_secs(60));
        populate(&cache, "c", Duration::from_secs(60));
        // "b" was the stale end after "a" was refreshed.
        assert!(cache.lookup("b", Duration::from_secs(60)).is_none());
        assert!(cache.lookup("a", Duration::from_secs(60)).is_some());
    }

    #[tokio::test]
    async fn test_pop_entry_removes_own_entry() {
        let cache = QueryCache::new(8);
        let entry = populate(&cache, "a", Duration::from_secs(60));
        cache.pop_entry(&entry, true).await;
        assert!(cache.is_empty());
    }

    #[tokio::test]
    async fn test_pop_entry_restores_raced_in_stranger() {
        let cache = QueryCache::new(8);
        let old = populate(&cache, "a", Duration::from_secs(60));
        cache.clear();
        let new = populate(&cache, "a", Duration::from_secs(60));
        cache.pop_entry(&old, true).await;
        assert_eq!(cache.len(), 1);
        assert!(Arc::ptr_eq(&cache.get_lock("a"), &new));
    }

    #[tokio::test]
    async fn test_non_blocking_pop_skips_locked_entry() {
        let cache = QueryCache::new(8);
        let entry = populate(&cache, "a", Duration::from_secs(60));
        let _held = entry.lock().await;
        cache.pop_entry(&entry, false).await;
        assert_eq!(cache.len(), 1);
    }

    #[tokio::test]
    async fn test_prune_drops_only_stale_entries() {
        let cache = QueryCache::new(8);
        let stale = populate(&cache, "old", Duration::from_secs(5));
        stale.backdate(Duration::from_secs(10));
        populate(&cache, "fresh", Duration::from_secs(60));
        cache.prune().await;
        assert_eq!(cache.len(), 1);
        assert!(cache.lookup("fresh", Duration::from_secs(60)).is_some());
    }

    #[test]
    fn test_clear() {
        let cache = QueryCache::new(8);
        populate(&cache, "a", Duration::from_secs(60));
        cache.clear();
        assert!(cache.is_empty());
    }
}
