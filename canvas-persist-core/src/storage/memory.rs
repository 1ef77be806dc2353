/*!
In-memory key-value store with a browser-like capacity ceiling.
*/

use super::{entry_units, KeyValueStore};
use crate::config::DEFAULT_MEMORY_QUOTA;
use crate::{PersistError, Result};
use std::collections::BTreeMap;
use std::ops::Bound;
use std::sync::{Mutex, MutexGuard};

#[derive(Debug, Default)]
struct Entries {
    map: BTreeMap<String, String>,
    used: usize,
}

/// Memory-based key-value store
///
/// Keys enumerate in sorted order. Every entry costs the UTF-16 length of its
/// key plus its value; a write that would push the total over the quota fails
/// with `PersistError::QuotaExceeded` and leaves the store unchanged.
///
/// # Example
/// ```rust
/// use canvas_persist_core::storage::{KeyValueStore, MemoryKeyValueStore};
///
/// let store = MemoryKeyValueStore::with_quota(16);
/// store.set("k", "small")?;
/// assert!(store.set("big", &"x".repeat(64)).is_err());
/// # Ok::<(), canvas_persist_core::PersistError>(())
/// ```
#[derive(Debug)]
pub struct MemoryKeyValueStore {
    entries: Mutex<Entries>,
    quota: usize,
}

impl MemoryKeyValueStore {
    /// Create a store with the default 5 MiB quota
    pub fn new() -> Self {
        Self::with_quota(DEFAULT_MEMORY_QUOTA)
    }

    /// Create a store holding at most `quota` UTF-16 code units
    pub fn with_quota(quota: usize) -> Self {
        Self {
            entries: Mutex::new(Entries::default()),
            quota,
        }
    }

    /// Units currently consumed
    pub fn used(&self) -> usize {
        self.lock().map(|entries| entries.used).unwrap_or(0)
    }

    pub fn quota(&self) -> usize {
        self.quota
    }

    fn lock(&self) -> Result<MutexGuard<'_, Entries>> {
        self.entries
            .lock()
            .map_err(|_| PersistError::storage("memory store lock poisoned"))
    }
}

impl Default for MemoryKeyValueStore {
    fn default() -> Self {
        Self::new()
    }
}

impl KeyValueStore for MemoryKeyValueStore {
    fn get(&self, key: &str) -> Result<Option<String>> {
        Ok(self.lock()?.map.get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> Result<()> {
        let mut entries = self.lock()?;
        let released = entries
            .map
            .get(key)
            .map_or(0, |old| entry_units(key, old));
        let required = entry_units(key, value);
        let available = self.quota - (entries.used - released);

        if required > available {
            return Err(PersistError::QuotaExceeded {
                key: key.to_string(),
                required,
                available,
            });
        }

        entries.used = entries.used - released + required;
        entries.map.insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<()> {
        let mut entries = self.lock()?;
        if let Some(old) = entries.map.remove(key) {
            entries.used -= entry_units(key, &old);
        }
        Ok(())
    }

    fn len(&self) -> Result<usize> {
        Ok(self.lock()?.map.len())
    }

    fn key_at(&self, index: usize) -> Result<Option<String>> {
        Ok(self.lock()?.map.keys().nth(index).cloned())
    }

    fn keys_with_prefix(&self, prefix: &str) -> Result<Vec<String>> {
        let entries = self.lock()?;
        Ok(entries
            .map
            .range::<str, _>((Bound::Included(prefix), Bound::Unbounded))
            .map(|(key, _)| key)
            .take_while(|key| key.starts_with(prefix))
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memory_store_basic_operations() {
        let store = MemoryKeyValueStore::new();

        store.set("undo_stack", "[1,2]").unwrap();
        assert_eq!(store.get("undo_stack").unwrap(), Some("[1,2]".to_string()));
        assert_eq!(store.len().unwrap(), 1);

        store.remove("undo_stack").unwrap();
        assert_eq!(store.get("undo_stack").unwrap(), None);
        assert_eq!(store.used(), 0);

        // Removing an absent key is fine
        assert!(store.remove("missing").is_ok());
    }

    #[test]
    fn test_memory_store_sorted_enumeration() {
        let store = MemoryKeyValueStore::new();
        store.set("b", "2").unwrap();
        store.set("a", "1").unwrap();
        store.set("c", "3").unwrap();

        assert_eq!(store.key_at(0).unwrap(), Some("a".to_string()));
        assert_eq!(store.key_at(2).unwrap(), Some("c".to_string()));
        assert_eq!(store.key_at(3).unwrap(), None);
    }

    #[test]
    fn test_memory_store_prefix_range_scan() {
        let store = MemoryKeyValueStore::new();
        for key in [
            "canvas_current_version",
            "canvas_state_1_chunk_0",
            "canvas_state_1_chunks",
            "canvas_state_2_chunks",
            "undo_stack",
        ] {
            store.set(key, "v").unwrap();
        }

        let keys = store.keys_with_prefix("canvas_state_1_chunk").unwrap();
        assert_eq!(keys, vec!["canvas_state_1_chunk_0", "canvas_state_1_chunks"]);
        assert!(store.keys_with_prefix("zzz").unwrap().is_empty());
        assert_eq!(store.keys_with_prefix("").unwrap().len(), 5);
    }

    #[test]
    fn test_memory_store_quota_rejects_and_preserves() {
        let store = MemoryKeyValueStore::with_quota(10);
        store.set("k", "12345").unwrap();
        assert_eq!(store.used(), 6);

        let err = store.set("other", "123456").unwrap_err();
        assert!(err.is_quota_exceeded());
        assert_eq!(store.get("other").unwrap(), None);
        assert_eq!(store.used(), 6);
    }

    #[test]
    fn test_memory_store_overwrite_releases_old_cost() {
        let store = MemoryKeyValueStore::with_quota(10);
        store.set("k", "123456789").unwrap();
        // Replacing the value only needs room for the difference
        store.set("k", "987654321").unwrap();
        assert_eq!(store.used(), 10);

        store.set("k", "1").unwrap();
        assert_eq!(store.used(), 2);
    }
}
