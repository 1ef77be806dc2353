/*!
Key-value store adapters for chunked snapshot persistence.

This module defines the store abstraction (port) and concrete implementations
(adapters). The chunking and history logic only ever talks to
[`KeyValueStore`], so the backing store can be swapped without touching it.

The port mirrors a browser-style local storage: synchronous string get/set/
remove, a key count and positional key access, and a finite capacity that
surfaces as [`PersistError::QuotaExceeded`](crate::PersistError::QuotaExceeded).
*/

pub mod local;
pub mod memory;

use crate::Result;
use std::sync::Arc;

/// Key written and removed by [`KeyValueStore::is_available`]
pub const PROBE_KEY: &str = "__canvas_persist_probe__";

/// Storage abstraction for string keys and string values
///
/// Implementations use interior mutability so a store can be shared between
/// the persistence engine and inspection tooling.
pub trait KeyValueStore: Send + Sync {
    /// Read the value stored under `key`
    ///
    /// # Returns
    /// `None` when the key is absent
    fn get(&self, key: &str) -> Result<Option<String>>;

    /// Store `value` under `key`, replacing any previous value
    ///
    /// # Errors
    /// * `PersistError::QuotaExceeded` - if the write would exceed capacity
    fn set(&self, key: &str, value: &str) -> Result<()>;

    /// Delete `key`; deleting an absent key is not an error
    fn remove(&self, key: &str) -> Result<()>;

    /// Number of keys currently stored
    fn len(&self) -> Result<usize>;

    /// Key at position `index` in the store's enumeration order
    fn key_at(&self, index: usize) -> Result<Option<String>>;

    fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    /// Collect every key starting with `prefix`
    ///
    /// The default walks `key_at(0..len)`; adapters with sorted keys override
    /// it with a range scan.
    fn keys_with_prefix(&self, prefix: &str) -> Result<Vec<String>> {
        let mut keys = Vec::new();
        for index in 0..self.len()? {
            if let Some(key) = self.key_at(index)? {
                if key.starts_with(prefix) {
                    keys.push(key);
                }
            }
        }
        Ok(keys)
    }

    /// Probe whether the store accepts writes
    fn is_available(&self) -> bool {
        self.set(PROBE_KEY, PROBE_KEY).is_ok() && self.remove(PROBE_KEY).is_ok()
    }
}

impl<S: KeyValueStore + ?Sized> KeyValueStore for Arc<S> {
    fn get(&self, key: &str) -> Result<Option<String>> {
        (**self).get(key)
    }

    fn set(&self, key: &str, value: &str) -> Result<()> {
        (**self).set(key, value)
    }

    fn remove(&self, key: &str) -> Result<()> {
        (**self).remove(key)
    }

    fn len(&self) -> Result<usize> {
        (**self).len()
    }

    fn key_at(&self, index: usize) -> Result<Option<String>> {
        (**self).key_at(index)
    }

    fn keys_with_prefix(&self, prefix: &str) -> Result<Vec<String>> {
        (**self).keys_with_prefix(prefix)
    }

    fn is_available(&self) -> bool {
        (**self).is_available()
    }
}

impl<S: KeyValueStore + ?Sized> KeyValueStore for Box<S> {
    fn get(&self, key: &str) -> Result<Option<String>> {
        (**self).get(key)
    }

    fn set(&self, key: &str, value: &str) -> Result<()> {
        (**self).set(key, value)
    }

    fn remove(&self, key: &str) -> Result<()> {
        (**self).remove(key)
    }

    fn len(&self) -> Result<usize> {
        (**self).len()
    }

    fn key_at(&self, index: usize) -> Result<Option<String>> {
        (**self).key_at(index)
    }

    fn keys_with_prefix(&self, prefix: &str) -> Result<Vec<String>> {
        (**self).keys_with_prefix(prefix)
    }

    fn is_available(&self) -> bool {
        (**self).is_available()
    }
}

/// Storage cost of one entry, in UTF-16 code units like browser storage
pub(crate) fn entry_units(key: &str, value: &str) -> usize {
    key.encode_utf16().count() + value.encode_utf16().count()
}

// Re-export types for convenience
pub use local::LocalKeyValueStore;
pub use memory::MemoryKeyValueStore;
