/*!
Directory-backed key-value store implementation.
*/

use super::KeyValueStore;
use crate::{PersistError, Result};
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

/// Local filesystem key-value store
///
/// Each key is a file under the base directory and its value is the file
/// content. Writes go to a hidden temporary file first and are renamed into
/// place, so a reader never sees a half-written value. Keys enumerate in
/// sorted order.
///
/// # Example
/// ```rust
/// use canvas_persist_core::storage::{KeyValueStore, LocalKeyValueStore};
///
/// let dir = tempfile::tempdir().unwrap();
/// let store = LocalKeyValueStore::with_base_dir(dir.path())?;
/// store.set("canvas_current_version", "1700000000000")?;
/// assert_eq!(store.len()?, 1);
/// # Ok::<(), canvas_persist_core::PersistError>(())
/// ```
#[derive(Debug, Clone)]
pub struct LocalKeyValueStore {
    base_dir: PathBuf,
    /// Optional ceiling on the total bytes of all values
    quota: Option<u64>,
}

impl LocalKeyValueStore {
    /// Open (creating if needed) a store rooted at `base_dir`
    pub fn with_base_dir<P: AsRef<Path>>(base_dir: P) -> Result<Self> {
        let base_dir = base_dir.as_ref().to_path_buf();
        fs::create_dir_all(&base_dir).map_err(|e| {
            PersistError::storage(format!(
                "Failed to create directory {}: {}",
                base_dir.display(),
                e
            ))
        })?;
        Ok(Self {
            base_dir,
            quota: None,
        })
    }

    /// Limit the total size of stored values to `quota` bytes
    pub fn with_quota(mut self, quota: u64) -> Self {
        self.quota = Some(quota);
        self
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    /// Resolve the file path for a key, rejecting anything that could escape
    /// the base directory
    fn resolve_path(&self, key: &str) -> Result<PathBuf> {
        let valid = !key.is_empty()
            && !key.starts_with('.')
            && key
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.'));
        if !valid {
            return Err(PersistError::storage(format!("Invalid store key: {key:?}")));
        }
        Ok(self.base_dir.join(key))
    }

    fn sorted_keys(&self) -> Result<Vec<String>> {
        let mut keys = Vec::new();
        for entry in fs::read_dir(&self.base_dir)? {
            let entry = entry?;
            if !entry.file_type()?.is_file() {
                continue;
            }
            if let Some(name) = entry.file_name().to_str() {
                // Temporary files are hidden
                if !name.starts_with('.') {
                    keys.push(name.to_string());
                }
            }
        }
        keys.sort();
        Ok(keys)
    }

    fn used_bytes_excluding(&self, key: &str) -> Result<u64> {
        let mut used = 0;
        for name in self.sorted_keys()? {
            if name != key {
                used += fs::metadata(self.base_dir.join(&name))?.len();
            }
        }
        Ok(used)
    }
}

impl KeyValueStore for LocalKeyValueStore {
    fn get(&self, key: &str) -> Result<Option<String>> {
        let path = self.resolve_path(key)?;
        match fs::read_to_string(&path) {
            Ok(value) => Ok(Some(value)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(PersistError::storage(format!(
                "Failed to read {}: {}",
                path.display(),
                e
            ))),
        }
    }

    fn set(&self, key: &str, value: &str) -> Result<()> {
        let path = self.resolve_path(key)?;

        if let Some(quota) = self.quota {
            let required = value.len() as u64;
            let available = quota.saturating_sub(self.used_bytes_excluding(key)?);
            if required > available {
                return Err(PersistError::QuotaExceeded {
                    key: key.to_string(),
                    required: required as usize,
                    available: available as usize,
                });
            }
        }

        let tmp_path = self.base_dir.join(format!(".{key}.tmp"));
        fs::write(&tmp_path, value).map_err(|e| {
            PersistError::storage(format!("Failed to write {}: {}", tmp_path.display(), e))
        })?;
        if let Err(e) = fs::rename(&tmp_path, &path) {
            let _ = fs::remove_file(&tmp_path);
            return Err(PersistError::storage(format!(
                "Failed to move {} into place: {}",
                path.display(),
                e
            )));
        }

        Ok(())
    }

    fn remove(&self, key: &str) -> Result<()> {
        let path = self.resolve_path(key)?;
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(PersistError::storage(format!(
                "Failed to delete {}: {}",
                path.display(),
                e
            ))),
        }
    }

    fn len(&self) -> Result<usize> {
        Ok(self.sorted_keys()?.len())
    }

    fn key_at(&self, index: usize) -> Result<Option<String>> {
        Ok(self.sorted_keys()?.into_iter().nth(index))
    }

    fn keys_with_prefix(&self, prefix: &str) -> Result<Vec<String>> {
        Ok(self
            .sorted_keys()?
            .into_iter()
            .filter(|key| key.starts_with(prefix))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_local_store_basic_operations() {
        let temp_dir = TempDir::new().unwrap();
        let store = LocalKeyValueStore::with_base_dir(temp_dir.path()).unwrap();

        store.set("canvas_state_1_chunk_0", "data:image/jpeg;base64,AAAA").unwrap();
        assert_eq!(
            store.get("canvas_state_1_chunk_0").unwrap(),
            Some("data:image/jpeg;base64,AAAA".to_string())
        );
        assert_eq!(store.len().unwrap(), 1);

        store.remove("canvas_state_1_chunk_0").unwrap();
        assert_eq!(store.get("canvas_state_1_chunk_0").unwrap(), None);
        assert!(store.remove("canvas_state_1_chunk_0").is_ok());
    }

    #[test]
    fn test_local_store_creates_nested_base_dir() {
        let temp_dir = TempDir::new().unwrap();
        let nested = temp_dir.path().join("profiles/default/canvas");
        let store = LocalKeyValueStore::with_base_dir(&nested).unwrap();

        store.set("undo_stack", "[]").unwrap();
        assert!(nested.join("undo_stack").exists());
    }

    #[test]
    fn test_local_store_enumeration_skips_temporaries() {
        let temp_dir = TempDir::new().unwrap();
        let store = LocalKeyValueStore::with_base_dir(temp_dir.path()).unwrap();
        store.set("b", "2").unwrap();
        store.set("a", "1").unwrap();
        fs::write(temp_dir.path().join(".c.tmp"), "partial").unwrap();

        assert_eq!(store.len().unwrap(), 2);
        assert_eq!(store.key_at(0).unwrap(), Some("a".to_string()));
        assert_eq!(store.keys_with_prefix("b").unwrap(), vec!["b"]);
    }

    #[test]
    fn test_local_store_rejects_path_keys() {
        let temp_dir = TempDir::new().unwrap();
        let store = LocalKeyValueStore::with_base_dir(temp_dir.path()).unwrap();

        assert!(store.set("../escape", "x").is_err());
        assert!(store.set("a/b", "x").is_err());
        assert!(store.get(".hidden").is_err());
    }

    #[test]
    fn test_local_store_quota() {
        let temp_dir = TempDir::new().unwrap();
        let store = LocalKeyValueStore::with_base_dir(temp_dir.path())
            .unwrap()
            .with_quota(8);

        store.set("a", "12345").unwrap();
        let err = store.set("b", "12345").unwrap_err();
        assert!(err.is_quota_exceeded());
        assert_eq!(store.get("b").unwrap(), None);

        // Overwriting a key does not count its old value
        store.set("a", "12345678").unwrap();
    }

    #[test]
    fn test_failed_rename_leaves_no_temporary() {
        let temp_dir = TempDir::new().unwrap();
        let store = LocalKeyValueStore::with_base_dir(temp_dir.path()).unwrap();

        // A non-empty directory in the key's place cannot be replaced by a file
        let blocked = temp_dir.path().join("canvas_current_version");
        fs::create_dir(&blocked).unwrap();
        fs::write(blocked.join("inner"), "x").unwrap();

        assert!(store.set("canvas_current_version", "42").is_err());
        assert!(!temp_dir.path().join(".canvas_current_version.tmp").exists());
    }
}
