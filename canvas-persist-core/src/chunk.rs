/*!
Chunked payload storage.

A payload is split into chunks of at most `chunk_size` characters, written
under `{namespace}_chunk_{i}`, and followed by the chunk count under
`{namespace}_chunks`. Reassembly is ordered concatenation; the count is the
only metadata.
*/

use crate::keys;
use crate::storage::KeyValueStore;
use crate::{PersistError, Result};
use tracing::{debug, warn};

/// Split `payload` into consecutive slices of at most `chunk_size` chars
///
/// Boundaries always fall on `char` boundaries. An empty payload yields no
/// chunks.
pub fn split_into_chunks(payload: &str, chunk_size: usize) -> Vec<&str> {
    let chunk_size = chunk_size.max(1);
    let mut chunks = Vec::with_capacity(payload.len() / chunk_size + 1);
    let mut start = 0;
    let mut taken = 0;

    for (offset, _) in payload.char_indices() {
        if taken == chunk_size {
            chunks.push(&payload[start..offset]);
            start = offset;
            taken = 0;
        }
        taken += 1;
    }
    if taken > 0 {
        chunks.push(&payload[start..]);
    }
    chunks
}

/// Chunk store over a [`KeyValueStore`]
#[derive(Debug)]
pub struct ChunkStore<S> {
    store: S,
    chunk_size: usize,
}

impl<S: KeyValueStore> ChunkStore<S> {
    pub fn new(store: S, chunk_size: usize) -> Self {
        Self {
            store,
            chunk_size: chunk_size.max(1),
        }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    /// Persist `payload` under `namespace`
    ///
    /// Every entry previously written under the namespace is removed first,
    /// so a shorter payload never leaves stale trailing chunks behind. On a
    /// store error the chunks written so far are removed again and the error
    /// is returned; the count entry is written last, so an interrupted save
    /// never reads back as a valid record.
    ///
    /// # Returns
    /// The number of chunks written
    pub fn save(&self, namespace: &str, payload: &str) -> Result<usize> {
        self.clear_family(namespace)?;

        let chunks = split_into_chunks(payload, self.chunk_size);
        for (index, chunk) in chunks.iter().enumerate() {
            if let Err(e) = self.store.set(&keys::chunk_key(namespace, index), chunk) {
                warn!(key = namespace, chunk = index, error = %e, "chunk write failed");
                self.discard_written(namespace, index);
                return Err(e);
            }
        }

        if let Err(e) = self
            .store
            .set(&keys::count_key(namespace), &chunks.len().to_string())
        {
            warn!(key = namespace, error = %e, "chunk count write failed");
            self.discard_written(namespace, chunks.len());
            return Err(e);
        }

        #[cfg(feature = "metrics")]
        {
            let metrics = crate::observability::PersistMetrics::global();
            metrics.record_chunks_written(chunks.len());
            metrics.record_payload_size(payload.len());
        }

        debug!(key = namespace, chunks = chunks.len(), "payload stored");
        Ok(chunks.len())
    }

    /// Reassemble the payload stored under `namespace`
    ///
    /// A missing chunk contributes nothing and is logged; the remaining
    /// chunks are still returned in order.
    ///
    /// # Returns
    /// `None` when no count entry exists
    ///
    /// # Errors
    /// * `PersistError::InvalidFormat` - if the count entry is not a number
    pub fn load(&self, namespace: &str) -> Result<Option<String>> {
        let Some(count) = self.chunk_count(namespace)? else {
            return Ok(None);
        };

        let mut payload = String::new();
        for index in 0..count {
            match self.store.get(&keys::chunk_key(namespace, index))? {
                Some(chunk) => payload.push_str(&chunk),
                None => warn!(key = namespace, chunk = index, count, "missing chunk"),
            }
        }
        Ok(Some(payload))
    }

    /// Delete every chunk and the count entry of `namespace`
    ///
    /// No-op when the count entry is absent.
    pub fn remove(&self, namespace: &str) -> Result<()> {
        match self.chunk_count(namespace) {
            Ok(None) => Ok(()),
            Ok(Some(count)) => {
                for index in 0..count {
                    self.store.remove(&keys::chunk_key(namespace, index))?;
                }
                self.store.remove(&keys::count_key(namespace))
            }
            // An unreadable count still identifies the family
            Err(PersistError::InvalidFormat(_)) => self.clear_family(namespace),
            Err(e) => Err(e),
        }
    }

    /// Stored chunk count for `namespace`
    pub fn chunk_count(&self, namespace: &str) -> Result<Option<usize>> {
        let Some(raw) = self.store.get(&keys::count_key(namespace))? else {
            return Ok(None);
        };
        raw.trim().parse::<usize>().map(Some).map_err(|_| {
            PersistError::invalid_format(format!(
                "chunk count for {namespace} is not a number: {raw:?}"
            ))
        })
    }

    /// Scan-and-remove every key under the namespace's chunk prefix
    fn clear_family(&self, namespace: &str) -> Result<()> {
        for key in self.store.keys_with_prefix(&keys::family_prefix(namespace))? {
            self.store.remove(&key)?;
        }
        Ok(())
    }

    fn discard_written(&self, namespace: &str, written: usize) {
        #[cfg(feature = "metrics")]
        crate::observability::PersistMetrics::global().record_store_error();

        for index in 0..written {
            if let Err(e) = self.store.remove(&keys::chunk_key(namespace, index)) {
                warn!(key = namespace, chunk = index, error = %e, "could not discard partial chunk");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryKeyValueStore;
    use proptest::prelude::*;
    use std::sync::Arc;

    fn chunk_store(chunk_size: usize) -> ChunkStore<Arc<MemoryKeyValueStore>> {
        ChunkStore::new(Arc::new(MemoryKeyValueStore::new()), chunk_size)
    }

    #[test]
    fn test_split_respects_size_and_order() {
        assert_eq!(split_into_chunks("abcdefg", 3), vec!["abc", "def", "g"]);
        assert_eq!(split_into_chunks("abcdef", 3), vec!["abc", "def"]);
        assert!(split_into_chunks("", 3).is_empty());
    }

    #[test]
    fn test_split_keeps_multibyte_chars_whole() {
        let payload = "héllo wörld";
        let chunks = split_into_chunks(payload, 2);
        assert_eq!(chunks[0], "hé");
        assert!(chunks.iter().all(|c| c.chars().count() <= 2));
        assert_eq!(chunks.concat(), payload);
    }

    #[test]
    fn test_save_writes_count_and_chunks() {
        let chunks = chunk_store(4);
        let written = chunks.save("canvas_state_1", "0123456789").unwrap();

        assert_eq!(written, 3);
        assert_eq!(chunks.chunk_count("canvas_state_1").unwrap(), Some(3));
        let store = chunks.store();
        assert_eq!(store.get("canvas_state_1_chunk_0").unwrap().unwrap(), "0123");
        assert_eq!(store.get("canvas_state_1_chunk_2").unwrap().unwrap(), "89");
        assert_eq!(store.keys_with_prefix("canvas_state_1_chunk_").unwrap().len(), 3);
    }

    #[test]
    fn test_empty_payload_roundtrips() {
        let chunks = chunk_store(4);
        assert_eq!(chunks.save("k", "").unwrap(), 0);
        assert_eq!(chunks.chunk_count("k").unwrap(), Some(0));
        assert_eq!(chunks.load("k").unwrap(), Some(String::new()));
    }

    #[test]
    fn test_zero_count_loads_as_empty_payload() {
        let chunks = chunk_store(4);
        chunks.store().set("k_chunks", "0").unwrap();
        assert_eq!(chunks.load("k").unwrap(), Some(String::new()));
    }

    #[test]
    fn test_load_absent_namespace() {
        assert_eq!(chunk_store(4).load("nothing_here").unwrap(), None);
    }

    #[test]
    fn test_shorter_rewrite_leaves_no_orphans() {
        let chunks = chunk_store(2);
        chunks.save("k", "abcdefgh").unwrap();
        chunks.save("k", "xyz").unwrap();

        assert_eq!(chunks.load("k").unwrap(), Some("xyz".to_string()));
        assert_eq!(chunks.store().get("k_chunk_2").unwrap(), None);
        assert_eq!(chunks.store().get("k_chunk_3").unwrap(), None);
    }

    #[test]
    fn test_missing_chunk_is_lossy_not_fatal() {
        let chunks = chunk_store(2);
        chunks.save("k", "aabbcc").unwrap();
        chunks.store().remove("k_chunk_1").unwrap();

        assert_eq!(chunks.load("k").unwrap(), Some("aacc".to_string()));
    }

    #[test]
    fn test_malformed_count_is_reported() {
        let chunks = chunk_store(2);
        chunks.store().set("k_chunks", "lots").unwrap();
        chunks.store().set("k_chunk_0", "aa").unwrap();

        assert!(matches!(chunks.load("k"), Err(PersistError::InvalidFormat(_))));

        // remove still cleans up the whole family
        chunks.remove("k").unwrap();
        assert!(chunks.store().is_empty().unwrap());
    }

    #[test]
    fn test_remove_deletes_everything() {
        let chunks = chunk_store(3);
        chunks.save("k", "0123456").unwrap();
        chunks.remove("k").unwrap();

        assert!(chunks.store().is_empty().unwrap());
        assert_eq!(chunks.load("k").unwrap(), None);
        // No-op on an absent namespace
        assert!(chunks.remove("k").is_ok());
    }

    #[test]
    fn test_quota_failure_leaves_no_readable_record() {
        // Room for the first chunk but not the second
        let store = Arc::new(MemoryKeyValueStore::with_quota(20));
        let chunks = ChunkStore::new(store.clone(), 8);

        let err = chunks.save("k", &"x".repeat(16)).unwrap_err();
        assert!(err.is_quota_exceeded());
        assert_eq!(chunks.load("k").unwrap(), None);
        assert_eq!(store.used(), 0);
    }

    proptest! {
        #[test]
        fn prop_roundtrip_and_count(payload in "\\PC{0,200}", size in 1usize..40) {
            let chunks = chunk_store(size);
            let written = chunks.save("ns", &payload).unwrap();

            let expected = payload.chars().count().div_ceil(size);
            prop_assert_eq!(written, expected);
            prop_assert_eq!(chunks.store().keys_with_prefix("ns_chunk_").unwrap().len(), expected);
            prop_assert_eq!(chunks.load("ns").unwrap(), Some(payload));
        }
    }
}
