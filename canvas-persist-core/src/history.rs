/*!
Bounded canvas history and undo stack.

Every snapshot gets a fresh millisecond timestamp and is written through the
[`ChunkStore`] under `canvas_state_{ts}` (history) or `undo_state_{ts}`
(undo). Both collections are capped at `max_states`; the oldest entries are
evicted first.

The history set is tracked in an ordered in-memory index. The index is
rebuilt from a prefix scan of `canvas_state_` count entries before every
save, and the undo stack is re-read before every push, so several managers
sharing one store keep a single bound between them.
*/

use crate::chunk::ChunkStore;
use crate::clock::{Clock, MonotonicStamp};
use crate::compression::CompressionAdapter;
use crate::config::PersistConfig;
use crate::keys;
use crate::storage::KeyValueStore;
use crate::{Outcome, PersistError, Result};
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Canvas history and undo stack over a key-value store
pub struct HistoryManager<S> {
    chunks: ChunkStore<S>,
    compressor: CompressionAdapter,
    clock: Arc<dyn Clock>,
    stamp: MonotonicStamp,
    max_states: usize,
    /// Live `canvas_state_` timestamps
    states: BTreeSet<u64>,
    /// Undo timestamps, oldest first
    undo: Vec<u64>,
}

impl<S: KeyValueStore> HistoryManager<S> {
    /// Open the history persisted in `store`
    ///
    /// An unreadable undo stack is logged and treated as empty.
    ///
    /// # Errors
    /// * `PersistError::Storage` / `PersistError::Io` - if the store cannot
    ///   be enumerated
    pub fn open(
        store: S,
        compressor: CompressionAdapter,
        config: &PersistConfig,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        let states = scan_timestamps(&store, keys::STATE_PREFIX)?;

        let undo = match read_undo_stack(&store) {
            Ok(undo) => undo,
            Err(e) => {
                warn!(error = %e, "ignoring unreadable undo stack");
                Vec::new()
            }
        };

        // Undo records the stack no longer names still own their namespace
        let undo_records = scan_timestamps(&store, keys::UNDO_PREFIX)?;

        let mut stamp = MonotonicStamp::default();
        for ts in states.iter().chain(undo.iter()).chain(undo_records.iter()) {
            stamp.observe(*ts);
        }
        if let Ok(Some(pointer)) = read_pointer(&store) {
            stamp.observe(pointer);
        }

        info!(
            states = states.len(),
            undo_entries = undo.len(),
            "canvas history opened"
        );

        Ok(Self {
            chunks: ChunkStore::new(store, config.chunk_size),
            compressor,
            clock,
            stamp,
            max_states: config.max_states,
            states,
            undo,
        })
    }

    /// Compress and store `payload` as the new current canvas state
    ///
    /// # Returns
    /// The new state's timestamp, or `None` if nothing was persisted
    pub async fn record_current_state(&mut self, payload: &str) -> Outcome<Option<u64>> {
        let compressed = self.compressor.compress(payload, None).await;
        self.refresh_states();
        let timestamp = self.stamp.next(self.clock.as_ref());
        let namespace = keys::state_key(timestamp);

        if let Err(e) = self.chunks.save(&namespace, &compressed.value) {
            warn!(key = %namespace, error = %e, "canvas state not saved");
            return Outcome::degraded(None, e);
        }

        if let Err(e) = self
            .chunks
            .store()
            .set(keys::CURRENT_VERSION_KEY, &timestamp.to_string())
        {
            warn!(timestamp, error = %e, "current state pointer not updated");
            self.discard(&namespace);
            return Outcome::degraded(None, e);
        }

        self.states.insert(timestamp);
        debug!(timestamp, "canvas state recorded");

        let evicted = self.evict_states();
        Outcome::ok(Some(timestamp))
            .or_diagnostic(compressed.diagnostic)
            .or_diagnostic(evicted.diagnostic)
    }

    /// Load the state the current-state pointer refers to
    pub fn read_current_state(&self) -> Outcome<Option<String>> {
        match read_pointer(self.chunks.store()) {
            Ok(Some(timestamp)) => self.load_state(timestamp),
            Ok(None) => Outcome::ok(None),
            Err(e) => {
                warn!(error = %e, "current state pointer unreadable");
                Outcome::fallback(e)
            }
        }
    }

    /// Compress and push `payload` onto the undo stack
    ///
    /// # Returns
    /// The new entry's timestamp, or `None` if nothing was persisted
    pub async fn push_undo(&mut self, payload: &str) -> Outcome<Option<u64>> {
        let compressed = self.compressor.compress(payload, None).await;
        self.refresh_undo();
        let timestamp = self.stamp.next(self.clock.as_ref());
        let namespace = keys::undo_key(timestamp);

        if let Err(e) = self.chunks.save(&namespace, &compressed.value) {
            warn!(key = %namespace, error = %e, "undo state not saved");
            return Outcome::degraded(None, e);
        }

        let mut undo = self.undo.clone();
        undo.push(timestamp);
        let overflow = undo.len().saturating_sub(self.max_states);
        let evicted: Vec<u64> = undo.drain(..overflow).collect();

        // The sequence is persisted before evicted data goes, so it never
        // names a deleted entry
        if let Err(e) = write_undo_stack(self.chunks.store(), &undo) {
            warn!(error = %e, "undo stack not persisted");
            self.discard(&namespace);
            return Outcome::degraded(None, e);
        }
        self.undo = undo;
        debug!(timestamp, depth = self.undo.len(), "undo state pushed");

        let mut outcome = Outcome::ok(Some(timestamp)).or_diagnostic(compressed.diagnostic);
        for old in evicted {
            outcome = outcome.or_diagnostic(self.evict(&keys::undo_key(old)).err());
        }
        outcome
    }

    /// Load the most recent undo entry without removing it
    ///
    /// The persisted stack wins over the cached one, so pushes made by
    /// another manager are visible.
    pub fn read_undo(&self) -> Outcome<Option<String>> {
        let top = match read_undo_stack(self.chunks.store()) {
            Ok(undo) => undo.last().copied(),
            Err(e) => {
                debug!(error = %e, "undo stack unreadable; using cached entries");
                self.undo.last().copied()
            }
        };
        match top {
            Some(timestamp) => self.load_namespace(&keys::undo_key(timestamp)),
            None => Outcome::ok(None),
        }
    }

    /// Load one history entry by timestamp
    pub fn load_state(&self, timestamp: u64) -> Outcome<Option<String>> {
        self.load_namespace(&keys::state_key(timestamp))
    }

    /// Live history timestamps, newest first
    pub fn states(&self) -> Vec<u64> {
        self.states.iter().rev().copied().collect()
    }

    /// Undo timestamps, oldest first, as of this manager's last push or open
    pub fn undo_entries(&self) -> &[u64] {
        &self.undo
    }

    /// Timestamp the current-state pointer refers to
    pub fn current_timestamp(&self) -> Option<u64> {
        read_pointer(self.chunks.store()).ok().flatten()
    }

    pub fn chunk_store(&self) -> &ChunkStore<S> {
        &self.chunks
    }

    pub fn compressor(&self) -> &CompressionAdapter {
        &self.compressor
    }

    /// Remove every history and undo record, the pointer, and the stack
    ///
    /// Records the index does not know about (left by another writer) are
    /// swept too.
    pub fn clear(&mut self) -> Outcome<()> {
        let mut outcome = Outcome::ok(());
        let store = self.chunks.store();

        for prefix in [keys::STATE_PREFIX, keys::UNDO_PREFIX] {
            match store.keys_with_prefix(prefix) {
                Ok(found) => {
                    for key in found {
                        outcome = outcome.or_diagnostic(store.remove(&key).err());
                    }
                }
                Err(e) => outcome = outcome.or_diagnostic(Some(e)),
            }
        }
        for key in [keys::CURRENT_VERSION_KEY, keys::UNDO_STACK_KEY] {
            outcome = outcome.or_diagnostic(store.remove(key).err());
        }

        self.states.clear();
        self.undo.clear();
        if let Some(e) = &outcome.diagnostic {
            warn!(error = %e, "canvas history only partially cleared");
        } else {
            info!("canvas history cleared");
        }
        outcome
    }

    /// Release the compression worker
    pub async fn shutdown(&mut self) {
        self.compressor.shutdown().await;
    }

    /// Replace the index with the history set currently in the store
    fn refresh_states(&mut self) {
        match scan_timestamps(self.chunks.store(), keys::STATE_PREFIX) {
            Ok(found) => {
                for ts in &found {
                    self.stamp.observe(*ts);
                }
                self.states = found;
            }
            Err(e) => warn!(error = %e, "history set not rescanned; using cached index"),
        }
    }

    /// Replace the cached undo stack with the persisted one
    ///
    /// An unreadable stack keeps the cache, and the stamp is moved past every
    /// undo record still in the store.
    fn refresh_undo(&mut self) {
        match read_undo_stack(self.chunks.store()) {
            Ok(undo) => {
                for ts in &undo {
                    self.stamp.observe(*ts);
                }
                self.undo = undo;
            }
            Err(e) => {
                warn!(error = %e, "undo stack unreadable; using cached entries");
                if let Ok(found) = scan_timestamps(self.chunks.store(), keys::UNDO_PREFIX) {
                    for ts in found {
                        self.stamp.observe(ts);
                    }
                }
            }
        }
    }

    /// Drop the oldest history entries beyond `max_states`
    fn evict_states(&mut self) -> Outcome<()> {
        let mut outcome = Outcome::ok(());
        while self.states.len() > self.max_states {
            let Some(oldest) = self.states.pop_first() else {
                break;
            };
            outcome = outcome.or_diagnostic(self.evict(&keys::state_key(oldest)).err());
        }
        outcome
    }

    fn evict(&self, namespace: &str) -> Result<()> {
        #[cfg(feature = "metrics")]
        crate::observability::PersistMetrics::global().record_eviction();

        debug!(key = namespace, "evicting snapshot");
        self.chunks.remove(namespace).map_err(|e| {
            warn!(key = namespace, error = %e, "evicted snapshot not removed");
            e
        })
    }

    fn discard(&self, namespace: &str) {
        if let Err(e) = self.chunks.remove(namespace) {
            warn!(key = namespace, error = %e, "could not discard unreferenced snapshot");
        }
    }

    fn load_namespace(&self, namespace: &str) -> Outcome<Option<String>> {
        match self.chunks.load(namespace) {
            Ok(payload) => Outcome::ok(payload),
            Err(e) => {
                warn!(key = namespace, error = %e, "snapshot unreadable");
                Outcome::fallback(e)
            }
        }
    }
}

/// Timestamps of every namespace under `prefix` that has a count entry
fn scan_timestamps<S: KeyValueStore + ?Sized>(store: &S, prefix: &str) -> Result<BTreeSet<u64>> {
    Ok(store
        .keys_with_prefix(prefix)?
        .iter()
        .filter_map(|key| keys::parse_count_key(key, prefix))
        .collect())
}

fn read_pointer<S: KeyValueStore + ?Sized>(store: &S) -> Result<Option<u64>> {
    let Some(raw) = store.get(keys::CURRENT_VERSION_KEY)? else {
        return Ok(None);
    };
    raw.trim().parse().map(Some).map_err(|_| {
        PersistError::invalid_format(format!("current state pointer is not a timestamp: {raw:?}"))
    })
}

fn read_undo_stack<S: KeyValueStore + ?Sized>(store: &S) -> Result<Vec<u64>> {
    match store.get(keys::UNDO_STACK_KEY)? {
        Some(raw) => Ok(serde_json::from_str(&raw)?),
        None => Ok(Vec::new()),
    }
}

fn write_undo_stack<S: KeyValueStore + ?Sized>(store: &S, undo: &[u64]) -> Result<()> {
    store.set(keys::UNDO_STACK_KEY, &serde_json::to_string(undo)?)
}
