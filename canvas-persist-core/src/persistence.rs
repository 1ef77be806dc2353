/*!
Public facade over canvas history persistence.

[`CanvasPersistence`] composes the store, the compression adapter, and the
history manager behind five operations. It is constructed explicitly (there
is no shared global instance) and degrades to a no-op when no usable store is
present. No operation ever fails; each returns an [`Outcome`].
*/

use crate::clock::{Clock, SystemClock};
use crate::compression::{CompressionAdapter, ImageTransform};
use crate::config::{PersistConfig, StorageBackend, StorageConfig};
use crate::history::HistoryManager;
use crate::storage::{KeyValueStore, LocalKeyValueStore, MemoryKeyValueStore};
use crate::{Outcome, PersistError, Result};
use async_trait::async_trait;
use std::sync::Arc;
use tracing::{info, warn};

/// Canvas state and undo persistence
///
/// # Example
/// ```rust
/// use canvas_persist_core::{CanvasPersistence, MemoryKeyValueStore, PersistConfig};
///
/// # tokio::runtime::Runtime::new().unwrap().block_on(async {
/// let mut canvas = CanvasPersistence::new(
///     Some(MemoryKeyValueStore::new()),
///     None,
///     PersistConfig::default(),
/// );
///
/// let _ = canvas.save_canvas_state("data:image/png;base64,AAAA").await;
/// let loaded = canvas.load_canvas_state().await.into_value();
/// assert_eq!(loaded.as_deref(), Some("data:image/png;base64,AAAA"));
///
/// canvas.destroy().await;
/// # });
/// ```
pub struct CanvasPersistence<S> {
    history: Option<HistoryManager<S>>,
}

impl<S: KeyValueStore> CanvasPersistence<S> {
    /// Create a facade over `store`, compressing through `transform`
    ///
    /// `None` for the store, a store that fails its write probe, or a store
    /// that cannot be enumerated all yield a disabled facade. An invalid
    /// configuration is logged and replaced by the defaults.
    pub fn new(
        store: Option<S>,
        transform: Option<Arc<dyn ImageTransform>>,
        config: PersistConfig,
    ) -> Self {
        Self::with_clock(store, transform, config, Arc::new(SystemClock))
    }

    /// Like [`CanvasPersistence::new`] with an explicit timestamp source
    pub fn with_clock(
        store: Option<S>,
        transform: Option<Arc<dyn ImageTransform>>,
        config: PersistConfig,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let Some(store) = store.filter(|store| store.is_available()) else {
            info!("no persistent storage available; canvas persistence disabled");
            return Self::disabled();
        };

        let config = match config.validate() {
            Ok(()) => config,
            Err(e) => {
                warn!(error = %e, "invalid persistence config; using defaults");
                PersistConfig::default()
            }
        };

        let compressor = CompressionAdapter::with_transform(transform, &config);
        match HistoryManager::open(store, compressor, &config, clock) {
            Ok(history) => Self {
                history: Some(history),
            },
            Err(e) => {
                warn!(error = %e, "canvas history unavailable; persistence disabled");
                Self::disabled()
            }
        }
    }

    /// A facade with no host store; every operation is a no-op
    pub fn disabled() -> Self {
        Self { history: None }
    }

    /// Whether a usable store was detected
    pub fn is_enabled(&self) -> bool {
        self.history.is_some()
    }

    /// Persist `payload` as the current canvas state
    pub async fn save_canvas_state(&mut self, payload: &str) -> Outcome<()> {
        match self.history.as_mut() {
            Some(history) => history.record_current_state(payload).await.map(|_| ()),
            None => Outcome::ok(()),
        }
    }

    /// The most recently saved canvas state
    pub async fn load_canvas_state(&self) -> Outcome<Option<String>> {
        match &self.history {
            Some(history) => history.read_current_state(),
            None => Outcome::ok(None),
        }
    }

    /// Push `payload` onto the undo stack
    pub async fn save_to_undo_stack(&mut self, payload: &str) -> Outcome<()> {
        match self.history.as_mut() {
            Some(history) => history.push_undo(payload).await.map(|_| ()),
            None => Outcome::ok(()),
        }
    }

    /// The newest undo entry; repeated calls return the same entry
    pub async fn load_from_undo_stack(&self) -> Outcome<Option<String>> {
        match &self.history {
            Some(history) => history.read_undo(),
            None => Outcome::ok(None),
        }
    }

    /// Release the compression worker; later saves store payloads as given
    pub async fn destroy(&mut self) {
        if let Some(history) = self.history.as_mut() {
            history.shutdown().await;
        }
    }

    /// Remove every persisted canvas record
    pub fn clear(&mut self) -> Outcome<()> {
        match self.history.as_mut() {
            Some(history) => history.clear(),
            None => Outcome::ok(()),
        }
    }

    pub fn history(&self) -> Option<&HistoryManager<S>> {
        self.history.as_ref()
    }
}

/// Canvas persistence operations behind dynamic dispatch
///
/// Lets [`create_persistence_from_config`] return facades over different
/// concrete stores.
#[async_trait]
pub trait CanvasPersistenceInterface: Send + Sync {
    async fn save_canvas_state(&mut self, payload: &str) -> Outcome<()>;
    async fn load_canvas_state(&self) -> Outcome<Option<String>>;
    async fn save_to_undo_stack(&mut self, payload: &str) -> Outcome<()>;
    async fn load_from_undo_stack(&self) -> Outcome<Option<String>>;
    async fn destroy(&mut self);
    fn clear(&mut self) -> Outcome<()>;
    fn is_enabled(&self) -> bool;
    /// Live history timestamps, newest first
    fn states(&self) -> Vec<u64>;
    /// Undo timestamps, oldest first
    fn undo_entries(&self) -> Vec<u64>;
    fn current_timestamp(&self) -> Option<u64>;
    fn chunk_count(&self, namespace: &str) -> Option<usize>;
    fn load_state(&self, timestamp: u64) -> Outcome<Option<String>>;
}

#[async_trait]
impl<S: KeyValueStore> CanvasPersistenceInterface for CanvasPersistence<S> {
    async fn save_canvas_state(&mut self, payload: &str) -> Outcome<()> {
        CanvasPersistence::save_canvas_state(self, payload).await
    }

    async fn load_canvas_state(&self) -> Outcome<Option<String>> {
        CanvasPersistence::load_canvas_state(self).await
    }

    async fn save_to_undo_stack(&mut self, payload: &str) -> Outcome<()> {
        CanvasPersistence::save_to_undo_stack(self, payload).await
    }

    async fn load_from_undo_stack(&self) -> Outcome<Option<String>> {
        CanvasPersistence::load_from_undo_stack(self).await
    }

    async fn destroy(&mut self) {
        CanvasPersistence::destroy(self).await
    }

    fn clear(&mut self) -> Outcome<()> {
        CanvasPersistence::clear(self)
    }

    fn is_enabled(&self) -> bool {
        CanvasPersistence::is_enabled(self)
    }

    fn states(&self) -> Vec<u64> {
        self.history().map(HistoryManager::states).unwrap_or_default()
    }

    fn undo_entries(&self) -> Vec<u64> {
        self.history()
            .map(|history| history.undo_entries().to_vec())
            .unwrap_or_default()
    }

    fn current_timestamp(&self) -> Option<u64> {
        self.history()?.current_timestamp()
    }

    fn chunk_count(&self, namespace: &str) -> Option<usize> {
        self.history()?
            .chunk_store()
            .chunk_count(namespace)
            .ok()
            .flatten()
    }

    fn load_state(&self, timestamp: u64) -> Outcome<Option<String>> {
        match self.history() {
            Some(history) => history.load_state(timestamp),
            None => Outcome::ok(None),
        }
    }
}

/// The default image transform for this build
///
/// JPEG re-encoding with the `jpeg` feature, otherwise pass-through.
pub fn default_transform() -> Option<Arc<dyn ImageTransform>> {
    #[cfg(feature = "jpeg")]
    {
        Some(Arc::new(crate::transform::JpegTransform::new()))
    }
    #[cfg(not(feature = "jpeg"))]
    {
        None
    }
}

/// Convenience function to create a facade over a quota-bounded memory store
///
/// # Example
/// ```rust
/// use canvas_persist_core::{create_memory_persistence, PersistConfig};
///
/// # tokio::runtime::Runtime::new().unwrap().block_on(async {
/// let canvas = create_memory_persistence(PersistConfig::default(), None);
/// assert!(canvas.is_enabled());
/// # });
/// ```
pub fn create_memory_persistence(
    config: PersistConfig,
    transform: Option<Arc<dyn ImageTransform>>,
) -> CanvasPersistence<MemoryKeyValueStore> {
    CanvasPersistence::new(Some(MemoryKeyValueStore::new()), transform, config)
}

/// Create a facade based on storage configuration
///
/// Selects the memory, local, or disabled backend from `storage`.
///
/// # Errors
/// * `PersistError::Validation` - if `storage` is invalid
/// * `PersistError::Storage` - if the local base directory cannot be created
///
/// # Example
/// ```rust,no_run
/// use canvas_persist_core::{create_persistence_from_config, PersistConfig, StorageConfig};
///
/// # tokio::runtime::Runtime::new().unwrap().block_on(async {
/// let storage = StorageConfig::local_with_path("/var/lib/canvas");
/// let mut canvas = create_persistence_from_config(&storage, PersistConfig::default(), None)?;
/// let _ = canvas.save_canvas_state("data:image/png;base64,AAAA").await;
/// # Ok::<(), canvas_persist_core::PersistError>(())
/// # });
/// ```
pub fn create_persistence_from_config(
    storage: &StorageConfig,
    config: PersistConfig,
    transform: Option<Arc<dyn ImageTransform>>,
) -> Result<Box<dyn CanvasPersistenceInterface>> {
    storage.validate()?;

    match storage.backend {
        StorageBackend::Memory => {
            let store = match storage.quota {
                Some(quota) => MemoryKeyValueStore::with_quota(quota),
                None => MemoryKeyValueStore::new(),
            };
            Ok(Box::new(CanvasPersistence::new(Some(store), transform, config)))
        }
        StorageBackend::Local => {
            let base_path = storage.local_base_path.as_ref().ok_or_else(|| {
                PersistError::validation("Local backend requires a base path")
            })?;
            let mut store = LocalKeyValueStore::with_base_dir(base_path)?;
            if let Some(quota) = storage.quota {
                store = store.with_quota(quota as u64);
            }
            Ok(Box::new(CanvasPersistence::new(Some(store), transform, config)))
        }
        StorageBackend::Disabled => Ok(Box::new(
            CanvasPersistence::<MemoryKeyValueStore>::disabled(),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::compression::{TransformRequest, TransformResponse};
    use crate::config::PersistConfigOverrides;

    fn config(max_states: usize) -> PersistConfig {
        PersistConfig::from_overrides(PersistConfigOverrides {
            max_states: Some(max_states),
            chunk_size: Some(4),
            ..Default::default()
        })
        .unwrap()
    }

    fn memory_facade(max_states: usize) -> CanvasPersistence<Arc<MemoryKeyValueStore>> {
        CanvasPersistence::with_clock(
            Some(Arc::new(MemoryKeyValueStore::new())),
            None,
            config(max_states),
            Arc::new(ManualClock::new(1_000)),
        )
    }

    #[tokio::test]
    async fn test_save_and_load_canvas_state() {
        let mut canvas = memory_facade(3);
        assert!(canvas.is_enabled());
        assert!(canvas.load_canvas_state().await.value.is_none());

        let outcome = canvas.save_canvas_state("data:image/png;base64,QUJD").await;
        assert!(!outcome.is_degraded());
        assert_eq!(
            canvas.load_canvas_state().await.value.as_deref(),
            Some("data:image/png;base64,QUJD")
        );
    }

    #[tokio::test]
    async fn test_undo_is_peek_only() {
        let mut canvas = memory_facade(3);
        let _ = canvas.save_to_undo_stack("A").await;
        let _ = canvas.save_to_undo_stack("B").await;

        assert_eq!(canvas.load_from_undo_stack().await.value.as_deref(), Some("B"));
        assert_eq!(canvas.load_from_undo_stack().await.value.as_deref(), Some("B"));
    }

    #[tokio::test]
    async fn test_disabled_facade_is_a_no_op() {
        let mut canvas = CanvasPersistence::<MemoryKeyValueStore>::new(
            None,
            Some(Arc::new(|req: &TransformRequest| {
                TransformResponse::success(req.id, String::new())
            })),
            PersistConfig::default(),
        );
        assert!(!canvas.is_enabled());

        assert!(!canvas.save_canvas_state("x").await.is_degraded());
        assert!(!canvas.save_to_undo_stack("x").await.is_degraded());
        assert!(canvas.load_canvas_state().await.value.is_none());
        assert!(canvas.load_from_undo_stack().await.value.is_none());
        canvas.destroy().await;
    }

    #[tokio::test]
    async fn test_store_failing_probe_disables_facade() {
        let canvas = CanvasPersistence::new(
            Some(MemoryKeyValueStore::with_quota(1)),
            None,
            PersistConfig::default(),
        );
        assert!(!canvas.is_enabled());
    }

    #[tokio::test]
    async fn test_invalid_config_falls_back_to_defaults() {
        let bad = PersistConfig {
            max_states: 0,
            ..Default::default()
        };
        let canvas = CanvasPersistence::new(Some(MemoryKeyValueStore::new()), None, bad);
        assert!(canvas.is_enabled());
    }

    #[tokio::test]
    async fn test_destroy_makes_compression_pass_through() {
        let store = Arc::new(MemoryKeyValueStore::new());
        let mut canvas = CanvasPersistence::new(
            Some(store.clone()),
            Some(Arc::new(|req: &TransformRequest| {
                TransformResponse::success(req.id, "compressed".to_string())
            })),
            PersistConfig::default(),
        );

        let _ = canvas.save_canvas_state("raw-1").await;
        assert_eq!(canvas.load_canvas_state().await.value.as_deref(), Some("compressed"));

        canvas.destroy().await;
        assert!(!canvas.history().unwrap().compressor().is_available());

        let _ = canvas.save_canvas_state("raw-2").await;
        assert_eq!(canvas.load_canvas_state().await.value.as_deref(), Some("raw-2"));
    }

    #[tokio::test]
    async fn test_quota_pressure_degrades_without_failing() {
        let store = Arc::new(MemoryKeyValueStore::with_quota(200));
        let mut canvas = CanvasPersistence::new(Some(store), None, PersistConfig::default());
        assert!(canvas.is_enabled());

        let outcome = canvas.save_canvas_state(&"x".repeat(1_000)).await;
        assert!(matches!(
            outcome.diagnostic,
            Some(PersistError::QuotaExceeded { .. })
        ));
        assert!(canvas.load_canvas_state().await.value.is_none());
    }

    #[tokio::test]
    async fn test_create_from_config_backends() {
        let mut canvas = create_persistence_from_config(
            &StorageConfig::default_memory(),
            PersistConfig::default(),
            None,
        )
        .unwrap();
        assert!(canvas.is_enabled());
        let _ = canvas.save_canvas_state("memory").await;
        assert_eq!(canvas.states().len(), 1);

        let temp_dir = tempfile::TempDir::new().unwrap();
        let canvas = create_persistence_from_config(
            &StorageConfig::local_with_path(temp_dir.path()),
            PersistConfig::default(),
            None,
        )
        .unwrap();
        assert!(canvas.is_enabled());

        let canvas = create_persistence_from_config(
            &StorageConfig::disabled(),
            PersistConfig::default(),
            None,
        )
        .unwrap();
        assert!(!canvas.is_enabled());
        assert!(canvas.states().is_empty());
    }

    #[test]
    fn test_create_from_invalid_config() {
        let mut storage = StorageConfig::local_with_path("/tmp/x");
        storage.local_base_path = None;
        assert!(create_persistence_from_config(&storage, PersistConfig::default(), None).is_err());
    }
}
