//! Configuration module for persistence tuning and storage backend selection
//!
//! [`PersistConfig`] holds the knobs of the persistence engine (compression
//! quality, history bound, chunk size, compression timeout). Callers usually
//! supply a sparse [`PersistConfigOverrides`] which is merged over the
//! defaults. [`StorageConfig`] selects the key-value store backing the engine.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Default lossy compression quality
pub const DEFAULT_COMPRESSION_QUALITY: f32 = 0.6;

/// Default number of history states and undo entries kept
pub const DEFAULT_MAX_STATES: usize = 30;

/// Maximum string length stored under a single chunk key (512 KiB)
pub const DEFAULT_CHUNK_SIZE: usize = 512 * 1024;

/// Default upper bound on a single compression round-trip
pub const DEFAULT_COMPRESSION_TIMEOUT_MS: u64 = 10_000;

/// Default capacity of the in-memory store, in UTF-16 code units (5 MiB)
pub const DEFAULT_MEMORY_QUOTA: usize = 5 * 1024 * 1024;

/// Tuning parameters for the persistence engine
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PersistConfig {
    /// Lossy compression quality in (0, 1]
    pub compression_quality: f32,
    /// Maximum number of history states, and separately of undo entries
    pub max_states: usize,
    /// Maximum characters per chunk
    pub chunk_size: usize,
    /// Milliseconds before a compression request falls back to pass-through
    pub compression_timeout_ms: u64,
}

impl PersistConfig {
    /// Merge sparse overrides over the defaults and validate the result
    ///
    /// # Example
    /// ```rust
    /// use canvas_persist_core::config::{PersistConfig, PersistConfigOverrides};
    ///
    /// let config = PersistConfig::from_overrides(PersistConfigOverrides {
    ///     max_states: Some(5),
    ///     ..Default::default()
    /// })?;
    /// assert_eq!(config.max_states, 5);
    /// assert_eq!(config.compression_quality, 0.6);
    /// # Ok::<(), canvas_persist_core::PersistError>(())
    /// ```
    pub fn from_overrides(overrides: PersistConfigOverrides) -> crate::Result<Self> {
        let config = Self::default().merge(overrides);
        config.validate()?;
        Ok(config)
    }

    /// Apply every field that is set in `overrides`
    pub fn merge(mut self, overrides: PersistConfigOverrides) -> Self {
        if let Some(quality) = overrides.compression_quality {
            self.compression_quality = quality;
        }
        if let Some(max_states) = overrides.max_states {
            self.max_states = max_states;
        }
        if let Some(chunk_size) = overrides.chunk_size {
            self.chunk_size = chunk_size;
        }
        if let Some(timeout) = overrides.compression_timeout_ms {
            self.compression_timeout_ms = timeout;
        }
        self
    }

    pub fn compression_timeout(&self) -> Duration {
        Duration::from_millis(self.compression_timeout_ms)
    }

    /// Validate the configuration
    pub fn validate(&self) -> crate::Result<()> {
        if !(self.compression_quality > 0.0 && self.compression_quality <= 1.0) {
            return Err(crate::PersistError::validation(format!(
                "compression_quality must be in (0, 1], got {}",
                self.compression_quality
            )));
        }
        if self.max_states == 0 {
            return Err(crate::PersistError::validation(
                "max_states must be at least 1",
            ));
        }
        if self.chunk_size == 0 {
            return Err(crate::PersistError::validation(
                "chunk_size must be at least 1",
            ));
        }
        if self.compression_timeout_ms == 0 {
            return Err(crate::PersistError::validation(
                "compression_timeout_ms must be at least 1",
            ));
        }
        Ok(())
    }
}

impl Default for PersistConfig {
    fn default() -> Self {
        Self {
            compression_quality: DEFAULT_COMPRESSION_QUALITY,
            max_states: DEFAULT_MAX_STATES,
            chunk_size: DEFAULT_CHUNK_SIZE,
            compression_timeout_ms: DEFAULT_COMPRESSION_TIMEOUT_MS,
        }
    }
}

/// Sparse configuration; unset fields keep their defaults
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PersistConfigOverrides {
    pub compression_quality: Option<f32>,
    pub max_states: Option<usize>,
    pub chunk_size: Option<usize>,
    pub compression_timeout_ms: Option<u64>,
}

/// Enumeration of supported key-value store backends
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum StorageBackend {
    /// Process-local, quota-bounded memory
    Memory,
    /// One file per key under a base directory
    Local,
    /// No persistent host; every operation is a no-op
    Disabled,
}

/// Configuration structure for storage backend settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// The storage backend to use
    pub backend: StorageBackend,
    /// Base directory (required for the local backend)
    pub local_base_path: Option<PathBuf>,
    /// Capacity ceiling: UTF-16 code units for memory, bytes on disk for the
    /// local backend. `None` means [`DEFAULT_MEMORY_QUOTA`] for memory and
    /// unbounded for local
    pub quota: Option<usize>,
}

impl StorageConfig {
    /// Quota-bounded in-memory storage
    pub fn default_memory() -> Self {
        StorageConfig {
            backend: StorageBackend::Memory,
            local_base_path: None,
            quota: None,
        }
    }

    /// Directory-backed storage rooted at `path`
    pub fn local_with_path<P: Into<PathBuf>>(path: P) -> Self {
        StorageConfig {
            backend: StorageBackend::Local,
            local_base_path: Some(path.into()),
            quota: None,
        }
    }

    /// No persistent host
    pub fn disabled() -> Self {
        StorageConfig {
            backend: StorageBackend::Disabled,
            local_base_path: None,
            quota: None,
        }
    }

    pub fn with_quota(mut self, quota: usize) -> Self {
        self.quota = Some(quota);
        self
    }

    /// Parse a storage URI and create the matching configuration
    ///
    /// Supports formats:
    /// - `memory://` for in-memory storage
    /// - `disabled://` (or `none://`) for the no-host mode
    /// - `/local/path` or `./relative/path` for directory-backed storage
    pub fn from_uri(uri: &str) -> crate::Result<StorageConfig> {
        if uri.is_empty() {
            return Err(crate::PersistError::validation(
                "Invalid storage URI: empty",
            ));
        }
        match uri {
            "memory://" => Ok(StorageConfig::default_memory()),
            "disabled://" | "none://" => Ok(StorageConfig::disabled()),
            other if other.contains("://") => Err(crate::PersistError::validation(format!(
                "Unsupported storage URI scheme: {other}"
            ))),
            path => Ok(StorageConfig::local_with_path(path)),
        }
    }

    /// Validate the configuration
    pub fn validate(&self) -> crate::Result<()> {
        match self.backend {
            StorageBackend::Local => {
                let missing = self
                    .local_base_path
                    .as_ref()
                    .map_or(true, |path| path.as_os_str().is_empty());
                if missing {
                    return Err(crate::PersistError::validation(
                        "Local backend requires a base path",
                    ));
                }
            }
            StorageBackend::Memory | StorageBackend::Disabled => {}
        }
        if self.quota == Some(0) {
            return Err(crate::PersistError::validation(
                "Storage quota must be positive",
            ));
        }
        Ok(())
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self::default_memory()
    }
}
