/*!
Error types for the canvas persistence engine.

Internal layers propagate [`PersistError`] with `?`. The public facade never
returns an error; it hands back an [`Outcome`], a best-effort value carrying
an optional diagnostic.
*/

use thiserror::Error;

/// Result type used throughout the canvas persistence core.
pub type Result<T> = std::result::Result<T, PersistError>;

/// Errors that can occur while persisting canvas snapshots.
#[derive(Error, Debug)]
pub enum PersistError {
    /// I/O errors from a directory-backed store
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Generic key-value store failures
    #[error("Storage error: {0}")]
    Storage(String),

    /// The store refused a write because its capacity ceiling was reached
    #[error("Storage quota exceeded writing {key}: {required} units needed, {available} available")]
    QuotaExceeded {
        key: String,
        required: usize,
        available: usize,
    },

    /// The image transform reported a failure
    #[error("Compression error: {0}")]
    Compression(String),

    /// The background compression worker is missing or has shut down
    #[error("Compression worker unavailable: {0}")]
    WorkerUnavailable(String),

    /// A compression request did not settle in time
    #[error("Compression request {request_id} timed out after {millis} ms")]
    Timeout { request_id: u64, millis: u128 },

    /// Persisted state could not be interpreted
    #[error("Invalid persisted format: {0}")]
    InvalidFormat(String),

    /// Configuration errors
    #[error("Validation error: {0}")]
    Validation(String),
}

impl PersistError {
    /// Create a new storage error
    pub fn storage<S: Into<String>>(msg: S) -> Self {
        Self::Storage(msg.into())
    }

    /// Create a new compression error
    pub fn compression<S: Into<String>>(msg: S) -> Self {
        Self::Compression(msg.into())
    }

    /// Create a new worker-unavailable error
    pub fn worker_unavailable<S: Into<String>>(msg: S) -> Self {
        Self::WorkerUnavailable(msg.into())
    }

    /// Create a new invalid format error
    pub fn invalid_format<S: Into<String>>(msg: S) -> Self {
        Self::InvalidFormat(msg.into())
    }

    /// Create a new validation error
    pub fn validation<S: Into<String>>(msg: S) -> Self {
        Self::Validation(msg.into())
    }

    /// True for failures caused by the store running out of space
    pub fn is_quota_exceeded(&self) -> bool {
        matches!(self, Self::QuotaExceeded { .. })
    }
}

/// Best-effort result of a public operation.
///
/// `value` is always usable. When something degraded along the way (a store
/// write failed, compression fell back to pass-through), `diagnostic` holds
/// the error that caused it.
#[derive(Debug)]
#[must_use]
pub struct Outcome<T> {
    pub value: T,
    pub diagnostic: Option<PersistError>,
}

impl<T> Outcome<T> {
    /// A clean result with no diagnostic
    pub fn ok(value: T) -> Self {
        Self {
            value,
            diagnostic: None,
        }
    }

    /// A degraded result
    pub fn degraded(value: T, error: PersistError) -> Self {
        Self {
            value,
            diagnostic: Some(error),
        }
    }

    pub fn is_degraded(&self) -> bool {
        self.diagnostic.is_some()
    }

    pub fn into_value(self) -> T {
        self.value
    }

    pub fn map<U, F: FnOnce(T) -> U>(self, f: F) -> Outcome<U> {
        Outcome {
            value: f(self.value),
            diagnostic: self.diagnostic,
        }
    }

    /// Keep the first diagnostic seen; later ones are usually consequences
    pub(crate) fn or_diagnostic(mut self, error: Option<PersistError>) -> Self {
        if self.diagnostic.is_none() {
            self.diagnostic = error;
        }
        self
    }
}

impl<T: Default> Outcome<T> {
    /// Degrade to the type's empty value (`None`, `()`)
    pub fn fallback(error: PersistError) -> Self {
        Self::degraded(T::default(), error)
    }
}
