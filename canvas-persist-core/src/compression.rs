/*!
Best-effort compression of snapshot payloads on a background worker.

The codec itself sits behind the [`ImageTransform`] port. [`CompressionAdapter`]
provisions a dedicated worker thread for it, talks to that thread over a
request channel and a response channel, and matches every response to its
request through a correlation id. Whatever goes wrong (no worker, a transform
failure, a dropped channel, a timeout) the adapter hands back the original
payload together with a diagnostic; it never fails the caller.
*/

use crate::config::PersistConfig;
use crate::{Outcome, PersistError, Result};
use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// A single compression job as seen by the worker
#[derive(Debug, Clone, PartialEq)]
pub struct TransformRequest {
    /// Correlation id, echoed back in the response
    pub id: u64,
    /// Image data as a data URI or bare base64
    pub payload: String,
    /// Lossy quality in (0, 1]
    pub quality: f32,
}

/// The worker's answer to a [`TransformRequest`]
#[derive(Debug, Clone, PartialEq)]
pub struct TransformResponse {
    pub id: u64,
    pub success: bool,
    pub data: Option<String>,
    pub error: Option<String>,
}

impl TransformResponse {
    pub fn success(id: u64, data: String) -> Self {
        Self {
            id,
            success: true,
            data: Some(data),
            error: None,
        }
    }

    pub fn failure<S: Into<String>>(id: u64, error: S) -> Self {
        Self {
            id,
            success: false,
            data: None,
            error: Some(error.into()),
        }
    }
}

/// Image transform abstraction
///
/// Implementations run on the adapter's worker thread and may block. Any
/// `Fn(&TransformRequest) -> TransformResponse` closure is a transform.
pub trait ImageTransform: Send + Sync + 'static {
    /// Transform `request.payload`, echoing `request.id` in the response
    fn transform(&self, request: &TransformRequest) -> TransformResponse;

    /// Name used in logs
    fn name(&self) -> &str {
        "custom"
    }
}

impl<F> ImageTransform for F
where
    F: Fn(&TransformRequest) -> TransformResponse + Send + Sync + 'static,
{
    fn transform(&self, request: &TransformRequest) -> TransformResponse {
        self(request)
    }
}

type PendingMap = Arc<Mutex<HashMap<u64, oneshot::Sender<TransformResponse>>>>;

/// Background worker owning one transform
///
/// The worker thread pulls requests off an unbounded channel and pushes
/// responses onto another; a dispatcher task on the tokio runtime routes each
/// response to the waiter registered under its id.
struct CompressionWorker {
    requests: mpsc::UnboundedSender<TransformRequest>,
    pending: PendingMap,
    next_id: AtomicU64,
    dispatcher: JoinHandle<()>,
    thread: Option<thread::JoinHandle<()>>,
    transform_name: String,
}

impl CompressionWorker {
    /// Provision the worker thread and dispatcher
    ///
    /// # Errors
    /// * `PersistError::WorkerUnavailable` - outside a tokio runtime, or if
    ///   the thread cannot be spawned
    fn spawn(transform: Arc<dyn ImageTransform>) -> Result<Self> {
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|e| PersistError::worker_unavailable(format!("no async runtime: {e}")))?;

        let (request_tx, mut request_rx) = mpsc::unbounded_channel::<TransformRequest>();
        let (response_tx, mut response_rx) = mpsc::unbounded_channel::<TransformResponse>();
        let transform_name = transform.name().to_string();

        let thread = thread::Builder::new()
            .name("canvas-compress".to_string())
            .spawn(move || {
                while let Some(request) = request_rx.blocking_recv() {
                    let id = request.id;
                    let response = catch_unwind(AssertUnwindSafe(|| transform.transform(&request)))
                        .unwrap_or_else(|_| TransformResponse::failure(id, "transform panicked"));
                    if response_tx.send(response).is_err() {
                        break;
                    }
                }
            })
            .map_err(|e| PersistError::worker_unavailable(format!("failed to spawn worker: {e}")))?;

        let pending: PendingMap = Arc::new(Mutex::new(HashMap::new()));
        let routes = Arc::clone(&pending);
        let dispatcher = runtime.spawn(async move {
            while let Some(response) = response_rx.recv().await {
                let waiter = routes
                    .lock()
                    .ok()
                    .and_then(|mut routes| routes.remove(&response.id));
                match waiter {
                    Some(waiter) => {
                        let _ = waiter.send(response);
                    }
                    // Its caller already timed out
                    None => debug!(request_id = response.id, "dropping late compression response"),
                }
            }
        });

        Ok(Self {
            requests: request_tx,
            pending,
            next_id: AtomicU64::new(1),
            dispatcher,
            thread: Some(thread),
            transform_name,
        })
    }

    async fn submit(&self, payload: &str, quality: f32, timeout: Duration) -> Result<String> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.pending
            .lock()
            .map_err(|_| PersistError::worker_unavailable("pending map poisoned"))?
            .insert(id, tx);

        let request = TransformRequest {
            id,
            payload: payload.to_string(),
            quality,
        };
        if self.requests.send(request).is_err() {
            self.forget(id);
            return Err(PersistError::worker_unavailable("worker has stopped"));
        }

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(response)) if response.success => response
                .data
                .ok_or_else(|| PersistError::compression("transform returned no data")),
            Ok(Ok(response)) => Err(PersistError::compression(
                response
                    .error
                    .unwrap_or_else(|| "transform failed without a reason".to_string()),
            )),
            Ok(Err(_)) => Err(PersistError::worker_unavailable(
                "worker dropped the request",
            )),
            Err(_) => {
                self.forget(id);
                Err(PersistError::Timeout {
                    request_id: id,
                    millis: timeout.as_millis(),
                })
            }
        }
    }

    fn forget(&self, id: u64) {
        if let Ok(mut pending) = self.pending.lock() {
            pending.remove(&id);
        }
    }

    /// Close the channels, fail pending waiters over, and join the thread
    /// for at most `grace`
    async fn shutdown(mut self, grace: Duration) {
        let Self {
            requests,
            pending,
            dispatcher,
            thread,
            ..
        } = &mut self;

        // Replacing the sender drops the original and closes the channel
        let (closed, _) = mpsc::unbounded_channel();
        *requests = closed;
        dispatcher.abort();
        if let Ok(mut pending) = pending.lock() {
            pending.clear();
        }

        if let Some(thread) = thread.take() {
            let join = tokio::task::spawn_blocking(move || thread.join());
            match tokio::time::timeout(grace, join).await {
                Ok(Ok(Ok(()))) => debug!("compression worker joined"),
                Ok(_) => warn!("compression worker exited abnormally"),
                Err(_) => warn!("compression worker still busy after shutdown; detaching"),
            }
        }
    }
}

impl Drop for CompressionWorker {
    fn drop(&mut self) {
        self.dispatcher.abort();
    }
}

/// Best-effort compression front end
///
/// # Example
/// ```rust
/// use canvas_persist_core::compression::{CompressionAdapter, TransformResponse};
/// use canvas_persist_core::PersistConfig;
///
/// # tokio_test_runtime(async {
/// let config = PersistConfig::default();
/// let adapter = CompressionAdapter::spawn(
///     |req: &canvas_persist_core::compression::TransformRequest| {
///         TransformResponse::failure(req.id, "codec unavailable")
///     },
///     &config,
/// );
///
/// // Failures fall back to the original payload
/// let outcome = adapter.compress("data:image/png;base64,AAAA", None).await;
/// assert_eq!(outcome.value, "data:image/png;base64,AAAA");
/// assert!(outcome.is_degraded());
/// # });
/// # fn tokio_test_runtime<F: std::future::Future>(f: F) -> F::Output {
/// #     tokio::runtime::Runtime::new().unwrap().block_on(f)
/// # }
/// ```
pub struct CompressionAdapter {
    worker: Option<CompressionWorker>,
    default_quality: f32,
    timeout: Duration,
}

impl CompressionAdapter {
    /// Adapter without a worker; every call passes through
    pub fn passthrough(config: &PersistConfig) -> Self {
        Self {
            worker: None,
            default_quality: config.compression_quality,
            timeout: config.compression_timeout(),
        }
    }

    /// Provision a worker for `transform`
    ///
    /// A worker that cannot start (for example outside a tokio runtime) is
    /// logged and the adapter degrades to pass-through.
    pub fn spawn<T: ImageTransform>(transform: T, config: &PersistConfig) -> Self {
        Self::with_transform(Some(Arc::new(transform)), config)
    }

    pub fn with_transform(
        transform: Option<Arc<dyn ImageTransform>>,
        config: &PersistConfig,
    ) -> Self {
        let mut adapter = Self::passthrough(config);
        let Some(transform) = transform else {
            return adapter;
        };

        match CompressionWorker::spawn(transform) {
            Ok(worker) => {
                info!(transform = %worker.transform_name, "compression worker started");
                adapter.worker = Some(worker);
            }
            Err(e) => warn!(error = %e, "compression worker unavailable; payloads pass through"),
        }
        adapter
    }

    /// Whether a background worker is running
    pub fn is_available(&self) -> bool {
        self.worker.is_some()
    }

    /// Compress `payload` at `quality` (the configured default when `None`)
    ///
    /// Resolves with the original payload when no worker is running. When
    /// the transform fails, the worker is gone, or the request times out, it
    /// resolves with the original payload and a diagnostic.
    pub async fn compress(&self, payload: &str, quality: Option<f32>) -> Outcome<String> {
        let Some(worker) = &self.worker else {
            return Outcome::ok(payload.to_string());
        };

        let quality = match quality {
            Some(q) if q > 0.0 && q <= 1.0 => q,
            Some(q) => {
                warn!(
                    quality = q,
                    fallback_quality = self.default_quality,
                    "quality out of range; using default"
                );
                self.default_quality
            }
            None => self.default_quality,
        };

        match worker.submit(payload, quality, self.timeout).await {
            Ok(compressed) => {
                debug!(
                    before = payload.len(),
                    after = compressed.len(),
                    "payload compressed"
                );
                Outcome::ok(compressed)
            }
            Err(e) => {
                warn!(error = %e, "compression failed; keeping original payload");
                #[cfg(feature = "metrics")]
                crate::observability::PersistMetrics::global().record_compression_fallback();
                Outcome::degraded(payload.to_string(), e)
            }
        }
    }

    /// Release the worker; later calls pass through
    pub async fn shutdown(&mut self) {
        if let Some(worker) = self.worker.take() {
            worker.shutdown(self.timeout).await;
            info!("compression worker released");
        }
    }
}

impl std::fmt::Debug for CompressionAdapter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompressionAdapter")
            .field("available", &self.is_available())
            .field("default_quality", &self.default_quality)
            .field("timeout", &self.timeout)
            .finish()
    }
}
