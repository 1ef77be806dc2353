/*!
Observability infrastructure for canvas persistence.

This module provides:
- Structured logging setup via `tracing-subscriber`
- Prometheus metrics instrumentation (feature `metrics`)
*/

#[cfg(feature = "metrics")]
use prometheus::{Encoder, Histogram, IntCounter, Registry, TextEncoder};
#[cfg(feature = "metrics")]
use std::sync::OnceLock;
use tracing::subscriber::set_global_default;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::{EnvFilter, Registry as TracingRegistry};

use crate::{PersistError, Result};

/// Directive applied on top of `RUST_LOG`
pub const DEFAULT_LOG_DIRECTIVE: &str = "canvas_persist=info";

/// Global metrics instance
#[cfg(feature = "metrics")]
static METRICS: OnceLock<PersistMetrics> = OnceLock::new();

/// Metrics collection for persistence operations
#[cfg(feature = "metrics")]
#[derive(Debug)]
pub struct PersistMetrics {
    pub chunks_written_total: IntCounter,
    pub store_errors_total: IntCounter,
    pub compression_fallbacks_total: IntCounter,
    pub evictions_total: IntCounter,
    pub payload_size_bytes: Histogram,

    // Prometheus registry for scraping
    registry: Registry,
}

#[cfg(feature = "metrics")]
impl PersistMetrics {
    /// Initialize new metrics instance
    fn new() -> Result<Self> {
        let registry = Registry::new();

        let counter = |name: &str, help: &str| -> Result<IntCounter> {
            let counter = IntCounter::new(name, help).map_err(|e| {
                PersistError::storage(format!("Failed to create {name} metric: {e}"))
            })?;
            registry
                .register(Box::new(counter.clone()))
                .map_err(|e| PersistError::storage(format!("Failed to register {name}: {e}")))?;
            Ok(counter)
        };

        let chunks_written_total = counter(
            "canvas_persist_chunks_written_total",
            "Total chunk entries written to the key-value store",
        )?;
        let store_errors_total = counter(
            "canvas_persist_store_errors_total",
            "Total failed snapshot writes",
        )?;
        let compression_fallbacks_total = counter(
            "canvas_persist_compression_fallbacks_total",
            "Total compression requests that fell back to the original payload",
        )?;
        let evictions_total = counter(
            "canvas_persist_evictions_total",
            "Total snapshots evicted from history or the undo stack",
        )?;

        let payload_size_bytes = Histogram::with_opts(
            prometheus::HistogramOpts::new(
                "canvas_persist_payload_size_bytes",
                "Size of stored snapshot payloads in bytes",
            )
            .buckets(prometheus::exponential_buckets(1024.0, 4.0, 8).map_err(|e| {
                PersistError::storage(format!("Failed to build histogram buckets: {e}"))
            })?),
        )
        .map_err(|e| {
            PersistError::storage(format!("Failed to create payload_size_bytes metric: {e}"))
        })?;
        registry
            .register(Box::new(payload_size_bytes.clone()))
            .map_err(|e| {
                PersistError::storage(format!("Failed to register payload_size_bytes: {e}"))
            })?;

        Ok(Self {
            chunks_written_total,
            store_errors_total,
            compression_fallbacks_total,
            evictions_total,
            payload_size_bytes,
            registry,
        })
    }

    /// Get or initialize global metrics instance
    pub fn global() -> &'static PersistMetrics {
        METRICS.get_or_init(|| Self::new().expect("Failed to initialize canvas persist metrics"))
    }

    pub fn record_chunks_written(&self, chunks: usize) {
        self.chunks_written_total.inc_by(chunks as u64);
    }

    pub fn record_store_error(&self) {
        self.store_errors_total.inc();
    }

    pub fn record_compression_fallback(&self) {
        self.compression_fallbacks_total.inc();
    }

    pub fn record_eviction(&self) {
        self.evictions_total.inc();
    }

    pub fn record_payload_size(&self, size_bytes: usize) {
        self.payload_size_bytes.observe(size_bytes as f64);
    }

    /// Gather metrics in Prometheus format
    pub fn gather_metrics(&self) -> Result<String> {
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();

        encoder
            .encode(&metric_families, &mut buffer)
            .map_err(|e| PersistError::storage(format!("Failed to encode metrics: {e}")))?;

        String::from_utf8(buffer)
            .map_err(|e| PersistError::storage(format!("Failed to convert metrics to string: {e}")))
    }
}

/// Initialize the global tracing subscriber
///
/// `RUST_LOG` is honoured; [`DEFAULT_LOG_DIRECTIVE`] is added on top. With
/// `json` set, events are emitted as one JSON object per line.
///
/// # Errors
/// * `PersistError::Validation` - if a subscriber is already installed
pub fn init_observability(json: bool) -> Result<()> {
    #[cfg(feature = "metrics")]
    PersistMetrics::global();

    let filter = EnvFilter::from_default_env().add_directive(
        DEFAULT_LOG_DIRECTIVE
            .parse()
            .map_err(|e| PersistError::validation(format!("Invalid log directive: {e}")))?,
    );

    let result = if json {
        let fmt_layer = tracing_subscriber::fmt::layer()
            .json()
            .with_target(false)
            .with_current_span(false);
        set_global_default(TracingRegistry::default().with(filter).with(fmt_layer))
    } else {
        let fmt_layer = tracing_subscriber::fmt::layer().with_target(false);
        set_global_default(TracingRegistry::default().with(filter).with(fmt_layer))
    };

    result.map_err(|e| {
        PersistError::validation(format!("Failed to set global tracing subscriber: {e}"))
    })?;

    tracing::info!("canvas persistence observability initialized");
    Ok(())
}

/// Initialize observability with default settings (JSON output)
pub fn init_default_observability() -> Result<()> {
    init_observability(true)
}
