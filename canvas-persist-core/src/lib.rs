/*!
# Canvas Persist Core Engine

Persistence of drawing-canvas snapshots (the current state plus an undo
history) in a size-limited key-value store.

This crate provides:

- Hexagonal architecture with pluggable key-value stores and image transforms
- Chunked storage that respects a per-entry size ceiling and reassembles
  payloads by ordered concatenation
- Best-effort compression on a background worker, with pass-through fallback
- Bounded history and undo stacks with oldest-first eviction
- A facade that never fails and becomes a no-op without a usable store

## Architecture

- [`storage::KeyValueStore`] is the port for the host store; memory and
  directory-backed adapters are included
- [`compression::ImageTransform`] is the port for the codec; a JPEG
  re-encoder is included behind the `jpeg` feature
- [`chunk::ChunkStore`] and [`history::HistoryManager`] hold the domain logic
- [`CanvasPersistence`] is the public surface

## Usage

```rust
use canvas_persist_core::{create_memory_persistence, PersistConfig};

# tokio::runtime::Runtime::new().unwrap().block_on(async {
let mut canvas = create_memory_persistence(PersistConfig::default(), None);

let _ = canvas.save_to_undo_stack("data:image/png;base64,AAAA").await;
let _ = canvas.save_canvas_state("data:image/png;base64,BBBB").await;

let current = canvas.load_canvas_state().await.into_value();
let undo = canvas.load_from_undo_stack().await.into_value();
assert_eq!(current.as_deref(), Some("data:image/png;base64,BBBB"));
assert_eq!(undo.as_deref(), Some("data:image/png;base64,AAAA"));

canvas.destroy().await;
# });
```
*/

pub mod chunk;
pub mod clock;
pub mod compression;
pub mod config;
pub mod error;
pub mod history;
pub mod keys;
pub mod observability;
pub mod persistence;
pub mod storage;
#[cfg(feature = "jpeg")]
pub mod transform;


pub use chunk::ChunkStore;
pub use clock::{Clock, ManualClock, SystemClock};
pub use compression::{CompressionAdapter, ImageTransform, TransformRequest, TransformResponse};
pub use config::{PersistConfig, PersistConfigOverrides, StorageBackend, StorageConfig};
pub use error::{Outcome, PersistError, Result};
pub use history::HistoryManager;
pub use persistence::{
    create_memory_persistence, create_persistence_from_config, default_transform,
    CanvasPersistence, CanvasPersistenceInterface,
};
pub use storage::{KeyValueStore, LocalKeyValueStore, MemoryKeyValueStore};
#[cfg(feature = "jpeg")]
pub use transform::JpegTransform;
