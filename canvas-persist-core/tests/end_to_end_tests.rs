/*!
End-to-end tests for canvas persistence.
These drive the public facade against real stores and the JPEG transform.
*/

#![cfg(feature = "jpeg")]

use base64::{engine::general_purpose::STANDARD, Engine as _};
use canvas_persist_core::{
    create_persistence_from_config, default_transform, CanvasPersistence, KeyValueStore,
    LocalKeyValueStore, ManualClock, MemoryKeyValueStore, PersistConfig, PersistConfigOverrides,
    StorageConfig,
};
use image::{DynamicImage, ImageFormat, Rgba, RgbaImage};
use std::io::Cursor;
use std::sync::Arc;
use tempfile::TempDir;

fn png_data_uri(width: u32, height: u32) -> String {
    let image = RgbaImage::from_fn(width, height, |x, y| {
        Rgba([(x * 7 % 256) as u8, (y * 3 % 256) as u8, ((x + y) % 256) as u8, 255])
    });
    let mut png = Vec::new();
    DynamicImage::ImageRgba8(image)
        .write_to(&mut Cursor::new(&mut png), ImageFormat::Png)
        .unwrap();
    format!("data:image/png;base64,{}", STANDARD.encode(png))
}

fn small_chunks(max_states: usize) -> PersistConfig {
    PersistConfig::from_overrides(PersistConfigOverrides {
        max_states: Some(max_states),
        chunk_size: Some(1_024),
        ..Default::default()
    })
    .unwrap()
}

#[tokio::test]
async fn test_jpeg_snapshot_roundtrip_across_chunks() {
    let store = Arc::new(MemoryKeyValueStore::new());
    let mut canvas = CanvasPersistence::new(Some(store.clone()), default_transform(), small_chunks(5));

    let snapshot = png_data_uri(256, 192);
    let outcome = canvas.save_canvas_state(&snapshot).await;
    assert!(!outcome.is_degraded(), "{:?}", outcome.diagnostic);

    let loaded = canvas.load_canvas_state().await.into_value().unwrap();
    assert!(loaded.starts_with("data:image/jpeg;base64,"));

    let history = canvas.history().unwrap();
    let ts = history.states()[0];
    let namespace = format!("canvas_state_{ts}");
    let count = history.chunk_store().chunk_count(&namespace).unwrap().unwrap();
    assert_eq!(count, loaded.len().div_ceil(1_024));
    assert!(count > 1);

    // The stored JPEG still decodes at the original size
    let body = loaded.strip_prefix("data:image/jpeg;base64,").unwrap();
    let decoded = image::load_from_memory(&STANDARD.decode(body).unwrap()).unwrap();
    assert_eq!((decoded.width(), decoded.height()), (256, 192));

    canvas.destroy().await;
}

#[tokio::test]
async fn test_undecodable_snapshot_is_stored_uncompressed() {
    let mut canvas = CanvasPersistence::new(
        Some(MemoryKeyValueStore::new()),
        default_transform(),
        PersistConfig::default(),
    );

    let outcome = canvas.save_to_undo_stack("data:image/png;base64,AAAA").await;
    assert!(outcome.is_degraded());
    assert_eq!(
        canvas.load_from_undo_stack().await.into_value().as_deref(),
        Some("data:image/png;base64,AAAA")
    );
}

#[tokio::test]
async fn test_undo_scenario_with_two_slots() {
    let store = Arc::new(MemoryKeyValueStore::new());
    let mut canvas = CanvasPersistence::with_clock(
        Some(store.clone()),
        None,
        small_chunks(2),
        Arc::new(ManualClock::new(42)),
    );

    for payload in ["A", "B", "C"] {
        let _ = canvas.save_to_undo_stack(payload).await;
    }

    let history = canvas.history().unwrap();
    let remaining: Vec<String> = history
        .undo_entries()
        .iter()
        .map(|ts| history.chunk_store().load(&format!("undo_state_{ts}")).unwrap().unwrap())
        .collect();
    assert_eq!(remaining, vec!["B", "C"]);
    assert_eq!(canvas.load_from_undo_stack().await.into_value().as_deref(), Some("C"));
    assert_eq!(store.keys_with_prefix("undo_state_").unwrap().len(), 4);
}

#[tokio::test]
async fn test_directory_store_survives_restart() {
    let temp_dir = TempDir::new().unwrap();
    let storage = StorageConfig::local_with_path(temp_dir.path());

    {
        let mut canvas =
            create_persistence_from_config(&storage, small_chunks(3), None).unwrap();
        for i in 0..5 {
            let _ = canvas.save_canvas_state(&format!("state-{i}-{}", "x".repeat(3_000))).await;
        }
        let _ = canvas.save_to_undo_stack("undo-entry").await;
        assert_eq!(canvas.states().len(), 3);
        canvas.destroy().await;
    }

    let canvas = create_persistence_from_config(&storage, small_chunks(3), None).unwrap();
    assert_eq!(canvas.states().len(), 3);
    let current = canvas.load_canvas_state().await.into_value().unwrap();
    assert!(current.starts_with("state-4-"));
    assert_eq!(current.len(), "state-4-".len() + 3_000);
    assert_eq!(
        canvas.load_from_undo_stack().await.into_value().as_deref(),
        Some("undo-entry")
    );

    // Three states of three chunks plus a count each, the pointer, one undo
    // record of one chunk plus its count, and the stack
    let store = LocalKeyValueStore::with_base_dir(temp_dir.path()).unwrap();
    assert_eq!(store.len().unwrap(), 3 * 4 + 1 + 2 + 1);
}

#[tokio::test]
async fn test_no_host_is_a_safe_no_op() {
    let mut canvas = create_persistence_from_config(
        &StorageConfig::disabled(),
        PersistConfig::default(),
        default_transform(),
    )
    .unwrap();

    assert!(!canvas.is_enabled());
    assert!(!canvas.save_canvas_state(&png_data_uri(8, 8)).await.is_degraded());
    assert!(!canvas.save_to_undo_stack("x").await.is_degraded());
    assert!(canvas.load_canvas_state().await.into_value().is_none());
    assert!(canvas.load_from_undo_stack().await.into_value().is_none());
    canvas.destroy().await;
    assert!(canvas.states().is_empty());
}

#[tokio::test]
async fn test_quota_pressure_keeps_editor_usable() {
    let store = Arc::new(MemoryKeyValueStore::with_quota(12_000));
    let mut canvas = CanvasPersistence::new(Some(store.clone()), None, small_chunks(30));

    let mut failures = 0;
    for i in 0..20 {
        let outcome = canvas.save_canvas_state(&format!("{i:04}{}", "p".repeat(1_000))).await;
        if outcome.is_degraded() {
            failures += 1;
        }
    }

    assert!(failures > 0);
    assert!(store.used() <= store.quota());
    // Whatever was last persisted successfully is still readable and whole
    let current = canvas.load_canvas_state().await.into_value().unwrap();
    assert_eq!(current.len(), 1_004);
}
