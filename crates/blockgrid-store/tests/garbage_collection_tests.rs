mod common;

use blockgrid_store::{
    CancellationFlag, CellAttributes, GarbageCollectionConfig, GridPosition, RiskFlag, StoreConfig,
};
use common::{small_grid_config, test_store, test_store_with};
use pretty_assertions::assert_eq;
use serde_json::json;
use std::time::Duration;

fn pos(x: u32, y: u32) -> GridPosition {
    GridPosition::new(x, y)
}

fn config_with_gc(gc: GarbageCollectionConfig) -> StoreConfig {
    StoreConfig {
        gc,
        ..small_grid_config()
    }
}

#[tokio::test]
async fn test_sweep_removes_stale_cells_with_recovery() {
    let t = test_store().await;
    t.store.set_cell(pos(0, 0), json!("stale")).await.unwrap();
    t.clock.advance(chrono::Duration::days(6));
    t.store.set_cell(pos(1, 0), json!("fresh")).await.unwrap();
    t.clock.advance(chrono::Duration::days(2));

    let result = t.store.run_garbage_collection(&CancellationFlag::new()).await.unwrap();

    assert_eq!(result.cells_removed, 1);
    assert!(result.memory_freed > 0);
    assert!(!result.cancelled);
    assert!(t.store.get_cell(pos(0, 0)).await.unwrap().is_none());
    assert!(t.store.get_cell(pos(1, 0)).await.unwrap().is_some());

    let stats = t.store.storage_stats().await.unwrap();
    assert_eq!(stats.recovery_records, 1);
    assert_eq!(stats.cell_records, 1);

    assert!(t.store.restore_removed_cell(&pos(0, 0).cell_id()).await.unwrap());
    assert_eq!(
        t.store.get_cell(pos(0, 0)).await.unwrap().unwrap().payload,
        json!("stale")
    );
}

#[tokio::test]
async fn test_safety_floor_is_never_crossed() {
    let t = test_store_with(config_with_gc(GarbageCollectionConfig {
        max_age: Duration::ZERO,
        min_access_count: u64::MAX,
        preserve_connected: false,
        ..GarbageCollectionConfig::default()
    }))
    .await;

    t.store.set_cell(pos(0, 0), json!("old")).await.unwrap();
    t.clock.advance(chrono::Duration::minutes(90));
    t.store.set_cell(pos(1, 0), json!("recent")).await.unwrap();
    t.clock.advance(chrono::Duration::minutes(30));

    let result = t.store.run_garbage_collection(&CancellationFlag::new()).await.unwrap();

    assert_eq!(result.cells_removed, 1);
    assert!(t.store.get_cell(pos(1, 0)).await.unwrap().is_some());
}

#[tokio::test]
async fn test_frequently_read_cells_survive() {
    let t = test_store().await;
    t.store.set_cell(pos(0, 0), json!("popular")).await.unwrap();
    for _ in 0..3 {
        t.store.get_cell(pos(0, 0)).await.unwrap();
    }
    t.clock.advance(chrono::Duration::days(30));

    let result = t.store.run_garbage_collection(&CancellationFlag::new()).await.unwrap();
    assert_eq!(result.cells_removed, 0);
}

#[tokio::test]
async fn test_connected_cells_are_preserved() {
    let t = test_store().await;
    t.store.set_cell(pos(0, 0), json!("a")).await.unwrap();
    t.store.set_cell(pos(1, 0), json!("b")).await.unwrap();
    t.store.set_cell(pos(2, 0), json!("loner")).await.unwrap();
    t.store.create_connection(pos(0, 0), pos(1, 0), "data").await.unwrap();
    t.clock.advance(chrono::Duration::days(10));

    let result = t.store.run_garbage_collection(&CancellationFlag::new()).await.unwrap();
    assert_eq!(result.cells_removed, 1);
    assert_eq!(result.connections_removed, 0);
    assert!(t.store.get_cell(pos(2, 0)).await.unwrap().is_none());
    assert_eq!(t.store.connections().await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_unpreserved_connections_are_cascaded() {
    let t = test_store_with(config_with_gc(GarbageCollectionConfig {
        preserve_connected: false,
        ..GarbageCollectionConfig::default()
    }))
    .await;
    t.store.set_cell(pos(0, 0), json!("a")).await.unwrap();
    t.store.set_cell(pos(1, 0), json!("b")).await.unwrap();
    t.store.create_connection(pos(0, 0), pos(1, 0), "data").await.unwrap();
    t.clock.advance(chrono::Duration::days(10));

    let result = t.store.run_garbage_collection(&CancellationFlag::new()).await.unwrap();
    assert_eq!(result.cells_removed, 2);
    assert_eq!(result.connections_removed, 1);
    assert!(t.store.connections().await.unwrap().is_empty());
    assert_eq!(t.store.statistics().await.unwrap().total_cells, 0);
}

#[tokio::test]
async fn test_generated_cells_expire_sooner() {
    let t = test_store().await;
    t.store
        .set_cell_with(pos(0, 0), json!("generated"), CellAttributes::default().generated())
        .await
        .unwrap();
    t.store.set_cell(pos(1, 0), json!("authored")).await.unwrap();
    t.clock.advance(chrono::Duration::days(4));

    let result = t.store.run_garbage_collection(&CancellationFlag::new()).await.unwrap();
    assert_eq!(result.cells_removed, 1);
    assert!(t.store.get_cell(pos(0, 0)).await.unwrap().is_none());
    assert!(t.store.get_cell(pos(1, 0)).await.unwrap().is_some());
}

#[tokio::test]
async fn test_sweep_survives_persistence_failures() {
    let t = test_store().await;
    t.store.set_cell(pos(0, 0), json!("a")).await.unwrap();
    t.store.set_cell(pos(1, 0), json!("b")).await.unwrap();
    t.clock.advance(chrono::Duration::days(10));

    t.persistence.fail_writes(true);
    for _ in 0..2 {
        let result = t.store.run_garbage_collection(&CancellationFlag::new()).await.unwrap();
        assert_eq!(result.cells_removed, 0);
    }
    assert!(!t.store.garbage_collector().is_running());

    t.persistence.fail_writes(false);
    let stats = t.store.storage_stats().await.unwrap();
    assert_eq!(stats.cell_records, 2);
    // Removals that never committed leave nothing to restore
    assert_eq!(stats.recovery_records, 0);

    let result = t.store.run_garbage_collection(&CancellationFlag::new()).await.unwrap();
    assert_eq!(result.cells_removed, 2);
    assert_eq!(t.store.storage_stats().await.unwrap().recovery_records, 2);
}

#[tokio::test]
async fn test_cancelled_sweep_removes_nothing_further() {
    let t = test_store().await;
    t.store.set_cell(pos(0, 0), json!("a")).await.unwrap();
    t.clock.advance(chrono::Duration::days(10));

    let cancel = CancellationFlag::new();
    cancel.cancel();
    let result = t.store.run_garbage_collection(&cancel).await.unwrap();

    assert!(result.cancelled);
    assert_eq!(result.cells_removed, 0);
    assert_eq!(t.store.storage_stats().await.unwrap().cell_records, 1);
}

#[tokio::test]
async fn test_preview_does_not_mutate() {
    let t = test_store().await;
    t.store
        .set_cell_with(pos(0, 0), json!("sys"), CellAttributes::default().with_category("system"))
        .await
        .unwrap();
    t.store.set_cell(pos(1, 0), json!("plain")).await.unwrap();
    t.clock.advance(chrono::Duration::days(10));

    let preview = t.store.preview_garbage_collection().await.unwrap();

    assert_eq!(preview.candidates.len(), 2);
    assert_eq!(preview.candidates[0].risks, vec![RiskFlag::CoreComponent]);
    assert!(!preview.candidates[1].is_risky());
    assert_eq!(t.store.storage_stats().await.unwrap().cell_records, 2);
    assert_eq!(t.store.storage_stats().await.unwrap().recovery_records, 0);
}

#[tokio::test]
async fn test_cell_read_during_sweep_is_kept() {
    let t = test_store().await;
    t.store.set_cell(pos(0, 0), json!("idle")).await.unwrap();
    t.clock.advance(chrono::Duration::days(10));
    t.persistence.delay_connection_listing(Duration::from_millis(100));

    // The read lands after candidates were listed but before the removal
    let cancel = CancellationFlag::new();
    let (result, read) = tokio::join!(t.store.run_garbage_collection(&cancel), async {
        tokio::time::sleep(Duration::from_millis(20)).await;
        t.store.get_cell(pos(0, 0)).await
    });
    t.persistence.delay_connection_listing(Duration::ZERO);

    assert!(read.unwrap().is_some());
    assert_eq!(result.unwrap().cells_removed, 0);
    let cell = t.store.get_cell(pos(0, 0)).await.unwrap().unwrap();
    assert_eq!(cell.payload, json!("idle"));
    assert_eq!(t.store.storage_stats().await.unwrap().recovery_records, 0);
}

#[tokio::test]
async fn test_cells_connected_during_sweep_are_kept() {
    let t = test_store().await;
    t.store.set_cell(pos(0, 0), json!("a")).await.unwrap();
    t.store.set_cell(pos(1, 0), json!("b")).await.unwrap();
    t.clock.advance(chrono::Duration::days(10));
    t.persistence.delay_connection_listing(Duration::from_millis(100));

    let cancel = CancellationFlag::new();
    let (result, connection) = tokio::join!(t.store.run_garbage_collection(&cancel), async {
        tokio::time::sleep(Duration::from_millis(20)).await;
        t.store.create_connection(pos(0, 0), pos(1, 0), "data").await
    });
    t.persistence.delay_connection_listing(Duration::ZERO);

    connection.unwrap();
    let result = result.unwrap();
    assert_eq!(result.cells_removed, 0);
    assert_eq!(result.connections_removed, 0);
    assert_eq!(t.store.connections().await.unwrap().len(), 1);
    assert_eq!(t.store.storage_stats().await.unwrap().cell_records, 2);
}
