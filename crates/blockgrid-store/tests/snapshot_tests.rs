mod common;

use blockgrid_store::{CancellationFlag, CellAttributes, Connection, ExportBundle, GridPosition, StoreError};
use common::{test_store, TestStore};
use pretty_assertions::assert_eq;
use serde_json::{json, Value};

fn pos(x: u32, y: u32) -> GridPosition {
    GridPosition::new(x, y)
}

/// Three blocks, two connected, one generated
async fn populated_store() -> TestStore {
    let t = test_store().await;
    t.store.set_cell(pos(0, 0), json!({"kind": "input"})).await.unwrap();
    t.store.set_cell(pos(1, 0), json!({"kind": "llm", "model": "any"})).await.unwrap();
    t.store
        .set_cell_with(pos(14, 3), json!({"kind": "output"}), CellAttributes::default().generated())
        .await
        .unwrap();
    t.store.create_connection(pos(0, 0), pos(1, 0), "data").await.unwrap();
    t
}

#[tokio::test]
async fn test_export_import_round_trip() {
    let source = populated_store().await;
    let bundle = source.store.export_snapshot(&CancellationFlag::new()).await.unwrap();

    assert_eq!(bundle.cells.len(), 3);
    assert_eq!(bundle.connections.len(), 1);
    assert_eq!(bundle.metadata.total_cells, 3);
    assert_eq!(bundle.metadata.active_workflows, 1);

    // Through JSON, as a file would carry it
    let bundle = ExportBundle::<Value>::from_json(&bundle.to_json().unwrap()).unwrap();

    let target = test_store().await;
    target.store.set_cell(pos(7, 7), json!("replaced")).await.unwrap();
    target.store.import_snapshot(&bundle, &CancellationFlag::new()).await.unwrap();

    assert!(target.store.get_cell(pos(7, 7)).await.unwrap().is_none());

    let reexported = target.store.export_snapshot(&CancellationFlag::new()).await.unwrap();
    assert_eq!(reexported.cells, bundle.cells);
    assert_eq!(reexported.connections, bundle.connections);
    assert_eq!(reexported.signature, bundle.signature);

    let source_stats = source.store.statistics().await.unwrap();
    let target_stats = target.store.statistics().await.unwrap();
    assert_eq!(target_stats.total_cells, source_stats.total_cells);
    assert_eq!(target_stats.active_workflows, source_stats.active_workflows);
    assert_eq!(target_stats.dimensions, source_stats.dimensions);
}

#[tokio::test]
async fn test_tampered_bundle_is_rejected_and_store_untouched() {
    let source = populated_store().await;
    let mut bundle = source.store.export_snapshot(&CancellationFlag::new()).await.unwrap();
    bundle.cells[1].payload = json!({"kind": "llm", "model": "tampered"});

    let target = test_store().await;
    target.store.set_cell(pos(2, 2), json!("original")).await.unwrap();
    let before = target.store.export_snapshot(&CancellationFlag::new()).await.unwrap();

    let err = target
        .store
        .import_snapshot(&bundle, &CancellationFlag::new())
        .await
        .unwrap_err();
    assert!(err.is_integrity_error());

    let after = target.store.export_snapshot(&CancellationFlag::new()).await.unwrap();
    assert_eq!(after.cells, before.cells);
    assert_eq!(after.signature, before.signature);
    assert_eq!(target.store.metadata().await.total_cells, 1);
}

#[tokio::test]
async fn test_dangling_connection_in_bundle_is_rejected() {
    let source = populated_store().await;
    let bundle = source.store.export_snapshot(&CancellationFlag::new()).await.unwrap();

    let mut connections = bundle.connections.clone();
    connections.push(Connection::new(
        pos(0, 0).cell_id(),
        pos(9, 9).cell_id(),
        "data",
        bundle.exported_at,
    ));
    let resigned = ExportBundle::new(
        bundle.version.clone(),
        bundle.exported_at,
        bundle.metadata.clone(),
        bundle.cells.clone(),
        connections,
    )
    .unwrap();

    let target = test_store().await;
    let err = target
        .store
        .import_snapshot(&resigned, &CancellationFlag::new())
        .await
        .unwrap_err();
    assert!(err.is_dangling_reference());
    assert_eq!(target.store.storage_stats().await.unwrap().cell_records, 0);
}

#[tokio::test]
async fn test_cancelled_import_leaves_store_untouched() {
    let source = populated_store().await;
    let bundle = source.store.export_snapshot(&CancellationFlag::new()).await.unwrap();

    let target = test_store().await;
    target.store.set_cell(pos(4, 4), json!("stays")).await.unwrap();

    let cancel = CancellationFlag::new();
    cancel.cancel();
    let err = target.store.import_snapshot(&bundle, &cancel).await.unwrap_err();
    assert!(err.is_cancelled());

    assert!(target.store.get_cell(pos(4, 4)).await.unwrap().is_some());
    assert_eq!(target.store.storage_stats().await.unwrap().cell_records, 1);
}

#[tokio::test]
async fn test_failed_import_commit_leaves_store_untouched() {
    let source = populated_store().await;
    let bundle = source.store.export_snapshot(&CancellationFlag::new()).await.unwrap();

    let target = test_store().await;
    target.store.set_cell(pos(4, 4), json!("stays")).await.unwrap();
    let before = target.store.metadata().await;

    target.persistence.fail_writes(true);
    let err = target
        .store
        .import_snapshot(&bundle, &CancellationFlag::new())
        .await
        .unwrap_err();
    target.persistence.fail_writes(false);

    assert!(matches!(err, StoreError::Persistence(_)));
    assert_eq!(target.store.metadata().await, before);
    assert_eq!(
        target.store.get_cell(pos(4, 4)).await.unwrap().unwrap().payload,
        json!("stays")
    );
}

#[tokio::test]
async fn test_cancelled_export_errors() {
    let source = populated_store().await;
    let cancel = CancellationFlag::new();
    cancel.cancel();

    let err = source.store.export_snapshot(&cancel).await.unwrap_err();
    assert!(err.is_cancelled());
}

#[tokio::test]
async fn test_import_into_empty_store_grows_to_fit() {
    let source = populated_store().await;
    let mut bundle = source.store.export_snapshot(&CancellationFlag::new()).await.unwrap();
    // A bundle whose metadata understates the grid still lands every cell in bounds
    bundle.metadata.dimensions.width = 1;
    bundle.metadata.dimensions.height = 1;

    let target = test_store().await;
    target.store.import_snapshot(&bundle, &CancellationFlag::new()).await.unwrap();

    let dims = target.store.dimensions().await;
    for cell in &bundle.cells {
        assert!(dims.contains(cell.position));
    }
}
