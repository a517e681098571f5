//! Shared fixtures for the store integration tests

#![allow(dead_code)]

use async_trait::async_trait;
use blockgrid_storage::{
    GridPersistence, InMemoryGridPersistence, ManualClock, RecordKind, StorageError, StorageResult, WriteBatch,
};
use blockgrid_store::{GridStore, StoreConfig};
use serde_json::Value;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Persistence that refuses writes (and optionally reads) on demand, and can
/// stall connection listings to widen race windows
#[derive(Debug, Default)]
pub struct FlakyPersistence {
    inner: InMemoryGridPersistence,
    fail_writes: AtomicBool,
    fail_reads: AtomicBool,
    connection_listing_delay_ms: AtomicU64,
}

impl FlakyPersistence {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    pub fn fail_reads(&self, fail: bool) {
        self.fail_reads.store(fail, Ordering::SeqCst);
    }

    pub fn delay_connection_listing(&self, delay: Duration) {
        self.connection_listing_delay_ms
            .store(delay.as_millis() as u64, Ordering::SeqCst);
    }

    fn check_write(&self) -> StorageResult<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(StorageError::Unavailable("writes disabled".to_string()));
        }
        Ok(())
    }

    fn check_read(&self) -> StorageResult<()> {
        if self.fail_reads.load(Ordering::SeqCst) {
            return Err(StorageError::Unavailable("reads disabled".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl GridPersistence for FlakyPersistence {
    async fn get_record(&self, kind: RecordKind, key: &str) -> StorageResult<Option<Vec<u8>>> {
        self.check_read()?;
        self.inner.get_record(kind, key).await
    }

    async fn put_record(&self, kind: RecordKind, key: &str, data: Vec<u8>) -> StorageResult<()> {
        self.check_write()?;
        self.inner.put_record(kind, key, data).await
    }

    async fn delete_record(&self, kind: RecordKind, key: &str) -> StorageResult<bool> {
        self.check_write()?;
        self.inner.delete_record(kind, key).await
    }

    async fn list_keys(&self, kind: RecordKind) -> StorageResult<Vec<String>> {
        self.check_read()?;
        self.inner.list_keys(kind).await
    }

    async fn list_records(&self, kind: RecordKind) -> StorageResult<Vec<(String, Vec<u8>)>> {
        self.check_read()?;
        let records = self.inner.list_records(kind).await?;
        // Callers get the listing as it was before the stall
        let delay_ms = self.connection_listing_delay_ms.load(Ordering::SeqCst);
        if kind == RecordKind::Connection && delay_ms > 0 {
            tokio::time::sleep(Duration::from_millis(delay_ms)).await;
        }
        Ok(records)
    }

    async fn apply_batch(&self, batch: WriteBatch) -> StorageResult<()> {
        self.check_write()?;
        self.inner.apply_batch(batch).await
    }
}

/// A small grid so growth is easy to trigger
pub fn small_grid_config() -> StoreConfig {
    StoreConfig {
        initial_width: 10,
        initial_height: 10,
        ..StoreConfig::default()
    }
}

pub struct TestStore {
    pub store: GridStore<Value>,
    pub clock: Arc<ManualClock>,
    pub persistence: Arc<FlakyPersistence>,
}

pub async fn test_store_with(config: StoreConfig) -> TestStore {
    blockgrid_monitoring::init_test_tracing();

    let clock = Arc::new(ManualClock::starting_now());
    let persistence = Arc::new(FlakyPersistence::new());
    let store = GridStore::builder()
        .config(config)
        .clock(clock.clone())
        .persistence(persistence.clone())
        .build()
        .await
        .expect("store builds");

    TestStore {
        store,
        clock,
        persistence,
    }
}

pub async fn test_store() -> TestStore {
    test_store_with(small_grid_config()).await
}
