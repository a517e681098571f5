//! In-memory implementation of GridPersistence
//!
//! This implementation is primarily intended for testing, development and
//! browser-local deployments. All data is lost when the instance is dropped.

use crate::{GridPersistence, RecordKind, StorageResult, WriteBatch, WriteOp};
use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::debug;

type Tables = HashMap<RecordKind, BTreeMap<String, Vec<u8>>>;

/// In-memory implementation of GridPersistence
///
/// Records of each kind live in their own ordered map so listings come out
/// in key order. Batches are applied under a single write lock.
#[derive(Debug, Clone, Default)]
pub struct InMemoryGridPersistence {
    tables: Arc<RwLock<Tables>>,
}

impl InMemoryGridPersistence {
    /// Create a new, empty in-memory store
    pub fn new() -> Self {
        Self::default()
    }

    fn apply_op(tables: &mut Tables, op: WriteOp) {
        match op {
            WriteOp::Put { kind, key, data } => {
                tables.entry(kind).or_default().insert(key, data);
            }
            WriteOp::Delete { kind, key } => {
                if let Some(table) = tables.get_mut(&kind) {
                    table.remove(&key);
                }
            }
            WriteOp::Clear(kind) => {
                tables.remove(&kind);
            }
        }
    }
}

#[async_trait]
impl GridPersistence for InMemoryGridPersistence {
    async fn get_record(&self, kind: RecordKind, key: &str) -> StorageResult<Option<Vec<u8>>> {
        let tables = self.tables.read().await;
        Ok(tables.get(&kind).and_then(|table| table.get(key)).cloned())
    }

    async fn put_record(&self, kind: RecordKind, key: &str, data: Vec<u8>) -> StorageResult<()> {
        let mut tables = self.tables.write().await;
        tables.entry(kind).or_default().insert(key.to_string(), data);
        Ok(())
    }

    async fn delete_record(&self, kind: RecordKind, key: &str) -> StorageResult<bool> {
        let mut tables = self.tables.write().await;
        Ok(tables
            .get_mut(&kind)
            .map(|table| table.remove(key).is_some())
            .unwrap_or(false))
    }

    async fn list_keys(&self, kind: RecordKind) -> StorageResult<Vec<String>> {
        let tables = self.tables.read().await;
        Ok(tables
            .get(&kind)
            .map(|table| table.keys().cloned().collect())
            .unwrap_or_default())
    }

    async fn list_records(&self, kind: RecordKind) -> StorageResult<Vec<(String, Vec<u8>)>> {
        let tables = self.tables.read().await;
        Ok(tables
            .get(&kind)
            .map(|table| table.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
            .unwrap_or_default())
    }

    async fn apply_batch(&self, batch: WriteBatch) -> StorageResult<()> {
        let op_count = batch.len();
        let mut tables = self.tables.write().await;
        for op in batch.into_ops() {
            Self::apply_op(&mut tables, op);
        }
        debug!("Applied write batch with {} operations", op_count);
        Ok(())
    }

    async fn record_count(&self, kind: RecordKind) -> StorageResult<usize> {
        let tables = self.tables.read().await;
        Ok(tables.get(&kind).map(BTreeMap::len).unwrap_or(0))
    }

    async fn stored_bytes(&self, kind: RecordKind) -> StorageResult<usize> {
        let tables = self.tables.read().await;
        Ok(tables
            .get(&kind)
            .map(|table| table.values().map(Vec::len).sum())
            .unwrap_or(0))
    }
}
