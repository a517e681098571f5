//! Per-coordinate write serialisation

use blockgrid_storage::GridPosition;
use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};

/// One async mutex per grid coordinate, created on first use.
///
/// Two mutations of the same coordinate never interleave; mutations of
/// different coordinates proceed in parallel.
#[derive(Debug, Default)]
pub struct CoordinateLocks {
    locks: DashMap<GridPosition, Arc<Mutex<()>>>,
}

impl CoordinateLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait for exclusive access to `position`
    pub async fn acquire(&self, position: GridPosition) -> OwnedMutexGuard<()> {
        // Clone the Arc out so the map shard is not held across the await
        let lock = self.locks.entry(position).or_default().clone();
        lock.lock_owned().await
    }

    /// Lock two coordinates in a fixed order so concurrent callers cannot deadlock
    pub async fn acquire_pair(
        &self,
        a: GridPosition,
        b: GridPosition,
    ) -> (OwnedMutexGuard<()>, Option<OwnedMutexGuard<()>>) {
        if a == b {
            return (self.acquire(a).await, None);
        }
        let (first, second) = if a < b { (a, b) } else { (b, a) };
        let first_guard = self.acquire(first).await;
        let second_guard = self.acquire(second).await;
        (first_guard, Some(second_guard))
    }

    /// Drop locks nobody holds or waits on
    pub fn prune(&self) -> usize {
        let before = self.locks.len();
        self.locks.retain(|_, lock| Arc::strong_count(lock) > 1);
        before - self.locks.len()
    }

    pub fn len(&self) -> usize {
        self.locks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }
}
