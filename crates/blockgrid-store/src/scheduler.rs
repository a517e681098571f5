//! Periodic garbage collection and metadata flush

use blockgrid_monitoring::LogExt;
use blockgrid_storage::Payload;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::cancel::CancellationFlag;
use crate::grid::GridStore;

/// Handles to the store's background loops
#[derive(Debug)]
pub struct BackgroundTasks {
    shutdown_tx: watch::Sender<bool>,
    /// Cancels a sweep that is mid-way when shutdown arrives
    gc_cancel: CancellationFlag,
    handles: Vec<JoinHandle<()>>,
}

impl BackgroundTasks {
    /// Spawn the GC and metadata flush loops using the store's configured intervals
    pub fn spawn<P: Payload>(store: Arc<GridStore<P>>) -> Self {
        let gc_interval = store.config().gc_interval;
        let flush_interval = store.config().metadata_flush_interval;
        Self::spawn_with_intervals(store, gc_interval, flush_interval)
    }

    pub fn spawn_with_intervals<P: Payload>(
        store: Arc<GridStore<P>>,
        gc_interval: Duration,
        flush_interval: Duration,
    ) -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let gc_cancel = CancellationFlag::new();

        let gc_handle = tokio::spawn(gc_loop(store.clone(), gc_interval, gc_cancel.clone(), shutdown_rx.clone()));
        let flush_handle = tokio::spawn(flush_loop(store, flush_interval, shutdown_rx));

        info!(
            "Started background tasks: GC every {}s, metadata flush every {}s",
            gc_interval.as_secs(),
            flush_interval.as_secs()
        );

        Self {
            shutdown_tx,
            gc_cancel,
            handles: vec![gc_handle, flush_handle],
        }
    }

    /// Signal both loops to stop and wait for them
    pub async fn shutdown(self) {
        info!("Stopping background tasks");
        self.gc_cancel.cancel();
        let _ = self.shutdown_tx.send(true);

        for handle in self.handles {
            if let Err(e) = handle.await {
                warn!("Background task ended abnormally: {}", e);
            }
        }
    }
}

async fn gc_loop<P: Payload>(
    store: Arc<GridStore<P>>,
    period: Duration,
    cancel: CancellationFlag,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    // First sweep one full period after startup
    let mut ticker = interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = shutdown_rx.changed() => {
                if *shutdown_rx.borrow() {
                    debug!("GC loop shutting down");
                    break;
                }
            }
            _ = ticker.tick() => {
                match store.run_garbage_collection(&cancel).await {
                    Ok(result) => debug!("Scheduled GC removed {} cells", result.cells_removed),
                    Err(e) => warn!("Scheduled garbage collection failed: {}", e),
                }
            }
        }
    }
}

async fn flush_loop<P: Payload>(store: Arc<GridStore<P>>, period: Duration, mut shutdown_rx: watch::Receiver<bool>) {
    let mut ticker = interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = shutdown_rx.changed() => {
                if *shutdown_rx.borrow() {
                    debug!("Metadata flush loop shutting down");
                    break;
                }
            }
            _ = ticker.tick() => {
                let _ = store.flush_metadata().await.log_err("Scheduled metadata flush failed");
            }
        }
    }
}
