//! Fire-and-forget handoff of accepted pings to the location store
//!
//! The ingest path never waits on the store: pings go into a bounded queue
//! drained by a single worker task. A full queue drops the ping.

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

use crate::store::LocationStore;
use crate::tracking::LocationPing;

/// Default queue depth between ingest and the store
pub const DEFAULT_QUEUE_CAPACITY: usize = 1024;

/// Producer side of the persistence queue
#[derive(Debug, Clone)]
pub struct PersistenceQueue {
    tx: mpsc::Sender<LocationPing>,
}

impl PersistenceQueue {
    /// Spawn the worker draining into `store`. The worker exits once every
    /// queue handle is dropped.
    pub fn spawn(store: Arc<dyn LocationStore>, capacity: usize) -> (Self, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let handle = tokio::spawn(run_worker(store, rx));
        (Self { tx }, handle)
    }

    /// Queue a ping without waiting. Returns false when it was dropped.
    pub fn submit(&self, ping: LocationPing) -> bool {
        match self.tx.try_send(ping) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(ping)) => {
                warn!(
                    order_id = ping.order_id,
                    driver_id = ping.driver_id,
                    "persistence queue full, dropping ping"
                );
                false
            }
            Err(mpsc::error::TrySendError::Closed(ping)) => {
                error!(
                    order_id = ping.order_id,
                    "persistence worker stopped, dropping ping"
                );
                false
            }
        }
    }
}

async fn run_worker(store: Arc<dyn LocationStore>, mut rx: mpsc::Receiver<LocationPing>) {
    while let Some(ping) = rx.recv().await {
        match store.append(&ping).await {
            Ok(()) => debug!(order_id = ping.order_id, "ping persisted"),
            Err(e) => warn!(
                order_id = ping.order_id,
                driver_id = ping.driver_id,
                error = %e,
                "failed to persist ping"
            ),
        }
    }
    debug!("persistence worker stopped");
}
