//! Location-history persistence
//!
//! Accepted pings are handed to a [`LocationStore`] after the live broadcast
//! path has taken what it needs. The store is the ledger; the tracking core
//! never reads from it on the hot path.
//!
//! # Backends
//!
//! - `memory` - bounded in-process history, always available
//! - `postgres` - appends to an existing `driver_locations` table
//!   (enable with `--features postgres`)

mod memory;

#[cfg(feature = "postgres")]
mod postgres;

pub use memory::MemoryLocationStore;

#[cfg(feature = "postgres")]
pub use postgres::PostgresLocationStore;

use async_trait::async_trait;

use crate::session::OrderId;
use crate::tracking::LocationPing;

/// Append-only location-history sink
#[async_trait]
pub trait LocationStore: Send + Sync {
    /// Append one accepted ping
    async fn append(&self, ping: &LocationPing) -> Result<(), StoreError>;

    /// Most recent pings for an order, oldest first
    async fn history(&self, order_id: OrderId, limit: usize) -> Result<Vec<LocationPing>, StoreError>;
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("location store unavailable: {0}")]
    Unavailable(String),
    #[cfg(feature = "postgres")]
    #[error("database error: {0}")]
    Database(#[from] tokio_postgres::Error),
}
