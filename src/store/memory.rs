//! In-memory location history
//!
//! Single-node only. Keeps the most recent pings per order and forgets the
//! rest. Ideal for development and single-instance deployments.

use std::collections::VecDeque;

use async_trait::async_trait;
use dashmap::DashMap;

use crate::session::OrderId;
use crate::store::{LocationStore, StoreError};
use crate::tracking::LocationPing;

/// Default number of pings retained per order
const DEFAULT_RETAINED_PER_ORDER: usize = 1000;

/// In-memory location history
///
/// # Limitations
/// - Single-process only
/// - Lost on restart
/// - Older pings are evicted once an order exceeds its retention
pub struct MemoryLocationStore {
    orders: DashMap<OrderId, VecDeque<LocationPing>>,
    retained_per_order: usize,
}

impl MemoryLocationStore {
    pub fn new() -> Self {
        Self::with_retention(DEFAULT_RETAINED_PER_ORDER)
    }

    /// Create with custom per-order retention
    pub fn with_retention(retained_per_order: usize) -> Self {
        Self {
            orders: DashMap::new(),
            retained_per_order: retained_per_order.max(1),
        }
    }

    /// Number of pings held for an order
    pub fn len(&self, order_id: OrderId) -> usize {
        self.orders.get(&order_id).map(|h| h.len()).unwrap_or(0)
    }
}

impl Default for MemoryLocationStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl LocationStore for MemoryLocationStore {
    async fn append(&self, ping: &LocationPing) -> Result<(), StoreError> {
        let mut history = self.orders.entry(ping.order_id).or_default();
        if history.len() == self.retained_per_order {
            history.pop_front();
        }
        history.push_back(ping.clone());
        Ok(())
    }

    async fn history(&self, order_id: OrderId, limit: usize) -> Result<Vec<LocationPing>, StoreError> {
        let Some(history) = self.orders.get(&order_id) else {
            return Ok(Vec::new());
        };
        let skip = history.len().saturating_sub(limit);
        Ok(history.iter().skip(skip).cloned().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn ping(order_id: OrderId, lat: f64) -> LocationPing {
        LocationPing {
            order_id,
            driver_id: 7,
            lat,
            lng: 51.4,
            speed: Some(20.0),
            heading: None,
            accuracy: None,
            timestamp: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_history_is_oldest_first_and_limited() {
        let store = MemoryLocationStore::new();
        for i in 0..5 {
            store.append(&ping(1, 35.0 + i as f64)).await.unwrap();
        }

        let recent = store.history(1, 3).await.unwrap();
        let lats: Vec<f64> = recent.iter().map(|p| p.lat).collect();
        assert_eq!(lats, vec![37.0, 38.0, 39.0]);

        assert_eq!(store.history(1, 50).await.unwrap().len(), 5);
        assert!(store.history(2, 50).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_retention_evicts_oldest() {
        let store = MemoryLocationStore::with_retention(2);
        store.append(&ping(1, 1.0)).await.unwrap();
        store.append(&ping(1, 2.0)).await.unwrap();
        store.append(&ping(1, 3.0)).await.unwrap();

        assert_eq!(store.len(1), 2);
        let lats: Vec<f64> = store.history(1, 10).await.unwrap().iter().map(|p| p.lat).collect();
        assert_eq!(lats, vec![2.0, 3.0]);
    }

    #[test]
    fn test_default() {
        let store = MemoryLocationStore::default();
        assert_eq!(store.retained_per_order, DEFAULT_RETAINED_PER_ORDER);
    }
}
