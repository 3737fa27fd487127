//! Order/driver lookup collaborator
//!
//! The order-management system owns orders, driver assignments and
//! destinations. The tracking core only reads them through [`OrderDirectory`].

use std::path::Path;

use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::protocol::{DriverStatus, DriverSummary, Vehicle};
use crate::session::{DriverId, LatLng, OrderId, UserId};

/// Driver assigned to an order
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AssignedDriver {
    pub driver_id: DriverId,
    pub user_id: UserId,
    pub name: String,
    #[serde(default)]
    pub phone: Option<String>,
    #[serde(default)]
    pub vehicle: Option<Vehicle>,
    #[serde(default)]
    pub rating: Option<f64>,
}

impl AssignedDriver {
    pub fn summary(&self) -> DriverSummary {
        DriverSummary {
            driver_id: self.driver_id,
            name: self.name.clone(),
            phone: self.phone.clone(),
            vehicle: self.vehicle.clone(),
            rating: self.rating,
        }
    }
}

/// Order as seen by the tracking core
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderRecord {
    pub order_id: OrderId,
    pub order_number: String,
    pub customer_id: UserId,
    pub status: String,
    #[serde(default)]
    pub driver: Option<AssignedDriver>,
    #[serde(default)]
    pub destination: Option<LatLng>,
}

impl OrderRecord {
    pub fn driver_id(&self) -> Option<DriverId> {
        self.driver.as_ref().map(|d| d.driver_id)
    }
}

/// Order/driver lookup
#[async_trait]
pub trait OrderDirectory: Send + Sync {
    /// Fetch an order, `None` if it does not exist
    async fn order(&self, order_id: OrderId) -> Result<Option<OrderRecord>, DirectoryError>;

    /// Record a driver's availability
    async fn record_driver_status(
        &self,
        driver_id: DriverId,
        status: DriverStatus,
    ) -> Result<(), DirectoryError>;
}

#[derive(Debug, thiserror::Error)]
pub enum DirectoryError {
    #[error("order directory unavailable: {0}")]
    Unavailable(String),
}

/// Seed file layout for [`MemoryOrderDirectory`]
#[derive(Debug, Default, Deserialize)]
struct Seed {
    #[serde(default)]
    orders: Vec<OrderRecord>,
}

#[derive(Debug, thiserror::Error)]
pub enum SeedError {
    #[error("failed to read seed file: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid seed file: {0}")]
    Json(#[from] serde_json::Error),
}

/// In-memory order directory for single-node deployments and tests
#[derive(Debug, Default)]
pub struct MemoryOrderDirectory {
    orders: DashMap<OrderId, OrderRecord>,
    driver_statuses: DashMap<DriverId, DriverStatus>,
}

impl MemoryOrderDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load orders from a JSON seed file: `{"orders": [...]}`
    pub fn from_seed_file(path: &Path) -> Result<Self, SeedError> {
        let data = std::fs::read_to_string(path)?;
        Self::from_seed_json(&data)
    }

    pub fn from_seed_json(data: &str) -> Result<Self, SeedError> {
        let seed: Seed = serde_json::from_str(data)?;
        let directory = Self::new();
        for order in seed.orders {
            directory.upsert(order);
        }
        debug!(orders = directory.orders.len(), "order directory seeded");
        Ok(directory)
    }

    /// Insert or replace an order
    pub fn upsert(&self, order: OrderRecord) {
        self.orders.insert(order.order_id, order);
    }

    /// Change the driver assigned to an order. Returns false for unknown orders.
    pub fn assign_driver(&self, order_id: OrderId, driver: Option<AssignedDriver>) -> bool {
        match self.orders.get_mut(&order_id) {
            Some(mut order) => {
                order.driver = driver;
                true
            }
            None => false,
        }
    }

    pub fn driver_status(&self, driver_id: DriverId) -> Option<DriverStatus> {
        self.driver_statuses.get(&driver_id).map(|s| *s)
    }
}

#[async_trait]
impl OrderDirectory for MemoryOrderDirectory {
    async fn order(&self, order_id: OrderId) -> Result<Option<OrderRecord>, DirectoryError> {
        Ok(self.orders.get(&order_id).map(|o| o.clone()))
    }

    async fn record_driver_status(
        &self,
        driver_id: DriverId,
        status: DriverStatus,
    ) -> Result<(), DirectoryError> {
        self.driver_statuses.insert(driver_id, status);
        Ok(())
    }
}
