//! Ephemeral per-order tracking state

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};

use crate::session::{DriverId, LatLng, OrderId};

/// One accepted GPS sample from a driver
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LocationPing {
    pub order_id: OrderId,
    pub driver_id: DriverId,
    pub lat: f64,
    pub lng: f64,
    pub speed: Option<f64>,
    pub heading: Option<f64>,
    pub accuracy: Option<f64>,
    pub timestamp: DateTime<Utc>,
}

impl LocationPing {
    pub fn position(&self) -> LatLng {
        LatLng::new(self.lat, self.lng)
    }
}

/// Live view of an order, rebuilt from its latest ping
#[derive(Debug, Clone)]
pub struct TrackingState {
    pub last_ping: Option<LocationPing>,
    pub eta_minutes: Option<u32>,
    pub geofence_fired: bool,
    /// Geofence latch for once-per-crossing firing
    pub geofence_armed: bool,
}

impl Default for TrackingState {
    fn default() -> Self {
        Self {
            last_ping: None,
            eta_minutes: None,
            geofence_fired: false,
            geofence_armed: true,
        }
    }
}

/// Tracking state for every order that has received a ping
#[derive(Debug, Default)]
pub struct TrackingStore {
    orders: DashMap<OrderId, TrackingState>,
}

impl TrackingStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `f` with exclusive access to an order's state, creating it on
    /// first use. Keeps updates for one order serialized.
    pub fn with_order<R>(&self, order_id: OrderId, f: impl FnOnce(&mut TrackingState) -> R) -> R {
        let mut state = self.orders.entry(order_id).or_default();
        f(state.value_mut())
    }

    pub fn get(&self, order_id: OrderId) -> Option<TrackingState> {
        self.orders.get(&order_id).map(|s| s.clone())
    }

    /// Drop the live view of an order if `unwatched` holds while its entry
    /// is locked
    pub fn forget_if(&self, order_id: OrderId, unwatched: impl FnOnce() -> bool) -> bool {
        self.orders.remove_if(&order_id, |_, _| unwatched()).is_some()
    }

    pub fn len(&self) -> usize {
        self.orders.len()
    }

    pub fn is_empty(&self) -> bool {
        self.orders.is_empty()
    }
}
