//! Live session state
//!
//! A session represents a single real-time connection and the identity
//! resolved for it when it was registered.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::outbox::Outbox;

/// Connection identifier assigned by the server on accept
pub type ConnectionId = u64;
/// Order identifier from the order-management system
pub type OrderId = i64;
/// Driver identifier from the order-management system
pub type DriverId = i64;
/// User identifier from the identity provider
pub type UserId = i64;

/// Role claimed by an authenticated identity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Role {
    Customer,
    Driver,
    Admin,
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Customer => write!(f, "Customer"),
            Self::Driver => write!(f, "Driver"),
            Self::Admin => write!(f, "Admin"),
        }
    }
}

/// Identity resolved by the identity collaborator
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Identity {
    pub user_id: UserId,
    pub role: Role,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub driver_id: Option<DriverId>,
    #[serde(default)]
    pub name: String,
}

/// A WGS84 coordinate pair
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LatLng {
    pub lat: f64,
    pub lng: f64,
}

impl LatLng {
    pub fn new(lat: f64, lng: f64) -> Self {
        Self { lat, lng }
    }
}

/// Real-time session
#[derive(Debug, Clone)]
pub struct Session {
    /// Unique connection ID
    pub conn_id: ConnectionId,
    /// Resolved identity; `None` when the token could not be resolved
    pub identity: Option<Identity>,
    /// Most recent order a driver session joined
    pub active_order_id: Option<OrderId>,
    /// Last accepted location from this session
    pub last_location: Option<LatLng>,
    pub last_location_at: Option<DateTime<Utc>>,
    pub connected_at: DateTime<Utc>,
    /// Outbound queue for this connection
    pub outbox: Outbox,
}

impl Session {
    pub fn new(conn_id: ConnectionId, identity: Option<Identity>, outbox: Outbox) -> Self {
        Self {
            conn_id,
            identity,
            active_order_id: None,
            last_location: None,
            last_location_at: None,
            connected_at: Utc::now(),
            outbox,
        }
    }

    /// Check if session is authenticated
    pub fn is_authenticated(&self) -> bool {
        self.identity.is_some()
    }

    pub fn user_id(&self) -> Option<UserId> {
        self.identity.as_ref().map(|i| i.user_id)
    }

    pub fn role(&self) -> Option<Role> {
        self.identity.as_ref().map(|i| i.role)
    }

    /// Driver ID, only for sessions authenticated with the driver role
    pub fn driver_id(&self) -> Option<DriverId> {
        self.identity
            .as_ref()
            .filter(|i| i.role == Role::Driver)
            .and_then(|i| i.driver_id)
    }

    pub fn is_driver(&self) -> bool {
        self.driver_id().is_some()
    }

    /// Record an accepted location ping
    pub fn record_location(&mut self, location: LatLng, at: DateTime<Utc>) {
        self.last_location = Some(location);
        self.last_location_at = Some(at);
    }
}
