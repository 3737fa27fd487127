//! Tracking wire protocol
//!
//! JSON text frames in both directions.
//!
//! ## Client Commands
//! `{"command": "StartTracking", "orderId": 42}`
//! - `StartTracking` / `StopTracking`: join or leave an order's group
//! - `UpdateLocation`: driver GPS ping
//! - `GetLocationHistory`: recent pings for an order
//! - `SendMessage`: chat message to everyone tracking an order
//! - `UpdateDriverStatus`: driver availability change
//!
//! ## Server Events
//! `{"type": "LocationUpdated", "payload": {...}}`

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::session::{ConnectionId, DriverId, OrderId, Role, UserId};
use crate::tracking::LocationPing;

/// Driver availability
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DriverStatus {
    Available,
    Busy,
    OnTrip,
    Offline,
}

impl std::fmt::Display for DriverStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Available => write!(f, "Available"),
            Self::Busy => write!(f, "Busy"),
            Self::OnTrip => write!(f, "OnTrip"),
            Self::Offline => write!(f, "Offline"),
        }
    }
}

/// Client-to-server commands
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "command", rename_all_fields = "camelCase")]
pub enum ClientCommand {
    StartTracking {
        order_id: OrderId,
    },
    StopTracking {
        order_id: OrderId,
    },
    UpdateLocation {
        order_id: OrderId,
        lat: f64,
        lng: f64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        speed: Option<f64>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        heading: Option<f64>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        accuracy: Option<f64>,
    },
    GetLocationHistory {
        order_id: OrderId,
    },
    SendMessage {
        order_id: OrderId,
        text: String,
    },
    UpdateDriverStatus {
        status: DriverStatus,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        order_id: Option<OrderId>,
    },
}

impl ClientCommand {
    pub fn name(&self) -> &'static str {
        match self {
            Self::StartTracking { .. } => "StartTracking",
            Self::StopTracking { .. } => "StopTracking",
            Self::UpdateLocation { .. } => "UpdateLocation",
            Self::GetLocationHistory { .. } => "GetLocationHistory",
            Self::SendMessage { .. } => "SendMessage",
            Self::UpdateDriverStatus { .. } => "UpdateDriverStatus",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectedPayload {
    pub connection_id: ConnectionId,
    pub user_id: UserId,
    pub role: Role,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Vehicle {
    pub model: String,
    pub plate_number: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub color: Option<String>,
}

/// Driver details shown to trackers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DriverSummary {
    pub driver_id: DriverId,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phone: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vehicle: Option<Vehicle>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rating: Option<f64>,
}

/// One-time state snapshot returned on join
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrackingSnapshot {
    pub order_id: OrderId,
    pub order_number: String,
    pub status: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub driver: Option<DriverSummary>,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderRef {
    pub order_id: OrderId,
    pub timestamp: DateTime<Utc>,
}

impl OrderRef {
    pub fn now(order_id: OrderId) -> Self {
        Self {
            order_id,
            timestamp: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LocationUpdate {
    pub order_id: OrderId,
    pub driver_id: DriverId,
    pub lat: f64,
    pub lng: f64,
    pub speed: Option<f64>,
    pub heading: Option<f64>,
    pub accuracy: Option<f64>,
    pub eta_minutes: Option<u32>,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LocationHistory {
    pub order_id: OrderId,
    pub locations: Vec<LocationPing>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NearDestination {
    pub order_id: OrderId,
    pub distance_in_meters: f64,
    pub message: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DriverStatusChange {
    pub order_id: OrderId,
    pub driver_id: DriverId,
    pub status: DriverStatus,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderStatusChange {
    pub order_id: OrderId,
    pub status: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatMessage {
    pub order_id: OrderId,
    pub sender_id: UserId,
    pub sender_name: String,
    pub sender_role: Role,
    pub message: String,
    pub timestamp: DateTime<Utc>,
}

/// Server-to-client events
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload")]
pub enum ServerEvent {
    Connected(ConnectedPayload),
    OrderTrackingStarted(TrackingSnapshot),
    OrderTrackingStopped(OrderRef),
    LocationUpdated(LocationUpdate),
    LocationHistory(LocationHistory),
    DriverDisconnected(OrderRef),
    DriverNearDestination(NearDestination),
    DriverStatusChanged(DriverStatusChange),
    OrderStatusChanged(OrderStatusChange),
    MessageReceived(ChatMessage),
    RequestCurrentLocation(OrderRef),
    Error(String),
}

impl ServerEvent {
    /// Event type as it appears on the wire
    pub fn name(&self) -> &'static str {
        match self {
            Self::Connected(_) => "Connected",
            Self::OrderTrackingStarted(_) => "OrderTrackingStarted",
            Self::OrderTrackingStopped(_) => "OrderTrackingStopped",
            Self::LocationUpdated(_) => "LocationUpdated",
            Self::LocationHistory(_) => "LocationHistory",
            Self::DriverDisconnected(_) => "DriverDisconnected",
            Self::DriverNearDestination(_) => "DriverNearDestination",
            Self::DriverStatusChanged(_) => "DriverStatusChanged",
            Self::OrderStatusChanged(_) => "OrderStatusChanged",
            Self::MessageReceived(_) => "MessageReceived",
            Self::RequestCurrentLocation(_) => "RequestCurrentLocation",
            Self::Error(_) => "Error",
        }
    }
}

/// Parse a client command from a text frame
pub fn parse_command(data: &str) -> Result<ClientCommand, ProtocolError> {
    serde_json::from_str(data).map_err(ProtocolError::Parse)
}

/// Parse a server event from a text frame
pub fn parse_event(data: &str) -> Result<ServerEvent, ProtocolError> {
    serde_json::from_str(data).map_err(ProtocolError::Parse)
}

/// Encode a server event to a text frame
pub fn encode_event(event: &ServerEvent) -> Result<String, ProtocolError> {
    serde_json::to_string(event).map_err(ProtocolError::Encode)
}

/// Encode a client command to a text frame
pub fn encode_command(command: &ClientCommand) -> Result<String, ProtocolError> {
    serde_json::to_string(command).map_err(ProtocolError::Encode)
}

/// Protocol errors
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("failed to parse frame: {0}")]
    Parse(serde_json::Error),
    #[error("failed to encode frame: {0}")]
    Encode(serde_json::Error),
}
