//! Client command handling
//!
//! Maps each command frame onto a Hub operation. Failures never escape:
//! the caller gets one `Error` event and everyone else is unaffected.

use tracing::{debug, warn};

use crate::error::TrackingError;
use crate::hub::Hub;
use crate::ingest::LocationFix;
use crate::protocol::{ClientCommand, OrderRef, ServerEvent, parse_command};
use crate::session::ConnectionId;

/// Handle one text frame from a connection
pub async fn handle_text(hub: &Hub, conn_id: ConnectionId, text: &str) {
    match parse_command(text) {
        Ok(command) => handle_command(hub, conn_id, command).await,
        Err(e) => {
            let err = TrackingError::ValidationFailure(e.to_string());
            warn!(conn_id, error = %err, "malformed command");
            hub.send_to_connection(conn_id, ServerEvent::Error(err.to_string()));
        }
    }
}

/// Handle one parsed command
pub async fn handle_command(hub: &Hub, conn_id: ConnectionId, command: ClientCommand) {
    let name = command.name();
    debug!(conn_id, command = name, "command received");

    if let Err(e) = dispatch(hub, conn_id, command).await {
        warn!(conn_id, command = name, kind = e.kind(), error = %e, "command failed");
        hub.send_to_connection(conn_id, ServerEvent::Error(e.to_string()));
    }
}

async fn dispatch(hub: &Hub, conn_id: ConnectionId, command: ClientCommand) -> Result<(), TrackingError> {
    match command {
        ClientCommand::StartTracking { order_id } => {
            let snapshot = hub.join(conn_id, order_id).await?;
            hub.send_to_connection(conn_id, ServerEvent::OrderTrackingStarted(snapshot));
        }
        ClientCommand::StopTracking { order_id } => {
            hub.leave(conn_id, order_id);
            hub.send_to_connection(
                conn_id,
                ServerEvent::OrderTrackingStopped(OrderRef::now(order_id)),
            );
        }
        ClientCommand::UpdateLocation {
            order_id,
            lat,
            lng,
            speed,
            heading,
            accuracy,
        } => {
            let fix = LocationFix {
                lat,
                lng,
                speed,
                heading,
                accuracy,
            };
            hub.update_location(conn_id, order_id, fix).await?;
        }
        ClientCommand::GetLocationHistory { order_id } => {
            let history = hub.location_history(conn_id, order_id).await?;
            hub.send_to_connection(conn_id, ServerEvent::LocationHistory(history));
        }
        ClientCommand::SendMessage { order_id, text } => {
            hub.send_message(conn_id, order_id, &text).await?;
        }
        ClientCommand::UpdateDriverStatus { status, order_id } => {
            hub.update_driver_status(conn_id, status, order_id).await?;
        }
    }
    Ok(())
}
