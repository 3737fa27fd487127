//! Location ingest
//!
//! A driver's GPS fix becomes an accepted ping, updates the order's live
//! state and fans out to everyone tracking the order.

use chrono::Utc;
use tracing::{debug, info};

use crate::access::is_assigned_driver;
use crate::error::TrackingError;
use crate::hub::Hub;
use crate::protocol::{LocationUpdate, NearDestination, ServerEvent};
use crate::session::{ConnectionId, OrderId};
use crate::tracking::LocationPing;

/// Message carried by `DriverNearDestination`
pub const NEAR_DESTINATION_MESSAGE: &str = "Driver is arriving at the destination";

/// Raw fix as reported by a driver
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct LocationFix {
    pub lat: f64,
    pub lng: f64,
    pub speed: Option<f64>,
    pub heading: Option<f64>,
    pub accuracy: Option<f64>,
}

impl LocationFix {
    pub fn new(lat: f64, lng: f64) -> Self {
        Self {
            lat,
            lng,
            ..Default::default()
        }
    }

    /// Reject fixes no GPS receiver could produce
    pub fn validate(&self) -> Result<(), TrackingError> {
        let invalid = |what: String| -> Result<(), TrackingError> {
            Err(TrackingError::ValidationFailure(what))
        };

        if !self.lat.is_finite() || !(-90.0..=90.0).contains(&self.lat) {
            return invalid(format!("latitude {} out of range", self.lat));
        }
        if !self.lng.is_finite() || !(-180.0..=180.0).contains(&self.lng) {
            return invalid(format!("longitude {} out of range", self.lng));
        }
        if let Some(speed) = self.speed
            && !(speed.is_finite() && speed >= 0.0)
        {
            return invalid(format!("speed {} is invalid", speed));
        }
        if let Some(accuracy) = self.accuracy
            && !(accuracy.is_finite() && accuracy >= 0.0)
        {
            return invalid(format!("accuracy {} is invalid", accuracy));
        }
        if let Some(heading) = self.heading
            && !(heading.is_finite() && (0.0..360.0).contains(&heading))
        {
            return invalid(format!("heading {} out of range", heading));
        }
        Ok(())
    }
}

impl Hub {
    /// Accept a location fix from the order's assigned driver.
    ///
    /// Persistence is handed off without waiting. Updates for one order are
    /// broadcast in the order they were accepted.
    pub async fn update_location(
        &self,
        conn_id: ConnectionId,
        order_id: OrderId,
        fix: LocationFix,
    ) -> Result<LocationUpdate, TrackingError> {
        let session = self.authenticated(conn_id)?;
        let order = self.fetch_order(order_id).await?;
        if !is_assigned_driver(&session, &order) {
            return Err(TrackingError::AccessDenied(format!(
                "not the assigned driver of order {}",
                order_id
            )));
        }
        let Some(driver_id) = session.driver_id() else {
            return Err(TrackingError::AccessDenied("not a driver".to_string()));
        };
        fix.validate()?;

        let engine = self.settings.signals;
        let update = self.tracking.with_order(order_id, |state| {
            // Stamped under the order's lock so timestamps follow broadcast order
            let ping = LocationPing {
                order_id,
                driver_id,
                lat: fix.lat,
                lng: fix.lng,
                speed: fix.speed,
                heading: fix.heading,
                accuracy: fix.accuracy,
                timestamp: Utc::now(),
            };
            self.persistence.submit(ping.clone());
            self.registry.record_location(conn_id, ping.position(), ping.timestamp);

            let signals = engine.evaluate(ping.position(), order.destination, &mut state.geofence_armed);
            state.eta_minutes = signals.eta_minutes;
            state.geofence_fired |= signals.near_destination.is_some();

            let update = LocationUpdate {
                order_id,
                driver_id,
                lat: ping.lat,
                lng: ping.lng,
                speed: ping.speed,
                heading: ping.heading,
                accuracy: ping.accuracy,
                eta_minutes: signals.eta_minutes,
                timestamp: ping.timestamp,
            };
            let reached = self
                .dispatcher
                .broadcast(order_id, ServerEvent::LocationUpdated(update.clone()));
            debug!(
                order_id,
                driver_id,
                reached,
                distance_km = ?signals.distance_km,
                eta = ?signals.eta_minutes,
                "location broadcast"
            );

            if let Some(distance_in_meters) = signals.near_destination {
                self.dispatcher.broadcast(
                    order_id,
                    ServerEvent::DriverNearDestination(NearDestination {
                        order_id,
                        distance_in_meters,
                        message: NEAR_DESTINATION_MESSAGE.to_string(),
                        timestamp: ping.timestamp,
                    }),
                );
                info!(order_id, driver_id, distance_in_meters, "driver near destination");
            }

            state.last_ping = Some(ping);
            update
        });

        // Nobody tracking this order: keep no live state for it
        self.release_tracking(order_id);

        Ok(update)
    }
}
