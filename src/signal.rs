//! Derived signals from raw coordinates
//!
//! Distance, ETA and destination geofence for an order's latest ping.

use serde::{Deserialize, Serialize};

use crate::session::LatLng;

/// Mean Earth radius used for great-circle distance
pub const EARTH_RADIUS_KM: f64 = 6371.0;

/// Assumed average road speed for ETA
pub const DEFAULT_AVERAGE_SPEED_KMH: f64 = 30.0;

/// Distance to destination under which the geofence fires
pub const DEFAULT_GEOFENCE_RADIUS_KM: f64 = 0.5;

/// When the destination geofence fires
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GeofencePolicy {
    /// Fire on entering the radius; re-arm after the driver is seen outside it
    #[default]
    OncePerCrossing,
    /// Fire on every ping inside the radius
    EveryUpdate,
}

impl std::str::FromStr for GeofencePolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "once" | "once_per_crossing" => Ok(Self::OncePerCrossing),
            "every" | "every_update" => Ok(Self::EveryUpdate),
            other => Err(format!("unknown geofence policy: {}", other)),
        }
    }
}

/// Great-circle distance in kilometres (haversine)
pub fn haversine_km(from: LatLng, to: LatLng) -> f64 {
    let dlat = (to.lat - from.lat).to_radians();
    let dlng = (to.lng - from.lng).to_radians();
    let lat1 = from.lat.to_radians();
    let lat2 = to.lat.to_radians();

    let a = (dlat / 2.0).sin().powi(2) + lat1.cos() * lat2.cos() * (dlng / 2.0).sin().powi(2);
    let c = 2.0 * a.sqrt().atan2((1.0 - a).sqrt());
    EARTH_RADIUS_KM * c
}

/// Whole minutes to cover `distance_km` at `speed_kmh`, at least one
/// minute for any positive distance
pub fn eta_minutes(distance_km: f64, speed_kmh: f64) -> u32 {
    if distance_km <= 0.0 {
        return 0;
    }
    let minutes = (distance_km / speed_kmh * 60.0).floor();
    (minutes as u32).max(1)
}

/// Signals derived for one ping
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Signals {
    /// Distance to destination, if the destination is known
    pub distance_km: Option<f64>,
    pub eta_minutes: Option<u32>,
    /// Set when the geofence fires on this ping
    pub near_destination: Option<f64>,
}

impl Signals {
    pub const UNKNOWN: Signals = Signals {
        distance_km: None,
        eta_minutes: None,
        near_destination: None,
    };
}

/// Signal engine parameters
#[derive(Debug, Clone, Copy)]
pub struct SignalEngine {
    pub average_speed_kmh: f64,
    pub geofence_radius_km: f64,
    pub policy: GeofencePolicy,
}

impl Default for SignalEngine {
    fn default() -> Self {
        Self {
            average_speed_kmh: DEFAULT_AVERAGE_SPEED_KMH,
            geofence_radius_km: DEFAULT_GEOFENCE_RADIUS_KM,
            policy: GeofencePolicy::default(),
        }
    }
}

impl SignalEngine {
    /// Evaluate a position against the destination.
    ///
    /// `armed` is the order's geofence latch: `true` while a firing is
    /// still allowed under `OncePerCrossing`. It is updated in place.
    pub fn evaluate(&self, position: LatLng, destination: Option<LatLng>, armed: &mut bool) -> Signals {
        let Some(destination) = destination else {
            return Signals::UNKNOWN;
        };

        let distance_km = haversine_km(position, destination);
        let inside = distance_km < self.geofence_radius_km;

        let fires = match self.policy {
            GeofencePolicy::EveryUpdate => inside,
            GeofencePolicy::OncePerCrossing => {
                let fires = inside && *armed;
                *armed = !inside;
                fires
            }
        };

        Signals {
            distance_km: Some(distance_km),
            eta_minutes: Some(eta_minutes(distance_km, self.average_speed_kmh)),
            near_destination: fires.then(|| (distance_km * 1000.0).round()),
        }
    }
}
