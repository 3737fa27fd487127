//! Routecast configuration
//!
//! Configuration comes from `ROUTECAST_*` environment variables; the CLI
//! can override the bind address.
//!
//! - `ROUTECAST_BIND` - listen address (default `0.0.0.0:8080`)
//! - `ROUTECAST_IDENTITY_SECRET` - HMAC key for identity tokens (required)
//! - `ROUTECAST_SEED` - JSON file of orders for the in-memory directory
//! - `ROUTECAST_DATABASE_URL` - PostgreSQL location history (`postgres` feature)
//! - `ROUTECAST_OUTBOX_CAPACITY`, `ROUTECAST_GROUP_CAPACITY`, `ROUTECAST_PERSIST_QUEUE`
//! - `ROUTECAST_GEOFENCE_POLICY` (`once` | `every`), `ROUTECAST_GEOFENCE_RADIUS_KM`
//! - `ROUTECAST_AVERAGE_SPEED_KMH`, `ROUTECAST_HISTORY_LIMIT`
//! - `ROUTECAST_PING_INTERVAL_SECS`

use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::hub::HubSettings;
use crate::server::DEFAULT_PING_INTERVAL;
use crate::signal::GeofencePolicy;

/// Default listen address, `0.0.0.0:8080`
pub fn default_bind() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 8080))
}

/// Routecast configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub bind_addr: SocketAddr,
    /// Identity token secret
    pub identity_secret: String,
    /// Order seed file for the in-memory directory
    pub seed_path: Option<PathBuf>,
    /// PostgreSQL connection string for location history
    pub database_url: Option<String>,
    pub hub: HubSettings,
    /// Server ping interval (default: 30s)
    pub ping_interval: Duration,
}

impl Config {
    /// Create config from environment variables
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Create config from any key lookup
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let var = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        let identity_secret = var("ROUTECAST_IDENTITY_SECRET")
            .ok_or(ConfigError::MissingEnv("ROUTECAST_IDENTITY_SECRET"))?;

        let bind_addr = parse_or(
            var("ROUTECAST_BIND"),
            "ROUTECAST_BIND",
            "expected host:port",
            default_bind(),
        )?;

        let mut hub = HubSettings::default();
        hub.outbox_capacity = parse_positive(
            var("ROUTECAST_OUTBOX_CAPACITY"),
            "ROUTECAST_OUTBOX_CAPACITY",
            hub.outbox_capacity,
        )?;
        hub.group_capacity = parse_positive(
            var("ROUTECAST_GROUP_CAPACITY"),
            "ROUTECAST_GROUP_CAPACITY",
            hub.group_capacity,
        )?;
        hub.persist_queue = parse_positive(
            var("ROUTECAST_PERSIST_QUEUE"),
            "ROUTECAST_PERSIST_QUEUE",
            hub.persist_queue,
        )?;
        hub.history_limit = parse_positive(
            var("ROUTECAST_HISTORY_LIMIT"),
            "ROUTECAST_HISTORY_LIMIT",
            hub.history_limit,
        )?;

        hub.signals.policy = parse_or(
            var("ROUTECAST_GEOFENCE_POLICY"),
            "ROUTECAST_GEOFENCE_POLICY",
            "expected once or every",
            GeofencePolicy::default(),
        )?;
        hub.signals.geofence_radius_km = parse_or(
            var("ROUTECAST_GEOFENCE_RADIUS_KM"),
            "ROUTECAST_GEOFENCE_RADIUS_KM",
            "expected kilometres",
            hub.signals.geofence_radius_km,
        )?;
        hub.signals.average_speed_kmh = parse_or(
            var("ROUTECAST_AVERAGE_SPEED_KMH"),
            "ROUTECAST_AVERAGE_SPEED_KMH",
            "expected km/h",
            hub.signals.average_speed_kmh,
        )?;
        if !(hub.signals.geofence_radius_km.is_finite() && hub.signals.geofence_radius_km > 0.0) {
            return Err(ConfigError::InvalidEnv(
                "ROUTECAST_GEOFENCE_RADIUS_KM",
                "expected a positive number",
            ));
        }
        if !(hub.signals.average_speed_kmh.is_finite() && hub.signals.average_speed_kmh > 0.0) {
            return Err(ConfigError::InvalidEnv(
                "ROUTECAST_AVERAGE_SPEED_KMH",
                "expected a positive number",
            ));
        }

        let ping_secs = parse_positive(
            var("ROUTECAST_PING_INTERVAL_SECS"),
            "ROUTECAST_PING_INTERVAL_SECS",
            DEFAULT_PING_INTERVAL.as_secs() as usize,
        )?;

        Ok(Self {
            bind_addr,
            identity_secret,
            seed_path: var("ROUTECAST_SEED").map(PathBuf::from),
            database_url: var("ROUTECAST_DATABASE_URL"),
            hub,
            ping_interval: Duration::from_secs(ping_secs as u64),
        })
    }
}

fn parse_or<T: FromStr>(
    value: Option<String>,
    key: &'static str,
    expected: &'static str,
    default: T,
) -> Result<T, ConfigError> {
    match value {
        Some(value) => value
            .parse()
            .map_err(|_| ConfigError::InvalidEnv(key, expected)),
        None => Ok(default),
    }
}

fn parse_positive(
    value: Option<String>,
    key: &'static str,
    default: usize,
) -> Result<usize, ConfigError> {
    let parsed = parse_or(value, key, "expected a positive integer", default)?;
    if parsed == 0 {
        return Err(ConfigError::InvalidEnv(key, "expected a positive integer"));
    }
    Ok(parsed)
}

/// Configuration error
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("missing environment variable: {0}")]
    MissingEnv(&'static str),
    #[error("invalid environment variable {0}: {1}")]
    InvalidEnv(&'static str, &'static str),
}
