//! Routecast - live driver tracking and dispatch over WebSockets
//!
//! Drivers stream GPS fixes for the orders they are working; customers,
//! drivers and admins subscribe to an order and receive location updates,
//! ETA, arrival notices, status changes and chat in real time.
//!
//! ## Architecture
//!
//! ```text
//! Client (WS) → server → handler → Hub ─┬→ SessionRegistry
//!                                       ├→ GroupDispatcher → per-order broadcast → outboxes
//!                                       ├→ TrackingStore + SignalEngine
//!                                       └→ PersistenceQueue → LocationStore
//! ```
//!
//! Orders, identities and location history live in external systems reached
//! through the [`OrderDirectory`], [`IdentityResolver`] and [`LocationStore`]
//! traits.
//!
//! ## Features
//!
//! - `postgres` - PostgreSQL-backed location history

pub mod access;
pub mod client;
pub mod config;
pub mod directory;
pub mod dispatcher;
pub mod error;
pub mod handler;
pub mod hub;
pub mod identity;
pub mod ingest;
pub mod outbox;
pub mod persist;
pub mod protocol;
pub mod registry;
pub mod server;
pub mod session;
pub mod signal;
pub mod store;
pub mod tracking;

pub use client::{ClientHandle, ConnectionState, ReconnectPolicy, TrackingClient, WsConnector};
pub use config::Config;
pub use directory::{MemoryOrderDirectory, OrderDirectory, OrderRecord};
pub use error::TrackingError;
pub use hub::{Collaborators, Hub, HubSettings};
pub use identity::{IdentityResolver, SignedTokenResolver, TokenVerifier};
pub use ingest::LocationFix;
pub use protocol::{ClientCommand, ServerEvent};
pub use server::{AppState, build_router};
pub use session::{Identity, LatLng, Role, Session};
pub use signal::{GeofencePolicy, SignalEngine};
pub use store::{LocationStore, MemoryLocationStore};

#[cfg(feature = "postgres")]
pub use store::PostgresLocationStore;
