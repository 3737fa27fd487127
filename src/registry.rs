//! Session registry
//!
//! Concurrent map of live connections to their sessions. The registry is
//! the only owner of [`Session`] values; everything else works on clones.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tracing::debug;

use crate::error::TrackingError;
use crate::session::{ConnectionId, DriverId, Identity, LatLng, OrderId, Session};
use crate::outbox::Outbox;

#[derive(Debug, Default)]
pub struct SessionRegistry {
    sessions: DashMap<ConnectionId, Session>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new connection.
    ///
    /// Without an identity the connection is still kept, as an anonymous
    /// session, and `AuthenticationMissing` is returned.
    pub fn register(
        &self,
        conn_id: ConnectionId,
        identity: Option<Identity>,
        outbox: Outbox,
    ) -> Result<Session, TrackingError> {
        let authenticated = identity.is_some();
        let session = match self.sessions.entry(conn_id) {
            Entry::Occupied(_) => {
                return Err(TrackingError::ValidationFailure(format!(
                    "connection {} is already registered",
                    conn_id
                )));
            }
            Entry::Vacant(slot) => slot.insert(Session::new(conn_id, identity, outbox)).clone(),
        };

        debug!(
            conn_id,
            user_id = ?session.user_id(),
            role = ?session.role(),
            "session registered"
        );

        if authenticated {
            Ok(session)
        } else {
            Err(TrackingError::AuthenticationMissing)
        }
    }

    /// Remove a session, returning it if it existed
    pub fn remove(&self, conn_id: ConnectionId) -> Option<Session> {
        let (_, session) = self.sessions.remove(&conn_id)?;
        debug!(conn_id, "session removed");
        Some(session)
    }

    /// Get a snapshot of a session
    pub fn lookup(&self, conn_id: ConnectionId) -> Option<Session> {
        self.sessions.get(&conn_id).map(|s| s.clone())
    }

    pub fn contains(&self, conn_id: ConnectionId) -> bool {
        self.sessions.contains_key(&conn_id)
    }

    /// Most recently connected session of a driver
    pub fn find_by_driver_id(&self, driver_id: DriverId) -> Option<Session> {
        self.sessions
            .iter()
            .filter(|entry| entry.driver_id() == Some(driver_id))
            .max_by_key(|entry| (entry.connected_at, entry.conn_id))
            .map(|entry| entry.value().clone())
    }

    /// Record an accepted location on a session. Returns false if the
    /// session is gone.
    pub fn record_location(&self, conn_id: ConnectionId, location: LatLng, at: DateTime<Utc>) -> bool {
        match self.sessions.get_mut(&conn_id) {
            Some(mut session) => {
                session.record_location(location, at);
                true
            }
            None => false,
        }
    }

    /// Set the order a driver session is working. Non-driver sessions are
    /// left untouched.
    pub fn set_active_order(&self, conn_id: ConnectionId, order_id: OrderId) {
        if let Some(mut session) = self.sessions.get_mut(&conn_id)
            && session.is_driver()
        {
            session.active_order_id = Some(order_id);
        }
    }

    /// Clear the active order if it is `order_id`
    pub fn clear_active_order(&self, conn_id: ConnectionId, order_id: OrderId) {
        if let Some(mut session) = self.sessions.get_mut(&conn_id)
            && session.active_order_id == Some(order_id)
        {
            session.active_order_id = None;
        }
    }

    /// Get session count
    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}
