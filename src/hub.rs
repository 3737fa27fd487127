//! Tracking Hub
//!
//! Owns the session registry, order groups and live tracking state, and
//! exposes every tracking operation as a method. The transport maps frames
//! onto these methods; nothing here knows about WebSockets.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::Utc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::access::{can_access_order, is_assigned_driver};
use crate::directory::{OrderDirectory, OrderRecord};
use crate::dispatcher::{DEFAULT_GROUP_CAPACITY, GroupDispatcher, JoinOutcome};
use crate::error::TrackingError;
use crate::identity::IdentityResolver;
use crate::outbox::{self, Delivery, Frame};
use crate::persist::{DEFAULT_QUEUE_CAPACITY, PersistenceQueue};
use crate::protocol::{
    ChatMessage, ConnectedPayload, DriverStatus, DriverStatusChange, LocationHistory, OrderRef,
    OrderStatusChange, ServerEvent, TrackingSnapshot,
};
use crate::registry::SessionRegistry;
use crate::session::{ConnectionId, Identity, OrderId, Session};
use crate::signal::SignalEngine;
use crate::store::LocationStore;
use crate::tracking::TrackingStore;

/// Default outbound queue depth per connection
pub const DEFAULT_OUTBOX_CAPACITY: usize = 256;

/// Default number of pings returned by a history request
pub const DEFAULT_HISTORY_LIMIT: usize = 100;

/// Longest accepted chat message, in characters
pub const MAX_MESSAGE_LEN: usize = 1000;

/// Tunables for a [`Hub`]
#[derive(Debug, Clone, Copy)]
pub struct HubSettings {
    pub outbox_capacity: usize,
    pub group_capacity: usize,
    pub persist_queue: usize,
    pub signals: SignalEngine,
    pub history_limit: usize,
    pub max_message_len: usize,
}

impl Default for HubSettings {
    fn default() -> Self {
        Self {
            outbox_capacity: DEFAULT_OUTBOX_CAPACITY,
            group_capacity: DEFAULT_GROUP_CAPACITY,
            persist_queue: DEFAULT_QUEUE_CAPACITY,
            signals: SignalEngine::default(),
            history_limit: DEFAULT_HISTORY_LIMIT,
            max_message_len: MAX_MESSAGE_LEN,
        }
    }
}

/// External systems the Hub reads from and writes to
#[derive(Clone)]
pub struct Collaborators {
    pub identity: Arc<dyn IdentityResolver>,
    pub directory: Arc<dyn OrderDirectory>,
    pub store: Arc<dyn LocationStore>,
}

/// A freshly accepted connection
#[derive(Debug)]
pub struct Connection {
    pub conn_id: ConnectionId,
    /// Events queued for this connection, drained by its writer
    pub events: mpsc::Receiver<Frame>,
    pub identity: Option<Identity>,
}

pub struct Hub {
    pub(crate) registry: Arc<SessionRegistry>,
    pub(crate) dispatcher: GroupDispatcher,
    pub(crate) tracking: TrackingStore,
    pub(crate) persistence: PersistenceQueue,
    pub(crate) collaborators: Collaborators,
    pub(crate) settings: HubSettings,
    next_conn_id: AtomicU64,
}

impl Hub {
    /// Create a Hub. Spawns the persistence worker, so this must run inside
    /// a tokio runtime.
    pub fn new(collaborators: Collaborators, settings: HubSettings) -> Self {
        let registry = Arc::new(SessionRegistry::new());
        let dispatcher = GroupDispatcher::with_capacity(registry.clone(), settings.group_capacity);
        let (persistence, _worker) =
            PersistenceQueue::spawn(collaborators.store.clone(), settings.persist_queue);

        Self {
            registry,
            dispatcher,
            tracking: TrackingStore::new(),
            persistence,
            collaborators,
            settings,
            next_conn_id: AtomicU64::new(1),
        }
    }

    /// Accept a connection: resolve its identity, register the session and
    /// greet it with `Connected`. An unresolvable token still yields a
    /// connection, as an anonymous session that gets an `Error` instead.
    pub async fn connect(&self, token: Option<&str>) -> Connection {
        let conn_id = self.next_conn_id.fetch_add(1, Ordering::Relaxed);
        let (outbox, events) = outbox::channel(conn_id, self.settings.outbox_capacity);
        let identity = self.collaborators.identity.resolve(token).await;

        let greeting = match self.registry.register(conn_id, identity.clone(), outbox) {
            Ok(session) => {
                let identity = session.identity.as_ref();
                info!(
                    conn_id,
                    user_id = ?identity.map(|i| i.user_id),
                    role = ?identity.map(|i| i.role),
                    "connection established"
                );
                identity.map(|identity| {
                    ServerEvent::Connected(ConnectedPayload {
                        connection_id: conn_id,
                        user_id: identity.user_id,
                        role: identity.role,
                        timestamp: session.connected_at,
                    })
                })
            }
            Err(e) => {
                warn!(conn_id, error = %e, "connection is not authenticated");
                Some(ServerEvent::Error(e.to_string()))
            }
        };

        if let Some(event) = greeting {
            self.dispatcher.send_to_connection(conn_id, event);
        }

        Connection {
            conn_id,
            events,
            identity,
        }
    }

    /// Drop a connection everywhere. A driver working an order leaves a
    /// single `DriverDisconnected` behind in that order's group.
    pub fn remove_session(&self, conn_id: ConnectionId) -> Option<Session> {
        let session = self.registry.remove(conn_id);
        let left = self.dispatcher.evict(conn_id);
        for &order_id in &left {
            self.release_tracking(order_id);
        }
        let session = session?;

        if session.is_driver()
            && let Some(order_id) = session.active_order_id
        {
            self.dispatcher
                .broadcast(order_id, ServerEvent::DriverDisconnected(OrderRef::now(order_id)));
            info!(conn_id, order_id, driver_id = ?session.driver_id(), "driver disconnected");
        }

        info!(conn_id, groups = left.len(), "connection closed");
        Some(session)
    }

    /// Session of an authenticated connection
    pub(crate) fn authenticated(&self, conn_id: ConnectionId) -> Result<Session, TrackingError> {
        let session = self
            .registry
            .lookup(conn_id)
            .ok_or_else(|| TrackingError::unknown_session(conn_id))?;
        if !session.is_authenticated() {
            return Err(TrackingError::AccessDenied(
                "connection is not authenticated".to_string(),
            ));
        }
        Ok(session)
    }

    pub(crate) async fn fetch_order(&self, order_id: OrderId) -> Result<OrderRecord, TrackingError> {
        self.collaborators
            .directory
            .order(order_id)
            .await
            .map_err(|e| TrackingError::PersistenceFailure(e.to_string()))?
            .ok_or_else(|| TrackingError::unknown_order(order_id))
    }

    /// Session and order, once the session may observe the order
    async fn authorize(
        &self,
        conn_id: ConnectionId,
        order_id: OrderId,
    ) -> Result<(Session, OrderRecord), TrackingError> {
        let session = self.authenticated(conn_id)?;
        let order = self.fetch_order(order_id).await?;
        if !can_access_order(&session, &order) {
            return Err(TrackingError::AccessDenied(format!("order {}", order_id)));
        }
        Ok((session, order))
    }

    /// Join an order's group and get a fresh snapshot of it
    pub async fn join(
        &self,
        conn_id: ConnectionId,
        order_id: OrderId,
    ) -> Result<TrackingSnapshot, TrackingError> {
        let (session, order) = self.authorize(conn_id, order_id).await?;

        let outcome = self.dispatcher.join(&session.outbox, order_id);
        if !self.registry.contains(conn_id) {
            // Disconnected while joining
            self.dispatcher.leave(conn_id, order_id);
            return Err(TrackingError::unknown_session(conn_id));
        }

        if is_assigned_driver(&session, &order) {
            self.registry.set_active_order(conn_id, order_id);
        }

        if outcome == JoinOutcome::Joined {
            debug!(conn_id, order_id, "tracking started");
            self.request_driver_location(&session, &order);
        }

        Ok(TrackingSnapshot {
            order_id: order.order_id,
            order_number: order.order_number.clone(),
            status: order.status.clone(),
            driver: order.driver.as_ref().map(|d| d.summary()),
            timestamp: Utc::now(),
        })
    }

    /// Ask the assigned driver for a fresh fix on behalf of a new tracker
    fn request_driver_location(&self, joiner: &Session, order: &OrderRecord) {
        let Some(driver_id) = order.driver_id() else {
            return;
        };
        if joiner.driver_id() == Some(driver_id) {
            return;
        }
        if let Some(driver) = self.registry.find_by_driver_id(driver_id)
            && driver.conn_id != joiner.conn_id
        {
            let event = ServerEvent::RequestCurrentLocation(OrderRef::now(order.order_id));
            if self.dispatcher.send_to_connection(driver.conn_id, event) == Delivery::Queued {
                debug!(
                    order_id = order.order_id,
                    driver_id,
                    driver_conn = driver.conn_id,
                    "requested current location"
                );
            }
        }
    }

    /// Leave an order's group. Not being a member is fine.
    pub fn leave(&self, conn_id: ConnectionId, order_id: OrderId) -> bool {
        self.registry.clear_active_order(conn_id, order_id);
        let left = self.dispatcher.leave(conn_id, order_id);
        if left {
            self.release_tracking(order_id);
            debug!(conn_id, order_id, "tracking stopped");
        }
        left
    }

    /// Drop an order's live tracking state once nobody is tracking it
    pub(crate) fn release_tracking(&self, order_id: OrderId) {
        if self
            .tracking
            .forget_if(order_id, || self.dispatcher.member_count(order_id) == 0)
        {
            debug!(order_id, "tracking state released");
        }
    }

    /// Broadcast to an order's group, returning how many members it reached
    pub fn broadcast(&self, order_id: OrderId, event: ServerEvent) -> usize {
        self.dispatcher.broadcast(order_id, event)
    }

    pub fn send_to_connection(&self, conn_id: ConnectionId, event: ServerEvent) -> Delivery {
        self.dispatcher.send_to_connection(conn_id, event)
    }

    /// Recent pings for an order, oldest first
    pub async fn location_history(
        &self,
        conn_id: ConnectionId,
        order_id: OrderId,
    ) -> Result<LocationHistory, TrackingError> {
        self.authorize(conn_id, order_id).await?;

        let locations = self
            .collaborators
            .store
            .history(order_id, self.settings.history_limit)
            .await
            .map_err(|e| TrackingError::PersistenceFailure(e.to_string()))?;

        debug!(conn_id, order_id, count = locations.len(), "location history served");
        Ok(LocationHistory {
            order_id,
            locations,
        })
    }

    /// Chat to everyone tracking an order
    pub async fn send_message(
        &self,
        conn_id: ConnectionId,
        order_id: OrderId,
        text: &str,
    ) -> Result<(), TrackingError> {
        let (session, _) = self.authorize(conn_id, order_id).await?;

        let text = text.trim();
        if text.is_empty() {
            return Err(TrackingError::ValidationFailure(
                "message text is empty".to_string(),
            ));
        }
        let len = text.chars().count();
        if len > self.settings.max_message_len {
            return Err(TrackingError::ValidationFailure(format!(
                "message text is {} characters, limit is {}",
                len, self.settings.max_message_len
            )));
        }

        let Some(identity) = session.identity else {
            return Err(TrackingError::AuthenticationMissing);
        };
        let event = ServerEvent::MessageReceived(ChatMessage {
            order_id,
            sender_id: identity.user_id,
            sender_name: identity.name,
            sender_role: identity.role,
            message: text.to_string(),
            timestamp: Utc::now(),
        });
        let reached = self.dispatcher.broadcast(order_id, event);
        debug!(conn_id, order_id, reached, "message sent");
        Ok(())
    }

    /// Record a driver's availability, announcing it to the order's group
    /// when one is given
    pub async fn update_driver_status(
        &self,
        conn_id: ConnectionId,
        status: DriverStatus,
        order_id: Option<OrderId>,
    ) -> Result<(), TrackingError> {
        let session = self.authenticated(conn_id)?;
        let Some(driver_id) = session.driver_id() else {
            return Err(TrackingError::AccessDenied(
                "only drivers can update driver status".to_string(),
            ));
        };

        if let Some(order_id) = order_id {
            let order = self.fetch_order(order_id).await?;
            if !is_assigned_driver(&session, &order) {
                return Err(TrackingError::AccessDenied(format!(
                    "driver {} is not assigned to order {}",
                    driver_id, order_id
                )));
            }
        }

        if let Err(e) = self
            .collaborators
            .directory
            .record_driver_status(driver_id, status)
            .await
        {
            warn!(conn_id, driver_id, %status, error = %e, "failed to record driver status");
        }

        if let Some(order_id) = order_id {
            self.dispatcher.broadcast(
                order_id,
                ServerEvent::DriverStatusChanged(DriverStatusChange {
                    order_id,
                    driver_id,
                    status,
                    timestamp: Utc::now(),
                }),
            );
        }

        info!(conn_id, driver_id, %status, order_id = ?order_id, "driver status updated");
        Ok(())
    }

    /// Push an order status change from the order-management system
    pub fn notify_order_status(
        &self,
        order_id: OrderId,
        status: &str,
        message: Option<String>,
    ) -> usize {
        let reached = self.dispatcher.broadcast(
            order_id,
            ServerEvent::OrderStatusChanged(OrderStatusChange {
                order_id,
                status: status.to_string(),
                message,
                timestamp: Utc::now(),
            }),
        );
        debug!(order_id, status, reached, "order status pushed");
        reached
    }

    pub fn session(&self, conn_id: ConnectionId) -> Option<Session> {
        self.registry.lookup(conn_id)
    }

    pub fn is_member(&self, conn_id: ConnectionId, order_id: OrderId) -> bool {
        self.dispatcher.is_member(conn_id, order_id)
    }

    pub fn member_count(&self, order_id: OrderId) -> usize {
        self.dispatcher.member_count(order_id)
    }

    /// Get session count
    pub fn session_count(&self) -> usize {
        self.registry.len()
    }

    /// Get group count
    pub fn group_count(&self) -> usize {
        self.dispatcher.group_count()
    }

    /// Orders with live tracking state
    pub fn tracked_order_count(&self) -> usize {
        self.tracking.len()
    }

    #[cfg(test)]
    pub(crate) fn tracking(&self) -> &TrackingStore {
        &self.tracking
    }

    pub fn settings(&self) -> &HubSettings {
        &self.settings
    }
}

impl std::fmt::Debug for Hub {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Hub")
            .field("sessions", &self.registry.len())
            .field("groups", &self.dispatcher.group_count())
            .field("tracked_orders", &self.tracking.len())
            .finish()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::directory::{AssignedDriver, MemoryOrderDirectory};
    use crate::identity::SignedTokenResolver;
    use crate::ingest::LocationFix;
    use crate::session::{LatLng, Role};
    use crate::store::MemoryLocationStore;
    use std::time::Duration;
    use tokio::time::timeout;

    pub const SECRET: &str = "test-secret";

    pub struct Fixture {
        pub hub: Hub,
        pub resolver: SignedTokenResolver,
        pub directory: Arc<MemoryOrderDirectory>,
        pub store: Arc<MemoryLocationStore>,
    }

    impl Fixture {
        pub fn new() -> Self {
            Self::with_settings(HubSettings::default())
        }

        pub fn with_settings(settings: HubSettings) -> Self {
            let directory = Arc::new(MemoryOrderDirectory::new());
            directory.upsert(order(1, Some(7), Some(LatLng::new(35.7020, 51.4010))));
            directory.upsert(order(2, None, None));
            let store = Arc::new(MemoryLocationStore::new());
            let collaborators = Collaborators {
                identity: Arc::new(SignedTokenResolver::new(SECRET)),
                directory: directory.clone(),
                store: store.clone(),
            };
            Self {
                hub: Hub::new(collaborators, settings),
                resolver: SignedTokenResolver::new(SECRET),
                directory,
                store,
            }
        }

        pub async fn connect(&self, identity: &Identity) -> Connection {
            let token = self.resolver.verifier().sign(identity).unwrap();
            let mut connection = self.hub.connect(Some(&token)).await;
            let greeting = next_event(&mut connection.events).await;
            assert_eq!(greeting.name(), "Connected");
            connection
        }
    }

    pub fn order(order_id: OrderId, driver_id: Option<i64>, destination: Option<LatLng>) -> OrderRecord {
        OrderRecord {
            order_id,
            order_number: format!("MV-{:04}", order_id),
            customer_id: 100,
            status: "DriverAssigned".to_string(),
            driver: driver_id.map(|driver_id| AssignedDriver {
                driver_id,
                user_id: 200 + driver_id,
                name: "Ava".to_string(),
                phone: None,
                vehicle: None,
                rating: Some(4.9),
            }),
            destination,
        }
    }

    pub fn customer(user_id: i64) -> Identity {
        Identity {
            user_id,
            role: Role::Customer,
            driver_id: None,
            name: "Kim".to_string(),
        }
    }

    pub fn driver(driver_id: i64) -> Identity {
        Identity {
            user_id: 200 + driver_id,
            role: Role::Driver,
            driver_id: Some(driver_id),
            name: "Ava".to_string(),
        }
    }

    pub fn admin() -> Identity {
        Identity {
            user_id: 1,
            role: Role::Admin,
            driver_id: None,
            name: "Ops".to_string(),
        }
    }

    pub async fn next_event(rx: &mut mpsc::Receiver<Frame>) -> Frame {
        timeout(Duration::from_secs(1), rx.recv())
            .await
            .expect("timed out waiting for event")
            .expect("connection closed")
    }

    pub async fn assert_no_event(rx: &mut mpsc::Receiver<Frame>) {
        if let Ok(Some(frame)) = timeout(Duration::from_millis(50), rx.recv()).await {
            panic!("unexpected event: {:?}", frame);
        }
    }

    #[tokio::test]
    async fn test_connect_greets_with_connected() {
        let fixture = Fixture::new();
        let token = fixture.resolver.verifier().sign(&customer(100)).unwrap();
        let mut connection = fixture.hub.connect(Some(&token)).await;

        match &*next_event(&mut connection.events).await {
            ServerEvent::Connected(payload) => {
                assert_eq!(payload.connection_id, connection.conn_id);
                assert_eq!(payload.user_id, 100);
                assert_eq!(payload.role, Role::Customer);
            }
            other => panic!("expected Connected, got {:?}", other),
        }
        assert_eq!(fixture.hub.session_count(), 1);
    }

    #[tokio::test]
    async fn test_connect_without_token_is_anonymous() {
        let fixture = Fixture::new();
        let mut connection = fixture.hub.connect(None).await;

        assert!(matches!(
            &*next_event(&mut connection.events).await,
            ServerEvent::Error(_)
        ));
        assert!(connection.identity.is_none());
        assert_eq!(fixture.hub.session_count(), 1);

        let err = fixture.hub.join(connection.conn_id, 1).await.unwrap_err();
        assert_eq!(err.kind(), "access_denied");
    }

    #[tokio::test]
    async fn test_join_returns_snapshot() {
        let fixture = Fixture::new();
        let connection = fixture.connect(&customer(100)).await;

        let snapshot = fixture.hub.join(connection.conn_id, 1).await.unwrap();
        assert_eq!(snapshot.order_number, "MV-0001");
        assert_eq!(snapshot.status, "DriverAssigned");
        let driver = snapshot.driver.unwrap();
        assert_eq!(driver.driver_id, 7);
        assert_eq!(driver.rating, Some(4.9));
    }

    #[tokio::test]
    async fn test_join_twice_keeps_one_membership() {
        let fixture = Fixture::new();
        let connection = fixture.connect(&customer(100)).await;

        fixture.hub.join(connection.conn_id, 1).await.unwrap();
        fixture.hub.join(connection.conn_id, 1).await.unwrap();
        assert_eq!(fixture.hub.member_count(1), 1);
    }

    #[tokio::test]
    async fn test_join_denied_for_other_customer() {
        let fixture = Fixture::new();
        let connection = fixture.connect(&customer(555)).await;

        let err = fixture.hub.join(connection.conn_id, 1).await.unwrap_err();
        assert!(matches!(err, TrackingError::AccessDenied(_)));
        assert_eq!(fixture.hub.member_count(1), 0);
    }

    #[tokio::test]
    async fn test_join_unknown_order() {
        let fixture = Fixture::new();
        let connection = fixture.connect(&admin()).await;

        let err = fixture.hub.join(connection.conn_id, 404).await.unwrap_err();
        assert_eq!(err, TrackingError::unknown_order(404));
    }

    #[tokio::test]
    async fn test_new_tracker_requests_driver_location_once() {
        let fixture = Fixture::new();
        let mut driver = fixture.connect(&driver(7)).await;
        fixture.hub.join(driver.conn_id, 1).await.unwrap();
        assert_no_event(&mut driver.events).await;

        let customer = fixture.connect(&customer(100)).await;
        fixture.hub.join(customer.conn_id, 1).await.unwrap();
        match &*next_event(&mut driver.events).await {
            ServerEvent::RequestCurrentLocation(r) => assert_eq!(r.order_id, 1),
            other => panic!("expected RequestCurrentLocation, got {:?}", other),
        }

        // Repeat join has no side effects
        fixture.hub.join(customer.conn_id, 1).await.unwrap();
        assert_no_event(&mut driver.events).await;
    }

    #[tokio::test]
    async fn test_driver_drop_emits_one_disconnect() {
        let fixture = Fixture::new();
        let driver = fixture.connect(&driver(7)).await;
        let mut customer = fixture.connect(&customer(100)).await;
        fixture.hub.join(driver.conn_id, 1).await.unwrap();
        fixture.hub.join(customer.conn_id, 1).await.unwrap();
        assert_eq!(
            fixture.hub.session(driver.conn_id).unwrap().active_order_id,
            Some(1)
        );

        assert!(fixture.hub.remove_session(driver.conn_id).is_some());
        assert!(fixture.hub.remove_session(driver.conn_id).is_none());

        match &*next_event(&mut customer.events).await {
            ServerEvent::DriverDisconnected(r) => assert_eq!(r.order_id, 1),
            other => panic!("expected DriverDisconnected, got {:?}", other),
        }
        assert_no_event(&mut customer.events).await;
        assert_eq!(fixture.hub.member_count(1), 1);
    }

    #[tokio::test]
    async fn test_remove_clears_every_group() {
        let fixture = Fixture::new();
        let admin = fixture.connect(&admin()).await;
        fixture.hub.join(admin.conn_id, 1).await.unwrap();
        fixture.hub.join(admin.conn_id, 2).await.unwrap();
        assert_eq!(fixture.hub.group_count(), 2);

        fixture.hub.remove_session(admin.conn_id);
        assert!(!fixture.hub.is_member(admin.conn_id, 1));
        assert!(!fixture.hub.is_member(admin.conn_id, 2));
        assert_eq!(fixture.hub.group_count(), 0);
        assert_eq!(fixture.hub.session_count(), 0);
    }

    #[tokio::test]
    async fn test_tracking_state_released_with_last_member() {
        let fixture = Fixture::new();
        let driver = fixture.connect(&driver(7)).await;
        let customer = fixture.connect(&customer(100)).await;
        fixture.hub.join(driver.conn_id, 1).await.unwrap();
        fixture.hub.join(customer.conn_id, 1).await.unwrap();

        fixture
            .hub
            .update_location(driver.conn_id, 1, LocationFix::new(35.7, 51.4))
            .await
            .unwrap();
        assert_eq!(fixture.hub.tracked_order_count(), 1);

        // One tracker left, state stays
        fixture.hub.remove_session(driver.conn_id);
        assert_eq!(fixture.hub.tracked_order_count(), 1);

        assert!(fixture.hub.leave(customer.conn_id, 1));
        assert_eq!(fixture.hub.tracked_order_count(), 0);
        assert_eq!(fixture.hub.group_count(), 0);
    }

    #[tokio::test]
    async fn test_tracking_state_released_on_disconnect() {
        let fixture = Fixture::new();
        let driver = fixture.connect(&driver(7)).await;
        let customer = fixture.connect(&customer(100)).await;
        fixture.hub.join(customer.conn_id, 1).await.unwrap();
        fixture
            .hub
            .update_location(driver.conn_id, 1, LocationFix::new(35.7, 51.4))
            .await
            .unwrap();

        fixture.hub.remove_session(driver.conn_id);
        fixture.hub.remove_session(customer.conn_id);
        assert_eq!(fixture.hub.session_count(), 0);
        assert_eq!(fixture.hub.group_count(), 0);
        assert_eq!(fixture.hub.tracked_order_count(), 0);
    }

    #[tokio::test]
    async fn test_leave_clears_active_order() {
        let fixture = Fixture::new();
        let driver = fixture.connect(&driver(7)).await;
        fixture.hub.join(driver.conn_id, 1).await.unwrap();

        assert!(fixture.hub.leave(driver.conn_id, 1));
        assert!(!fixture.hub.leave(driver.conn_id, 1));
        assert_eq!(fixture.hub.session(driver.conn_id).unwrap().active_order_id, None);
    }

    #[tokio::test]
    async fn test_send_message_broadcasts_trimmed_text() {
        let fixture = Fixture::new();
        let mut customer = fixture.connect(&customer(100)).await;
        let mut driver = fixture.connect(&driver(7)).await;
        fixture.hub.join(driver.conn_id, 1).await.unwrap();
        fixture.hub.join(customer.conn_id, 1).await.unwrap();
        next_event(&mut driver.events).await; // RequestCurrentLocation

        fixture
            .hub
            .send_message(customer.conn_id, 1, "  on my way down  ")
            .await
            .unwrap();

        for rx in [&mut customer.events, &mut driver.events] {
            match &*next_event(rx).await {
                ServerEvent::MessageReceived(m) => {
                    assert_eq!(m.message, "on my way down");
                    assert_eq!(m.sender_id, 100);
                    assert_eq!(m.sender_role, Role::Customer);
                }
                other => panic!("expected MessageReceived, got {:?}", other),
            }
        }
    }

    #[tokio::test]
    async fn test_send_message_validation() {
        let fixture = Fixture::new();
        let customer = fixture.connect(&customer(100)).await;

        let err = fixture.hub.send_message(customer.conn_id, 1, "   ").await.unwrap_err();
        assert_eq!(err.kind(), "validation_failure");

        let long = "x".repeat(MAX_MESSAGE_LEN + 1);
        let err = fixture.hub.send_message(customer.conn_id, 1, &long).await.unwrap_err();
        assert_eq!(err.kind(), "validation_failure");

        let exact = "x".repeat(MAX_MESSAGE_LEN);
        assert!(fixture.hub.send_message(customer.conn_id, 1, &exact).await.is_ok());
    }

    #[tokio::test]
    async fn test_update_driver_status() {
        let fixture = Fixture::new();
        let driver = fixture.connect(&driver(7)).await;
        let mut customer = fixture.connect(&customer(100)).await;
        fixture.hub.join(customer.conn_id, 1).await.unwrap();

        fixture
            .hub
            .update_driver_status(driver.conn_id, DriverStatus::OnTrip, Some(1))
            .await
            .unwrap();

        assert_eq!(fixture.directory.driver_status(7), Some(DriverStatus::OnTrip));
        match &*next_event(&mut customer.events).await {
            ServerEvent::DriverStatusChanged(change) => {
                assert_eq!(change.driver_id, 7);
                assert_eq!(change.status, DriverStatus::OnTrip);
            }
            other => panic!("expected DriverStatusChanged, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_update_driver_status_rules() {
        let fixture = Fixture::new();
        let customer = fixture.connect(&customer(100)).await;
        let other_driver = fixture.connect(&driver(8)).await;

        let err = fixture
            .hub
            .update_driver_status(customer.conn_id, DriverStatus::Busy, None)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "access_denied");

        let err = fixture
            .hub
            .update_driver_status(other_driver.conn_id, DriverStatus::Busy, Some(1))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "access_denied");

        // No order: recorded without a broadcast
        fixture
            .hub
            .update_driver_status(other_driver.conn_id, DriverStatus::Offline, None)
            .await
            .unwrap();
        assert_eq!(fixture.directory.driver_status(8), Some(DriverStatus::Offline));
    }

    #[tokio::test]
    async fn test_notify_order_status() {
        let fixture = Fixture::new();
        let mut customer = fixture.connect(&customer(100)).await;
        fixture.hub.join(customer.conn_id, 1).await.unwrap();

        assert_eq!(
            fixture
                .hub
                .notify_order_status(1, "InProgress", Some("Picked up".to_string())),
            1
        );
        match &*next_event(&mut customer.events).await {
            ServerEvent::OrderStatusChanged(change) => {
                assert_eq!(change.status, "InProgress");
                assert_eq!(change.message.as_deref(), Some("Picked up"));
            }
            other => panic!("expected OrderStatusChanged, got {:?}", other),
        }
        assert_eq!(fixture.hub.notify_order_status(2, "Cancelled", None), 0);
    }
}
