//! Group dispatcher
//!
//! Per-order subscriber groups. Each group owns a `tokio::sync::broadcast`
//! channel, so a broadcast is O(1) for the caller; one forwarding task per
//! member moves events into that member's outbox.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::broadcast;
use tokio::task::AbortHandle;
use tracing::{debug, warn};

use crate::outbox::{Delivery, Frame, Outbox};
use crate::protocol::ServerEvent;
use crate::registry::SessionRegistry;
use crate::session::{ConnectionId, OrderId};

/// Broadcast channel capacity per order
pub const DEFAULT_GROUP_CAPACITY: usize = 256;

/// Result of a join
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinOutcome {
    Joined,
    AlreadyMember,
}

struct Group {
    tx: broadcast::Sender<Frame>,
    /// Forwarding task per member
    members: HashMap<ConnectionId, AbortHandle>,
}

/// Order groups and their members
///
/// Lock order is `memberships` before `groups` everywhere.
pub struct GroupDispatcher {
    registry: Arc<SessionRegistry>,
    groups: DashMap<OrderId, Group>,
    /// Reverse index: conn_id -> joined orders
    memberships: DashMap<ConnectionId, HashSet<OrderId>>,
    capacity: usize,
}

impl GroupDispatcher {
    pub fn new(registry: Arc<SessionRegistry>) -> Self {
        Self::with_capacity(registry, DEFAULT_GROUP_CAPACITY)
    }

    pub fn with_capacity(registry: Arc<SessionRegistry>, capacity: usize) -> Self {
        Self {
            registry,
            groups: DashMap::new(),
            memberships: DashMap::new(),
            capacity: capacity.max(1),
        }
    }

    /// Add a connection to an order's group. Joining twice is a no-op.
    pub fn join(&self, outbox: &Outbox, order_id: OrderId) -> JoinOutcome {
        let conn_id = outbox.conn_id();
        let mut orders = self.memberships.entry(conn_id).or_default();
        if orders.contains(&order_id) {
            debug!(conn_id, order_id, "already joined");
            return JoinOutcome::AlreadyMember;
        }

        let capacity = self.capacity;
        let mut group = self.groups.entry(order_id).or_insert_with(|| {
            let (tx, _) = broadcast::channel(capacity);
            debug!(order_id, "group created");
            Group {
                tx,
                members: HashMap::new(),
            }
        });

        let rx = group.tx.subscribe();
        let handle = tokio::spawn(forward(conn_id, order_id, rx, outbox.clone()));
        group.members.insert(conn_id, handle.abort_handle());
        orders.insert(order_id);

        debug!(conn_id, order_id, members = group.members.len(), "joined group");
        JoinOutcome::Joined
    }

    /// Remove a connection from an order's group. Returns false if it was
    /// not a member.
    pub fn leave(&self, conn_id: ConnectionId, order_id: OrderId) -> bool {
        let removed = match self.memberships.get_mut(&conn_id) {
            Some(mut orders) => {
                let removed = orders.remove(&order_id);
                if removed {
                    self.detach(conn_id, order_id);
                }
                removed
            }
            None => false,
        };
        self.memberships.remove_if(&conn_id, |_, orders| orders.is_empty());

        if removed {
            debug!(conn_id, order_id, "left group");
        }
        removed
    }

    /// Remove a connection from every group, returning the orders it left
    pub fn evict(&self, conn_id: ConnectionId) -> Vec<OrderId> {
        let Some((_, orders)) = self.memberships.remove(&conn_id) else {
            return Vec::new();
        };

        let orders: Vec<OrderId> = orders.into_iter().collect();
        for &order_id in &orders {
            self.detach(conn_id, order_id);
        }

        debug!(conn_id, groups = orders.len(), "evicted from groups");
        orders
    }

    fn detach(&self, conn_id: ConnectionId, order_id: OrderId) {
        if let Some(mut group) = self.groups.get_mut(&order_id)
            && let Some(handle) = group.members.remove(&conn_id)
        {
            handle.abort();
        }

        if self
            .groups
            .remove_if(&order_id, |_, group| group.members.is_empty())
            .is_some()
        {
            debug!(order_id, "removed empty group");
        }
    }

    /// Broadcast an event to every member of an order's group. Returns the
    /// number of members it was queued for.
    pub fn broadcast(&self, order_id: OrderId, event: ServerEvent) -> usize {
        let Some(group) = self.groups.get(&order_id) else {
            debug!(order_id, event = event.name(), "no group for broadcast");
            return 0;
        };

        let name = event.name();
        match group.tx.send(Arc::new(event)) {
            Ok(n) => {
                debug!(order_id, event = name, receivers = n, "broadcast sent");
                n
            }
            Err(_) => {
                debug!(order_id, event = name, "no receivers for broadcast");
                0
            }
        }
    }

    /// Send an event to one connection. Silently dropped if the connection
    /// is gone at send time.
    pub fn send_to_connection(&self, conn_id: ConnectionId, event: ServerEvent) -> Delivery {
        let Some(session) = self.registry.lookup(conn_id) else {
            debug!(conn_id, event = event.name(), "send to unknown connection dropped");
            return Delivery::Closed;
        };
        session.outbox.try_deliver(Arc::new(event))
    }

    pub fn is_member(&self, conn_id: ConnectionId, order_id: OrderId) -> bool {
        self.memberships
            .get(&conn_id)
            .map(|orders| orders.contains(&order_id))
            .unwrap_or(false)
    }

    /// Member count for an order's group
    pub fn member_count(&self, order_id: OrderId) -> usize {
        self.groups
            .get(&order_id)
            .map(|group| group.members.len())
            .unwrap_or(0)
    }

    /// Get group count
    pub fn group_count(&self) -> usize {
        self.groups.len()
    }
}

impl std::fmt::Debug for GroupDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GroupDispatcher")
            .field("groups", &self.groups.len())
            .field("connections", &self.memberships.len())
            .finish()
    }
}

/// Move group events into a member's outbox until either side closes
async fn forward(
    conn_id: ConnectionId,
    order_id: OrderId,
    mut rx: broadcast::Receiver<Frame>,
    outbox: Outbox,
) {
    loop {
        match rx.recv().await {
            Ok(frame) => {
                if !outbox.deliver(frame).await {
                    break;
                }
            }
            Err(broadcast::error::RecvError::Lagged(n)) => {
                outbox.record_lagged(n);
                warn!(conn_id, order_id, lagged = n, "member lagged, oldest events dropped");
            }
            Err(broadcast::error::RecvError::Closed) => {
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::outbox;
    use crate::protocol::OrderRef;
    use std::time::Duration;
    use tokio::sync::mpsc;
    use tokio::time::timeout;

    fn dispatcher() -> GroupDispatcher {
        GroupDispatcher::new(Arc::new(SessionRegistry::new()))
    }

    fn ping_event(order_id: OrderId) -> ServerEvent {
        ServerEvent::RequestCurrentLocation(OrderRef::now(order_id))
    }

    async fn next(rx: &mut mpsc::Receiver<Frame>) -> Frame {
        timeout(Duration::from_secs(1), rx.recv())
            .await
            .expect("timed out waiting for event")
            .expect("outbox closed")
    }

    async fn assert_quiet(rx: &mut mpsc::Receiver<Frame>) {
        assert!(timeout(Duration::from_millis(50), rx.recv()).await.is_err());
    }

    #[tokio::test]
    async fn test_join_is_idempotent() {
        let dispatcher = dispatcher();
        let (outbox, _rx) = outbox::channel(1, 8);

        assert_eq!(dispatcher.join(&outbox, 10), JoinOutcome::Joined);
        assert_eq!(dispatcher.join(&outbox, 10), JoinOutcome::AlreadyMember);
        assert_eq!(dispatcher.member_count(10), 1);
        assert!(dispatcher.is_member(1, 10));
    }

    #[tokio::test]
    async fn test_broadcast_reaches_every_member_once() {
        let dispatcher = dispatcher();
        let (a, mut rx_a) = outbox::channel(1, 8);
        let (b, mut rx_b) = outbox::channel(2, 8);
        let (c, mut rx_c) = outbox::channel(3, 8);
        dispatcher.join(&a, 10);
        dispatcher.join(&b, 10);
        dispatcher.join(&c, 11);

        let event = ping_event(10);
        assert_eq!(dispatcher.broadcast(10, event.clone()), 2);

        assert_eq!(*next(&mut rx_a).await, event);
        assert_eq!(*next(&mut rx_b).await, event);
        assert_quiet(&mut rx_a).await;
        assert_quiet(&mut rx_c).await;
    }

    #[tokio::test]
    async fn test_broadcast_preserves_order_per_group() {
        let dispatcher = dispatcher();
        let (a, mut rx) = outbox::channel(1, 64);
        dispatcher.join(&a, 10);

        for i in 0..20 {
            dispatcher.broadcast(10, ServerEvent::Error(format!("{}", i)));
        }
        for i in 0..20 {
            assert_eq!(*next(&mut rx).await, ServerEvent::Error(format!("{}", i)));
        }
    }

    #[tokio::test]
    async fn test_leave_and_empty_group_pruned() {
        let dispatcher = dispatcher();
        let (a, _rx) = outbox::channel(1, 8);
        dispatcher.join(&a, 10);
        assert_eq!(dispatcher.group_count(), 1);

        assert!(dispatcher.leave(1, 10));
        assert!(!dispatcher.leave(1, 10));
        assert!(!dispatcher.leave(99, 10));
        assert_eq!(dispatcher.group_count(), 0);
        assert_eq!(dispatcher.member_count(10), 0);
        assert!(!dispatcher.is_member(1, 10));
    }

    #[tokio::test]
    async fn test_evict_removes_every_membership() {
        let dispatcher = dispatcher();
        let (a, _rx_a) = outbox::channel(1, 8);
        let (b, _rx_b) = outbox::channel(2, 8);
        dispatcher.join(&a, 10);
        dispatcher.join(&a, 11);
        dispatcher.join(&b, 11);

        let mut left = dispatcher.evict(1);
        left.sort();
        assert_eq!(left, vec![10, 11]);
        assert_eq!(dispatcher.member_count(10), 0);
        assert_eq!(dispatcher.member_count(11), 1);
        assert_eq!(dispatcher.group_count(), 1);
        assert!(!dispatcher.is_member(1, 11));
        assert!(dispatcher.evict(1).is_empty());
    }

    #[tokio::test]
    async fn test_broadcast_without_group_is_noop() {
        let dispatcher = dispatcher();
        assert_eq!(dispatcher.broadcast(10, ping_event(10)), 0);
    }

    #[tokio::test]
    async fn test_send_to_connection_checks_registry() {
        let registry = Arc::new(SessionRegistry::new());
        let dispatcher = GroupDispatcher::new(registry.clone());
        let (outbox, mut rx) = outbox::channel(1, 8);
        registry.register(1, None, outbox).ok();

        assert_eq!(dispatcher.send_to_connection(1, ping_event(10)), Delivery::Queued);
        assert_eq!(next(&mut rx).await.name(), "RequestCurrentLocation");

        registry.remove(1);
        assert_eq!(dispatcher.send_to_connection(1, ping_event(10)), Delivery::Closed);
    }

    #[tokio::test]
    async fn test_stalled_member_drops_oldest() {
        let dispatcher = GroupDispatcher::with_capacity(Arc::new(SessionRegistry::new()), 4);
        let (slow, mut slow_rx) = outbox::channel(1, 1);
        dispatcher.join(&slow, 10);

        for i in 0..20 {
            dispatcher.broadcast(10, ServerEvent::Error(format!("{}", i)));
        }

        // The newest events survive; the oldest were skipped
        let mut seen = Vec::new();
        while let Ok(Some(frame)) = timeout(Duration::from_millis(100), slow_rx.recv()).await {
            if let ServerEvent::Error(text) = &*frame {
                seen.push(text.parse::<u32>().unwrap());
            }
        }
        assert!(seen.len() < 20);
        assert_eq!(seen.last(), Some(&19));
        assert!(seen.windows(2).all(|w| w[0] < w[1]));
        assert!(slow.dropped() > 0);
    }
}
