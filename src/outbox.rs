//! Per-connection outbound queue
//!
//! Every connection owns one bounded queue drained by its writer task.
//! Unicast delivery refuses new events when the queue is full (drop-newest).
//! Group delivery goes through the order's broadcast channel first, so a
//! stalled member lags there and loses the oldest events (drop-oldest).

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::sync::mpsc;
use tracing::warn;

use crate::protocol::ServerEvent;
use crate::session::ConnectionId;

/// Event as queued for a connection
pub type Frame = Arc<ServerEvent>;

/// Outcome of a non-blocking delivery
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    Queued,
    /// Queue full, event dropped
    Dropped,
    /// Connection is gone
    Closed,
}

/// Sending half of a connection's outbound queue
#[derive(Debug, Clone)]
pub struct Outbox {
    conn_id: ConnectionId,
    tx: mpsc::Sender<Frame>,
    dropped: Arc<AtomicU64>,
}

/// Create an outbound queue for a connection
pub fn channel(conn_id: ConnectionId, capacity: usize) -> (Outbox, mpsc::Receiver<Frame>) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    let outbox = Outbox {
        conn_id,
        tx,
        dropped: Arc::new(AtomicU64::new(0)),
    };
    (outbox, rx)
}

impl Outbox {
    pub fn conn_id(&self) -> ConnectionId {
        self.conn_id
    }

    /// Queue an event without waiting
    pub fn try_deliver(&self, frame: Frame) -> Delivery {
        match self.tx.try_send(frame) {
            Ok(()) => Delivery::Queued,
            Err(mpsc::error::TrySendError::Full(frame)) => {
                let total = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                warn!(
                    conn_id = self.conn_id,
                    event = frame.name(),
                    dropped = total,
                    "outbox full, dropping event"
                );
                Delivery::Dropped
            }
            Err(mpsc::error::TrySendError::Closed(_)) => Delivery::Closed,
        }
    }

    /// Queue an event, waiting for capacity. Returns false once the
    /// connection is gone.
    pub async fn deliver(&self, frame: Frame) -> bool {
        self.tx.send(frame).await.is_ok()
    }

    /// Record events lost upstream of this queue
    pub fn record_lagged(&self, count: u64) {
        self.dropped.fetch_add(count, Ordering::Relaxed);
    }

    /// Total events dropped for this connection
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn error_event(text: &str) -> Frame {
        Arc::new(ServerEvent::Error(text.to_string()))
    }

    #[test]
    fn test_full_queue_drops_newest() {
        let (outbox, mut rx) = channel(1, 2);
        assert_eq!(outbox.try_deliver(error_event("a")), Delivery::Queued);
        assert_eq!(outbox.try_deliver(error_event("b")), Delivery::Queued);
        assert_eq!(outbox.try_deliver(error_event("c")), Delivery::Dropped);
        assert_eq!(outbox.dropped(), 1);

        assert_eq!(*rx.try_recv().unwrap(), ServerEvent::Error("a".into()));
        assert_eq!(*rx.try_recv().unwrap(), ServerEvent::Error("b".into()));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_closed_queue_is_noop() {
        let (outbox, rx) = channel(1, 2);
        drop(rx);
        assert_eq!(outbox.try_deliver(error_event("late")), Delivery::Closed);
        assert_eq!(outbox.dropped(), 0);
    }

    #[tokio::test]
    async fn test_deliver_waits_for_capacity() {
        let (outbox, mut rx) = channel(1, 1);
        assert!(outbox.deliver(error_event("first")).await);

        let sender = outbox.clone();
        let pending = tokio::spawn(async move { sender.deliver(error_event("second")).await });

        assert_eq!(*rx.recv().await.unwrap(), ServerEvent::Error("first".into()));
        assert!(pending.await.unwrap());
        assert_eq!(*rx.recv().await.unwrap(), ServerEvent::Error("second".into()));
    }
}
