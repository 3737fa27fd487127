//! WebSocket transport
//!
//! `GET /ws?token=...` upgrades to a tracking connection, `GET /health`
//! reports liveness. Each connection runs as a reader loop plus a writer
//! task and a keepalive task:
//! - Writer: owns the sink, drains the connection's event queue
//! - Keepalive: pings periodically, gives up when a pong is late
//! - Reader: parses command frames and hands them to the handler

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    Json, Router,
    extract::{
        Query, State,
        ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade},
    },
    response::Response,
    routing::get,
};
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{interval, timeout};
use tracing::{debug, error, info, warn};

use crate::handler;
use crate::hub::Hub;
use crate::outbox::Frame;
use crate::protocol::{ServerEvent, encode_event};
use crate::session::ConnectionId;

/// Default interval between server pings
pub const DEFAULT_PING_INTERVAL: Duration = Duration::from_secs(30);

/// Pong timeout: if no pong arrives this long after a ping, close.
const PONG_TIMEOUT: Duration = Duration::from_secs(10);

const CLOSE_FLUSH_TIMEOUT: Duration = Duration::from_secs(1);

/// Queued keepalive frames per connection
const CONTROL_QUEUE: usize = 4;

/// Close code sent when a pong is late
const CLOSE_GOING_AWAY: u16 = 1001;

#[derive(Clone)]
pub struct AppState {
    pub hub: Arc<Hub>,
    pub ping_interval: Duration,
}

impl AppState {
    pub fn new(hub: Arc<Hub>) -> Self {
        Self {
            hub,
            ping_interval: DEFAULT_PING_INTERVAL,
        }
    }
}

/// Query parameters for the WebSocket upgrade
#[derive(Debug, Deserialize)]
pub struct WsQuery {
    #[serde(default)]
    pub token: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Health {
    pub status: String,
    pub sessions: usize,
    pub groups: usize,
    pub tracked_orders: usize,
}

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/ws", get(ws_upgrade))
        .route("/health", get(health))
        .with_state(state)
}

/// Serve the router until `shutdown` resolves
pub async fn serve(
    listener: TcpListener,
    state: AppState,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> std::io::Result<()> {
    if let Ok(addr) = listener.local_addr() {
        info!(%addr, "listening");
    }
    axum::serve(listener, build_router(state))
        .with_graceful_shutdown(shutdown)
        .await
}

/// GET /ws?token=TOKEN
///
/// The token is optional: without a valid one the connection is kept as an
/// anonymous session that is told so with an `Error` event.
async fn ws_upgrade(
    State(state): State<AppState>,
    Query(query): Query<WsQuery>,
    ws: WebSocketUpgrade,
) -> Response {
    ws.on_upgrade(move |socket| run_connection(socket, state, query.token))
}

/// GET /health
async fn health(State(state): State<AppState>) -> Json<Health> {
    Json(Health {
        status: "ok".to_string(),
        sessions: state.hub.session_count(),
        groups: state.hub.group_count(),
        tracked_orders: state.hub.tracked_order_count(),
    })
}

/// Serve one connection until it closes, then remove it from the Hub
pub async fn run_connection(socket: WebSocket, state: AppState, token: Option<String>) {
    let connection = state.hub.connect(token.as_deref()).await;
    let conn_id = connection.conn_id;

    let (sink, mut stream) = socket.split();
    let (control_tx, control_rx) = mpsc::channel::<Message>(CONTROL_QUEUE);
    let (pong_tx, pong_rx) = mpsc::channel::<()>(1);

    let mut writer = tokio::spawn(writer_task(conn_id, sink, connection.events, control_rx));
    let mut keepalive = spawn_keepalive(conn_id, state.ping_interval, control_tx, pong_rx);

    loop {
        let msg = tokio::select! {
            msg = stream.next() => msg,
            _ = &mut writer => {
                debug!(conn_id, "writer finished");
                break;
            }
            _ = &mut keepalive => {
                debug!(conn_id, "keepalive gave up");
                // Let the writer flush the close frame
                let _ = timeout(CLOSE_FLUSH_TIMEOUT, &mut writer).await;
                break;
            }
        };

        match msg {
            Some(Ok(Message::Text(text))) => {
                handler::handle_text(&state.hub, conn_id, text.as_str()).await;
            }
            Some(Ok(Message::Binary(_))) => {
                warn!(conn_id, "binary frame rejected");
                state.hub.send_to_connection(
                    conn_id,
                    ServerEvent::Error("invalid request: binary frames are not supported".to_string()),
                );
            }
            Some(Ok(Message::Pong(_))) => {
                // One pending pong is enough
                let _ = pong_tx.try_send(());
            }
            // Answered by the websocket layer
            Some(Ok(Message::Ping(_))) => {}
            Some(Ok(Message::Close(frame))) => {
                debug!(conn_id, reason = ?frame, "client initiated close");
                break;
            }
            Some(Err(e)) => {
                warn!(conn_id, error = %e, "websocket receive error");
                break;
            }
            None => {
                debug!(conn_id, "websocket stream ended");
                break;
            }
        }
    }

    writer.abort();
    keepalive.abort();
    state.hub.remove_session(conn_id);
}

/// Drain queued events and control frames into the socket. Closes the
/// socket once the session is gone from the Hub.
async fn writer_task(
    conn_id: ConnectionId,
    mut sink: SplitSink<WebSocket, Message>,
    mut events: mpsc::Receiver<Frame>,
    mut control: mpsc::Receiver<Message>,
) {
    loop {
        let msg = tokio::select! {
            biased;
            Some(msg) = control.recv() => msg,
            frame = events.recv() => match frame {
                Some(frame) => match encode_event(&frame) {
                    Ok(text) => Message::Text(text.into()),
                    Err(e) => {
                        error!(conn_id, event = frame.name(), error = %e, "failed to encode event");
                        continue;
                    }
                },
                None => {
                    debug!(conn_id, "session removed, closing socket");
                    Message::Close(Some(CloseFrame {
                        code: CLOSE_GOING_AWAY,
                        reason: "session closed".into(),
                    }))
                }
            },
        };

        let closing = matches!(msg, Message::Close(_));
        if sink.send(msg).await.is_err() {
            break;
        }
        if closing {
            break;
        }
    }
}

/// Ping every `period`; finishes when a pong is late or the writer is gone.
/// A writer stuck on a peer that stopped reading leaves the ping unsent,
/// so the pong never comes.
fn spawn_keepalive(
    conn_id: ConnectionId,
    period: Duration,
    control_tx: mpsc::Sender<Message>,
    mut pong_rx: mpsc::Receiver<()>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = interval(period);
        // Skip the first immediate tick
        ticker.tick().await;

        loop {
            ticker.tick().await;

            // Unsolicited pongs don't count for this ping
            while pong_rx.try_recv().is_ok() {}

            match control_tx.try_send(Message::Ping(vec![1, 2, 3, 4].into())) {
                Ok(()) => {}
                Err(mpsc::error::TrySendError::Full(_)) => {
                    warn!(conn_id, "control queue full, ping skipped");
                }
                Err(mpsc::error::TrySendError::Closed(_)) => break,
            }

            match timeout(PONG_TIMEOUT, pong_rx.recv()).await {
                Ok(Some(())) => {}
                _ => {
                    warn!(conn_id, "pong timeout, closing connection");
                    let _ = control_tx.try_send(Message::Close(Some(CloseFrame {
                        code: CLOSE_GOING_AWAY,
                        reason: "pong timeout".into(),
                    })));
                    break;
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const PERIOD: Duration = Duration::from_secs(1);

    #[tokio::test(start_paused = true)]
    async fn test_keepalive_survives_answered_pings() {
        let (control_tx, mut control_rx) = mpsc::channel(CONTROL_QUEUE);
        let (pong_tx, pong_rx) = mpsc::channel(1);
        let keepalive = spawn_keepalive(1, PERIOD, control_tx, pong_rx);

        // Answer every ping like a live peer
        let peer = tokio::spawn(async move {
            let mut pings = 0;
            while let Some(msg) = control_rx.recv().await {
                assert!(matches!(msg, Message::Ping(_)), "unexpected {:?}", msg);
                pings += 1;
                let _ = pong_tx.try_send(());
            }
            pings
        });

        tokio::time::sleep(Duration::from_secs(60)).await;
        assert!(!keepalive.is_finished());

        keepalive.abort();
        assert!(peer.await.unwrap() >= 50);
    }

    #[tokio::test(start_paused = true)]
    async fn test_keepalive_closes_on_late_pong() {
        let (control_tx, mut control_rx) = mpsc::channel(CONTROL_QUEUE);
        let (_pong_tx, pong_rx) = mpsc::channel(1);
        let keepalive = spawn_keepalive(1, PERIOD, control_tx, pong_rx);

        keepalive.await.unwrap();
        assert!(matches!(control_rx.recv().await, Some(Message::Ping(_))));
        match control_rx.recv().await {
            Some(Message::Close(Some(frame))) => assert_eq!(frame.code, CLOSE_GOING_AWAY),
            other => panic!("expected close, got {:?}", other),
        }
        assert!(control_rx.recv().await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_keepalive_gives_up_on_stalled_writer() {
        // A writer that never drains: the queue stays at its bound
        let (control_tx, control_rx) = mpsc::channel(1);
        control_tx.try_send(Message::Ping(vec![0].into())).unwrap();
        let (pong_tx, pong_rx) = mpsc::channel(1);
        let keepalive = spawn_keepalive(1, PERIOD, control_tx, pong_rx);

        // Pongs that arrive before the ping are not an answer
        pong_tx.try_send(()).unwrap();
        assert!(pong_tx.try_send(()).is_err());

        timeout(Duration::from_secs(60), keepalive)
            .await
            .expect("keepalive should give up")
            .unwrap();
        assert_eq!(control_rx.len(), 1);
    }
}
