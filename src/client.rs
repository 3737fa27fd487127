//! Reconnecting tracking client
//!
//! Keeps one logical tracking session alive across transport drops:
//! `Disconnected -> Connecting -> Connected -> Reconnecting -> {Connected | GivenUp}`.
//! Retries back off exponentially (1s, 2s, 4s ... capped at 30s) for a
//! bounded number of attempts. The attempt count resets only once a link
//! has delivered an event, so a server that accepts and then drops every
//! connection still runs out the budget. After every (re)connect the active
//! order is tracked again, so the server replies with a fresh snapshot.

use std::time::Duration;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};

use crate::ingest::LocationFix;
use crate::protocol::{ClientCommand, ProtocolError, ServerEvent, encode_command, parse_event};
use crate::session::OrderId;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    /// Waiting out the backoff before reconnect attempt `attempt`
    Reconnecting { attempt: u32 },
    /// Terminal: retries exhausted
    GivenUp,
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Disconnected => write!(f, "disconnected"),
            Self::Connecting => write!(f, "connecting"),
            Self::Connected => write!(f, "connected"),
            Self::Reconnecting { attempt } => write!(f, "reconnecting (attempt {})", attempt),
            Self::GivenUp => write!(f, "given up"),
        }
    }
}

/// Exponential backoff with a cap and an attempt budget
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub base: Duration,
    pub max: Duration,
    pub max_attempts: u32,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_secs(1),
            max: Duration::from_secs(30),
            max_attempts: 10,
        }
    }
}

impl ReconnectPolicy {
    /// Delay before reconnect attempt `attempt` (1-based)
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31);
        self.base
            .checked_mul(1u32 << exponent)
            .map_or(self.max, |delay| delay.min(self.max))
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("connect failed: {0}")]
    Connect(String),
    #[error("transport error: {0}")]
    Transport(String),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error("client is closed")]
    Closed,
    #[error("gave up after {attempts} reconnect attempts")]
    GaveUp { attempts: u32 },
}

/// Opens transport links to the tracking server
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self) -> Result<Box<dyn Link>, ClientError>;
}

/// One live transport connection
#[async_trait]
pub trait Link: Send {
    async fn send(&mut self, command: &ClientCommand) -> Result<(), ClientError>;

    /// Next event; `None` once the link is closed
    async fn recv(&mut self) -> Option<Result<ServerEvent, ClientError>>;
}

enum SessionEnd {
    /// The handle was dropped
    Shutdown,
    Lost(String),
}

/// Connection driver. Run it with [`TrackingClient::run`] and talk to it
/// through the [`ClientHandle`].
pub struct TrackingClient<C> {
    connector: C,
    policy: ReconnectPolicy,
    commands: mpsc::UnboundedReceiver<ClientCommand>,
    events: mpsc::UnboundedSender<ServerEvent>,
    state: watch::Sender<ConnectionState>,
    active_order: Option<OrderId>,
}

pub struct ClientHandle {
    commands: mpsc::UnboundedSender<ClientCommand>,
    events: mpsc::UnboundedReceiver<ServerEvent>,
    state: watch::Receiver<ConnectionState>,
}

impl<C: Connector> TrackingClient<C> {
    pub fn new(connector: C, policy: ReconnectPolicy) -> (Self, ClientHandle) {
        let (commands_tx, commands) = mpsc::unbounded_channel();
        let (events, events_rx) = mpsc::unbounded_channel();
        let (state, state_rx) = watch::channel(ConnectionState::Disconnected);

        let client = Self {
            connector,
            policy,
            commands,
            events,
            state,
            active_order: None,
        };
        let handle = ClientHandle {
            commands: commands_tx,
            events: events_rx,
            state: state_rx,
        };
        (client, handle)
    }

    /// Drive the connection until the handle is dropped (`Ok`) or retries
    /// run out (`GaveUp`).
    pub async fn run(mut self) -> Result<(), ClientError> {
        let mut attempt = 0u32;
        self.set_state(ConnectionState::Connecting);

        loop {
            match self.connector.connect().await {
                Ok(mut link) => {
                    self.set_state(ConnectionState::Connected);
                    info!(attempt, active_order = ?self.active_order, "tracking client connected");

                    match self.session(link.as_mut(), &mut attempt).await {
                        SessionEnd::Shutdown => {
                            self.set_state(ConnectionState::Disconnected);
                            return Ok(());
                        }
                        SessionEnd::Lost(reason) => {
                            warn!(reason, "tracking connection lost");
                        }
                    }
                }
                Err(e) => {
                    warn!(attempt, error = %e, "tracking connect failed");
                }
            }

            attempt += 1;
            if attempt > self.policy.max_attempts {
                self.set_state(ConnectionState::GivenUp);
                warn!(attempts = self.policy.max_attempts, "giving up on tracking connection");
                return Err(ClientError::GaveUp {
                    attempts: self.policy.max_attempts,
                });
            }

            let delay = self.policy.delay_for(attempt);
            self.set_state(ConnectionState::Reconnecting { attempt });
            debug!(attempt, delay_ms = delay.as_millis() as u64, "reconnecting after backoff");

            // Stop early if the handle goes away while waiting
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = self.events.closed() => {
                    self.set_state(ConnectionState::Disconnected);
                    return Ok(());
                }
            }
        }
    }

    /// Run one link until it drops. `attempt` is reset by the first event
    /// the link delivers.
    async fn session(&mut self, link: &mut dyn Link, attempt: &mut u32) -> SessionEnd {
        if let Some(order_id) = self.active_order {
            debug!(order_id, "resuming tracking");
            if let Err(e) = link.send(&ClientCommand::StartTracking { order_id }).await {
                return SessionEnd::Lost(e.to_string());
            }
        }

        loop {
            tokio::select! {
                command = self.commands.recv() => {
                    let Some(command) = command else {
                        return SessionEnd::Shutdown;
                    };
                    self.track(&command);
                    if let Err(e) = link.send(&command).await {
                        return SessionEnd::Lost(e.to_string());
                    }
                }
                event = link.recv() => match event {
                    Some(Ok(event)) => {
                        if *attempt > 0 {
                            debug!(attempts = *attempt, "connection stable, retry budget reset");
                            *attempt = 0;
                        }
                        let _ = self.events.send(event);
                    }
                    Some(Err(ClientError::Protocol(e))) => {
                        warn!(error = %e, "ignoring malformed event");
                    }
                    Some(Err(e)) => return SessionEnd::Lost(e.to_string()),
                    None => return SessionEnd::Lost("closed by server".to_string()),
                },
            }
        }
    }

    /// Remember the order to resume after a reconnect
    fn track(&mut self, command: &ClientCommand) {
        match command {
            ClientCommand::StartTracking { order_id } => self.active_order = Some(*order_id),
            ClientCommand::StopTracking { order_id } if self.active_order == Some(*order_id) => {
                self.active_order = None;
            }
            _ => {}
        }
    }

    fn set_state(&self, state: ConnectionState) {
        let previous = self.state.send_replace(state);
        if previous != state {
            debug!(from = %previous, to = %state, "client state changed");
        }
    }
}

impl ClientHandle {
    /// Queue a command; it is sent once a connection is up
    pub fn send(&self, command: ClientCommand) -> Result<(), ClientError> {
        self.commands.send(command).map_err(|_| ClientError::Closed)
    }

    pub fn start_tracking(&self, order_id: OrderId) -> Result<(), ClientError> {
        self.send(ClientCommand::StartTracking { order_id })
    }

    pub fn stop_tracking(&self, order_id: OrderId) -> Result<(), ClientError> {
        self.send(ClientCommand::StopTracking { order_id })
    }

    pub fn update_location(&self, order_id: OrderId, fix: LocationFix) -> Result<(), ClientError> {
        self.send(ClientCommand::UpdateLocation {
            order_id,
            lat: fix.lat,
            lng: fix.lng,
            speed: fix.speed,
            heading: fix.heading,
            accuracy: fix.accuracy,
        })
    }

    /// Next event from the server, `None` once the client stopped
    pub async fn next_event(&mut self) -> Option<ServerEvent> {
        self.events.recv().await
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    /// Watch state transitions
    pub fn state_changes(&self) -> watch::Receiver<ConnectionState> {
        self.state.clone()
    }
}

/// WebSocket connector
#[derive(Debug, Clone)]
pub struct WsConnector {
    url: String,
}

impl WsConnector {
    pub fn new(url: impl Into<String>) -> Self {
        Self { url: url.into() }
    }

    /// Connect to `base_url` authenticating with `token`
    pub fn with_token(base_url: &str, token: &str) -> Self {
        Self::new(format!("{}?token={}", base_url, token))
    }
}

#[async_trait]
impl Connector for WsConnector {
    async fn connect(&self) -> Result<Box<dyn Link>, ClientError> {
        let (stream, _) = tokio_tungstenite::connect_async(self.url.as_str())
            .await
            .map_err(|e| ClientError::Connect(e.to_string()))?;
        Ok(Box::new(WsLink { stream }))
    }
}

struct WsLink {
    stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

#[async_trait]
impl Link for WsLink {
    async fn send(&mut self, command: &ClientCommand) -> Result<(), ClientError> {
        let text = encode_command(command)?;
        self.stream
            .send(Message::Text(text.into()))
            .await
            .map_err(|e| ClientError::Transport(e.to_string()))
    }

    async fn recv(&mut self) -> Option<Result<ServerEvent, ClientError>> {
        loop {
            match self.stream.next().await? {
                Ok(Message::Text(text)) => return Some(parse_event(text.as_str()).map_err(Into::into)),
                Ok(Message::Close(_)) => return None,
                Ok(_) => continue,
                Err(e) => return Some(Err(ClientError::Transport(e.to_string()))),
            }
        }
    }
}
