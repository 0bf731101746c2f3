//! Push socket: a persistent WebSocket that only ever says "something changed".
//!
//! The socket carries no notification payloads. After opening it the client
//! sends `login:<device_id>:<secret>`; the server then answers with
//! single-character commands:
//!
//! | frame | meaning                                   |
//! |-------|-------------------------------------------|
//! | `!`   | new data, fetch over REST                 |
//! | `E`   | login rejected                            |
//! | `R`   | server asks the client to reconnect       |
//! | `#`   | keepalive                                 |
//!
//! A watchdog emits [`SocketEvent::Timeout`] when nothing arrived for a whole
//! keepalive interval.

use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, info, warn};

use super::model::Credentials;

pub const DEFAULT_SOCKET_ENDPOINT: &str = "wss://client.pushover.net/push";

/// Silence longer than this means the connection is dead
pub const KEEPALIVE_TIMEOUT: Duration = Duration::from_secs(70);

/// Tolerance for timer jitter when comparing against the keepalive window
const WATCHDOG_SLACK: Duration = Duration::from_millis(100);

/// Identifies one `start()` of the connection manager; events from older sessions are stale
pub type SessionId = u64;

/// Decoded server frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerCommand {
    NewData,
    LoginFailed,
    Reconnect,
    KeepAlive,
}

impl ServerCommand {
    pub fn decode(frame: &str) -> Result<Self, SocketError> {
        match frame {
            "!" => Ok(ServerCommand::NewData),
            "E" => Ok(ServerCommand::LoginFailed),
            "R" => Ok(ServerCommand::Reconnect),
            "#" => Ok(ServerCommand::KeepAlive),
            other => Err(SocketError::UnknownCommand(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SocketError {
    /// Reported only; the connection stays up
    #[error("received unknown command {0:?}")]
    UnknownCommand(String),
    #[error("socket transport error: {0}")]
    Transport(String),
}

impl SocketError {
    /// Whether the connection is gone after this error
    pub fn is_fatal(&self) -> bool {
        matches!(self, SocketError::Transport(_))
    }
}

/// Everything a socket session can report to its owner
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SocketEvent {
    Notification,
    LoginFailed,
    RequestedReconnect,
    KeepAlive,
    Timeout,
    Error(SocketError),
    Close,
}

impl From<ServerCommand> for SocketEvent {
    fn from(command: ServerCommand) -> Self {
        match command {
            ServerCommand::NewData => SocketEvent::Notification,
            ServerCommand::LoginFailed => SocketEvent::LoginFailed,
            ServerCommand::Reconnect => SocketEvent::RequestedReconnect,
            ServerCommand::KeepAlive => SocketEvent::KeepAlive,
        }
    }
}

/// A socket event stamped with the session that produced it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionEvent {
    pub session: SessionId,
    pub event: SocketEvent,
}

pub type SocketEventSender = mpsc::UnboundedSender<SessionEvent>;

/// Owner's grip on one physical connection
pub trait SocketHandle: Send {
    /// Close deterministically. Only a final `Close` may follow.
    fn disconnect(&mut self);
}

/// Opens push sockets; the seam tests replace with a scripted fake
pub trait SocketConnector: Send + Sync {
    fn connect(
        &self,
        session: SessionId,
        credentials: &Credentials,
        events: SocketEventSender,
    ) -> Box<dyn SocketHandle>;
}

/// Tracks inbound traffic for the keepalive watchdog
#[derive(Debug, Clone, Copy)]
pub struct Watchdog {
    timeout: Duration,
    last_inbound: Instant,
}

impl Watchdog {
    pub fn new(timeout: Duration, now: Instant) -> Self {
        Self {
            timeout,
            last_inbound: now,
        }
    }

    pub fn touch(&mut self, now: Instant) {
        self.last_inbound = now;
    }

    pub fn is_expired(&self, now: Instant) -> bool {
        now.saturating_duration_since(self.last_inbound) + WATCHDOG_SLACK > self.timeout
    }
}

/// tokio-tungstenite implementation of [`SocketConnector`]
#[derive(Debug, Clone)]
pub struct WebSocketConnector {
    endpoint: String,
    keepalive_timeout: Duration,
}

impl WebSocketConnector {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            keepalive_timeout: KEEPALIVE_TIMEOUT,
        }
    }

    pub fn with_keepalive_timeout(mut self, timeout: Duration) -> Self {
        self.keepalive_timeout = timeout;
        self
    }
}

impl Default for WebSocketConnector {
    fn default() -> Self {
        Self::new(DEFAULT_SOCKET_ENDPOINT)
    }
}

impl SocketConnector for WebSocketConnector {
    fn connect(
        &self,
        session: SessionId,
        credentials: &Credentials,
        events: SocketEventSender,
    ) -> Box<dyn SocketHandle> {
        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        tokio::spawn(run_socket(
            self.endpoint.clone(),
            credentials.socket_login_frame(),
            session,
            events,
            shutdown_rx,
            self.keepalive_timeout,
        ));

        Box::new(WebSocketHandle {
            shutdown: Some(shutdown_tx),
        })
    }
}

struct WebSocketHandle {
    shutdown: Option<oneshot::Sender<()>>,
}

impl SocketHandle for WebSocketHandle {
    fn disconnect(&mut self) {
        if let Some(shutdown) = self.shutdown.take() {
            // The task may already have ended on its own
            let _ = shutdown.send(());
        }
    }
}

impl Drop for WebSocketHandle {
    fn drop(&mut self) {
        self.disconnect();
    }
}

async fn run_socket(
    endpoint: String,
    login_frame: String,
    session: SessionId,
    events: SocketEventSender,
    mut shutdown: oneshot::Receiver<()>,
    keepalive_timeout: Duration,
) {
    let emit = |event: SocketEvent| {
        let _ = events.send(SessionEvent { session, event });
    };

    let connecting = tokio::time::timeout(keepalive_timeout, connect_async(endpoint.as_str()));
    let connected = tokio::select! {
        result = connecting => result,
        _ = &mut shutdown => {
            emit(SocketEvent::Close);
            return;
        }
    };

    let ws = match connected {
        Ok(Ok((ws, _response))) => ws,
        Ok(Err(e)) => {
            warn!(session, error = %e, "socket connect failed");
            emit(SocketEvent::Error(SocketError::Transport(e.to_string())));
            return;
        }
        Err(_) => {
            warn!(session, "socket connect timed out");
            emit(SocketEvent::Timeout);
            return;
        }
    };

    info!(session, "socket connected");
    let (mut sink, mut stream) = ws.split();

    if let Err(e) = sink.send(Message::Text(login_frame)).await {
        warn!(session, error = %e, "failed to send socket login");
        emit(SocketEvent::Error(SocketError::Transport(e.to_string())));
        return;
    }

    let mut watchdog = Watchdog::new(keepalive_timeout, Instant::now());
    let mut ticker =
        tokio::time::interval_at(Instant::now() + keepalive_timeout, keepalive_timeout);

    loop {
        tokio::select! {
            _ = &mut shutdown => {
                let _ = sink.close().await;
                debug!(session, "socket disconnected by owner");
                emit(SocketEvent::Close);
                return;
            }

            _ = ticker.tick() => {
                if watchdog.is_expired(Instant::now()) {
                    warn!(session, "socket timed out");
                    emit(SocketEvent::Timeout);
                }
            }

            frame = stream.next() => {
                let payload = match frame {
                    Some(Ok(Message::Text(text))) => text,
                    Some(Ok(Message::Binary(bytes))) => String::from_utf8_lossy(&bytes).into_owned(),
                    Some(Ok(Message::Ping(_))) | Some(Ok(Message::Pong(_))) => {
                        watchdog.touch(Instant::now());
                        continue;
                    }
                    Some(Ok(Message::Frame(_))) => continue,
                    Some(Ok(Message::Close(_))) | None => {
                        info!(session, "socket closed by server");
                        emit(SocketEvent::Close);
                        return;
                    }
                    Some(Err(e)) => {
                        warn!(session, error = %e, "socket read failed");
                        emit(SocketEvent::Error(SocketError::Transport(e.to_string())));
                        return;
                    }
                };

                watchdog.touch(Instant::now());
                match ServerCommand::decode(&payload) {
                    Ok(command) => {
                        debug!(session, ?command, "server command");
                        emit(command.into());
                    }
                    Err(e) => {
                        debug!(session, error = %e, "ignoring frame");
                        emit(SocketEvent::Error(e));
                    }
                }
            }
        }
    }
}
