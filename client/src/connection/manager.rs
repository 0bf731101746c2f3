//! The connection manager: one dispatcher task that owns the push socket,
//! every timer, the notification pipeline and the connection state.
//!
//! ```text
//!            start                 timeout / error / fetch failure
//!  STOPPED ---------> ONLINE ------------------------------------> OFFLINE
//!     ^                 ^  <----------------------------------------  |
//!     |                 |        probe ok / login retry timer          |
//!     +------ stop -----+----------------------------------------------+
//! ```
//!
//! Everything that mutates state happens inside [`ConnectionManager::run`].
//! REST calls, probes and socket I/O run in spawned tasks and report back
//! over channels, each result tagged with the session id it was started
//! under. Every start, stop and offline transition bumps the session id, so
//! a result from a torn-down session is recognised and dropped.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::reachability::Reachability;
use super::state::{ConnectionState, ConnectionStatus, LoginFailureCounter};
use crate::delivery::pipeline::{
    DisplayItem, NotificationPipeline, PipelineConfig, DISPLAY_INTERVAL, MAX_DISPLAY_LIMIT,
    SOUND_COOLDOWN,
};
use crate::delivery::store::NotificationStore;
use crate::protocol::error::ApiError;
use crate::protocol::model::{Credentials, LocalId, Notification};
use crate::protocol::rest::PushoverApi;
use crate::protocol::socket::{
    SessionEvent, SessionId, SocketConnector, SocketEvent, SocketHandle,
};
use crate::settings::CredentialStore;

/// Scheduled stop+start while online
pub const FULL_CYCLE_INTERVAL: Duration = Duration::from_secs(30 * 60);

/// Connectivity probe period while offline
pub const OFFLINE_POLL_INTERVAL: Duration = Duration::from_secs(30);

/// Wait before starting again after a rejected login
pub const LOGIN_RETRY_DELAY: Duration = Duration::from_secs(20);

const DISPLAY_CHANNEL_CAPACITY: usize = 256;

// An unthrottled batch is published in one go; subscribers must not lag on it
const _: () = assert!(DISPLAY_CHANNEL_CAPACITY > MAX_DISPLAY_LIMIT + 1);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManagerTiming {
    pub full_cycle: Duration,
    pub offline_poll: Duration,
    pub login_retry: Duration,
    pub display_interval: Duration,
    pub sound_cooldown: Duration,
}

impl Default for ManagerTiming {
    fn default() -> Self {
        Self {
            full_cycle: FULL_CYCLE_INTERVAL,
            offline_poll: OFFLINE_POLL_INTERVAL,
            login_retry: LOGIN_RETRY_DELAY,
            display_interval: DISPLAY_INTERVAL,
            sound_cooldown: SOUND_COOLDOWN,
        }
    }
}

/// OS and network seams the manager drives
pub struct Collaborators {
    pub api: Arc<dyn PushoverApi>,
    pub connector: Arc<dyn SocketConnector>,
    pub reachability: Arc<dyn Reachability>,
    pub credential_store: Arc<dyn CredentialStore>,
    pub store: Box<dyn NotificationStore>,
}

#[derive(Debug)]
enum Command {
    Start,
    Stop,
    Reconnect,
    Wake(Duration),
    ConfigChanged(PipelineConfig),
    CredentialsChanged(Option<Credentials>),
    Logout,
}

#[derive(Debug)]
enum Completion {
    Fetched {
        session: SessionId,
        result: Result<Vec<Notification>, ApiError>,
    },
    Probed {
        session: SessionId,
        reachable: bool,
    },
}

/// Cloneable front door to a running manager
#[derive(Clone)]
pub struct ManagerHandle {
    commands: mpsc::UnboundedSender<Command>,
    status: watch::Receiver<ConnectionStatus>,
    displays: broadcast::Sender<DisplayItem>,
}

impl ManagerHandle {
    pub fn start(&self) {
        self.send(Command::Start);
    }

    /// Idempotent
    pub fn stop(&self) {
        self.send(Command::Stop);
    }

    pub fn reconnect(&self) {
        self.send(Command::Reconnect);
    }

    pub fn wake(&self, slept: Duration) {
        self.send(Command::Wake(slept));
    }

    pub fn update_config(&self, config: PipelineConfig) {
        self.send(Command::ConfigChanged(config));
    }

    pub fn update_credentials(&self, credentials: Option<Credentials>) {
        self.send(Command::CredentialsChanged(credentials));
    }

    /// Stop, forget credentials and clear the max-failures flag
    pub fn logout(&self) {
        self.send(Command::Logout);
    }

    pub fn status(&self) -> ConnectionStatus {
        self.status.borrow().clone()
    }

    pub fn subscribe_status(&self) -> watch::Receiver<ConnectionStatus> {
        self.status.clone()
    }

    /// Items are dropped when nobody is subscribed
    pub fn subscribe_displays(&self) -> broadcast::Receiver<DisplayItem> {
        self.displays.subscribe()
    }

    fn send(&self, command: Command) {
        if self.commands.send(command).is_err() {
            warn!("connection manager has shut down");
        }
    }
}

pub struct ConnectionManager {
    api: Arc<dyn PushoverApi>,
    connector: Arc<dyn SocketConnector>,
    reachability: Arc<dyn Reachability>,
    credential_store: Arc<dyn CredentialStore>,
    store: Box<dyn NotificationStore>,
    credentials: Option<Credentials>,
    config: PipelineConfig,
    timing: ManagerTiming,
    pipeline: NotificationPipeline,

    state: ConnectionState,
    session: SessionId,
    socket: Option<Box<dyn SocketHandle>>,
    failures: LoginFailureCounter,
    fetch_in_flight: bool,
    fetch_pending: bool,
    probe_in_flight: bool,

    full_cycle_at: Option<Instant>,
    poll_at: Option<Instant>,
    retry_at: Option<Instant>,

    status: watch::Sender<ConnectionStatus>,
    displays: broadcast::Sender<DisplayItem>,
    socket_events: mpsc::UnboundedSender<SessionEvent>,
    completions: mpsc::UnboundedSender<Completion>,
}

impl ConnectionManager {
    /// Spawn the dispatcher. It runs until every handle is dropped.
    pub fn spawn(
        collaborators: Collaborators,
        credentials: Option<Credentials>,
        config: PipelineConfig,
        timing: ManagerTiming,
    ) -> (ManagerHandle, JoinHandle<()>) {
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (socket_tx, socket_rx) = mpsc::unbounded_channel();
        let (completion_tx, completion_rx) = mpsc::unbounded_channel();
        let (display_tx, _) = broadcast::channel(DISPLAY_CHANNEL_CAPACITY);

        let (status_tx, status_rx) = watch::channel(ConnectionStatus {
            messages_received: collaborators.store.count(),
            ..ConnectionStatus::default()
        });

        let manager = ConnectionManager {
            api: collaborators.api,
            connector: collaborators.connector,
            reachability: collaborators.reachability,
            credential_store: collaborators.credential_store,
            store: collaborators.store,
            credentials,
            config,
            pipeline: NotificationPipeline::with_timing(
                timing.display_interval,
                timing.sound_cooldown,
            ),
            timing,
            state: ConnectionState::Stopped,
            session: 0,
            socket: None,
            failures: LoginFailureCounter::default(),
            fetch_in_flight: false,
            fetch_pending: false,
            probe_in_flight: false,
            full_cycle_at: None,
            poll_at: None,
            retry_at: None,
            status: status_tx,
            displays: display_tx.clone(),
            socket_events: socket_tx,
            completions: completion_tx,
        };

        let task = tokio::spawn(manager.run(command_rx, socket_rx, completion_rx));
        let handle = ManagerHandle {
            commands: command_tx,
            status: status_rx,
            displays: display_tx,
        };
        (handle, task)
    }

    async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<Command>,
        mut socket_events: mpsc::UnboundedReceiver<SessionEvent>,
        mut completions: mpsc::UnboundedReceiver<Completion>,
    ) {
        loop {
            let display_at = self.pipeline.next_deadline(Instant::now(), &self.config);

            tokio::select! {
                command = commands.recv() => match command {
                    Some(command) => self.handle_command(command),
                    None => {
                        debug!("all manager handles dropped");
                        self.stop(false);
                        return;
                    }
                },

                Some(event) = socket_events.recv() => self.handle_socket_event(event),

                Some(completion) = completions.recv() => self.handle_completion(completion),

                _ = sleep_until(self.full_cycle_at) => {
                    self.full_cycle_at = None;
                    info!("scheduled reconnect");
                    self.start();
                }

                _ = sleep_until(self.poll_at) => {
                    self.poll_at = None;
                    self.probe();
                }

                _ = sleep_until(self.retry_at) => {
                    self.retry_at = None;
                    info!("retrying login");
                    self.start();
                }

                _ = sleep_until(display_at) => self.flush_displays(),
            }
        }
    }

    fn handle_command(&mut self, command: Command) {
        match command {
            Command::Start => self.start(),
            Command::Stop => self.stop(true),
            Command::Reconnect => {
                if self.state == ConnectionState::Stopped {
                    debug!("reconnect ignored while stopped");
                } else {
                    self.start();
                }
            }
            Command::Wake(slept) => {
                if self.state == ConnectionState::Stopped {
                    return;
                }
                info!(slept_secs = slept.as_secs(), "reconnecting after wake");
                self.start();
            }
            Command::ConfigChanged(config) => self.config = config,
            Command::CredentialsChanged(credentials) => {
                let running = self.state != ConnectionState::Stopped;
                self.credentials = credentials;
                self.failures.reset();
                self.status.send_modify(|status| status.max_failures_exceeded = false);
                if self.credentials.is_none() {
                    self.stop(true);
                } else if running {
                    self.start();
                }
            }
            Command::Logout => {
                self.stop(true);
                self.credentials = None;
                self.failures.reset();
                if let Err(e) = self.credential_store.clear() {
                    warn!(error = %e, "failed to clear stored credentials");
                }
                self.status.send_modify(|status| status.max_failures_exceeded = false);
                info!("logged out");
            }
        }
    }

    fn handle_socket_event(&mut self, SessionEvent { session, event }: SessionEvent) {
        if session != self.session {
            debug!(session, current = self.session, ?event, "stale socket event");
            return;
        }

        match event {
            SocketEvent::Notification => self.request_fetch(),
            SocketEvent::KeepAlive => self.record_sync(),
            SocketEvent::LoginFailed => {
                warn!("socket login rejected");
                self.login_failed();
            }
            SocketEvent::RequestedReconnect => {
                info!("server requested reconnect");
                self.start();
            }
            SocketEvent::Timeout => {
                warn!("socket keepalive timed out");
                self.go_offline();
            }
            SocketEvent::Error(e) if !e.is_fatal() => {
                warn!(error = %e, "socket error, staying connected");
            }
            SocketEvent::Error(e) => {
                warn!(error = %e, "socket failed");
                self.go_offline();
            }
            SocketEvent::Close => {
                warn!("socket closed unexpectedly");
                self.go_offline();
            }
        }
    }

    fn handle_completion(&mut self, completion: Completion) {
        match completion {
            Completion::Fetched { session, result } => {
                if session != self.session {
                    debug!(session, "stale fetch result");
                    return;
                }
                self.fetch_in_flight = false;
                self.fetch_finished(result);
            }
            Completion::Probed { session, reachable } => {
                if session != self.session {
                    return;
                }
                self.probe_in_flight = false;
                if reachable && self.state == ConnectionState::Offline {
                    info!("connectivity restored");
                    self.start();
                } else {
                    debug!(reachable, "still offline");
                }
            }
        }
    }

    fn fetch_finished(&mut self, result: Result<Vec<Notification>, ApiError>) {
        match result {
            Ok(batch) => {
                self.failures.reset();
                self.record_sync();

                let outcome =
                    self.pipeline
                        .process_batch(&batch, &self.config, self.store.as_mut());
                if !batch.is_empty() {
                    info!(
                        received = batch.len(),
                        stored = outcome.stored,
                        redelivered = outcome.redelivered,
                        omitted = outcome.omitted,
                        "notifications fetched"
                    );
                }
                let count = self.store.count();
                self.status.send_if_modified(|status| {
                    let changed = status.messages_received != count;
                    status.messages_received = count;
                    changed
                });

                if let Some(local_id) = outcome.acknowledge {
                    self.acknowledge(local_id);
                }
                self.flush_displays();

                if std::mem::take(&mut self.fetch_pending) {
                    self.request_fetch();
                }
            }
            Err(e) if e.is_invalid_credentials() => {
                warn!(error = %e, "fetch rejected credentials");
                self.login_failed();
            }
            Err(e) => {
                warn!(error = %e, "fetch failed");
                self.go_offline();
            }
        }
    }

    /// Tear down and come back up under a fresh session
    fn start(&mut self) {
        let Some(credentials) = self.credentials.clone() else {
            warn!("cannot start without credentials");
            self.stop(false);
            return;
        };

        self.teardown();
        self.set_state(ConnectionState::Online);
        self.request_fetch();
        self.socket = Some(self.connector.connect(
            self.session,
            &credentials,
            self.socket_events.clone(),
        ));
        self.full_cycle_at = Some(Instant::now() + self.timing.full_cycle);
    }

    /// `clear_display` drops notifications still waiting to be shown
    fn stop(&mut self, clear_display: bool) {
        self.teardown();
        if clear_display {
            self.pipeline.clear();
        }
        self.set_state(ConnectionState::Stopped);
    }

    fn go_offline(&mut self) {
        if self.state == ConnectionState::Stopped {
            return;
        }
        self.teardown();
        self.set_state(ConnectionState::Offline);
        self.poll_at = Some(Instant::now() + self.timing.offline_poll);
    }

    fn login_failed(&mut self) {
        if self.failures.record_failure() {
            warn!(
                failures = self.failures.count(),
                "too many login failures, dropping credentials"
            );
            self.stop(true);
            self.credentials = None;
            self.failures.reset();
            if let Err(e) = self.credential_store.clear() {
                warn!(error = %e, "failed to clear stored credentials");
            }
            self.status.send_modify(|status| status.max_failures_exceeded = true);
            return;
        }

        warn!(failures = self.failures.count(), "login failed, retrying later");
        self.teardown();
        self.set_state(ConnectionState::Offline);
        self.retry_at = Some(Instant::now() + self.timing.login_retry);
    }

    /// Cancel timers, close the socket and invalidate everything in flight
    fn teardown(&mut self) {
        self.session += 1;
        self.full_cycle_at = None;
        self.poll_at = None;
        self.retry_at = None;
        self.fetch_in_flight = false;
        self.fetch_pending = false;
        self.probe_in_flight = false;

        if let Some(mut socket) = self.socket.take() {
            socket.disconnect();
        }
    }

    fn request_fetch(&mut self) {
        if self.state != ConnectionState::Online {
            return;
        }
        if self.fetch_in_flight {
            self.fetch_pending = true;
            return;
        }
        let Some(credentials) = self.credentials.clone() else {
            return;
        };

        self.fetch_in_flight = true;
        let api = Arc::clone(&self.api);
        let completions = self.completions.clone();
        let session = self.session;

        tokio::spawn(async move {
            let result = api.fetch_notifications(&credentials).await;
            let _ = completions.send(Completion::Fetched { session, result });
        });
    }

    /// Failures are only logged; the next batch's acknowledgment supersedes this one
    fn acknowledge(&self, local_id: LocalId) {
        let Some(credentials) = self.credentials.clone() else {
            return;
        };
        let api = Arc::clone(&self.api);

        tokio::spawn(async move {
            match api.acknowledge_notification(&credentials, local_id).await {
                Ok(()) => debug!(local_id, "acknowledged"),
                Err(e) => warn!(local_id, error = %e, "acknowledge failed"),
            }
        });
    }

    fn probe(&mut self) {
        self.poll_at = Some(Instant::now() + self.timing.offline_poll);
        if self.probe_in_flight {
            return;
        }

        self.probe_in_flight = true;
        let reachability = Arc::clone(&self.reachability);
        let completions = self.completions.clone();
        let session = self.session;

        tokio::spawn(async move {
            let reachable =
                reachability.internet_reachable().await && reachability.service_reachable().await;
            let _ = completions.send(Completion::Probed { session, reachable });
        });
    }

    fn flush_displays(&mut self) {
        for item in self.pipeline.due(Instant::now(), &self.config) {
            if self.displays.send(item).is_err() {
                debug!("no display subscribers");
            }
        }
    }

    fn record_sync(&mut self) {
        let now = Utc::now();
        self.status.send_modify(|status| status.last_sync = Some(now));
    }

    fn set_state(&mut self, state: ConnectionState) {
        let previous = self.state;
        self.state = state;
        if previous != state {
            info!(from = %previous, to = %state, "connection state changed");
        }
        self.status.send_if_modified(|status| {
            let changed = status.state != state;
            status.state = state;
            changed
        });
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
