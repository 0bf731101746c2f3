//! Scripted stand-ins for the network and OS seams of the connection manager.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{TimeZone, Utc};

use pushdesk_lib::connection::manager::{
    Collaborators, ConnectionManager, ManagerHandle, ManagerTiming,
};
use pushdesk_lib::connection::reachability::Reachability;
use pushdesk_lib::delivery::pipeline::PipelineConfig;
use pushdesk_lib::delivery::store::MemoryNotificationStore;
use pushdesk_lib::protocol::error::ApiError;
use pushdesk_lib::protocol::model::{
    Credentials, DeviceRegistration, LocalId, LoginResponse, Notification,
};
use pushdesk_lib::protocol::rest::PushoverApi;
use pushdesk_lib::protocol::socket::{
    SessionEvent, SessionId, SocketConnector, SocketEvent, SocketEventSender, SocketHandle,
};
use pushdesk_lib::settings::CredentialStore;
use tokio::task::JoinHandle;

pub fn notification(local_id: LocalId, global_id: u64) -> Notification {
    Notification {
        local_id,
        global_id,
        title: Some(format!("Title {}", global_id)),
        message: format!("Message {}", global_id),
        app: "Tests".to_string(),
        app_icon_id: None,
        priority: 0,
        sound_key: None,
        received_at: Utc.timestamp_opt(1_700_000_000 + global_id as i64, 0).unwrap(),
        url: None,
        url_title: None,
    }
}

pub fn credentials() -> Credentials {
    Credentials::new("secret", "device")
}

/// REST fake: fetches and acks pop scripted results. Once a script runs out,
/// fetches return an empty batch and acks succeed.
#[derive(Default)]
pub struct FakeApi {
    fetch_results: Mutex<VecDeque<Result<Vec<Notification>, ApiError>>>,
    ack_results: Mutex<VecDeque<Result<(), ApiError>>>,
    fetch_delay: Mutex<Duration>,
    fetches: AtomicUsize,
    acks: Mutex<Vec<LocalId>>,
}

impl FakeApi {
    pub fn push_fetch(&self, result: Result<Vec<Notification>, ApiError>) {
        self.fetch_results.lock().unwrap().push_back(result);
    }

    pub fn push_ack(&self, result: Result<(), ApiError>) {
        self.ack_results.lock().unwrap().push_back(result);
    }

    pub fn set_fetch_delay(&self, delay: Duration) {
        *self.fetch_delay.lock().unwrap() = delay;
    }

    pub fn fetches(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }

    /// Every acknowledge attempt, failed ones included
    pub fn acks(&self) -> Vec<LocalId> {
        self.acks.lock().unwrap().clone()
    }
}

#[async_trait]
impl PushoverApi for FakeApi {
    async fn login(&self, _email: &str, _password: &str) -> Result<LoginResponse, ApiError> {
        Err(ApiError::Rejected("not scripted".to_string()))
    }

    async fn register_device(
        &self,
        _secret: &str,
        _device_name: &str,
    ) -> Result<DeviceRegistration, ApiError> {
        Err(ApiError::Rejected("not scripted".to_string()))
    }

    async fn fetch_notifications(
        &self,
        _credentials: &Credentials,
    ) -> Result<Vec<Notification>, ApiError> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        let delay = *self.fetch_delay.lock().unwrap();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        self.fetch_results
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Ok(Vec::new()))
    }

    async fn acknowledge_notification(
        &self,
        _credentials: &Credentials,
        local_id: LocalId,
    ) -> Result<(), ApiError> {
        self.acks.lock().unwrap().push(local_id);
        self.ack_results
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(Ok(()))
    }
}

struct Connection {
    session: SessionId,
    events: SocketEventSender,
}

/// Socket fake: remembers every connection so tests can speak for the server
#[derive(Default)]
pub struct FakeConnector {
    connections: Mutex<Vec<Connection>>,
    disconnects: Arc<AtomicUsize>,
}

impl FakeConnector {
    pub fn connections(&self) -> usize {
        self.connections.lock().unwrap().len()
    }

    pub fn disconnects(&self) -> usize {
        self.disconnects.load(Ordering::SeqCst)
    }

    pub fn latest_session(&self) -> Option<SessionId> {
        self.connections.lock().unwrap().last().map(|c| c.session)
    }

    /// Deliver an event on the most recent connection
    pub fn emit(&self, event: SocketEvent) {
        let connections = self.connections.lock().unwrap();
        let latest = connections.last().expect("no socket connected yet");
        latest
            .events
            .send(SessionEvent {
                session: latest.session,
                event,
            })
            .unwrap();
    }

    /// Deliver an event tagged with an arbitrary session
    pub fn emit_for(&self, session: SessionId, event: SocketEvent) {
        let connections = self.connections.lock().unwrap();
        let latest = connections.last().expect("no socket connected yet");
        latest.events.send(SessionEvent { session, event }).unwrap();
    }
}

struct FakeHandle {
    disconnects: Arc<AtomicUsize>,
}

impl SocketHandle for FakeHandle {
    fn disconnect(&mut self) {
        self.disconnects.fetch_add(1, Ordering::SeqCst);
    }
}

impl SocketConnector for FakeConnector {
    fn connect(
        &self,
        session: SessionId,
        _credentials: &Credentials,
        events: SocketEventSender,
    ) -> Box<dyn SocketHandle> {
        self.connections
            .lock()
            .unwrap()
            .push(Connection { session, events });
        Box::new(FakeHandle {
            disconnects: Arc::clone(&self.disconnects),
        })
    }
}

pub struct FakeReachability {
    online: AtomicBool,
    probes: AtomicUsize,
}

impl Default for FakeReachability {
    fn default() -> Self {
        Self {
            online: AtomicBool::new(true),
            probes: AtomicUsize::new(0),
        }
    }
}

impl FakeReachability {
    pub fn set_online(&self, online: bool) {
        self.online.store(online, Ordering::SeqCst);
    }

    pub fn probes(&self) -> usize {
        self.probes.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Reachability for FakeReachability {
    async fn internet_reachable(&self) -> bool {
        self.probes.fetch_add(1, Ordering::SeqCst);
        self.online.load(Ordering::SeqCst)
    }

    async fn service_reachable(&self) -> bool {
        self.online.load(Ordering::SeqCst)
    }
}

#[derive(Default)]
pub struct RecordingCredentialStore {
    clears: AtomicUsize,
}

impl RecordingCredentialStore {
    pub fn clears(&self) -> usize {
        self.clears.load(Ordering::SeqCst)
    }
}

impl CredentialStore for RecordingCredentialStore {
    fn clear(&self) -> Result<()> {
        self.clears.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// A manager wired to fakes, with the fakes kept around for assertions
pub struct Harness {
    pub handle: ManagerHandle,
    pub task: JoinHandle<()>,
    pub api: Arc<FakeApi>,
    pub connector: Arc<FakeConnector>,
    pub reachability: Arc<FakeReachability>,
    pub credential_store: Arc<RecordingCredentialStore>,
}

pub struct HarnessBuilder {
    api: Arc<FakeApi>,
    credentials: Option<Credentials>,
    config: PipelineConfig,
}

impl Default for HarnessBuilder {
    fn default() -> Self {
        Self {
            api: Arc::new(FakeApi::default()),
            credentials: Some(credentials()),
            config: PipelineConfig {
                native_notifications: false,
                ..PipelineConfig::default()
            },
        }
    }
}

impl HarnessBuilder {
    pub fn api(mut self, api: FakeApi) -> Self {
        self.api = Arc::new(api);
        self
    }

    pub fn without_credentials(mut self) -> Self {
        self.credentials = None;
        self
    }

    pub fn config(mut self, config: PipelineConfig) -> Self {
        self.config = config;
        self
    }

    pub fn spawn(self) -> Harness {
        let connector = Arc::new(FakeConnector::default());
        let reachability = Arc::new(FakeReachability::default());
        let credential_store = Arc::new(RecordingCredentialStore::default());

        let collaborators = Collaborators {
            api: self.api.clone(),
            connector: connector.clone(),
            reachability: reachability.clone(),
            credential_store: credential_store.clone(),
            store: Box::new(MemoryNotificationStore::new()),
        };

        let (handle, task) = ConnectionManager::spawn(
            collaborators,
            self.credentials,
            self.config,
            ManagerTiming::default(),
        );

        Harness {
            handle,
            task,
            api: self.api,
            connector,
            reachability,
            credential_store,
        }
    }
}
