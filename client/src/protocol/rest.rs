//! REST half of the Pushover Open Client protocol.
//!
//! Every call is a single request/response over HTTPS with form-encoded
//! bodies. Responses are JSON objects carrying a `status` field where `1`
//! means success; anything else is a refusal whose meaning depends on the
//! call. See <https://pushover.net/api/client>.

use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value;
use tracing::debug;

use super::error::ApiError;
use super::model::{Credentials, DeviceRegistration, LocalId, LoginResponse, Notification};

pub const DEFAULT_API_BASE_URL: &str = "https://api.pushover.net/";
const API_NAMESPACE: &str = "1/";

/// Upper bound for a single REST round trip
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Open Client devices always register with this OS code
const OPEN_CLIENT_OS: &str = "O";

pub const MAX_DEVICE_NAME_LEN: usize = 25;

static DEVICE_NAME_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z0-9_-]+$").expect("failed to compile device name pattern"));

pub static USER_AGENT: Lazy<String> = Lazy::new(|| {
    format!(
        "pushdesk/{} ({} {})",
        env!("CARGO_PKG_VERSION"),
        std::env::consts::OS,
        std::env::consts::ARCH
    )
});

/// The four calls the connection pipeline and the login flow need
#[async_trait]
pub trait PushoverApi: Send + Sync {
    async fn login(&self, email: &str, password: &str) -> Result<LoginResponse, ApiError>;

    async fn register_device(
        &self,
        secret: &str,
        device_name: &str,
    ) -> Result<DeviceRegistration, ApiError>;

    /// Pending notifications, oldest first. An empty list is a normal result.
    async fn fetch_notifications(
        &self,
        credentials: &Credentials,
    ) -> Result<Vec<Notification>, ApiError>;

    /// Must be given the local id of the last item of the batch just fetched
    async fn acknowledge_notification(
        &self,
        credentials: &Credentials,
        local_id: LocalId,
    ) -> Result<(), ApiError>;
}

/// Values the client remembers from earlier calls
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CachedAccount {
    pub user_key: Option<String>,
    pub secret: Option<String>,
    pub device_id: Option<String>,
}

/// reqwest-backed implementation of [`PushoverApi`]
pub struct RestClient {
    http: reqwest::Client,
    base_url: String,
    cached: Mutex<CachedAccount>,
}

impl RestClient {
    pub fn new() -> Result<Self, ApiError> {
        Self::with_base_url(DEFAULT_API_BASE_URL)
    }

    pub fn with_base_url(base_url: &str) -> Result<Self, ApiError> {
        let http = reqwest::Client::builder()
            .user_agent(USER_AGENT.as_str())
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| ApiError::Unreachable(format!("failed to build HTTP client: {}", e)))?;

        let mut base_url = base_url.trim().to_string();
        if !base_url.ends_with('/') {
            base_url.push('/');
        }

        Ok(Self {
            http,
            base_url,
            cached: Mutex::new(CachedAccount::default()),
        })
    }

    /// Secret and device id remembered from `login`/`register_device`, if both are known
    pub fn cached_credentials(&self) -> Option<Credentials> {
        let cached = self.cached.lock().ok()?;
        match (&cached.secret, &cached.device_id) {
            (Some(secret), Some(device_id)) => Some(Credentials::new(secret, device_id)),
            _ => None,
        }
    }

    pub fn cached_account(&self) -> CachedAccount {
        self.cached
            .lock()
            .map(|cached| cached.clone())
            .unwrap_or_default()
    }

    fn remember(&self, update: impl FnOnce(&mut CachedAccount)) {
        if let Ok(mut cached) = self.cached.lock() {
            update(&mut cached);
        }
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}{}{}", self.base_url, API_NAMESPACE, path)
    }

    /// Server-side trouble (5xx, 429) is transient whatever the body says,
    /// so it never reaches the per-call refusal mapping.
    async fn read_status(response: reqwest::Response) -> Result<Status, ApiError> {
        let http_status = response.status();
        let body = response.text().await?;
        debug!(%http_status, bytes = body.len(), "response received");

        if is_transient(http_status) {
            let reason = serde_json::from_str::<Value>(&body)
                .map(|value| failure_message(&value, http_status.as_str()))
                .unwrap_or_else(|_| http_status.to_string());
            return Err(ApiError::Rejected(format!(
                "server unavailable ({}): {}",
                http_status.as_u16(),
                reason
            )));
        }

        parse_status(&body)
    }
}

#[async_trait]
impl PushoverApi for RestClient {
    async fn login(&self, email: &str, password: &str) -> Result<LoginResponse, ApiError> {
        if email.trim().is_empty() || password.is_empty() {
            return Err(ApiError::InvalidArguments(
                "email and password are mandatory".to_string(),
            ));
        }

        let response = self
            .http
            .post(self.endpoint("users/login.json"))
            .form(&[("email", email), ("password", password)])
            .send()
            .await?;

        match Self::read_status(response).await? {
            Status::Success(body) => {
                let login: LoginResponse = serde_json::from_value(body).map_err(|e| {
                    ApiError::MalformedResponse(format!("login response missing fields: {}", e))
                })?;
                self.remember(|cached| {
                    cached.user_key = Some(login.user_key.clone());
                    cached.secret = Some(login.secret.clone());
                });
                Ok(login)
            }
            Status::Failure(body) => Err(ApiError::InvalidCredentials(failure_message(
                &body,
                "Email or password invalid",
            ))),
        }
    }

    async fn register_device(
        &self,
        secret: &str,
        device_name: &str,
    ) -> Result<DeviceRegistration, ApiError> {
        if secret.is_empty() {
            return Err(ApiError::InvalidArguments("secret is mandatory".to_string()));
        }
        validate_device_name(device_name)?;

        let response = self
            .http
            .post(self.endpoint("devices.json"))
            .form(&[
                ("secret", secret),
                ("name", device_name),
                ("os", OPEN_CLIENT_OS),
            ])
            .send()
            .await?;

        match Self::read_status(response).await? {
            Status::Success(body) => {
                let registration: DeviceRegistration =
                    serde_json::from_value(body).map_err(|e| {
                        ApiError::MalformedResponse(format!(
                            "device registration response missing id: {}",
                            e
                        ))
                    })?;
                self.remember(|cached| {
                    cached.secret = Some(secret.to_string());
                    cached.device_id = Some(registration.device_id.clone());
                });
                Ok(registration)
            }
            Status::Failure(body) => Err(registration_failure(&body)),
        }
    }

    async fn fetch_notifications(
        &self,
        credentials: &Credentials,
    ) -> Result<Vec<Notification>, ApiError> {
        let response = self
            .http
            .get(self.endpoint("messages.json"))
            .query(&[
                ("secret", credentials.secret.as_str()),
                ("device_id", credentials.device_id.as_str()),
            ])
            .send()
            .await?;

        match Self::read_status(response).await? {
            Status::Success(mut body) => {
                let messages = body
                    .get_mut("messages")
                    .map(Value::take)
                    .ok_or_else(|| {
                        ApiError::MalformedResponse("response has no messages".to_string())
                    })?;
                serde_json::from_value(messages).map_err(|e| {
                    ApiError::MalformedResponse(format!("could not read messages: {}", e))
                })
            }
            Status::Failure(body) => Err(ApiError::InvalidCredentials(failure_message(
                &body,
                "Fetch notifications failed, secret or device id invalid",
            ))),
        }
    }

    async fn acknowledge_notification(
        &self,
        credentials: &Credentials,
        local_id: LocalId,
    ) -> Result<(), ApiError> {
        let path = format!("devices/{}/update_highest_message.json", credentials.device_id);
        let local_id = local_id.to_string();
        let response = self
            .http
            .post(self.endpoint(&path))
            .form(&[
                ("secret", credentials.secret.as_str()),
                ("message", local_id.as_str()),
            ])
            .send()
            .await?;

        match Self::read_status(response).await? {
            Status::Success(_) => Ok(()),
            Status::Failure(body) => Err(ApiError::Rejected(failure_message(
                &body,
                "Acknowledge notification returned bad status",
            ))),
        }
    }
}

/// Check a device name locally: length 1..=25, characters `[A-Za-z0-9_-]`
pub fn validate_device_name(device_name: &str) -> Result<(), ApiError> {
    if device_name.is_empty() {
        return Err(ApiError::InvalidArguments(
            "Device name too short (min 1 char)".to_string(),
        ));
    }
    if device_name.chars().count() > MAX_DEVICE_NAME_LEN {
        return Err(ApiError::InvalidArguments(format!(
            "Device name too long (max {} chars)",
            MAX_DEVICE_NAME_LEN
        )));
    }
    if !DEVICE_NAME_RE.is_match(device_name) {
        return Err(ApiError::InvalidArguments(
            "Device name contains invalid chars (allowed are [A-Z,a-z,0-9,_,-])".to_string(),
        ));
    }
    Ok(())
}

fn is_transient(http_status: reqwest::StatusCode) -> bool {
    http_status.is_server_error() || http_status == reqwest::StatusCode::TOO_MANY_REQUESTS
}

/// A response body split on its `status` field
#[derive(Debug, PartialEq)]
enum Status {
    Success(Value),
    Failure(Value),
}

fn parse_status(body: &str) -> Result<Status, ApiError> {
    if body.trim().is_empty() {
        return Err(ApiError::MalformedResponse("empty body".to_string()));
    }

    let value: Value = serde_json::from_str(body)
        .map_err(|e| ApiError::MalformedResponse(format!("body is not JSON: {}", e)))?;

    match value.get("status").and_then(Value::as_i64) {
        Some(1) => Ok(Status::Success(value)),
        Some(_) => Ok(Status::Failure(value)),
        None => Err(ApiError::MalformedResponse(
            "response has no status field".to_string(),
        )),
    }
}

/// Human-readable reason from a refused response: the `errors` list, else `message`
fn failure_message(body: &Value, fallback: &str) -> String {
    if let Some(errors) = body.get("errors") {
        let joined = join_errors(errors);
        if !joined.is_empty() {
            return joined;
        }
    }
    body.get("message")
        .and_then(Value::as_str)
        .map(str::to_string)
        .unwrap_or_else(|| fallback.to_string())
}

fn join_errors(errors: &Value) -> String {
    match errors {
        Value::String(s) => s.clone(),
        Value::Array(items) => items
            .iter()
            .filter_map(Value::as_str)
            .collect::<Vec<_>>()
            .join(". "),
        Value::Object(fields) => fields
            .iter()
            .map(|(field, reasons)| format!("{} {}", field, join_errors(reasons)))
            .collect::<Vec<_>>()
            .join(". "),
        _ => String::new(),
    }
}

/// Device registration refusals carry per-field errors; a refusal with
/// errors on neither `name` nor `secret` is the device limit.
fn registration_failure(body: &Value) -> ApiError {
    let Some(errors) = body.get("errors") else {
        return ApiError::Rejected(failure_message(body, "Device registration failed"));
    };

    if let Some(name) = errors.get("name") {
        return ApiError::InvalidArguments(format!("Name {}", join_errors(name)));
    }
    if let Some(secret) = errors.get("secret") {
        return ApiError::InvalidCredentials(format!("Secret {}", join_errors(secret)));
    }

    ApiError::TooManyDevices(failure_message(body, "Too many devices registered"))
}
