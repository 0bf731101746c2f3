// Wire model for the Pushover Open Client API
// Field names follow the JSON the service returns; Rust names follow what we use them for

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Server-assigned id, unique only within this device's message stream
pub type LocalId = u64;

/// Message id unique across all of a user's devices (the wire `umid`)
pub type GlobalId = u64;

/// Priority below which a notification is never shown
pub const PRIORITY_SUPPRESSED: i8 = -2;

/// Priority at which a notification is shown without sound
pub const PRIORITY_SILENT: i8 = -1;

/// One message from the service.
///
/// Example payload:
///
/// ```json
/// { "id": 2, "umid": 6298, "title": "Welcome to Pushover!",
///   "message": "This message confirms that you are now able to receive messages",
///   "app": "Pushover", "aid": 1, "icon": "pushover", "date": 1448839221,
///   "priority": 0, "acked": 0, "sound": "po" }
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Notification {
    /// Only meaningful for acknowledging the batch it arrived in
    #[serde(rename = "id")]
    pub local_id: LocalId,
    /// De-duplication key
    #[serde(rename = "umid")]
    pub global_id: GlobalId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub app: String,
    #[serde(rename = "icon", default, skip_serializing_if = "Option::is_none")]
    pub app_icon_id: Option<String>,
    #[serde(default)]
    pub priority: i8,
    #[serde(rename = "sound", default, skip_serializing_if = "Option::is_none")]
    pub sound_key: Option<String>,
    #[serde(rename = "date", with = "chrono::serde::ts_seconds")]
    pub received_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url_title: Option<String>,
}

impl Notification {
    pub fn is_suppressed(&self) -> bool {
        self.priority <= PRIORITY_SUPPRESSED
    }

    pub fn is_silent(&self) -> bool {
        self.priority == PRIORITY_SILENT
    }

    /// Title to show: the sending app's name stands in for a missing title
    pub fn display_title(&self) -> &str {
        match self.title.as_deref() {
            Some(title) if !title.trim().is_empty() => title,
            _ => &self.app,
        }
    }
}

/// Result of a successful login
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct LoginResponse {
    #[serde(rename = "id")]
    pub user_key: String,
    pub secret: String,
}

/// Result of a successful device registration
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct DeviceRegistration {
    #[serde(rename = "id")]
    pub device_id: String,
}

/// Secret and device id needed by every call after registration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credentials {
    pub secret: String,
    pub device_id: String,
}

impl Credentials {
    pub fn new(secret: impl Into<String>, device_id: impl Into<String>) -> Self {
        Self {
            secret: secret.into(),
            device_id: device_id.into(),
        }
    }

    /// First frame the push socket expects after opening
    pub fn socket_login_frame(&self) -> String {
        format!("login:{}:{}", self.device_id, self.secret)
    }
}
