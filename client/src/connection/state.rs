// Connection state as seen by the UI, and the login failure back-off counter

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Consecutive login failures after which credentials are dropped
pub const MAX_LOGIN_FAILURES: u32 = 3;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    #[default]
    Stopped,
    Online,
    Offline,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            ConnectionState::Stopped => "stopped",
            ConnectionState::Online => "online",
            ConnectionState::Offline => "offline",
        };
        f.write_str(label)
    }
}

/// Snapshot published on every change
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ConnectionStatus {
    pub state: ConnectionState,
    /// Last successful fetch or keepalive
    pub last_sync: Option<DateTime<Utc>>,
    /// Credentials were dropped after too many login failures
    pub max_failures_exceeded: bool,
    /// Distinct notifications in the archive
    pub messages_received: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoginFailureCounter {
    count: u32,
    max: u32,
}

impl Default for LoginFailureCounter {
    fn default() -> Self {
        Self::new(MAX_LOGIN_FAILURES)
    }
}

impl LoginFailureCounter {
    pub fn new(max: u32) -> Self {
        Self {
            count: 0,
            max: max.max(1),
        }
    }

    /// Count one failure; true once the maximum is reached
    pub fn record_failure(&mut self) -> bool {
        self.count = self.count.saturating_add(1);
        self.count >= self.max
    }

    pub fn reset(&mut self) {
        self.count = 0;
    }

    pub fn count(&self) -> u32 {
        self.count
    }
}
