// Persisted user settings and account credentials (settings.json)

use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::config::Config;
use crate::delivery::pipeline::{PipelineConfig, DEFAULT_MAX_NOTIFICATION_AMOUNT, DEFAULT_SOUND};
use crate::persistence::{atomic_write, FileLock};
use crate::protocol::model::Credentials;

/// What we know about the logged-in account and this device
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Account {
    pub email: Option<String>,
    pub user_key: Option<String>,
    pub secret: Option<String>,
    pub device_id: Option<String>,
    pub device_name: Option<String>,
}

impl Account {
    pub fn credentials(&self) -> Option<Credentials> {
        match (self.secret.as_deref(), self.device_id.as_deref()) {
            (Some(secret), Some(device_id)) if !secret.is_empty() && !device_id.is_empty() => {
                Some(Credentials::new(secret, device_id))
            }
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub account: Account,
    pub max_notification_amount: usize,
    pub default_sound: String,
    pub native_notifications: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_base_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub socket_endpoint: Option<String>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            account: Account::default(),
            max_notification_amount: DEFAULT_MAX_NOTIFICATION_AMOUNT,
            default_sound: DEFAULT_SOUND.to_string(),
            native_notifications: true,
            api_base_url: None,
            socket_endpoint: None,
        }
    }
}

impl Settings {
    /// Load settings, falling back to defaults when the file does not exist yet
    pub fn load(config: &Config) -> Result<Self> {
        Self::read(&config.settings_file())
    }

    pub fn save(&self, config: &Config) -> Result<()> {
        let path = config.settings_file();
        let _lock = FileLock::acquire(&path)?;
        self.write(&path)
    }

    /// Read-modify-write under the settings lock
    pub fn update(config: &Config, change: impl FnOnce(&mut Settings)) -> Result<Self> {
        let path = config.settings_file();
        let _lock = FileLock::acquire(&path)?;

        let mut settings = Self::read(&path)?;
        change(&mut settings);
        settings.write(&path)?;
        Ok(settings)
    }

    pub fn credentials(&self) -> Option<Credentials> {
        self.account.credentials()
    }

    pub fn pipeline_config(&self) -> PipelineConfig {
        PipelineConfig {
            max_notification_amount: self.max_notification_amount,
            default_sound: self.default_sound.clone(),
            native_notifications: self.native_notifications,
        }
    }

    /// Forget the secret and device id; the email stays for the next login prompt
    pub fn clear_credentials(&mut self) {
        self.account.user_key = None;
        self.account.secret = None;
        self.account.device_id = None;
    }

    fn read(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }

        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read settings: {}", path.display()))?;
        serde_json::from_str(&contents)
            .with_context(|| format!("Failed to parse settings: {}", path.display()))
    }

    fn write(&self, path: &Path) -> Result<()> {
        let json = serde_json::to_string_pretty(self).context("Failed to serialize settings")?;
        atomic_write(path, json)
    }
}

/// Where the connection manager drops credentials after repeated login failures
pub trait CredentialStore: Send + Sync {
    fn clear(&self) -> Result<()>;
}

/// Clears credentials in `settings.json`
#[derive(Debug, Clone)]
pub struct SettingsCredentialStore {
    config: Config,
}

impl SettingsCredentialStore {
    pub fn new(config: Config) -> Self {
        Self { config }
    }
}

impl CredentialStore for SettingsCredentialStore {
    fn clear(&self) -> Result<()> {
        Settings::update(&self.config, Settings::clear_credentials)?;
        info!("stored credentials cleared");
        Ok(())
    }
}
