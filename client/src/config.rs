// Environment configuration helpers
// Resolves where settings, the notification archive and cached sounds live

use std::path::PathBuf;

/// Environment variable overriding the state directory
pub const STATE_DIR_ENV: &str = "PUSHDESK_DIR";

/// Paths used by the client
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    /// Directory for persistent state (settings, notification archive, sounds, icons)
    pub state_dir: PathBuf,
}

impl Config {
    pub fn new(state_dir: impl Into<PathBuf>) -> Self {
        Self {
            state_dir: state_dir.into(),
        }
    }

    /// Create configuration using default paths
    pub fn default_paths() -> Self {
        Self::new(Self::default_state_dir())
    }

    /// Create configuration from environment variables, falling back to defaults
    pub fn from_env() -> Self {
        if let Ok(override_dir) = std::env::var(STATE_DIR_ENV) {
            if !override_dir.trim().is_empty() {
                return Self::new(override_dir);
            }
        }

        Self::default_paths()
    }

    /// All platforms: ~/.pushdesk/ (or the temp dir if home is unavailable)
    fn default_state_dir() -> PathBuf {
        dirs::home_dir()
            .map(|h| h.join(".pushdesk"))
            .unwrap_or_else(|| std::env::temp_dir().join("pushdesk"))
    }

    pub fn state_dir(&self) -> &PathBuf {
        &self.state_dir
    }

    pub fn settings_file(&self) -> PathBuf {
        self.state_dir.join("settings.json")
    }

    /// Append-only archive of every notification ever received
    pub fn notifications_file(&self) -> PathBuf {
        self.state_dir.join("notifications.jsonl")
    }

    pub fn sounds_dir(&self) -> PathBuf {
        self.state_dir.join("sounds")
    }

    pub fn icons_dir(&self) -> PathBuf {
        self.state_dir.join("icons")
    }

    /// Ensure the state directory exists; owner-only on Unix since it holds the secret
    pub fn ensure_dirs(&self) -> std::io::Result<()> {
        std::fs::create_dir_all(&self.state_dir)?;
        std::fs::create_dir_all(self.sounds_dir())?;
        std::fs::create_dir_all(self.icons_dir())?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&self.state_dir, std::fs::Permissions::from_mode(0o700))?;
        }

        Ok(())
    }
}
