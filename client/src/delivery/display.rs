//! Presenting display items to the user.
//!
//! The connection manager only publishes [`DisplayItem`]s on a broadcast
//! channel. A [`DisplayDriver`] subscribed to that channel plays the sound
//! and hands the item to a [`Presenter`]: the OS notification center, or the
//! log when native notifications are turned off. App icons are fetched
//! through an [`IconCache`] first so the presenter gets a local file.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use once_cell::sync::Lazy;
use regex::Regex;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use super::icon::IconCache;
use super::pipeline::DisplayItem;
use super::sound::SoundOutput;

/// Wait before the single retry of a failed display
pub const DISPLAY_RETRY_DELAY: Duration = Duration::from_secs(1);

const APP_NAME: &str = "pushdesk";

static TAG_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"<[^>]*>").expect("valid tag regex"));

/// Native notification centers render plain text only
pub fn strip_tags(text: &str) -> String {
    TAG_RE.replace_all(text, "").into_owned()
}

pub trait Presenter: Send + Sync {
    /// `icon` is the cached app icon, when there is one
    fn show(&self, item: &DisplayItem, icon: Option<&Path>) -> Result<()>;
}

/// OS notification center via notify-rust
#[derive(Debug, Clone, Default)]
pub struct NativePresenter;

impl NativePresenter {
    fn body(item: &DisplayItem) -> String {
        let mut body = strip_tags(&item.body);
        if let Some(url) = item.url.as_deref() {
            let label = item.url_title.as_deref().unwrap_or(url);
            if !body.is_empty() {
                body.push('\n');
            }
            if label == url {
                body.push_str(url);
            } else {
                body.push_str(&format!("{}: {}", label, url));
            }
        }
        body
    }
}

impl Presenter for NativePresenter {
    fn show(&self, item: &DisplayItem, icon: Option<&Path>) -> Result<()> {
        let mut notification = notify_rust::Notification::new();
        notification
            .appname(APP_NAME)
            .summary(&item.title)
            .body(&Self::body(item));
        if let Some(icon) = icon {
            notification.icon(&icon.to_string_lossy());
        }
        notification
            .show()
            .map(|_| ())
            .context("Failed to show native notification")
    }
}

/// Writes items to the log instead of the notification center
#[derive(Debug, Clone, Default)]
pub struct LogPresenter;

impl Presenter for LogPresenter {
    fn show(&self, item: &DisplayItem, _icon: Option<&Path>) -> Result<()> {
        info!(
            title = %item.title,
            body = %strip_tags(&item.body),
            url = item.url.as_deref().unwrap_or(""),
            priority = item.priority,
            "notification"
        );
        Ok(())
    }
}

/// Consumes display items and drives the presenter and sound output
pub struct DisplayDriver {
    presenter: Arc<dyn Presenter>,
    sounds: Arc<dyn SoundOutput>,
    icons: Option<IconCache>,
    retry_delay: Duration,
}

impl DisplayDriver {
    pub fn new(presenter: Arc<dyn Presenter>, sounds: Arc<dyn SoundOutput>) -> Self {
        Self {
            presenter,
            sounds,
            icons: None,
            retry_delay: DISPLAY_RETRY_DELAY,
        }
    }

    pub fn with_icons(mut self, icons: IconCache) -> Self {
        self.icons = Some(icons);
        self
    }

    pub fn with_retry_delay(mut self, retry_delay: Duration) -> Self {
        self.retry_delay = retry_delay;
        self
    }

    /// Run until the sending side is dropped
    pub async fn run(self, mut items: broadcast::Receiver<DisplayItem>) {
        loop {
            match items.recv().await {
                Ok(item) => self.deliver(item).await,
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "display driver fell behind, items skipped");
                }
                Err(broadcast::error::RecvError::Closed) => {
                    debug!("display channel closed");
                    return;
                }
            }
        }
    }

    /// Play the item's sound and show it, retrying the display once
    pub async fn deliver(&self, item: DisplayItem) {
        if let Some(sound) = item.sound.as_deref() {
            self.sounds.play(sound);
        }

        let icon = self.icon_for(&item).await;
        let item = Arc::new(item);
        if let Err(first) = self.show(&item, &icon).await {
            debug!(error = %first, "display failed, retrying");
            tokio::time::sleep(self.retry_delay).await;
            if let Err(e) = self.show(&item, &icon).await {
                warn!(title = %item.title, error = %e, "failed to display notification");
            }
        }
    }

    /// A missing icon never holds the notification back
    async fn icon_for(&self, item: &DisplayItem) -> Option<PathBuf> {
        let icons = self.icons.as_ref()?;
        let url = item.icon_url.as_deref()?;
        match icons.ensure(url).await {
            Ok(path) => Some(path),
            Err(e) => {
                debug!(url, error = %e, "icon unavailable");
                None
            }
        }
    }

    async fn show(&self, item: &Arc<DisplayItem>, icon: &Option<PathBuf>) -> Result<()> {
        let presenter = Arc::clone(&self.presenter);
        let item = Arc::clone(item);
        let icon = icon.clone();
        tokio::task::spawn_blocking(move || presenter.show(&item, icon.as_deref()))
            .await
            .context("Display task panicked")?
    }
}
