//! Archive of every notification ever received, keyed by global id.
//!
//! The archive is what makes redelivery harmless: inserting an id that is
//! already present succeeds without changing anything, so the "messages
//! received" count only ever counts distinct notifications.
//!
//! [`FileNotificationStore`] keeps one JSON object per line in
//! `notifications.jsonl`. Lines are only ever appended; a line that fails to
//! parse on load is skipped with a warning.

use std::collections::BTreeMap;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tracing::{debug, warn};

use crate::persistence::FileLock;
use crate::protocol::model::{GlobalId, Notification};

pub trait NotificationStore: Send {
    /// Pure lookup
    fn is_new(&self, global_id: GlobalId) -> bool;

    /// Idempotent: inserting a known id is a successful no-op
    fn insert(&mut self, notification: &Notification) -> Result<()>;

    /// Distinct notifications stored so far
    fn count(&self) -> usize;

    fn get(&self, global_id: GlobalId) -> Option<&Notification>;

    /// Newest first
    fn recent(&self, limit: usize) -> Vec<&Notification>;
}

/// Store that lives only as long as the process
#[derive(Debug, Default, Clone)]
pub struct MemoryNotificationStore {
    notifications: BTreeMap<GlobalId, Notification>,
}

impl MemoryNotificationStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl NotificationStore for MemoryNotificationStore {
    fn is_new(&self, global_id: GlobalId) -> bool {
        !self.notifications.contains_key(&global_id)
    }

    fn insert(&mut self, notification: &Notification) -> Result<()> {
        self.notifications
            .entry(notification.global_id)
            .or_insert_with(|| notification.clone());
        Ok(())
    }

    fn count(&self) -> usize {
        self.notifications.len()
    }

    fn get(&self, global_id: GlobalId) -> Option<&Notification> {
        self.notifications.get(&global_id)
    }

    fn recent(&self, limit: usize) -> Vec<&Notification> {
        newest_first(&self.notifications, limit)
    }
}

/// Append-only JSON-lines archive
#[derive(Debug)]
pub struct FileNotificationStore {
    path: PathBuf,
    notifications: BTreeMap<GlobalId, Notification>,
}

impl FileNotificationStore {
    /// Load the archive at `path`, starting empty if it does not exist yet
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let mut notifications = BTreeMap::new();

        if path.exists() {
            let contents = fs::read_to_string(&path)
                .with_context(|| format!("Failed to read notification archive: {}", path.display()))?;

            for (index, line) in contents.lines().enumerate() {
                let line = line.trim();
                if line.is_empty() {
                    continue;
                }
                match serde_json::from_str::<Notification>(line) {
                    Ok(notification) => {
                        notifications
                            .entry(notification.global_id)
                            .or_insert(notification);
                    }
                    Err(e) => {
                        warn!(
                            path = %path.display(),
                            line = index + 1,
                            error = %e,
                            "skipping unreadable archive line"
                        );
                    }
                }
            }
        }

        debug!(path = %path.display(), count = notifications.len(), "notification archive loaded");
        Ok(Self {
            path,
            notifications,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn append(&self, notification: &Notification) -> Result<()> {
        let mut line =
            serde_json::to_string(notification).context("Failed to serialize notification")?;
        line.push('\n');

        // Runs on the connection manager's task; never wait on another process
        let _lock = FileLock::try_acquire(&self.path)?;
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .with_context(|| {
                format!("Failed to open notification archive: {}", self.path.display())
            })?;

        file.write_all(line.as_bytes())
            .with_context(|| format!("Failed to append to {}", self.path.display()))?;
        Ok(())
    }
}

impl NotificationStore for FileNotificationStore {
    fn is_new(&self, global_id: GlobalId) -> bool {
        !self.notifications.contains_key(&global_id)
    }

    fn insert(&mut self, notification: &Notification) -> Result<()> {
        if self.notifications.contains_key(&notification.global_id) {
            return Ok(());
        }

        // Memory is only updated once the line is on disk
        self.append(notification)?;
        self.notifications
            .insert(notification.global_id, notification.clone());
        Ok(())
    }

    fn count(&self) -> usize {
        self.notifications.len()
    }

    fn get(&self, global_id: GlobalId) -> Option<&Notification> {
        self.notifications.get(&global_id)
    }

    fn recent(&self, limit: usize) -> Vec<&Notification> {
        newest_first(&self.notifications, limit)
    }
}

fn newest_first(
    notifications: &BTreeMap<GlobalId, Notification>,
    limit: usize,
) -> Vec<&Notification> {
    let mut all: Vec<&Notification> = notifications.values().collect();
    all.sort_by(|a, b| {
        b.received_at
            .cmp(&a.received_at)
            .then_with(|| b.global_id.cmp(&a.global_id))
    });
    all.truncate(limit);
    all
}
