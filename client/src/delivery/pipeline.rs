//! Turns a fetched batch into store writes, display items and one acknowledgment.
//!
//! `process_batch` is synchronous and runs inside the connection manager's
//! dispatcher, so items are handled strictly in the order they arrived.
//! Display is decoupled from processing: items land in a [`DisplayQueue`] and
//! the owner drains it with [`NotificationPipeline::due`] whenever
//! [`NotificationPipeline::next_deadline`] passes. Sound cooldowns are checked
//! at drain time, so a rate-limited item that is shown later is judged against
//! what actually played before it.

use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use serde::Serialize;
use tokio::time::Instant;
use tracing::{debug, warn};

use super::store::NotificationStore;
use crate::protocol::model::{GlobalId, LocalId, Notification};

/// Minimum spacing between native notifications
pub const DISPLAY_INTERVAL: Duration = Duration::from_millis(1500);

/// A sound key stays quiet this long after it last played
pub const SOUND_COOLDOWN: Duration = Duration::from_secs(10);

pub const DEFAULT_MAX_NOTIFICATION_AMOUNT: usize = 20;

/// Ceiling on `max_notification_amount`; one batch plus its summary must fit
/// the display channel when everything is released at once
pub const MAX_DISPLAY_LIMIT: usize = 100;

pub const DEFAULT_SOUND: &str = "po";

/// Sound key meaning "play nothing"
pub const NO_SOUND: &str = "no";

const ICON_BASE_URL: &str = "https://api.pushover.net/icons/";

/// Immutable settings snapshot the pipeline works from
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipelineConfig {
    /// Largest number of items from one batch that get displayed
    pub max_notification_amount: usize,
    pub default_sound: String,
    /// Native notification center is in use, so displays are rate limited
    pub native_notifications: bool,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            max_notification_amount: DEFAULT_MAX_NOTIFICATION_AMOUNT,
            default_sound: DEFAULT_SOUND.to_string(),
            native_notifications: true,
        }
    }
}

impl PipelineConfig {
    fn display_limit(&self) -> usize {
        self.max_notification_amount.clamp(1, MAX_DISPLAY_LIMIT)
    }

    /// Resolved sound for one notification, `None` meaning silence
    pub fn resolve_sound(&self, notification: &Notification) -> Option<String> {
        if notification.is_silent() {
            return None;
        }

        let key = notification
            .sound_key
            .as_deref()
            .map(str::trim)
            .filter(|key| !key.is_empty())
            .unwrap_or(&self.default_sound);

        sound_or_none(key)
    }

    fn summary_sound(&self) -> Option<String> {
        sound_or_none(&self.default_sound)
    }
}

fn sound_or_none(key: &str) -> Option<String> {
    let key = key.trim();
    if key.is_empty() || key == NO_SOUND {
        None
    } else {
        Some(key.to_string())
    }
}

/// Icon ids are names under the service's icon path; full URLs pass through
fn icon_url(icon: &str) -> String {
    if icon.starts_with("https://") {
        icon.to_string()
    } else {
        format!("{}{}.png", ICON_BASE_URL, icon)
    }
}

/// What the presenter is asked to show
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DisplayItem {
    /// `None` for the synthetic overflow summary
    pub global_id: Option<GlobalId>,
    pub title: String,
    pub body: String,
    pub url: Option<String>,
    pub url_title: Option<String>,
    pub icon_url: Option<String>,
    pub priority: i8,
    pub sound: Option<String>,
}

impl DisplayItem {
    pub fn from_notification(notification: &Notification, sound: Option<String>) -> Self {
        Self {
            global_id: Some(notification.global_id),
            title: notification.display_title().to_string(),
            body: notification.message.clone(),
            url: notification.url.clone(),
            url_title: notification.url_title.clone(),
            icon_url: notification
                .app_icon_id
                .as_deref()
                .filter(|icon| !icon.is_empty())
                .map(icon_url),
            priority: notification.priority,
            sound,
        }
    }

    pub fn omitted_summary(omitted: usize, sound: Option<String>) -> Self {
        let noun = if omitted == 1 {
            "notification"
        } else {
            "notifications"
        };
        Self {
            global_id: None,
            title: "pushdesk".to_string(),
            body: format!("Omitted {} older {}", omitted, noun),
            url: None,
            url_title: None,
            icon_url: None,
            priority: 0,
            sound,
        }
    }

    pub fn is_summary(&self) -> bool {
        self.global_id.is_none()
    }
}

/// Items waiting to be shown, released at most once per interval when rate limited
#[derive(Debug)]
pub struct DisplayQueue {
    interval: Duration,
    pending: VecDeque<DisplayItem>,
    next_slot: Option<Instant>,
}

impl DisplayQueue {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            pending: VecDeque::new(),
            next_slot: None,
        }
    }

    pub fn push(&mut self, item: DisplayItem) {
        self.pending.push_back(item);
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    pub fn clear(&mut self) {
        self.pending.clear();
    }

    /// When the next item may be released; `None` when there is nothing queued
    pub fn next_deadline(&self, now: Instant, rate_limited: bool) -> Option<Instant> {
        if self.pending.is_empty() {
            return None;
        }
        if !rate_limited {
            return Some(now);
        }
        Some(self.next_slot.map_or(now, |slot| slot.max(now)))
    }

    /// Everything allowed out at `now`
    pub fn pop_due(&mut self, now: Instant, rate_limited: bool) -> Vec<DisplayItem> {
        if !rate_limited {
            return self.pending.drain(..).collect();
        }

        if self.next_slot.is_some_and(|slot| now < slot) {
            return Vec::new();
        }

        match self.pending.pop_front() {
            Some(item) => {
                self.next_slot = Some(now + self.interval);
                vec![item]
            }
            None => Vec::new(),
        }
    }
}

/// Per-sound-key rolling cooldown
#[derive(Debug)]
pub struct SoundCooldowns {
    cooldown: Duration,
    last_played: HashMap<String, Instant>,
}

impl SoundCooldowns {
    pub fn new(cooldown: Duration) -> Self {
        Self {
            cooldown,
            last_played: HashMap::new(),
        }
    }

    /// Whether `sound` may play at `now`; records the play when it may
    pub fn admit(&mut self, sound: &str, now: Instant) -> bool {
        let allowed = match self.last_played.get(sound) {
            Some(last) => now.saturating_duration_since(*last) >= self.cooldown,
            None => true,
        };
        if allowed {
            self.last_played.insert(sound.to_string(), now);
        }
        allowed
    }
}

/// Summary of one processed batch
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BatchOutcome {
    /// Local id of the batch's last item, `None` for an empty batch
    pub acknowledge: Option<LocalId>,
    /// Newly stored notifications
    pub stored: usize,
    /// Already-known notifications seen again
    pub redelivered: usize,
    /// Items (summary included) handed to the display queue
    pub queued: usize,
    /// Older items not displayed because the batch overflowed
    pub omitted: usize,
}

#[derive(Debug)]
pub struct NotificationPipeline {
    queue: DisplayQueue,
    sounds: SoundCooldowns,
}

impl Default for NotificationPipeline {
    fn default() -> Self {
        Self::new()
    }
}

impl NotificationPipeline {
    pub fn new() -> Self {
        Self::with_timing(DISPLAY_INTERVAL, SOUND_COOLDOWN)
    }

    pub fn with_timing(display_interval: Duration, sound_cooldown: Duration) -> Self {
        Self {
            queue: DisplayQueue::new(display_interval),
            sounds: SoundCooldowns::new(sound_cooldown),
        }
    }

    pub fn process_batch(
        &mut self,
        batch: &[Notification],
        config: &PipelineConfig,
        store: &mut dyn NotificationStore,
    ) -> BatchOutcome {
        let Some(last) = batch.last() else {
            return BatchOutcome::default();
        };

        let mut outcome = BatchOutcome {
            acknowledge: Some(last.local_id),
            ..BatchOutcome::default()
        };

        for notification in batch {
            if !store.is_new(notification.global_id) {
                outcome.redelivered += 1;
                debug!(global_id = notification.global_id, "notification redelivered");
                continue;
            }
            match store.insert(notification) {
                Ok(()) => outcome.stored += 1,
                Err(e) => warn!(
                    global_id = notification.global_id,
                    error = %e,
                    "failed to store notification"
                ),
            }
        }

        // Overflow is decided by position; suppressed items still take a slot
        let omitted = batch.len().saturating_sub(config.display_limit());
        for notification in &batch[omitted..] {
            if notification.is_suppressed() {
                continue;
            }
            let sound = config.resolve_sound(notification);
            self.queue
                .push(DisplayItem::from_notification(notification, sound));
            outcome.queued += 1;
        }

        if omitted > 0 {
            self.queue
                .push(DisplayItem::omitted_summary(omitted, config.summary_sound()));
            outcome.queued += 1;
            outcome.omitted = omitted;
        }

        outcome
    }

    /// Release whatever may be displayed at `now`, with sound cooldowns applied
    pub fn due(&mut self, now: Instant, config: &PipelineConfig) -> Vec<DisplayItem> {
        let mut items = self.queue.pop_due(now, config.native_notifications);
        for item in &mut items {
            if let Some(sound) = item.sound.as_deref() {
                if !self.sounds.admit(sound, now) {
                    debug!(sound, "sound in cooldown, showing silently");
                    item.sound = None;
                }
            }
        }
        items
    }

    pub fn next_deadline(&self, now: Instant, config: &PipelineConfig) -> Option<Instant> {
        self.queue.next_deadline(now, config.native_notifications)
    }

    pub fn pending(&self) -> usize {
        self.queue.len()
    }

    /// Drop everything not yet displayed
    pub fn clear(&mut self) {
        self.queue.clear();
    }
}
