// Notification sounds: download-once cache plus a rodio playback thread

use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::sync::mpsc as std_mpsc;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use rodio::{Decoder, OutputStream, OutputStreamHandle, Sink};
use tracing::{debug, info, warn};

use super::pipeline::NO_SOUND;
use crate::persistence::atomic_write;

pub const DEFAULT_SOUND_BASE_URL: &str = "https://api.pushover.net/sounds/";

/// Sound keys the service uses in messages, with their display names
pub const SOUNDS: &[(&str, &str)] = &[
    ("po", "Pushover (default)"),
    ("bk", "Bike"),
    ("bu", "Bugle"),
    ("ch", "Cash Register"),
    ("cl", "Classical"),
    ("co", "Cosmic"),
    ("fa", "Falling"),
    ("gl", "Gamelan"),
    ("ic", "Incoming"),
    ("im", "Intermission"),
    ("ma", "Magic"),
    ("mc", "Mechanical"),
    ("pn", "Piano Bar"),
    ("si", "Siren"),
    ("sp", "Space Alarm"),
    ("tg", "Tug Boat"),
    ("ln", "Alien Alarm (long)"),
    ("mb", "Climb (long)"),
    ("ps", "Persistent (long)"),
    ("ec", "Pushover Echo (long)"),
    ("ud", "Up Down (long)"),
    (NO_SOUND, "None (silent)"),
];

pub fn sound_name(key: &str) -> Option<&'static str> {
    SOUNDS
        .iter()
        .find(|(known, _)| *known == key)
        .map(|(_, name)| *name)
}

/// Whether a key is safe to use as a file name and URL segment
fn is_valid_key(key: &str) -> bool {
    !key.is_empty()
        && key
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
}

/// Where something should play sound; the seam tests replace with a recorder
pub trait SoundOutput: Send + Sync {
    /// Fire and forget
    fn play(&self, key: &str);
}

/// Sound files fetched from the service on first use
#[derive(Debug, Clone)]
pub struct SoundCache {
    dir: PathBuf,
    base_url: String,
    http: reqwest::Client,
}

impl SoundCache {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self::with_base_url(dir, DEFAULT_SOUND_BASE_URL)
    }

    pub fn with_base_url(dir: impl Into<PathBuf>, base_url: impl Into<String>) -> Self {
        let mut base_url = base_url.into();
        if !base_url.ends_with('/') {
            base_url.push('/');
        }
        Self {
            dir: dir.into(),
            base_url,
            http: reqwest::Client::new(),
        }
    }

    pub fn path_for(&self, key: &str) -> PathBuf {
        self.dir.join(format!("{}.wav", key))
    }

    pub fn url_for(&self, key: &str) -> String {
        format!("{}{}.wav", self.base_url, key)
    }

    /// Local path of the sound, downloading it if it is not cached yet
    pub async fn ensure(&self, key: &str) -> Result<PathBuf> {
        if !is_valid_key(key) || key == NO_SOUND {
            bail!("Not a playable sound: {:?}", key);
        }

        let path = self.path_for(key);
        if path.is_file() {
            return Ok(path);
        }

        let url = self.url_for(key);
        let bytes = self
            .http
            .get(&url)
            .send()
            .await
            .and_then(|response| response.error_for_status())
            .with_context(|| format!("Failed to download sound: {}", url))?
            .bytes()
            .await
            .with_context(|| format!("Failed to read sound body: {}", url))?;

        atomic_write(&path, &bytes)?;
        info!(key, path = %path.display(), "sound cached");
        Ok(path)
    }
}

/// Plays cached sounds on a dedicated audio thread.
///
/// rodio's output stream is not `Send`, so the thread owns it and receives
/// file paths over a channel. Downloads happen on the tokio runtime.
pub struct SoundPlayer {
    cache: Arc<SoundCache>,
    runtime: tokio::runtime::Handle,
    audio: std_mpsc::Sender<PathBuf>,
}

impl SoundPlayer {
    /// Must be called from inside a tokio runtime
    pub fn spawn(cache: SoundCache) -> Result<Self> {
        let runtime = tokio::runtime::Handle::try_current()
            .context("Sound player needs a tokio runtime")?;

        let (audio, paths) = std_mpsc::channel();
        std::thread::Builder::new()
            .name("pushdesk-audio".to_string())
            .spawn(move || audio_thread(paths))
            .context("Failed to spawn audio thread")?;

        Ok(Self {
            cache: Arc::new(cache),
            runtime,
            audio,
        })
    }
}

impl SoundOutput for SoundPlayer {
    fn play(&self, key: &str) {
        let cache = Arc::clone(&self.cache);
        let audio = self.audio.clone();
        let key = key.to_string();

        self.runtime.spawn(async move {
            match cache.ensure(&key).await {
                Ok(path) => {
                    if audio.send(path).is_err() {
                        warn!(key, "audio thread is gone");
                    }
                }
                Err(e) => warn!(key, error = %e, "sound unavailable"),
            }
        });
    }
}

fn audio_thread(paths: std_mpsc::Receiver<PathBuf>) {
    let (_stream, handle) = match OutputStream::try_default() {
        Ok(output) => output,
        Err(e) => {
            warn!(error = %e, "no audio device, sounds disabled");
            for path in paths {
                debug!(path = %path.display(), "dropping sound");
            }
            return;
        }
    };

    let mut playing: Vec<Sink> = Vec::new();
    for path in paths {
        playing.retain(|sink| !sink.empty());
        match play_file(&handle, &path) {
            Ok(sink) => playing.push(sink),
            Err(e) => warn!(path = %path.display(), error = %e, "failed to play sound"),
        }
    }
}

fn play_file(handle: &OutputStreamHandle, path: &Path) -> Result<Sink> {
    let file =
        File::open(path).with_context(|| format!("Failed to open sound: {}", path.display()))?;
    let source = Decoder::new(BufReader::new(file)).context("Failed to decode audio")?;
    let sink = Sink::try_new(handle).context("Failed to create audio sink")?;
    sink.append(source);
    Ok(sink)
}
