// Application icons: fetched once per icon and kept next to the cached sounds

use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use tracing::info;

use crate::persistence::atomic_write;

/// Icons cached on disk under their file name from the service
#[derive(Debug, Clone)]
pub struct IconCache {
    dir: PathBuf,
    http: reqwest::Client,
}

impl IconCache {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            http: reqwest::Client::new(),
        }
    }

    /// Cache file for an icon URL; `None` unless the last segment is a plain `<name>.png`
    pub fn path_for(&self, url: &str) -> Option<PathBuf> {
        let url = reqwest::Url::parse(url).ok()?;
        let file_name = url.path_segments()?.last()?;
        let stem = file_name.strip_suffix(".png")?;
        let valid = !stem.is_empty()
            && stem
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-');
        valid.then(|| self.dir.join(file_name))
    }

    /// Local path of the icon, downloading it on first use
    pub async fn ensure(&self, url: &str) -> Result<PathBuf> {
        let Some(path) = self.path_for(url) else {
            bail!("Not a cacheable icon url: {:?}", url);
        };
        if path.is_file() {
            return Ok(path);
        }

        let bytes = self
            .http
            .get(url)
            .send()
            .await
            .and_then(|response| response.error_for_status())
            .with_context(|| format!("Failed to download icon: {}", url))?
            .bytes()
            .await
            .with_context(|| format!("Failed to read icon body: {}", url))?;

        atomic_write(&path, &bytes)?;
        info!(path = %path.display(), "icon cached");
        Ok(path)
    }
}
