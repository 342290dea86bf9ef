//! Streaming HTTP content acquirer.
//!
//! Audio lands in `<home>/audio/downloaded` and is moved to
//! `<home>/audio/archive` once its episode completes.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{error, info, warn};

use super::{Acquired, ContentAcquirer};

const BYTES_PER_MB: f64 = 1024.0 * 1024.0;

pub struct HttpAcquirer {
    client: reqwest::Client,
    download_dir: PathBuf,
    archive_dir: PathBuf,
}

impl HttpAcquirer {
    /// Acquirer rooted at `audio_dir` (creates `downloaded/` and `archive/`)
    pub fn new(audio_dir: &Path) -> Result<Self> {
        let download_dir = audio_dir.join("downloaded");
        let archive_dir = audio_dir.join("archive");
        for dir in [&download_dir, &archive_dir] {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("Failed to create {}", dir.display()))?;
        }

        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(30))
            .build()
            .context("Failed to build HTTP client")?;

        Ok(Self {
            client,
            download_dir,
            archive_dir,
        })
    }

    pub fn download_dir(&self) -> &Path {
        &self.download_dir
    }

    pub fn archive_dir(&self) -> &Path {
        &self.archive_dir
    }

    /// Stream `url` into `path`, enforcing the size ceiling.
    ///
    /// Returns the byte count, or `None` when the ceiling was exceeded.
    /// `path` is a staging file; the caller moves it into place.
    async fn stream_to(&self, url: &str, path: &Path, max_bytes: u64) -> Result<Option<u64>> {
        let mut response = self
            .client
            .get(url)
            .send()
            .await
            .with_context(|| format!("Failed to request {}", url))?
            .error_for_status()
            .with_context(|| format!("Download rejected for {}", url))?;

        if let Some(length) = response.content_length() {
            if length > max_bytes {
                error!(
                    url,
                    size_mb = length as f64 / BYTES_PER_MB,
                    limit_mb = max_bytes as f64 / BYTES_PER_MB,
                    "Declared size exceeds limit"
                );
                return Ok(None);
            }
        }

        let mut file = fs::File::create(path)
            .await
            .with_context(|| format!("Failed to create {}", path.display()))?;
        let mut written: u64 = 0;

        while let Some(chunk) = response.chunk().await.context("Download interrupted")? {
            written += chunk.len() as u64;
            if written > max_bytes {
                error!(url, limit_mb = max_bytes as f64 / BYTES_PER_MB, "Stream exceeds size limit");
                return Ok(None);
            }
            file.write_all(&chunk).await.context("Failed to write audio")?;
        }
        file.flush().await.context("Failed to flush audio")?;

        Ok(Some(written))
    }

    /// Locate a file by name across the audio directories
    fn locate(&self, path: &Path) -> Option<PathBuf> {
        if path.exists() {
            return Some(path.to_path_buf());
        }
        let name = path.file_name()?;
        [&self.download_dir, &self.archive_dir]
            .into_iter()
            .map(|dir| dir.join(name))
            .find(|candidate| candidate.exists())
    }
}

/// `<name>.part` beside the final file
fn staging_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    name.push(".part");
    path.with_file_name(name)
}

#[async_trait]
impl ContentAcquirer for HttpAcquirer {
    async fn acquire(
        &self,
        url: &str,
        file_name: &str,
        max_size_mb: f64,
    ) -> Result<Option<Acquired>> {
        let path = self.download_dir.join(file_name);
        let max_bytes = (max_size_mb * BYTES_PER_MB) as u64;

        // Only complete downloads ever reach the final name
        if let Ok(meta) = fs::metadata(&path).await {
            if meta.len() > max_bytes {
                error!(
                    path = %path.display(),
                    size_mb = meta.len() as f64 / BYTES_PER_MB,
                    limit_mb = max_size_mb,
                    "Existing audio exceeds size limit"
                );
                let _ = fs::remove_file(&path).await;
                return Ok(None);
            }
            if meta.len() > 0 {
                info!(path = %path.display(), "Audio already on disk");
                return Ok(Some(Acquired {
                    size_mb: meta.len() as f64 / BYTES_PER_MB,
                    path,
                }));
            }
        }

        let staging = staging_path(&path);
        info!(url, "Downloading audio");

        match self.stream_to(url, &staging, max_bytes).await {
            Ok(Some(bytes)) => {
                fs::rename(&staging, &path)
                    .await
                    .with_context(|| format!("Failed to move {} into place", staging.display()))?;
                let size_mb = bytes as f64 / BYTES_PER_MB;
                info!(path = %path.display(), size_mb, "Downloaded audio");
                Ok(Some(Acquired { path, size_mb }))
            }
            Ok(None) => {
                let _ = fs::remove_file(&staging).await;
                Ok(None)
            }
            Err(e) => {
                let _ = fs::remove_file(&staging).await;
                Err(e)
            }
        }
    }

    async fn archive(&self, path: &Path) -> Result<()> {
        let Some(source) = self.locate(path) else {
            warn!(path = %path.display(), "Audio not found for archiving");
            return Ok(());
        };
        let Some(name) = source.file_name() else {
            return Ok(());
        };
        let target = self.archive_dir.join(name);
        if source == target {
            return Ok(());
        }

        fs::rename(&source, &target)
            .await
            .with_context(|| format!("Failed to archive {}", source.display()))?;
        info!(path = %target.display(), "Archived audio");
        Ok(())
    }

    async fn purge(&self, path: &Path) -> Result<()> {
        match self.locate(path) {
            Some(found) => {
                fs::remove_file(&found)
                    .await
                    .with_context(|| format!("Failed to delete {}", found.display()))?;
                info!(path = %found.display(), "Deleted audio");
            }
            None => warn!(path = %path.display(), "Audio not found for deletion"),
        }
        Ok(())
    }
}
