//! Download capability.
//!
//! The orchestrator only consumes progress callbacks from a [`Downloader`]; transport
//! and resumption are the implementation's business. [`HttpDownloader`] streams a URL
//! to the artifact path with `reqwest`.

use crate::core::{CancelToken, UpdateError};
use anyhow::Context;
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::time::Instant;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info};

/// Progress callback: `(bytes so far, total bytes or 0 when unknown, rate in MB/s)`.
pub type ProgressFn = dyn Fn(u64, u64, Option<f64>) + Send + Sync;

/// Fetches the new-version artifact.
#[async_trait]
pub trait Downloader: Send + Sync {
    /// Download to completion. Must return promptly with [`UpdateError::Cancelled`] once
    /// `cancel` fires.
    async fn execute(&self, cancel: &CancelToken, on_progress: &ProgressFn) -> Result<(), UpdateError>;
}

/// Streams an HTTP(S) URL to a file.
///
/// Data goes to `<dest>.part` first and is renamed into place once complete, so a
/// cancelled or failed download never leaves a truncated artifact behind.
pub struct HttpDownloader {
    client: reqwest::Client,
    url: String,
    dest: PathBuf,
}

impl HttpDownloader {
    pub fn new(url: impl Into<String>, dest: impl Into<PathBuf>) -> Self {
        Self {
            client: reqwest::Client::new(),
            url: url.into(),
            dest: dest.into(),
        }
    }

    #[must_use]
    pub fn dest(&self) -> &Path {
        &self.dest
    }

    fn part_path(&self) -> PathBuf {
        let mut name = self.dest.file_name().unwrap_or_default().to_os_string();
        name.push(".part");
        self.dest.with_file_name(name)
    }

    async fn fetch(&self, cancel: &CancelToken, on_progress: &ProgressFn) -> anyhow::Result<bool> {
        if cancel.is_cancelled() {
            return Ok(false);
        }
        let sent = tokio::select! {
            sent = self.client.get(&self.url).send() => sent,
            () = cancel.cancelled() => return Ok(false),
        };
        let mut response = sent
            .with_context(|| format!("Failed to request {}", self.url))?
            .error_for_status()
            .with_context(|| format!("Server refused {}", self.url))?;

        let total = response.content_length().unwrap_or(0);
        let part = self.part_path();
        if let Some(parent) = part.parent() {
            fs::create_dir_all(parent).await?;
        }
        let mut file = fs::File::create(&part)
            .await
            .with_context(|| format!("Failed to create {}", part.display()))?;

        let started = Instant::now();
        let mut downloaded = 0u64;
        on_progress(0, total, None);

        loop {
            let chunk = tokio::select! {
                chunk = response.chunk() => chunk.context("Connection interrupted")?,
                () = cancel.cancelled() => return Ok(false),
            };
            let Some(chunk) = chunk else {
                break;
            };

            file.write_all(&chunk).await.context("Failed to write download")?;
            downloaded += chunk.len() as u64;
            let elapsed = started.elapsed().as_secs_f64();
            let rate = (elapsed > 0.0).then(|| downloaded as f64 / elapsed / (1024.0 * 1024.0));
            on_progress(downloaded, total, rate);
        }

        file.flush().await?;
        file.sync_all().await?;
        drop(file);

        fs::rename(&part, &self.dest)
            .await
            .with_context(|| format!("Failed to move download to {}", self.dest.display()))?;
        info!("Downloaded {downloaded} bytes to {}", self.dest.display());
        Ok(true)
    }
}

#[async_trait]
impl Downloader for HttpDownloader {
    async fn execute(&self, cancel: &CancelToken, on_progress: &ProgressFn) -> Result<(), UpdateError> {
        debug!("Downloading {} to {}", self.url, self.dest.display());
        let outcome = self.fetch(cancel, on_progress).await;

        if !matches!(outcome, Ok(true)) {
            let _ = fs::remove_file(self.part_path()).await;
        }
        match outcome {
            Ok(true) => Ok(()),
            Ok(false) => Err(UpdateError::Cancelled),
            Err(e) => Err(UpdateError::Download {
                message: format!("{e:#}"),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_part_path_sits_next_to_destination() {
        let downloader = HttpDownloader::new("https://example.invalid/app", "/tmp/updates/app.new");
        assert_eq!(downloader.part_path(), PathBuf::from("/tmp/updates/app.new.part"));
    }

    #[tokio::test]
    async fn test_unreachable_url_is_download_error() {
        let temp = tempfile::TempDir::new().unwrap();
        let dest = temp.path().join("app.new");
        let downloader = HttpDownloader::new("http://127.0.0.1:9/app", &dest);

        let err = downloader.execute(&CancelToken::new(), &|_, _, _| {}).await.unwrap_err();
        assert!(matches!(err, UpdateError::Download { .. }));
        assert!(!dest.exists());
    }

    #[tokio::test]
    async fn test_cancelled_before_start() {
        let temp = tempfile::TempDir::new().unwrap();
        let cancel = CancelToken::new();
        cancel.cancel();
        let downloader = HttpDownloader::new("http://127.0.0.1:9/app", temp.path().join("app.new"));
        let err = downloader.execute(&cancel, &|_, _, _| {}).await.unwrap_err();
        assert_eq!(err, UpdateError::Cancelled);
        assert!(!temp.path().join("app.new.part").exists());
    }
}
