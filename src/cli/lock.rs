//! Single-instance lock for update runs.
//!
//! Two updaters working on the same update directory would overwrite each other's
//! request file and channel. The CLI holds an exclusive OS file lock on
//! `<update dir>/.update.lock` for the whole run.

use crate::constants::{MAX_BACKOFF_DELAY_MS, STARTING_BACKOFF_DELAY_MS, UPDATE_LOCK_FILE};
use anyhow::{Context, Result, anyhow};
use fs4::fs_std::FileExt;
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_retry::strategy::ExponentialBackoff;
use tracing::debug;

/// Exclusive lock on an update directory, released on drop.
#[derive(Debug)]
pub struct UpdateLock {
    file: Arc<File>,
    path: PathBuf,
}

impl UpdateLock {
    /// Acquire the lock, waiting up to `timeout` with exponential backoff.
    pub async fn acquire(update_dir: &Path, timeout: Duration) -> Result<Self> {
        tokio::fs::create_dir_all(update_dir)
            .await
            .with_context(|| format!("Failed to create update directory {}", update_dir.display()))?;

        let path = update_dir.join(UPDATE_LOCK_FILE);
        let open_path = path.clone();
        let file = tokio::task::spawn_blocking(move || {
            OpenOptions::new().create(true).write(true).truncate(false).open(&open_path)
        })
        .await
        .context("spawn_blocking panicked")?
        .with_context(|| format!("Failed to open lock file {}", path.display()))?;
        let file = Arc::new(file);

        let start = Instant::now();
        for delay in retry_delays() {
            let candidate = Arc::clone(&file);
            let locked = tokio::task::spawn_blocking(move || candidate.try_lock_exclusive())
                .await
                .context("spawn_blocking panicked")?;

            if matches!(locked, Ok(true)) {
                debug!(wait_ms = start.elapsed().as_millis(), "Update lock acquired");
                return Ok(Self {
                    file,
                    path,
                });
            }

            let remaining = timeout.saturating_sub(start.elapsed());
            if remaining.is_zero() {
                break;
            }
            tokio::time::sleep(delay.min(remaining)).await;
        }

        Err(anyhow!(
            "Another update is already running in {} (waited {timeout:?})",
            update_dir.display()
        ))
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

fn retry_delays() -> impl Iterator<Item = Duration> {
    ExponentialBackoff::from_millis(STARTING_BACKOFF_DELAY_MS).max_delay(Duration::from_millis(MAX_BACKOFF_DELAY_MS))
}

impl Drop for UpdateLock {
    fn drop(&mut self) {
        #[allow(unstable_name_collisions)]
        if let Err(e) = self.file.unlock() {
            debug!("Failed to unlock {}: {e}", self.path.display());
        }
    }
}
