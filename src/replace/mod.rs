//! File replacement and rollback.
//!
//! [`Replacer`] performs the mutating steps of an install: swapping a single file or a
//! whole bundle, restoring a backup over a target, and checking that the result is
//! usable. [`with_rollback`] wraps any mutating step so that a failure triggers exactly
//! one restore from the backup, and [`replace_with_rollback`] is the complete
//! replace-then-verify primitive built on it.
//!
//! # Failure window
//!
//! Replacing a single file is delete-then-copy, so there is a short window in which the
//! target does not exist. The delete is retried because the previous instance may still
//! hold the file for a moment after it exits.

pub mod archive;
pub mod checksum;

use crate::config::{BundleConfig, RetryPolicy, UpdaterConfig};
use crate::core::UpdateError;
use crate::request::ArtifactKind;
use anyhow::{Context, Result, anyhow, bail};
use std::future::Future;
use std::path::Path;
use thiserror::Error;
use tokio::fs;
use tracing::{debug, info, warn};

/// Outcome of a failed step that was followed by a restore attempt.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ReplaceError {
    #[error("{cause} (previous version restored)")]
    RolledBack {
        cause: String,
    },

    #[error("{cause} (restore failed: {restore})")]
    Unrecoverable {
        cause: String,
        restore: String,
    },
}

impl ReplaceError {
    /// Classify as an Install-phase failure.
    #[must_use]
    pub fn into_install_error(self) -> UpdateError {
        match self {
            Self::RolledBack {
                cause,
            } => UpdateError::InstallFailedRolledBack {
                cause,
            },
            Self::Unrecoverable {
                cause,
                restore,
            } => UpdateError::InstallFailedUnrecoverable {
                cause,
                restore,
            },
        }
    }

    /// Classify as a Verify-phase failure.
    #[must_use]
    pub fn into_verify_error(self) -> UpdateError {
        match self {
            Self::RolledBack {
                cause,
            } => UpdateError::VerifyFailedRolledBack {
                cause,
            },
            Self::Unrecoverable {
                cause,
                restore,
            } => UpdateError::VerifyFailedUnrecoverable {
                cause,
                restore,
            },
        }
    }
}

/// Performs target mutations with the configured retry and permission policy.
#[derive(Debug, Clone)]
pub struct Replacer {
    retry: RetryPolicy,
    bundle: BundleConfig,
}

impl Replacer {
    #[must_use]
    pub fn new(config: &UpdaterConfig) -> Self {
        Self {
            retry: config.retry.clone(),
            bundle: config.bundle.clone(),
        }
    }

    /// Put `new_content` in place of `target`.
    pub async fn replace(&self, target: &Path, new_content: &Path, kind: ArtifactKind) -> Result<()> {
        match kind {
            ArtifactKind::SingleFile => self.replace_file(target, new_content).await,
            ArtifactKind::Bundle => self.replace_bundle(target, new_content).await,
        }
    }

    async fn replace_file(&self, target: &Path, new_content: &Path) -> Result<()> {
        if target.exists() {
            relax_permissions(target).await;
            self.remove_with_retry(target).await?;
        }

        debug!("Copying {} to {}", new_content.display(), target.display());
        fs::copy(new_content, target).await.with_context(|| {
            format!("Failed to copy {} to {}", new_content.display(), target.display())
        })?;
        self.apply_file_mode(target).await
    }

    async fn replace_bundle(&self, target: &Path, new_content: &Path) -> Result<()> {
        if target.exists() {
            debug!("Removing bundle {}", target.display());
            fs::remove_dir_all(target)
                .await
                .with_context(|| format!("Failed to remove {}", target.display()))?;
        }

        if archive::is_archive(new_content) {
            archive::unpack(new_content, target).await?;
        } else if new_content.is_dir() {
            archive::copy_tree(new_content, target).await?;
        } else {
            bail!("Bundle artifact must be a directory or a zip archive: {}", new_content.display());
        }

        self.reset_bundle_permissions(target).await
    }

    /// Delete `target`, retrying while the file is still locked.
    pub async fn remove_with_retry(&self, target: &Path) -> Result<()> {
        let attempts = self.retry.delete_attempts.max(1);
        let mut last_error = None;

        for attempt in 1..=attempts {
            match fs::remove_file(target).await {
                Ok(()) => return Ok(()),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
                Err(e) => {
                    warn!(
                        "Delete attempt {attempt}/{attempts} for {} failed: {e}",
                        target.display()
                    );
                    last_error = Some(e);
                    if attempt < attempts {
                        tokio::time::sleep(self.retry.delete_interval()).await;
                    }
                }
            }
        }

        Err(anyhow!(
            "Failed to delete {} after {attempts} attempts: {}",
            target.display(),
            last_error.map(|e| e.to_string()).unwrap_or_default()
        ))
    }

    /// Copy a backup back over `target`.
    pub async fn restore(&self, backup: &Path, target: &Path, kind: ArtifactKind) -> Result<()> {
        if !backup.exists() {
            bail!("No backup found at {}", backup.display());
        }
        warn!("Restoring {} from {}", target.display(), backup.display());

        match kind {
            ArtifactKind::SingleFile => {
                if target.exists() {
                    relax_permissions(target).await;
                    self.remove_with_retry(target).await?;
                }
                fs::copy(backup, target)
                    .await
                    .with_context(|| format!("Failed to restore backup to {}", target.display()))?;

                #[cfg(unix)]
                {
                    let permissions = fs::metadata(backup)
                        .await
                        .context("Failed to read backup metadata")?
                        .permissions();
                    fs::set_permissions(target, permissions)
                        .await
                        .context("Failed to restore permissions")?;
                }
            }
            ArtifactKind::Bundle => {
                if target.exists() {
                    fs::remove_dir_all(target)
                        .await
                        .with_context(|| format!("Failed to remove {}", target.display()))?;
                }
                if archive::is_archive(backup) {
                    archive::unpack(backup, target).await?;
                } else {
                    archive::copy_tree(backup, target).await?;
                }
                self.reset_bundle_permissions(target).await?;
            }
        }

        info!("Restored {}", target.display());
        Ok(())
    }

    /// Confirm the installed artifact is present and usable.
    ///
    /// Single files must be non-empty; when `expected_checksum` is given their SHA-256
    /// must match it too.
    pub async fn verify(
        &self,
        target: &Path,
        kind: ArtifactKind,
        expected_checksum: Option<&str>,
    ) -> Result<()> {
        let metadata = fs::metadata(target)
            .await
            .with_context(|| format!("Installed artifact is missing: {}", target.display()))?;

        match kind {
            ArtifactKind::SingleFile => {
                if !metadata.is_file() || metadata.len() == 0 {
                    bail!("Installed file is empty: {}", target.display());
                }
                if let Some(expected) = expected_checksum {
                    checksum::verify_checksum(target, expected).await?;
                }
            }
            ArtifactKind::Bundle => {
                if !metadata.is_dir() {
                    bail!("Installed bundle is not a directory: {}", target.display());
                }
            }
        }
        Ok(())
    }

    async fn apply_file_mode(&self, target: &Path) -> Result<()> {
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(target, std::fs::Permissions::from_mode(self.bundle.mode))
                .await
                .with_context(|| format!("Failed to set permissions on {}", target.display()))?;
        }
        #[cfg(not(unix))]
        let _ = target;
        Ok(())
    }

    async fn reset_bundle_permissions(&self, root: &Path) -> Result<()> {
        archive::set_mode_recursive(root, self.bundle.mode).await?;
        self.reset_ownership(root).await
    }

    /// Hand a bundle installed by root back to the invoking user.
    #[cfg(unix)]
    async fn reset_ownership(&self, root: &Path) -> Result<()> {
        // SAFETY: geteuid has no preconditions and cannot fail.
        if unsafe { libc::geteuid() } != 0 {
            return Ok(());
        }
        let Some(user) = invoking_user() else {
            debug!("No invoking user known, leaving ownership of {} unchanged", root.display());
            return Ok(());
        };
        let owner = match &self.bundle.owner_group {
            Some(group) => format!("{user}:{group}"),
            None => user,
        };

        let status = tokio::process::Command::new("chown")
            .arg("-R")
            .arg(&owner)
            .arg(root)
            .status()
            .await
            .context("Failed to run chown")?;
        if !status.success() {
            bail!("chown -R {owner} {} exited with {status}", root.display());
        }
        Ok(())
    }

    #[cfg(not(unix))]
    async fn reset_ownership(&self, _root: &Path) -> Result<()> {
        Ok(())
    }
}

/// User that requested elevation, as reported by `sudo`, `pkexec` or the login shell.
#[cfg(unix)]
fn invoking_user() -> Option<String> {
    ["SUDO_UID", "PKEXEC_UID"]
        .into_iter()
        .find_map(|var| std::env::var(var).ok())
        .or_else(|| std::env::var("USER").ok().filter(|user| user != "root"))
        .filter(|user| !user.is_empty())
}

/// Make a target writable before deleting it. Failures are logged only; the delete
/// that follows reports the real error.
async fn relax_permissions(target: &Path) {
    let Ok(metadata) = fs::metadata(target).await else {
        return;
    };
    let mut permissions = metadata.permissions();

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        permissions.set_mode(0o666);
    }
    #[cfg(not(unix))]
    #[allow(clippy::permissions_set_readonly_false)]
    permissions.set_readonly(false);

    if let Err(e) = fs::set_permissions(target, permissions).await {
        debug!("Could not relax permissions on {}: {e}", target.display());
    }
}

/// Run a mutating step; on failure restore `backup` over `target` exactly once.
pub async fn with_rollback<F>(
    replacer: &Replacer,
    target: &Path,
    backup: &Path,
    kind: ArtifactKind,
    step: F,
) -> Result<(), ReplaceError>
where
    F: Future<Output = Result<()>>,
{
    let Err(cause) = step.await else {
        return Ok(());
    };
    let cause = format!("{cause:#}");
    warn!("Step on {} failed, rolling back: {cause}", target.display());

    match replacer.restore(backup, target, kind).await {
        Ok(()) => Err(ReplaceError::RolledBack {
            cause,
        }),
        Err(restore) => Err(ReplaceError::Unrecoverable {
            cause,
            restore: format!("{restore:#}"),
        }),
    }
}

/// Replace `target` with `new_content` and verify it, restoring `backup` on failure.
pub async fn replace_with_rollback(
    replacer: &Replacer,
    target: &Path,
    new_content: &Path,
    backup: &Path,
    kind: ArtifactKind,
) -> Result<(), ReplaceError> {
    with_rollback(replacer, target, backup, kind, async {
        replacer.replace(target, new_content, kind).await?;
        replacer.verify(target, kind, None).await
    })
    .await
}
