//! Backups of the current version and the catalog of backups on disk.
//!
//! Every completed Backup phase leaves one file in the backup directory named
//!
//! ```text
//! backup_<version>_<YYYYMMDD>_<HHMMSS>[.<ext>]
//! ```
//!
//! Single-file targets are copied as-is (keeping the executable's extension, if any);
//! bundles are packed into a `.zip`. [`BackupCatalog`] parses these names back into
//! [`BackupInfo`] entries for manual restore; anything in the directory that does not
//! follow the pattern is skipped.

pub mod restore;

use crate::constants::{BACKUP_PREFIX, BACKUP_TIME_FORMAT};
use crate::core::UpdateError;
use crate::replace::archive;
use crate::request::{ArtifactKind, UpdateRequest, app_root};
use anyhow::{Context, Result};
use chrono::{DateTime, Local, NaiveDateTime, TimeZone};
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::{debug, info, warn};

pub use restore::restore_backup;

/// On-disk form of a backup, read from its file name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackupFormat {
    /// A verbatim copy of a single executable.
    Plain,
    /// A zip of a bundle directory, as written by the Backup phase.
    Zip,
    /// A tarball (`.tar`, `.tar.gz`, `.tgz`, ...). Listed, but not restorable here.
    Tar,
}

impl BackupFormat {
    #[must_use]
    pub fn of(file_name: &str) -> Self {
        let lower = file_name.to_ascii_lowercase();
        if lower.ends_with(".zip") {
            Self::Zip
        } else if lower.ends_with(".tar") || lower.ends_with(".tgz") || lower.contains(".tar.") {
            Self::Tar
        } else {
            Self::Plain
        }
    }

    /// Kind of target this backup can be restored over.
    #[must_use]
    pub const fn artifact_kind(self) -> ArtifactKind {
        match self {
            Self::Plain => ArtifactKind::SingleFile,
            Self::Zip | Self::Tar => ArtifactKind::Bundle,
        }
    }

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Plain => "plain",
            Self::Zip => "zip",
            Self::Tar => "tar",
        }
    }
}

/// A parsed backup file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackupInfo {
    pub path: PathBuf,
    pub file_name: String,
    /// Version token; empty when the backup was made without one.
    pub version: String,
    pub created_at: DateTime<Local>,
    pub size: u64,
    pub format: BackupFormat,
    /// Application path this backup restores to, when the catalog was opened for one.
    pub restores_to: Option<PathBuf>,
}

/// Build a backup file name.
///
/// Underscores in `version` would break parsing and are replaced with `-`.
#[must_use]
pub fn backup_file_name(version: &str, timestamp: &DateTime<Local>, extension: Option<&str>) -> String {
    let version = version.replace('_', "-");
    let mut name = format!("{BACKUP_PREFIX}{version}_{}", timestamp.format(BACKUP_TIME_FORMAT));
    if let Some(ext) = extension.filter(|ext| !ext.is_empty()) {
        name.push('.');
        name.push_str(ext.trim_start_matches('.'));
    }
    name
}

/// Parse a backup file name into `(version, created_at)`.
///
/// Returns `None` for names that are not backups.
#[must_use]
pub fn parse_backup_name(file_name: &str) -> Option<(String, DateTime<Local>)> {
    let stem = strip_extensions(file_name);
    let rest = stem.strip_prefix(BACKUP_PREFIX)?;

    let parts: Vec<&str> = rest.split('_').collect();
    if parts.len() < 3 {
        return None;
    }

    let version = parts[0].to_string();
    if version.is_empty() {
        debug!("Backup {file_name} has no version");
    }

    let time = format!("{}_{}", parts[parts.len() - 2], parts[parts.len() - 1]);
    let naive = NaiveDateTime::parse_from_str(&time, BACKUP_TIME_FORMAT).ok()?;
    let created_at = Local.from_local_datetime(&naive).earliest()?;
    Some((version, created_at))
}

/// Drop a trailing extension (and a `.tar` before it).
///
/// Only a suffix without `_` counts as an extension, so the dots of a version number in
/// an extension-less name stay put.
fn strip_extensions(file_name: &str) -> &str {
    let stem = match file_name.rsplit_once('.') {
        Some((stem, ext))
            if !ext.is_empty() && !ext.contains('_') && !ext.chars().all(|c| c.is_ascii_digit()) =>
        {
            stem
        }
        _ => file_name,
    };
    stem.strip_suffix(".tar").unwrap_or(stem)
}

/// Backups available in one directory.
#[derive(Debug, Clone)]
pub struct BackupCatalog {
    dir: PathBuf,
    app_path: Option<PathBuf>,
}

impl BackupCatalog {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            app_path: None,
        }
    }

    /// Attribute every listed backup to the application at `app_path`.
    ///
    /// Bundle backups restore to the enclosing `.app` directory, plain ones to the
    /// executable itself.
    #[must_use]
    pub fn with_app(mut self, app_path: impl Into<PathBuf>) -> Self {
        self.app_path = Some(app_path.into());
        self
    }

    fn restore_target(&self, format: BackupFormat) -> Option<PathBuf> {
        let app_path = self.app_path.as_deref()?;
        Some(match format.artifact_kind() {
            ArtifactKind::SingleFile => app_path.to_path_buf(),
            ArtifactKind::Bundle => app_root(app_path),
        })
    }

    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// All backups, newest first. A missing directory is an empty catalog.
    pub async fn list(&self) -> Result<Vec<BackupInfo>> {
        if !self.dir.exists() {
            return Ok(Vec::new());
        }

        let mut entries = fs::read_dir(&self.dir)
            .await
            .with_context(|| format!("Failed to read backup directory {}", self.dir.display()))?;
        let mut backups = Vec::new();

        while let Some(entry) = entries.next_entry().await? {
            let file_name = entry.file_name().to_string_lossy().into_owned();
            let Some((version, created_at)) = parse_backup_name(&file_name) else {
                debug!("Skipping non-backup entry {file_name}");
                continue;
            };
            let size = entry.metadata().await.map(|m| m.len()).unwrap_or(0);
            let format = BackupFormat::of(&file_name);
            backups.push(BackupInfo {
                path: entry.path(),
                restores_to: self.restore_target(format),
                file_name,
                version,
                created_at,
                size,
                format,
            });
        }

        backups.sort_by(|a, b| b.created_at.cmp(&a.created_at).then_with(|| b.file_name.cmp(&a.file_name)));
        Ok(backups)
    }

    pub async fn latest(&self) -> Result<Option<BackupInfo>> {
        Ok(self.list().await?.into_iter().next())
    }

    /// Look a backup up by file name.
    pub async fn find(&self, file_name: &str) -> Result<Option<BackupInfo>> {
        Ok(self.list().await?.into_iter().find(|b| b.file_name == file_name))
    }
}

/// Path the Backup phase writes to for this request.
#[must_use]
pub fn backup_path_for(request: &UpdateRequest, now: &DateTime<Local>) -> PathBuf {
    if let Some(path) = request.backup_file() {
        return path.to_path_buf();
    }

    let extension = match request.artifact_kind() {
        ArtifactKind::Bundle => Some("zip".to_string()),
        ArtifactKind::SingleFile => {
            request.app_path().extension().map(|ext| ext.to_string_lossy().into_owned())
        }
    };
    request
        .backup_dir()
        .join(backup_file_name(request.version().unwrap_or_default(), now, extension.as_deref()))
}

/// Copy the current version to `backup`, unless that file already exists.
pub async fn create_backup(
    request: &UpdateRequest,
    backup: &Path,
) -> Result<(), UpdateError> {
    let to_error = |e: anyhow::Error| UpdateError::Backup {
        path: backup.display().to_string(),
        reason: format!("{e:#}"),
    };

    if backup.exists() {
        info!("Backup {} already exists, keeping it", backup.display());
        return Ok(());
    }
    if let Some(parent) = backup.parent() {
        fs::create_dir_all(parent)
            .await
            .with_context(|| format!("Failed to create backup directory {}", parent.display()))
            .map_err(to_error)?;
    }

    info!("Creating backup at {}", backup.display());
    let result = match request.artifact_kind() {
        ArtifactKind::SingleFile => copy_file_backup(request.app_path(), backup).await,
        ArtifactKind::Bundle => archive::pack_dir(request.install_target(), backup).await,
    };

    if let Err(e) = result {
        warn!("Backup failed, removing partial file {}", backup.display());
        let _ = fs::remove_file(backup).await;
        return Err(to_error(e));
    }
    Ok(())
}

async fn copy_file_backup(original: &Path, backup: &Path) -> Result<()> {
    fs::copy(original, backup).await.context("Failed to create backup")?;

    #[cfg(unix)]
    {
        let permissions = fs::metadata(original)
            .await
            .context("Failed to read original file metadata")?
            .permissions();
        fs::set_permissions(backup, permissions)
            .await
            .context("Failed to set backup permissions")?;
    }
    Ok(())
}
