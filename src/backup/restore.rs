//! Manual restore of a catalogued backup.

use super::{BackupFormat, BackupInfo};
use crate::core::UpdateError;
use crate::process::ProcessMonitor;
use crate::replace::{Replacer, archive, replace_with_rollback};
use crate::request::{ArtifactKind, app_root};
use chrono::Local;
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::{info, warn};

/// Put `backup` back in place of the application at `app_path`.
///
/// Refuses while the application is running, and refuses backups whose form does not
/// fit the target: a plain copy cannot replace a bundle, an archive cannot replace an
/// executable, and tarballs are not unpacked at all. The current installation is first
/// copied aside as a safety copy, which serves as the rollback source if the restore
/// fails and is removed once the restore succeeds.
pub async fn restore_backup(
    monitor: &ProcessMonitor,
    replacer: &Replacer,
    app_path: &Path,
    kind: ArtifactKind,
    backup: &BackupInfo,
) -> Result<(), UpdateError> {
    check_format(backup, kind)?;

    if let Some(name) = app_path.file_name().map(|n| n.to_string_lossy().into_owned()) {
        if monitor.is_process_running(&name).await? {
            return Err(UpdateError::validation(format!(
                "{name} is running; close it before restoring a backup"
            )));
        }
    }

    let target = match kind {
        ArtifactKind::SingleFile => app_path.to_path_buf(),
        ArtifactKind::Bundle => app_root(app_path),
    };
    let safety = safety_copy(&target, &backup.path, kind).await?;

    info!("Restoring {} from {}", target.display(), backup.file_name);
    let result = replace_with_rollback(replacer, &target, &backup.path, &safety, kind).await;

    match result {
        Ok(()) => {
            let _ = remove_path(&safety).await;
            info!("Restored version {} to {}", display_version(&backup.version), target.display());
            Ok(())
        }
        Err(e) => {
            warn!("Restore failed; safety copy kept at {}", safety.display());
            Err(e.into_install_error())
        }
    }
}

fn check_format(backup: &BackupInfo, kind: ArtifactKind) -> Result<(), UpdateError> {
    if backup.format == BackupFormat::Tar {
        return Err(UpdateError::validation(format!(
            "{} is a tar archive; extract it by hand",
            backup.file_name
        )));
    }
    if backup.format.artifact_kind() != kind {
        let (have, want) = match kind {
            ArtifactKind::SingleFile => ("an archive", "a single executable"),
            ArtifactKind::Bundle => ("a single file", "an application bundle"),
        };
        return Err(UpdateError::validation(format!(
            "{} is {have} and cannot replace {want}",
            backup.file_name
        )));
    }
    Ok(())
}

async fn safety_copy(target: &Path, backup: &Path, kind: ArtifactKind) -> Result<PathBuf, UpdateError> {
    let dir = backup.parent().unwrap_or(Path::new("."));
    let stamp = Local::now().format("%Y%m%d_%H%M%S");
    let to_error = |e: anyhow::Error, path: &Path| UpdateError::Backup {
        path: path.display().to_string(),
        reason: format!("{e:#}"),
    };

    match kind {
        ArtifactKind::SingleFile => {
            let path = dir.join(format!(".pre-restore_{stamp}"));
            fs::copy(target, &path)
                .await
                .map_err(|e| to_error(e.into(), &path))?;
            Ok(path)
        }
        ArtifactKind::Bundle => {
            let path = dir.join(format!(".pre-restore_{stamp}.zip"));
            archive::pack_dir(target, &path).await.map_err(|e| to_error(e, &path))?;
            Ok(path)
        }
    }
}

async fn remove_path(path: &Path) -> std::io::Result<()> {
    if path.is_dir() { fs::remove_dir_all(path).await } else { fs::remove_file(path).await }
}

fn display_version(version: &str) -> &str {
    if version.is_empty() { "(unversioned)" } else { version }
}
