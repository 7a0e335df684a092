//! `hotupdater backups`: inspect and restore backups.

use super::run::default_backup_dir;
use crate::backup::{BackupCatalog, BackupInfo, restore_backup};
use crate::config::UpdaterConfig;
use crate::platform::SystemPlatform;
use crate::process::ProcessMonitor;
use crate::replace::Replacer;
use crate::request::ArtifactKind;
use anyhow::{Result, anyhow, bail};
use clap::{Args, Subcommand};
use colored::Colorize;
use std::path::PathBuf;
use std::sync::Arc;

#[derive(Args, Debug, Clone)]
pub struct BackupsCommand {
    #[command(subcommand)]
    command: BackupsSubcommand,
}

#[derive(Subcommand, Debug, Clone)]
enum BackupsSubcommand {
    /// List backups, newest first.
    List {
        #[arg(long)]
        backup_dir: Option<PathBuf>,

        /// Show where each backup would be restored for this application.
        #[arg(long)]
        app: Option<PathBuf>,

        /// Print JSON instead of a table.
        #[arg(long)]
        json: bool,
    },

    /// Put a backup back in place of the installed application.
    Restore {
        /// Installed executable, or any path inside a macOS `.app` bundle.
        #[arg(long)]
        app: PathBuf,

        #[arg(long)]
        backup_dir: Option<PathBuf>,

        /// Backup file name as shown by `backups list`.
        #[arg(conflicts_with = "latest")]
        name: Option<String>,

        /// Restore the newest backup.
        #[arg(long)]
        latest: bool,
    },
}

impl BackupsCommand {
    pub async fn execute(self, config_path: Option<String>, quiet: bool) -> Result<()> {
        match self.command {
            BackupsSubcommand::List {
                backup_dir,
                app,
                json,
            } => {
                let mut catalog = BackupCatalog::new(resolve_dir(backup_dir)?);
                if let Some(app) = app {
                    catalog = catalog.with_app(app);
                }
                let backups = catalog.list().await?;
                if json {
                    println!("{}", serde_json::to_string_pretty(&to_json(&backups))?);
                } else {
                    print_table(&catalog, &backups);
                }
                Ok(())
            }
            BackupsSubcommand::Restore {
                app,
                backup_dir,
                name,
                latest,
            } => {
                let config = UpdaterConfig::load_with_optional(config_path.as_deref()).await?;
                let catalog = BackupCatalog::new(resolve_dir(backup_dir)?).with_app(&app);
                let backup = match (name, latest) {
                    (Some(name), _) => catalog
                        .find(&name)
                        .await?
                        .ok_or_else(|| anyhow!("No backup named {name} in {}", catalog.dir().display()))?,
                    (None, true) => catalog
                        .latest()
                        .await?
                        .ok_or_else(|| anyhow!("No backups in {}", catalog.dir().display()))?,
                    (None, false) => bail!("Name a backup to restore, or pass --latest"),
                };

                let platform = Arc::new(SystemPlatform::new(&config));
                let monitor = ProcessMonitor::new(platform, config.process.clone());
                let replacer = Replacer::new(&config);
                let kind = ArtifactKind::detect(&app);
                restore_backup(&monitor, &replacer, &app, kind, &backup).await?;

                if !quiet {
                    println!("{} Restored {} from {}", "✓".green(), app.display(), backup.file_name.bold());
                }
                Ok(())
            }
        }
    }
}

fn resolve_dir(dir: Option<PathBuf>) -> Result<PathBuf> {
    match dir {
        Some(dir) => Ok(dir),
        None => default_backup_dir(),
    }
}

fn to_json(backups: &[BackupInfo]) -> serde_json::Value {
    backups
        .iter()
        .map(|b| {
            serde_json::json!({
                "file_name": b.file_name,
                "path": b.path,
                "version": b.version,
                "created_at": b.created_at.to_rfc3339(),
                "size": b.size,
                "format": b.format.as_str(),
                "restores_to": b.restores_to,
            })
        })
        .collect()
}

fn print_table(catalog: &BackupCatalog, backups: &[BackupInfo]) {
    if backups.is_empty() {
        println!("No backups in {}", catalog.dir().display());
        return;
    }
    println!("{}", format!("Backups in {}", catalog.dir().display()).bold());
    for backup in backups {
        let version = if backup.version.is_empty() { "-" } else { backup.version.as_str() };
        println!(
            "  {:<12} {}  {:>10}  {}",
            version.cyan(),
            backup.created_at.format("%Y-%m-%d %H:%M:%S"),
            format_size(backup.size),
            backup.file_name.dimmed()
        );
    }
}

fn format_size(bytes: u64) -> String {
    const UNITS: [&str; 4] = ["B", "KB", "MB", "GB"];
    let mut size = bytes as f64;
    let mut unit = 0;
    while size >= 1024.0 && unit < UNITS.len() - 1 {
        size /= 1024.0;
        unit += 1;
    }
    if unit == 0 { format!("{bytes} B") } else { format!("{size:.1} {}", UNITS[unit]) }
}
