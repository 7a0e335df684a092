//! Shared helpers for the integration tests.
//!
//! [`TestApp`] lays out a throwaway installation: an "installed" executable, a new
//! version next to it, and backup and update directories, all under one `TempDir`.

#![allow(dead_code)]

use anyhow::Result;
use assert_cmd::Command;
use std::path::{Path, PathBuf};
use tempfile::TempDir;

/// Configuration with every wait shrunk so CLI runs finish quickly.
pub const FAST_CONFIG: &str = r#"
[retry]
delete_attempts = 3
delete_interval_ms = 5

[process]
deadline_ms = 200
poll_interval_ms = 10
confirm_delay_ms = 1
grace_period_ms = 1

[helper]
watchdog_interval_ms = 50

[ui]
grace_ms = 0
"#;

/// A temporary installation of one application.
pub struct TestApp {
    pub temp_dir: TempDir,
    pub app: PathBuf,
    pub artifact: PathBuf,
    pub backup_dir: PathBuf,
    pub update_dir: PathBuf,
    pub config: PathBuf,
}

impl TestApp {
    /// An installed single executable. The name is unique per test so the real process
    /// table never matches it.
    pub fn single_file(old: &str, new: &str) -> Result<Self> {
        let temp_dir = TempDir::new()?;
        let name = format!("hu-app-{}", uuid_suffix());
        let app = temp_dir.path().join("bin").join(&name);
        std::fs::create_dir_all(app.parent().unwrap_or(temp_dir.path()))?;
        std::fs::write(&app, old)?;

        let artifact = temp_dir.path().join("downloads").join(format!("{name}.new"));
        std::fs::create_dir_all(artifact.parent().unwrap_or(temp_dir.path()))?;
        std::fs::write(&artifact, new)?;

        let config = temp_dir.path().join("config.toml");
        std::fs::write(&config, FAST_CONFIG)?;

        Ok(Self {
            backup_dir: temp_dir.path().join("backups"),
            update_dir: temp_dir.path().join("update"),
            app,
            artifact,
            config,
            temp_dir,
        })
    }

    pub fn path(&self) -> &Path {
        self.temp_dir.path()
    }

    pub fn read_app(&self) -> String {
        std::fs::read_to_string(&self.app).unwrap_or_default()
    }

    /// `hotupdater` with the fast config and no progress bar.
    pub fn command(&self) -> Command {
        let mut cmd = Command::cargo_bin("hotupdater").expect("hotupdater binary");
        cmd.arg("--config")
            .arg(&self.config)
            .arg("--no-progress")
            .env_remove("RUST_LOG");
        cmd
    }

    /// `hotupdater run` for this installation.
    pub fn run_command(&self, version: &str) -> Command {
        let mut cmd = self.command();
        cmd.arg("run")
            .arg("--app")
            .arg(&self.app)
            .arg("--artifact")
            .arg(&self.artifact)
            .arg("--backup-dir")
            .arg(&self.backup_dir)
            .arg("--update-dir")
            .arg(&self.update_dir)
            .arg("--new-version")
            .arg(version);
        cmd
    }

    /// Files in the backup directory, sorted by name.
    pub fn backup_names(&self) -> Vec<String> {
        let Ok(entries) = std::fs::read_dir(&self.backup_dir) else {
            return Vec::new();
        };
        let mut names: Vec<String> = entries
            .filter_map(|entry| entry.ok())
            .map(|entry| entry.file_name().to_string_lossy().into_owned())
            .collect();
        names.sort();
        names
    }
}

fn uuid_suffix() -> String {
    let id = uuid::Uuid::new_v4().simple().to_string();
    id[..8].to_string()
}
