//! `hotupdater run`: update an application in place.

use super::lock::UpdateLock;
use super::render::ProgressRenderer;
use crate::config::UpdaterConfig;
use crate::constants::UPDATE_LOCK_TIMEOUT;
use crate::core::CancelToken;
use crate::download::HttpDownloader;
use crate::events::EventSink;
use crate::helper::HelperLauncher;
use crate::install::CommandInstallStep;
use crate::orchestrator::UpdateOrchestrator;
use crate::platform::{self, Platform, Privilege, SystemPlatform};
use crate::request::UpdateRequest;
use anyhow::{Context, Result};
use clap::Args;
use colored::Colorize;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, warn};

/// Replace an installed application with a new version.
#[derive(Args, Debug, Clone)]
pub struct RunCommand {
    /// Installed executable, or any path inside a macOS `.app` bundle.
    #[arg(long)]
    pub app: PathBuf,

    /// New-version artifact: an executable, a `.zip` of a bundle, or a bundle directory.
    ///
    /// With `--url` this is where the download is written.
    #[arg(long)]
    pub artifact: PathBuf,

    /// Download the artifact from this URL first.
    #[arg(long)]
    pub url: Option<String>,

    /// Version being installed, used in the backup name.
    #[arg(long = "new-version", value_name = "VERSION")]
    pub new_version: Option<String>,

    /// Directory that receives backups of the current version.
    #[arg(long)]
    pub backup_dir: Option<PathBuf>,

    /// Scratch directory for the request file, channel and lock.
    #[arg(long)]
    pub update_dir: Option<PathBuf>,

    /// Reuse this backup file instead of creating a new timestamped one.
    #[arg(long)]
    pub backup_file: Option<PathBuf>,

    /// Install with this program instead of the built-in file swap.
    #[arg(long)]
    pub script: Option<PathBuf>,

    /// Run the mutating phases in a helper with administrator rights.
    #[arg(long)]
    pub elevate: bool,

    /// Do not wait for the running application to exit.
    #[arg(long)]
    pub no_wait: bool,

    /// Start the application again after a successful update.
    #[arg(long)]
    pub restart: bool,
}

impl RunCommand {
    pub async fn execute(
        self,
        config_path: Option<String>,
        no_progress: bool,
        quiet: bool,
    ) -> Result<()> {
        let config = UpdaterConfig::load_with_optional(config_path.as_deref()).await?;
        let update_dir = self.update_dir.clone().unwrap_or_else(default_update_dir);
        let backup_dir = match self.backup_dir.clone() {
            Some(dir) => dir,
            None => default_backup_dir()?,
        };

        let _lock = UpdateLock::acquire(&update_dir, UPDATE_LOCK_TIMEOUT).await?;

        let mut request = UpdateRequest::new(&self.app, &self.artifact, &backup_dir, &update_dir);
        if let Some(version) = &self.new_version {
            request = request.with_version(version);
        }
        if let Some(backup_file) = &self.backup_file {
            request = request.with_backup_file(backup_file);
        }
        if let Some(script) = &self.script {
            request = request.with_script(script);
        }
        request = request.with_process_wait(!self.no_wait);

        let platform: Arc<dyn Platform> = Arc::new(SystemPlatform::new(&config));
        let renderer = Arc::new(ProgressRenderer::new(no_progress, quiet));
        let mut orchestrator = UpdateOrchestrator::new(config.clone(), platform.clone())
            .with_sink(renderer.clone() as Arc<dyn EventSink>)
            .wait_for_process(!self.no_wait);

        if let Some(url) = &self.url {
            orchestrator = orchestrator.with_downloader(Arc::new(HttpDownloader::new(url, &self.artifact)));
        }
        if let Some(script) = &self.script {
            orchestrator = orchestrator.with_install_step(Arc::new(CommandInstallStep::new(script)));
        }
        if self.elevate {
            if platform.detect_privilege() == Privilege::Elevated {
                debug!("Already elevated, running in-process");
            } else {
                let executable = std::env::current_exe().context("Failed to locate the updater executable")?;
                let launcher = HelperLauncher::new(platform.clone(), config.helper.clone(), executable)
                    .with_config_file(config_path.map(PathBuf::from));
                orchestrator = orchestrator.with_elevation(launcher);
            }
        }

        let cancel = CancelToken::new();
        let interrupt = cancel.clone();
        let ctrl_c = tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("Interrupted, stopping the update");
                interrupt.cancel();
            }
        });

        let outcome = orchestrator.run(&request, &cancel).await;
        ctrl_c.abort();
        renderer.finish();
        let report = outcome?;

        if !quiet {
            println!(
                "{} Updated {}",
                "✓".green(),
                report.target.display().to_string().bold()
            );
            if let Some(backup) = &report.backup_path {
                println!("  backup: {}", backup.display());
            }
        }

        if self.restart {
            platform::relaunch(platform.as_ref(), &request).await?;
        }
        Ok(())
    }
}

fn default_update_dir() -> PathBuf {
    std::env::temp_dir().join("hotupdater")
}

pub(super) fn default_backup_dir() -> Result<PathBuf> {
    let base = dirs::data_local_dir().context("Unable to determine local data directory")?;
    Ok(base.join("hotupdater").join("backups"))
}
