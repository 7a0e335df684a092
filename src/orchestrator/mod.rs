//! The update state machine.
//!
//! ```text
//! Download -> PreCheck -> Backup -> Install -> Verify -> Complete
//!                            |          |         |
//!                            |          +---------+--> Rollback
//!                            +--> (terminal, nothing to undo)
//! ```
//!
//! [`UpdateOrchestrator::run`] drives one update attempt and reports every phase
//! transition through the configured [`EventSink`]. Download runs in the calling
//! process when a [`Downloader`] is attached. The remaining phases run either in-process
//! or, when a [`HelperLauncher`] is attached, inside the elevated helper, which runs
//! [`UpdateOrchestrator::run_local`] on its side and streams progress back.
//!
//! Failures are mapped to exactly one [`UpdateError`] kind:
//!
//! | Phase | Error | Target state |
//! |-------|-------|--------------|
//! | Download | `Download` | untouched |
//! | PreCheck | `Validation`, `ProcessTermination` | untouched |
//! | Backup | `Backup` | untouched |
//! | Install | `InstallFailedRolledBack` / `InstallFailedUnrecoverable` | old version / unknown |
//! | Verify | `VerifyFailedRolledBack` / `VerifyFailedUnrecoverable` | old version / unknown |
//!
//! Cancellation is checked before each phase up to Install. Once Install has started the
//! run goes on to Verify so the target is never left unverified.


use crate::backup::{backup_path_for, create_backup};
use crate::config::UpdaterConfig;
use crate::constants::PROGRESS_PREFIX;
use crate::core::{CancelToken, UpdateError};
use crate::download::Downloader;
use crate::events::{EventSink, ProgressEmitter, TracingSink};
use crate::helper::HelperLauncher;
use crate::install::{self, InstallStep};
use crate::platform::Platform;
use crate::process::ProcessMonitor;
use crate::progress::{UpdatePhase, parse_progress_with};
use crate::replace::{ReplaceError, Replacer, checksum, with_rollback};
use crate::request::UpdateRequest;
use chrono::Local;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};

/// Summary of a successful run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpdateReport {
    /// Path that now holds the new version.
    pub target: PathBuf,
    /// Backup of the previous version, when known.
    pub backup_path: Option<PathBuf>,
    /// Whether the mutating phases ran in the elevated helper.
    pub elevated: bool,
}

/// Drives update runs.
pub struct UpdateOrchestrator {
    config: UpdaterConfig,
    sink: Arc<dyn EventSink>,
    platform: Arc<dyn Platform>,
    install_step: Option<Arc<dyn InstallStep>>,
    downloader: Option<Arc<dyn Downloader>>,
    launcher: Option<HelperLauncher>,
    wait_for_process: bool,
}

impl UpdateOrchestrator {
    pub fn new(config: UpdaterConfig, platform: Arc<dyn Platform>) -> Self {
        Self {
            config,
            sink: Arc::new(TracingSink),
            platform,
            install_step: None,
            downloader: None,
            launcher: None,
            wait_for_process: true,
        }
    }

    #[must_use]
    pub fn with_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.sink = sink;
        self
    }

    /// Use this step for Install instead of the one derived from the request.
    #[must_use]
    pub fn with_install_step(mut self, step: Arc<dyn InstallStep>) -> Self {
        self.install_step = Some(step);
        self
    }

    #[must_use]
    pub fn with_downloader(mut self, downloader: Arc<dyn Downloader>) -> Self {
        self.downloader = Some(downloader);
        self
    }

    /// Run PreCheck through Complete in the elevated helper.
    #[must_use]
    pub fn with_elevation(mut self, launcher: HelperLauncher) -> Self {
        self.launcher = Some(launcher);
        self
    }

    /// Whether PreCheck waits for the application to exit.
    #[must_use]
    pub const fn wait_for_process(mut self, wait: bool) -> Self {
        self.wait_for_process = wait;
        self
    }

    #[must_use]
    pub const fn config(&self) -> &UpdaterConfig {
        &self.config
    }

    fn emitter(&self) -> ProgressEmitter {
        ProgressEmitter::new(self.sink.clone(), self.config.phase_ranges)
    }

    /// Run a complete update.
    pub async fn run(&self, request: &UpdateRequest, cancel: &CancelToken) -> Result<UpdateReport, UpdateError> {
        let emitter = self.emitter();
        check_cancelled(cancel)?;

        if let Some(downloader) = &self.downloader {
            self.download(downloader.as_ref(), &emitter, cancel).await?;
        }

        match &self.launcher {
            Some(launcher) => {
                check_cancelled(cancel)?;
                let backup_path = launcher.run(request, &emitter, cancel).await?;
                Ok(UpdateReport {
                    target: request.install_target().to_path_buf(),
                    backup_path,
                    elevated: true,
                })
            }
            None => self.execute_phases(request, &emitter, cancel).await,
        }
    }

    /// Run PreCheck through Complete in this process.
    pub async fn run_local(
        &self,
        request: &UpdateRequest,
        cancel: &CancelToken,
    ) -> Result<UpdateReport, UpdateError> {
        self.execute_phases(request, &self.emitter(), cancel).await
    }

    async fn download(
        &self,
        downloader: &dyn Downloader,
        emitter: &ProgressEmitter,
        cancel: &CancelToken,
    ) -> Result<(), UpdateError> {
        emitter.phase_started(UpdatePhase::Download, None);
        let progress = emitter.clone();
        let on_progress = move |current: u64, total: u64, rate: Option<f64>| {
            progress.phase_progress(UpdatePhase::Download, current, total, rate, None);
        };
        downloader.execute(cancel, &on_progress).await?;
        emitter.phase_progress(UpdatePhase::Download, 1, 1, None, Some("Download complete"));
        Ok(())
    }

    async fn execute_phases(
        &self,
        request: &UpdateRequest,
        emitter: &ProgressEmitter,
        cancel: &CancelToken,
    ) -> Result<UpdateReport, UpdateError> {
        let kind = request.artifact_kind();
        let target = request.install_target();
        let replacer = Replacer::new(&self.config);
        let step = self
            .install_step
            .clone()
            .unwrap_or_else(|| install::step_for(request, self.platform.clone()));

        // PreCheck
        check_cancelled(cancel)?;
        emitter.phase_started(UpdatePhase::PreCheck, None);
        ensure_readable(request.app_path(), "Application").await?;
        ensure_readable(request.new_version(), "Update artifact").await?;
        if self.wait_for_process && request.waits_for_process() {
            self.wait_for_exit(request, emitter).await?;
        }
        let expected_checksum = self.expected_checksum(request, step.as_ref()).await;

        // Backup
        check_cancelled(cancel)?;
        emitter.phase_started(UpdatePhase::Backup, None);
        let backup = backup_path_for(request, &Local::now());
        create_backup(request, &backup).await?;
        emitter.phase_progress(UpdatePhase::Backup, 1, 1, None, Some(&display_name(&backup)));

        // Install
        check_cancelled(cancel)?;
        emitter.phase_started(UpdatePhase::Install, None);
        let params = request.install_params(&backup);
        let log = |line: &str| forward_install_line(emitter, line);
        with_rollback(&replacer, target, &backup, kind, step.perform(&params, &log, cancel))
            .await
            .map_err(ReplaceError::into_install_error)?;

        // Verify
        emitter.phase_started(UpdatePhase::Verify, None);
        with_rollback(
            &replacer,
            target,
            &backup,
            kind,
            replacer.verify(target, kind, expected_checksum.as_deref()),
        )
        .await
        .map_err(ReplaceError::into_verify_error)?;

        emitter.complete(&format!("Installed {}", request.version().unwrap_or("new version")));
        info!("Update of {} complete", target.display());
        if !self.config.ui.grace().is_zero() {
            tokio::time::sleep(self.config.ui.grace()).await;
        }

        Ok(UpdateReport {
            target: target.to_path_buf(),
            backup_path: Some(backup),
            elevated: false,
        })
    }

    async fn wait_for_exit(&self, request: &UpdateRequest, emitter: &ProgressEmitter) -> Result<(), UpdateError> {
        let Some(name) = request.process_name() else {
            return Ok(());
        };
        emitter.log(format!("Waiting for {name} to exit"));
        ProcessMonitor::new(self.platform.clone(), self.config.process.clone())
            .with_ignored_pids(request.parent_pid().into_iter().chain([std::process::id()]))
            .wait_for_exit(&name)
            .await
    }

    /// Checksum the installed file must match, when the step copies the artifact as-is.
    async fn expected_checksum(&self, request: &UpdateRequest, step: &dyn InstallStep) -> Option<String> {
        if !self.config.verify_checksum || !step.installs_verbatim() {
            return None;
        }
        match checksum::compute_sha256(request.new_version()).await {
            Ok(sum) => Some(sum),
            Err(e) => {
                warn!("Skipping checksum verification: {e:#}");
                None
            }
        }
    }
}

fn check_cancelled(cancel: &CancelToken) -> Result<(), UpdateError> {
    if cancel.is_cancelled() { Err(UpdateError::Cancelled) } else { Ok(()) }
}

async fn ensure_readable(path: &Path, what: &str) -> Result<(), UpdateError> {
    let metadata = tokio::fs::metadata(path)
        .await
        .map_err(|e| UpdateError::validation(format!("{what} not found at {}: {e}", path.display())))?;

    let readable = if metadata.is_dir() {
        tokio::fs::read_dir(path).await.map(|_| ())
    } else {
        tokio::fs::File::open(path).await.map(|_| ())
    };
    readable.map_err(|e| UpdateError::validation(format!("{what} at {} is not readable: {e}", path.display())))
}

/// Install output: progress lines become progress events, the rest log lines.
fn forward_install_line(emitter: &ProgressEmitter, line: &str) {
    if let Some(payload) = line.strip_prefix(PROGRESS_PREFIX) {
        if let Some(progress) = parse_progress_with(emitter.ranges(), payload) {
            emitter.forward(progress);
            return;
        }
    }
    emitter.log(line);
}

fn display_name(path: &Path) -> String {
    path.file_name().map(|n| n.to_string_lossy().into_owned()).unwrap_or_default()
}
