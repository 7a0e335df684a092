//! Test utilities for hotupdater
//!
//! Fakes for the seams of the update pipeline, so orchestrator behavior can be tested
//! without touching the real process table or asking anyone for a password:
//!
//! - [`FakePlatform`]: scripted process table, scripted elevation, real file swaps
//! - [`RecordingSink`]: keeps every event for later assertions
//! - [`ScriptedDownloader`]: writes fixed content in chunks, optionally failing
//! - [`FailingInstallStep`]: an install step that damages the target and fails
//!
//! # Example
//!
//! ```rust,no_run
//! use hotupdater::test_utils::FakePlatform;
//!
//! let platform = FakePlatform::new();
//! platform.add_process("myapp", 2); // seen running for two polls, then gone
//! ```

use crate::config::UpdaterConfig;
use crate::core::{CancelToken, UpdateError};
use crate::download::{Downloader, ProgressFn};
use crate::events::{EventSink, UpdateEvent};
use crate::install::{InstallStep, LogCallback};
use crate::platform::{ElevatedHelper, HelperChannel, HelperInvocation, Platform, Privilege};
use crate::progress::UpdateProgress;
use crate::replace::Replacer;
use crate::request::{ArtifactKind, InstallParams};
use anyhow::{Result, bail};
use async_trait::async_trait;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::{Mutex, Once};
use tokio::process::Command;
use tracing::Level;
use tracing_subscriber::EnvFilter;

/// Global flag to ensure logging is only initialized once in tests
static INIT_LOGGING: Once = Once::new();

/// Initialize logging for tests.
///
/// Respects `RUST_LOG` if set, or uses the provided level. Without either, tests run
/// silently.
///
/// ```bash
/// RUST_LOG=debug cargo test
/// ```
pub fn init_test_logging(level: Option<Level>) {
    INIT_LOGGING.call_once(|| {
        let filter = if let Some(level) = level {
            EnvFilter::new(level.to_string())
        } else if std::env::var("RUST_LOG").is_ok() {
            EnvFilter::from_default_env()
        } else {
            return;
        };

        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_test_writer()
            .with_target(true)
            .with_thread_ids(false)
            .with_ansi(true)
            .try_init();
    });
}

/// Records every event it receives.
#[derive(Debug, Default)]
pub struct RecordingSink {
    events: Mutex<Vec<UpdateEvent>>,
}

impl RecordingSink {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<UpdateEvent> {
        self.events.lock().unwrap().clone()
    }

    pub fn progress(&self) -> Vec<UpdateProgress> {
        self.events()
            .into_iter()
            .filter_map(|event| match event {
                UpdateEvent::Progress(progress) => Some(progress),
                UpdateEvent::Log(_) => None,
            })
            .collect()
    }

    pub fn logs(&self) -> Vec<String> {
        self.events()
            .into_iter()
            .filter_map(|event| match event {
                UpdateEvent::Log(line) => Some(line),
                UpdateEvent::Progress(_) => None,
            })
            .collect()
    }
}

impl EventSink for RecordingSink {
    fn emit_log(&self, message: &str) {
        self.events.lock().unwrap().push(UpdateEvent::Log(message.to_string()));
    }

    fn emit_progress(&self, progress: &UpdateProgress) {
        self.events.lock().unwrap().push(UpdateEvent::Progress(progress.clone()));
    }
}

#[derive(Debug, Clone, Copy)]
enum FakeProcess {
    /// Reported as running for this many more lookups.
    ExitsAfter(usize),
    /// Never exits on its own.
    Stubborn {
        dies_on_kill: bool,
    },
}

#[derive(Debug, Clone)]
enum FakeElevation {
    Deny(String),
    /// Shell script run as the "elevated" helper; its stdout is the channel.
    Script(String),
}

/// Scripted [`Platform`].
///
/// Process lookups consult an in-memory table. Elevation runs a shell script with the
/// helper arguments as `$1...` and the channel on its stdout. Artifact replacement is
/// real and goes through [`Replacer`].
#[derive(Debug)]
pub struct FakePlatform {
    processes: Mutex<HashMap<String, FakeProcess>>,
    pids: Mutex<HashMap<String, u32>>,
    next_pid: AtomicU32,
    terminate_calls: AtomicUsize,
    spared: Mutex<Vec<u32>>,
    privilege: Mutex<Privilege>,
    elevation: Mutex<FakeElevation>,
    replacer: Replacer,
}

impl Default for FakePlatform {
    fn default() -> Self {
        Self::new()
    }
}

impl FakePlatform {
    #[must_use]
    pub fn new() -> Self {
        Self {
            processes: Mutex::new(HashMap::new()),
            pids: Mutex::new(HashMap::new()),
            next_pid: AtomicU32::new(40_000),
            terminate_calls: AtomicUsize::new(0),
            spared: Mutex::new(Vec::new()),
            privilege: Mutex::new(Privilege::Standard),
            elevation: Mutex::new(FakeElevation::Deny("no elevation configured".to_string())),
            replacer: Replacer::new(&UpdaterConfig::for_tests()),
        }
    }

    fn insert(&self, name: &str, process: FakeProcess) {
        self.processes.lock().unwrap().insert(name.to_string(), process);
        let pid = self.next_pid.fetch_add(1, Ordering::SeqCst);
        self.pids.lock().unwrap().insert(name.to_string(), pid);
    }

    /// A process that is seen running for `polls` lookups and then exits.
    pub fn add_process(&self, name: &str, polls: usize) {
        self.insert(name, FakeProcess::ExitsAfter(polls));
    }

    /// A process that only goes away when terminated, if at all.
    pub fn add_stubborn_process(&self, name: &str, dies_on_kill: bool) {
        self.insert(
            name,
            FakeProcess::Stubborn {
                dies_on_kill,
            },
        );
    }

    pub fn pid_of(&self, name: &str) -> Option<u32> {
        self.pids.lock().unwrap().get(name).copied()
    }

    pub fn terminate_calls(&self) -> usize {
        self.terminate_calls.load(Ordering::SeqCst)
    }

    /// Pids a termination request was told to leave alone.
    pub fn spared_pids(&self) -> Vec<u32> {
        self.spared.lock().unwrap().clone()
    }

    pub fn set_privilege(&self, privilege: Privilege) {
        *self.privilege.lock().unwrap() = privilege;
    }

    /// Run `script` with `sh -c` (`cmd /C` on Windows) when elevation is requested.
    pub fn with_elevation_script(&self, script: impl Into<String>) {
        *self.elevation.lock().unwrap() = FakeElevation::Script(script.into());
    }

    /// Refuse elevation with `reason`.
    pub fn deny_elevation(&self, reason: impl Into<String>) {
        *self.elevation.lock().unwrap() = FakeElevation::Deny(reason.into());
    }
}

#[async_trait]
impl Platform for FakePlatform {
    async fn elevate(&self, invocation: &HelperInvocation) -> Result<ElevatedHelper, UpdateError> {
        let elevation = self.elevation.lock().unwrap().clone();
        let script = match elevation {
            FakeElevation::Deny(reason) => {
                return Err(UpdateError::ElevationDenied {
                    reason,
                });
            }
            FakeElevation::Script(script) => script,
        };

        #[cfg(unix)]
        let mut command = {
            let mut command = Command::new("sh");
            command.arg("-c").arg(&script).arg("hotupdater-helper");
            command
        };
        #[cfg(windows)]
        let mut command = {
            let mut command = Command::new("cmd");
            command.arg("/C").arg(&script);
            command
        };
        command
            .args(invocation.args(false))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let child = command
            .spawn()
            .map_err(|e| UpdateError::communication(format!("Failed to start fake helper: {e}")))?;
        Ok(ElevatedHelper {
            child,
            channel: HelperChannel::Stdout,
            denial_check: |code, _stderr| (code == Some(126)).then(|| "user cancelled".to_string()),
        })
    }

    fn detect_privilege(&self) -> Privilege {
        *self.privilege.lock().unwrap()
    }

    async fn find_process(&self, name: &str) -> Result<Vec<u32>> {
        let mut processes = self.processes.lock().unwrap();
        let running = match processes.get(name).copied() {
            None => false,
            Some(FakeProcess::ExitsAfter(0)) => {
                processes.remove(name);
                false
            }
            Some(FakeProcess::ExitsAfter(remaining)) => {
                processes.insert(name.to_string(), FakeProcess::ExitsAfter(remaining - 1));
                true
            }
            Some(FakeProcess::Stubborn { .. }) => true,
        };
        Ok(if running { self.pid_of(name).into_iter().collect() } else { Vec::new() })
    }

    async fn terminate_process(&self, name: &str, exclude: &[u32]) -> Result<()> {
        self.terminate_calls.fetch_add(1, Ordering::SeqCst);
        self.spared.lock().unwrap().extend_from_slice(exclude);
        if self.pid_of(name).is_some_and(|pid| exclude.contains(&pid)) {
            return Ok(());
        }
        let mut processes = self.processes.lock().unwrap();
        match processes.get(name) {
            Some(FakeProcess::Stubborn {
                dies_on_kill: false,
            }) => bail!("Access denied terminating {name}"),
            Some(_) => {
                processes.remove(name);
                Ok(())
            }
            None => Ok(()),
        }
    }

    async fn replace_artifact(
        &self,
        target: &Path,
        new_content: &Path,
        kind: ArtifactKind,
    ) -> Result<()> {
        self.replacer.replace(target, new_content, kind).await
    }
}

/// Downloader that writes fixed content to `dest` in equal chunks.
#[derive(Debug, Clone)]
pub struct ScriptedDownloader {
    pub dest: PathBuf,
    pub content: Vec<u8>,
    pub chunks: usize,
    /// Fail after this many chunks.
    pub fail_after: Option<usize>,
}

impl ScriptedDownloader {
    pub fn new(dest: impl Into<PathBuf>, content: impl Into<Vec<u8>>) -> Self {
        Self {
            dest: dest.into(),
            content: content.into(),
            chunks: 4,
            fail_after: None,
        }
    }

    #[must_use]
    pub const fn failing_after(mut self, chunks: usize) -> Self {
        self.fail_after = Some(chunks);
        self
    }
}

#[async_trait]
impl Downloader for ScriptedDownloader {
    async fn execute(&self, cancel: &CancelToken, on_progress: &ProgressFn) -> Result<(), UpdateError> {
        let total = self.content.len() as u64;
        let chunk_size = self.content.len().div_ceil(self.chunks.max(1)).max(1);
        let mut written = Vec::with_capacity(self.content.len());

        for (index, chunk) in self.content.chunks(chunk_size).enumerate() {
            if cancel.is_cancelled() {
                return Err(UpdateError::Cancelled);
            }
            if self.fail_after == Some(index) {
                return Err(UpdateError::Download {
                    message: "connection reset".to_string(),
                });
            }
            written.extend_from_slice(chunk);
            on_progress(written.len() as u64, total, Some(1.0));
            tokio::task::yield_now().await;
        }

        tokio::fs::write(&self.dest, &written).await.map_err(|e| UpdateError::Download {
            message: e.to_string(),
        })
    }
}

/// Install step that fails after optionally damaging the target or removing the backup.
#[derive(Debug, Clone, Default)]
pub struct FailingInstallStep {
    pub message: String,
    /// Overwrite the target with this content before failing.
    pub damage_target: Option<Vec<u8>>,
    /// Delete the backup so the rollback cannot succeed.
    pub remove_backup: bool,
    /// Succeed instead of failing, after any damage is done.
    pub succeed: bool,
}

impl FailingInstallStep {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn damaging(mut self, content: impl Into<Vec<u8>>) -> Self {
        self.damage_target = Some(content.into());
        self
    }

    #[must_use]
    pub const fn removing_backup(mut self) -> Self {
        self.remove_backup = true;
        self
    }

    /// Report success after writing the damage, so Verify has to catch it.
    #[must_use]
    pub const fn reporting_success(mut self) -> Self {
        self.succeed = true;
        self
    }
}

#[async_trait]
impl InstallStep for FailingInstallStep {
    async fn perform(
        &self,
        params: &InstallParams,
        log: &LogCallback<'_>,
        _cancel: &CancelToken,
    ) -> Result<()> {
        if let Some(content) = &self.damage_target {
            tokio::fs::write(params.path(InstallParams::APP_PATH), content).await?;
        }
        if self.remove_backup {
            tokio::fs::remove_file(params.path(InstallParams::BACKUP_FILE)).await?;
        }
        if self.succeed {
            return Ok(());
        }
        log(&self.message);
        bail!("{}", self.message)
    }
}
