//! Operating-system seam.
//!
//! Everything that differs between operating systems sits behind [`Platform`]:
//! privilege elevation, privilege detection, process lookup and termination, and the
//! artifact swap itself. Shared logic talks to `dyn Platform` only; the per-OS pieces of
//! [`SystemPlatform`] live in the `unix` and `windows` submodules and are selected at
//! build time.
//!
//! Process names are matched exactly against the process table (case-insensitively on
//! Windows). Substring matches never count.

#[cfg(unix)]
mod unix;
#[cfg(windows)]
mod windows;

#[cfg(unix)]
use unix as os;
#[cfg(windows)]
use windows as os;

use crate::config::UpdaterConfig;
use crate::constants::RELAUNCH_CONFIRM_DELAY;
use crate::core::UpdateError;
use crate::replace::Replacer;
use crate::request::{ArtifactKind, UpdateRequest};
use anyhow::{Result, bail};
use async_trait::async_trait;
use std::ffi::OsStr;
use std::path::{Path, PathBuf};
use std::time::Duration;
use sysinfo::{ProcessStatus, ProcessesToUpdate, System};
use tokio::process::Child;
use tracing::{debug, info, warn};

/// Privilege level of the current process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Privilege {
    Standard,
    Elevated,
}

/// How to start the elevated helper.
#[derive(Debug, Clone)]
pub struct HelperInvocation {
    /// Executable to re-invoke, normally the current one.
    pub executable: PathBuf,
    pub request_file: PathBuf,
    /// Path of the channel, used where the channel is a named pipe.
    pub pipe_path: PathBuf,
    pub config_file: Option<PathBuf>,
}

impl HelperInvocation {
    /// Arguments for the helper entry point.
    #[must_use]
    pub fn args(&self, with_pipe: bool) -> Vec<String> {
        let mut args = vec!["--update".to_string(), self.request_file.to_string_lossy().into_owned()];
        if with_pipe {
            args.push("--pipe".to_string());
            args.push(self.pipe_path.to_string_lossy().into_owned());
        }
        if let Some(config) = &self.config_file {
            args.push("--config".to_string());
            args.push(config.to_string_lossy().into_owned());
        }
        args
    }
}

/// Where the helper's protocol lines arrive.
#[derive(Debug)]
pub enum HelperChannel {
    /// The child's redirected standard output.
    Stdout,
    /// A named pipe the child opens for writing.
    Fifo(PathBuf),
    /// Server end of a Windows named pipe the child connects to.
    #[cfg(windows)]
    PipeServer(tokio::net::windows::named_pipe::NamedPipeServer),
}

/// Decides whether a helper exit means the user or the OS refused elevation.
pub type DenialCheck = fn(code: Option<i32>, stderr: &str) -> Option<String>;

/// A started elevated helper.
#[derive(Debug)]
pub struct ElevatedHelper {
    pub child: Child,
    pub channel: HelperChannel,
    pub denial_check: DenialCheck,
}

/// Per-OS capabilities used by the update pipeline.
#[async_trait]
pub trait Platform: Send + Sync {
    /// Start the helper with elevated rights and open its output channel.
    async fn elevate(&self, invocation: &HelperInvocation) -> Result<ElevatedHelper, UpdateError>;

    fn detect_privilege(&self) -> Privilege;

    /// Ids of running processes whose name is exactly `name`.
    async fn find_process(&self, name: &str) -> Result<Vec<u32>>;

    /// Forcibly terminate every process named `name` whose id is not in `exclude`.
    async fn terminate_process(&self, name: &str, exclude: &[u32]) -> Result<()>;

    /// Swap `target` for `new_content`.
    async fn replace_artifact(
        &self,
        target: &Path,
        new_content: &Path,
        kind: ArtifactKind,
    ) -> Result<()>;
}

/// The real operating system.
#[derive(Debug, Clone)]
pub struct SystemPlatform {
    replacer: Replacer,
}

impl SystemPlatform {
    #[must_use]
    pub fn new(config: &UpdaterConfig) -> Self {
        Self {
            replacer: Replacer::new(config),
        }
    }
}

#[async_trait]
impl Platform for SystemPlatform {
    async fn elevate(&self, invocation: &HelperInvocation) -> Result<ElevatedHelper, UpdateError> {
        os::elevate(invocation).await
    }

    fn detect_privilege(&self) -> Privilege {
        if os::is_elevated() {
            Privilege::Elevated
        } else {
            Privilege::Standard
        }
    }

    async fn find_process(&self, name: &str) -> Result<Vec<u32>> {
        let name = name.to_string();
        let own_pid = std::process::id();
        let pids = tokio::task::spawn_blocking(move || {
            let mut system = System::new();
            system.refresh_processes(ProcessesToUpdate::All, true);
            system
                .processes()
                .iter()
                .filter(|(pid, _)| pid.as_u32() != own_pid)
                .filter(|(_, process)| process.status() != ProcessStatus::Zombie)
                .filter(|(_, process)| {
                    name_matches(process.name(), &name)
                        || process
                            .exe()
                            .and_then(Path::file_name)
                            .is_some_and(|exe| name_matches(exe, &name))
                })
                .map(|(pid, _)| pid.as_u32())
                .collect::<Vec<_>>()
        })
        .await?;
        Ok(pids)
    }

    async fn terminate_process(&self, name: &str, exclude: &[u32]) -> Result<()> {
        let mut pids = self.find_process(name).await?;
        pids.retain(|pid| !exclude.contains(pid));
        if pids.is_empty() {
            debug!("No process named {name} to terminate");
            return Ok(());
        }

        let failed = tokio::task::spawn_blocking(move || {
            let mut system = System::new();
            system.refresh_processes(ProcessesToUpdate::All, true);
            pids.into_iter()
                .filter(|pid| {
                    system
                        .process(sysinfo::Pid::from_u32(*pid))
                        .is_some_and(|process| !process.kill())
                })
                .collect::<Vec<_>>()
        })
        .await?;

        if !failed.is_empty() {
            bail!("Failed to send kill to {name} (pids {failed:?})");
        }
        info!("Sent forced termination to {name}");
        Ok(())
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

/// Whether a process-table name is exactly `wanted`.
#[cfg(windows)]
fn name_matches(candidate: &OsStr, wanted: &str) -> bool {
    let candidate = candidate.to_string_lossy();
    let strip = |s: &str| -> String {
        let lower = s.to_ascii_lowercase();
        lower.strip_suffix(".exe").map(str::to_string).unwrap_or(lower)
    };
    strip(&candidate) == strip(wanted)
}

/// Whether a process-table name is exactly `wanted`.
#[cfg(not(windows))]
fn name_matches(candidate: &OsStr, wanted: &str) -> bool {
    candidate == OsStr::new(wanted)
}

/// Whether a process with this id exists.
#[must_use]
pub fn pid_alive(pid: u32) -> bool {
    let pid = sysinfo::Pid::from_u32(pid);
    let mut system = System::new();
    system.refresh_processes(ProcessesToUpdate::Some(&[pid]), true);
    system.process(pid).is_some_and(|process| process.status() != ProcessStatus::Zombie)
}

/// Start the updated application again and confirm it is running.
///
/// Bundles are reopened through the desktop; single files are spawned detached.
pub async fn relaunch(platform: &dyn Platform, request: &UpdateRequest) -> Result<()> {
    relaunch_with_delay(platform, request, RELAUNCH_CONFIRM_DELAY).await
}

pub async fn relaunch_with_delay(
    platform: &dyn Platform,
    request: &UpdateRequest,
    confirm_delay: Duration,
) -> Result<()> {
    info!("Relaunching {}", request.app_path().display());
    os::spawn_detached(request)?;

    tokio::time::sleep(confirm_delay).await;
    let Some(name) = request.process_name() else {
        return Ok(());
    };
    if platform.find_process(&name).await?.is_empty() {
        warn!("{name} did not appear after relaunch");
        bail!("The application did not start after the update");
    }
    Ok(())
}
