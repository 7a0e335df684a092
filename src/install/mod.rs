//! Pluggable install steps.
//!
//! The Install phase hands the actual mutation of the target to an [`InstallStep`]. It
//! receives the fixed [`InstallParams`] map and a logging callback and reports success
//! or failure; the orchestrator takes care of backup and rollback around it.
//!
//! - [`NativeInstallStep`] swaps the artifact through the [`Platform`]
//! - [`CommandInstallStep`] runs an external program with the parameters in its
//!   environment, for installs that need custom logic

use crate::core::CancelToken;
use crate::platform::Platform;
use crate::request::{ArtifactKind, InstallParams, UpdateRequest};
use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tracing::debug;

/// Callback receiving one line of install output. It may borrow from the caller.
pub type LogCallback<'a> = dyn Fn(&str) + Send + Sync + 'a;

/// Performs the privileged mutation of the target.
#[async_trait]
pub trait InstallStep: Send + Sync {
    async fn perform(
        &self,
        params: &InstallParams,
        log: &LogCallback<'_>,
        cancel: &CancelToken,
    ) -> Result<()>;

    /// Whether the installed file ends up byte-identical to the new artifact.
    fn installs_verbatim(&self) -> bool {
        false
    }
}

/// Swaps the artifact with [`Platform::replace_artifact`].
pub struct NativeInstallStep {
    platform: Arc<dyn Platform>,
    kind: ArtifactKind,
}

impl NativeInstallStep {
    pub fn new(platform: Arc<dyn Platform>, kind: ArtifactKind) -> Self {
        Self {
            platform,
            kind,
        }
    }
}

#[async_trait]
impl InstallStep for NativeInstallStep {
    async fn perform(
        &self,
        params: &InstallParams,
        log: &LogCallback<'_>,
        _cancel: &CancelToken,
    ) -> Result<()> {
        let target = match self.kind {
            ArtifactKind::SingleFile => params.path(InstallParams::APP_PATH),
            ArtifactKind::Bundle => params.path(InstallParams::APP_ROOT),
        };
        let new_content = params.path(InstallParams::NEW_VERSION);

        log(&format!("Replacing {}", target.display()));
        self.platform.replace_artifact(&target, &new_content, self.kind).await?;
        log(&format!("Installed {}", target.display()));
        Ok(())
    }

    fn installs_verbatim(&self) -> bool {
        self.kind == ArtifactKind::SingleFile
    }
}

/// Runs an external program as the install step.
///
/// Each parameter is exported as `HOTUPDATER_<KEY>` (for example
/// `HOTUPDATER_APP_PATH`). Standard output and error lines are passed to the log
/// callback, so the program can report progress with `@PROGRESS@` lines. The program is
/// killed when the run is cancelled.
pub struct CommandInstallStep {
    program: PathBuf,
    args: Vec<String>,
}

impl CommandInstallStep {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
        }
    }

    #[must_use]
    pub fn with_args(mut self, args: Vec<String>) -> Self {
        self.args = args;
        self
    }
}

/// Environment variable name for a parameter key.
#[must_use]
pub fn env_var_name(key: &str) -> String {
    format!("HOTUPDATER_{}", key.to_ascii_uppercase())
}

#[async_trait]
impl InstallStep for CommandInstallStep {
    async fn perform(
        &self,
        params: &InstallParams,
        log: &LogCallback<'_>,
        cancel: &CancelToken,
    ) -> Result<()> {
        let mut command = Command::new(&self.program);
        command
            .args(&self.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        for (key, value) in params.iter() {
            command.env(env_var_name(key), value);
        }

        debug!("Running install script {}", self.program.display());
        let mut child = command
            .spawn()
            .with_context(|| format!("Failed to start install script {}", self.program.display()))?;

        let stdout = child.stdout.take().context("Install script stdout not captured")?;
        let stderr = child.stderr.take().context("Install script stderr not captured")?;
        let mut stdout = BufReader::new(stdout).lines();
        let mut stderr = BufReader::new(stderr).lines();
        let (mut stdout_open, mut stderr_open) = (true, true);

        while stdout_open || stderr_open {
            tokio::select! {
                line = stdout.next_line(), if stdout_open => match line? {
                    Some(line) => log(&line),
                    None => stdout_open = false,
                },
                line = stderr.next_line(), if stderr_open => match line? {
                    Some(line) => log(&line),
                    None => stderr_open = false,
                },
                () = cancel.cancelled() => {
                    child.kill().await.ok();
                    bail!("Install script cancelled");
                }
            }
        }

        let status = tokio::select! {
            status = child.wait() => status.context("Failed to wait for install script")?,
            () = cancel.cancelled() => {
                child.kill().await.ok();
                bail!("Install script cancelled");
            }
        };
        if !status.success() {
            bail!("Install script {} exited with {status}", self.program.display());
        }
        Ok(())
    }
}

/// Install step for a request: its script if it names one, the native swap otherwise.
pub fn step_for(request: &UpdateRequest, platform: Arc<dyn Platform>) -> Arc<dyn InstallStep> {
    match request.script_path() {
        Some(script) => Arc::new(CommandInstallStep::new(script)),
        None => Arc::new(NativeInstallStep::new(platform, request.artifact_kind())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::FakePlatform;
    use std::path::Path;
    use std::sync::Mutex;
    use tempfile::TempDir;

    fn params(dir: &Path) -> InstallParams {
        UpdateRequest::new(dir.join("app"), dir.join("app.new"), dir.join("backups"), dir)
            .with_artifact_kind(ArtifactKind::SingleFile)
            .install_params(&dir.join("backups/backup_1_20240101_000000"))
    }

    #[test]
    fn test_env_var_names() {
        assert_eq!(env_var_name(InstallParams::APP_PATH), "HOTUPDATER_APP_PATH");
        assert_eq!(env_var_name(InstallParams::NEW_VERSION), "HOTUPDATER_NEW_VERSION");
    }

    #[tokio::test]
    async fn test_native_step_swaps_file() {
        let temp = TempDir::new().unwrap();
        std::fs::write(temp.path().join("app"), b"old").unwrap();
        std::fs::write(temp.path().join("app.new"), b"new").unwrap();

        let step = NativeInstallStep::new(Arc::new(FakePlatform::new()), ArtifactKind::SingleFile);
        let logged = Mutex::new(Vec::new());
        step.perform(
            &params(temp.path()),
            &|line: &str| logged.lock().unwrap().push(line.to_string()),
            &CancelToken::new(),
        )
        .await
        .unwrap();

        assert_eq!(std::fs::read(temp.path().join("app")).unwrap(), b"new");
        assert_eq!(logged.lock().unwrap().len(), 2);
        assert!(step.installs_verbatim());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_command_step_sees_parameters_and_forwards_output() {
        use std::os::unix::fs::PermissionsExt;

        let temp = TempDir::new().unwrap();
        let script = temp.path().join("install.sh");
        std::fs::write(
            &script,
            "#!/bin/sh\necho \"installing $HOTUPDATER_NEW_VERSION\"\necho '@PROGRESS@install|50|half'\n\
             echo \"$HOTUPDATER_BACKUP_PATH\"\necho \"$HOTUPDATER_BACKUP_FILE\"\n",
        )
        .unwrap();
        std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();

        let logged = Mutex::new(Vec::new());
        CommandInstallStep::new(&script)
            .perform(
                &params(temp.path()),
                &|line: &str| logged.lock().unwrap().push(line.to_string()),
                &CancelToken::new(),
            )
            .await
            .unwrap();

        let logged = logged.into_inner().unwrap();
        assert_eq!(
            logged[0],
            format!("installing {}", temp.path().join("app.new").display())
        );
        assert_eq!(logged[1], "@PROGRESS@install|50|half");
        assert_eq!(logged[2], temp.path().join("backups").display().to_string());
        assert_eq!(
            logged[3],
            temp.path().join("backups/backup_1_20240101_000000").display().to_string()
        );
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_command_step_failure_and_cancel() {
        let step = CommandInstallStep::new("/bin/sh").with_args(vec!["-c".into(), "exit 3".into()]);
        let temp = TempDir::new().unwrap();
        let err = step.perform(&params(temp.path()), &|_: &str| {}, &CancelToken::new()).await.unwrap_err();
        assert!(err.to_string().contains("exited"));

        let slow = CommandInstallStep::new("/bin/sh").with_args(vec!["-c".into(), "sleep 30".into()]);
        let cancel = CancelToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_millis(50)).await;
            trigger.cancel();
        });
        let started = std::time::Instant::now();
        let err = slow.perform(&params(temp.path()), &|_: &str| {}, &cancel).await.unwrap_err();
        assert!(err.to_string().contains("cancelled"));
        assert!(started.elapsed() < std::time::Duration::from_secs(10));
    }
}
