//! macOS and Linux: elevation through `osascript` / `pkexec` with a named pipe channel.

use super::{ElevatedHelper, HelperChannel, HelperInvocation};
use crate::core::UpdateError;
use crate::request::{ArtifactKind, UpdateRequest};
use anyhow::{Context, Result};
use std::ffi::CString;
use std::os::unix::ffi::OsStrExt;
use std::path::Path;
use std::process::Stdio;
use tokio::process::Command;
use tracing::debug;

pub(super) fn is_elevated() -> bool {
    // SAFETY: geteuid has no preconditions and cannot fail.
    unsafe { libc::geteuid() == 0 }
}

/// Create the named pipe at `path`, replacing a stale one.
pub fn create_fifo(path: &Path) -> Result<(), UpdateError> {
    if path.exists() {
        debug!("Removing stale pipe {}", path.display());
        std::fs::remove_file(path).map_err(|e| {
            UpdateError::communication(format!("Failed to remove stale pipe {}: {e}", path.display()))
        })?;
    }

    let c_path = CString::new(path.as_os_str().as_bytes())
        .map_err(|_| UpdateError::communication(format!("Invalid pipe path {}", path.display())))?;
    // SAFETY: c_path is a valid NUL-terminated string for the duration of the call.
    let rc = unsafe { libc::mkfifo(c_path.as_ptr(), 0o600) };
    if rc != 0 {
        let err = std::io::Error::last_os_error();
        return Err(UpdateError::communication(format!(
            "Failed to create pipe {}: {err}",
            path.display()
        )));
    }
    Ok(())
}

pub(super) async fn elevate(invocation: &HelperInvocation) -> Result<ElevatedHelper, UpdateError> {
    create_fifo(&invocation.pipe_path)?;

    let mut command = elevation_command(invocation)?;
    command.stdin(Stdio::null()).stdout(Stdio::null()).stderr(Stdio::piped()).kill_on_drop(true);

    let child = command.spawn().map_err(|e| UpdateError::ElevationDenied {
        reason: format!("Failed to start the elevation prompt: {e}"),
    })?;

    Ok(ElevatedHelper {
        child,
        channel: HelperChannel::Fifo(invocation.pipe_path.clone()),
        denial_check: denied,
    })
}

#[cfg(target_os = "macos")]
fn elevation_command(invocation: &HelperInvocation) -> Result<Command, UpdateError> {
    let mut shell = shell_quote(&invocation.executable.to_string_lossy());
    for arg in invocation.args(true) {
        shell.push(' ');
        shell.push_str(&shell_quote(&arg));
    }
    let script = format!(
        "do shell script \"{}\" with administrator privileges",
        shell.replace('\\', "\\\\").replace('"', "\\\"")
    );

    let mut command = Command::new("osascript");
    command.arg("-e").arg(script);
    Ok(command)
}

#[cfg(not(target_os = "macos"))]
fn elevation_command(invocation: &HelperInvocation) -> Result<Command, UpdateError> {
    let pkexec = which::which("pkexec").map_err(|_| UpdateError::ElevationDenied {
        reason: "pkexec is not installed".to_string(),
    })?;

    let mut command = Command::new(pkexec);
    command.arg(&invocation.executable).args(invocation.args(true));
    Ok(command)
}

/// `osascript` reports a cancelled prompt as error -128.
#[cfg(target_os = "macos")]
fn denied(_code: Option<i32>, stderr: &str) -> Option<String> {
    (stderr.contains("User canceled") || stderr.contains("-128"))
        .then(|| "the administrator prompt was cancelled".to_string())
}

/// `pkexec` exits 126 when the dialog is dismissed and 127 when not authorized.
#[cfg(not(target_os = "macos"))]
fn denied(code: Option<i32>, _stderr: &str) -> Option<String> {
    match code {
        Some(126) => Some("the authentication dialog was dismissed".to_string()),
        Some(127) => Some("not authorized to run the update helper".to_string()),
        _ => None,
    }
}

#[cfg(any(target_os = "macos", test))]
fn shell_quote(arg: &str) -> String {
    format!("'{}'", arg.replace('\'', "'\\''"))
}

pub(super) fn spawn_detached(request: &UpdateRequest) -> Result<()> {
    let mut command = if cfg!(target_os = "macos") && request.artifact_kind() == ArtifactKind::Bundle {
        let mut open = std::process::Command::new("open");
        open.arg("-n").arg(request.app_root());
        open
    } else {
        std::process::Command::new(request.app_path())
    };

    command
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .spawn()
        .with_context(|| format!("Failed to start {}", request.app_path().display()))?;
    Ok(())
}
