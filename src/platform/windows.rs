//! Windows: the helper is started through PowerShell `Start-Process -Verb RunAs`, which
//! shows the UAC prompt. An elevated process cannot inherit our standard handles, so the
//! channel is a named pipe created here and opened by the helper for writing.

use super::{ElevatedHelper, HelperChannel, HelperInvocation};
use crate::core::UpdateError;
use crate::request::UpdateRequest;
use anyhow::{Context, Result};
use std::path::PathBuf;
use std::process::Stdio;
use tokio::net::windows::named_pipe::ServerOptions;
use tokio::process::Command;

/// High mandatory integrity level.
const HIGH_INTEGRITY_SID: &str = "S-1-16-12288";

pub(super) fn is_elevated() -> bool {
    std::process::Command::new("whoami")
        .arg("/groups")
        .output()
        .map(|out| String::from_utf8_lossy(&out.stdout).contains(HIGH_INTEGRITY_SID))
        .unwrap_or(false)
}

pub(super) async fn elevate(invocation: &HelperInvocation) -> Result<ElevatedHelper, UpdateError> {
    let pipe_name = format!(r"\\.\pipe\hotupdater-{}", uuid::Uuid::new_v4().simple());
    let server = ServerOptions::new()
        .first_pipe_instance(true)
        .access_outbound(false)
        .create(&pipe_name)
        .map_err(|e| UpdateError::communication(format!("Failed to create pipe {pipe_name}: {e}")))?;

    let invocation = HelperInvocation {
        pipe_path: PathBuf::from(&pipe_name),
        ..invocation.clone()
    };
    let child = Command::new("powershell")
        .args(["-NoProfile", "-NonInteractive", "-ExecutionPolicy", "Bypass", "-Command"])
        .arg(start_process_script(&invocation))
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| UpdateError::ElevationDenied {
            reason: format!("Failed to start the elevation prompt: {e}"),
        })?;

    Ok(ElevatedHelper {
        child,
        channel: HelperChannel::PipeServer(server),
        denial_check: denied,
    })
}

/// PowerShell that runs the helper elevated and exits with its exit code.
fn start_process_script(invocation: &HelperInvocation) -> String {
    let arguments = invocation
        .args(true)
        .iter()
        .map(|arg| format!("\"{}\"", arg.replace('"', "\\\"")))
        .collect::<Vec<_>>()
        .join(" ");
    format!(
        "$p = Start-Process -FilePath {} -ArgumentList {} -Verb RunAs -WindowStyle Hidden -Wait -PassThru; exit $p.ExitCode",
        ps_quote(&invocation.executable.to_string_lossy()),
        ps_quote(&arguments)
    )
}

fn ps_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}

/// `Start-Process` fails with "canceled by the user" when the UAC prompt is declined.
fn denied(_code: Option<i32>, stderr: &str) -> Option<String> {
    (stderr.contains("canceled by the user") || stderr.contains("cancelled by the user"))
        .then(|| "the administrator prompt was cancelled".to_string())
}

pub(super) fn spawn_detached(request: &UpdateRequest) -> Result<()> {
    std::process::Command::new("cmd")
        .args(["/c", "start", ""])
        .arg(request.app_path())
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .spawn()
        .with_context(|| format!("Failed to start {}", request.app_path().display()))?;
    Ok(())
}
