//! Elevated side of the helper protocol.
//!
//! The helper is this same executable started with `--update <request file>`. It runs
//! PreCheck through Complete with the mutating rights the parent lacks, writes every
//! event to the channel, and ends with exactly one `@RESULT@` line.
//!
//! A watchdog stops the run when the parent process disappears or the request file is
//! removed, so an orphaned helper never keeps running with elevated rights.

use super::channel::ChannelWriter;
use super::protocol::HelperResponse;
use crate::config::UpdaterConfig;
use crate::core::CancelToken;
use crate::orchestrator::UpdateOrchestrator;
use crate::platform::{Platform, SystemPlatform, pid_alive};
use crate::request::UpdateRequest;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWrite;
use tracing::{error, info, warn};

/// Helper entry point; returns the process exit code.
///
/// With `pipe` the channel is the named pipe created by the parent, otherwise standard
/// output.
pub async fn run_helper(config: UpdaterConfig, request_file: &Path, pipe: Option<&Path>) -> i32 {
    let writer: Box<dyn AsyncWrite + Unpin + Send> = match pipe {
        Some(pipe) => match tokio::fs::OpenOptions::new().write(true).open(pipe).await {
            Ok(file) => Box::new(file),
            Err(e) => {
                error!("Failed to open channel {}: {e}", pipe.display());
                return 1;
            }
        },
        None => Box::new(tokio::io::stdout()),
    };

    let platform: Arc<dyn Platform> = Arc::new(SystemPlatform::new(&config));
    serve(config, platform, request_file, writer).await
}

/// Run the request in `request_file`, writing the channel to `writer`.
pub async fn serve<W>(
    config: UpdaterConfig,
    platform: Arc<dyn Platform>,
    request_file: &Path,
    writer: W,
) -> i32
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    let (channel, task) = ChannelWriter::spawn(writer, config.phase_ranges);

    let result = match UpdateRequest::read_from(request_file).await {
        Ok(request) => {
            let cancel = CancelToken::new();
            let watchdog = tokio::spawn(watchdog(
                request.parent_pid(),
                request_file.to_path_buf(),
                config.helper.watchdog_interval(),
                cancel.clone(),
            ));

            let orchestrator =
                UpdateOrchestrator::new(config, platform).with_sink(Arc::new(channel.clone()));
            let result = orchestrator.run_local(&request, &cancel).await;
            watchdog.abort();
            result
        }
        Err(e) => {
            error!("Rejected update request {}: {e}", request_file.display());
            Err(e)
        }
    };

    let (response, code) = match result {
        Ok(report) => {
            info!("Helper finished update of {}", report.target.display());
            (HelperResponse::success(report.backup_path.unwrap_or_default()), 0)
        }
        Err(e) => (HelperResponse::failure(e), 1),
    };

    if let Err(e) = channel.finish(&response, task).await {
        error!("Failed to deliver the final status line: {e}");
        return 1;
    }
    code
}

/// Cancel the run once the parent is gone or the request file was removed.
async fn watchdog(parent_pid: Option<u32>, request_file: PathBuf, interval: Duration, cancel: CancelToken) {
    loop {
        tokio::time::sleep(interval).await;

        let parent_alive = match parent_pid {
            Some(pid) => tokio::task::spawn_blocking(move || pid_alive(pid)).await.unwrap_or(true),
            None => true,
        };
        if !parent_alive {
            warn!("Parent process exited, stopping the update");
            cancel.cancel();
            return;
        }
        if !request_file.exists() {
            warn!("Request file {} disappeared, stopping the update", request_file.display());
            cancel.cancel();
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::UpdateError;
    use crate::helper::protocol::{ChannelLine, decode_line};
    use crate::progress::PhaseRanges;
    use crate::test_utils::FakePlatform;
    use tempfile::TempDir;
    use tokio::io::AsyncReadExt;

    async fn serve_to_string(request_file: &Path) -> (i32, Vec<ChannelLine>) {
        serve_with(Arc::new(FakePlatform::new()), request_file).await
    }

    async fn serve_with(platform: Arc<FakePlatform>, request_file: &Path) -> (i32, Vec<ChannelLine>) {
        let (client, mut server) = tokio::io::duplex(64 * 1024);
        let code = serve(UpdaterConfig::for_tests(), platform, request_file, client).await;

        let mut output = String::new();
        server.read_to_string(&mut output).await.unwrap();
        let ranges = PhaseRanges::default();
        (code, output.lines().map(|line| decode_line(&ranges, line)).collect())
    }

    #[tokio::test]
    async fn test_helper_runs_request_and_ends_with_result() {
        let temp = TempDir::new().unwrap();
        std::fs::write(temp.path().join("myapp"), b"old").unwrap();
        std::fs::write(temp.path().join("myapp.new"), b"new").unwrap();
        let request = UpdateRequest::new(
            temp.path().join("myapp"),
            temp.path().join("myapp.new"),
            temp.path().join("backups"),
            temp.path(),
        )
        .with_version("1.1.0");
        let request_file = temp.path().join("update_info.json");
        request.write_to(&request_file).await.unwrap();

        let (code, lines) = serve_to_string(&request_file).await;

        assert_eq!(code, 0);
        assert_eq!(std::fs::read(temp.path().join("myapp")).unwrap(), b"new");
        assert!(lines.iter().any(|line| matches!(line, ChannelLine::Progress(_))));
        let Some(ChannelLine::Result(response)) = lines.last() else {
            panic!("last line must be the result, got {lines:?}");
        };
        let backup = response.clone().into_result().unwrap().unwrap();
        assert_eq!(std::fs::read(backup).unwrap(), b"old");
    }

    #[tokio::test]
    async fn test_helper_skips_process_wait_when_request_says_so() {
        let temp = TempDir::new().unwrap();
        std::fs::write(temp.path().join("myapp"), b"old").unwrap();
        std::fs::write(temp.path().join("myapp.new"), b"new").unwrap();
        let request = UpdateRequest::new(
            temp.path().join("myapp"),
            temp.path().join("myapp.new"),
            temp.path().join("backups"),
            temp.path(),
        )
        .with_process_wait(false);
        let request_file = temp.path().join("update_info.json");
        request.write_to(&request_file).await.unwrap();

        let platform = Arc::new(FakePlatform::new());
        platform.add_stubborn_process("myapp", false);
        let (code, _) = serve_with(platform.clone(), &request_file).await;

        assert_eq!(code, 0);
        assert_eq!(platform.terminate_calls(), 0);
        assert_eq!(std::fs::read(temp.path().join("myapp")).unwrap(), b"new");
    }

    #[tokio::test]
    async fn test_unreadable_request_reports_failure() {
        let temp = TempDir::new().unwrap();
        let request_file = temp.path().join("update_info.json");
        std::fs::write(&request_file, b"{\"schema_version\": 7}").unwrap();

        let (code, lines) = serve_to_string(&request_file).await;

        assert_eq!(code, 1);
        assert_eq!(lines.len(), 1);
        let ChannelLine::Result(response) = &lines[0] else {
            panic!("expected result line, got {lines:?}");
        };
        assert!(matches!(
            response.clone().into_result(),
            Err(UpdateError::SchemaMismatch { found: 7, .. })
        ));
    }

    #[tokio::test]
    async fn test_watchdog_fires_when_request_file_is_removed() {
        let temp = TempDir::new().unwrap();
        let request_file = temp.path().join("update_info.json");
        std::fs::write(&request_file, b"{}").unwrap();
        let cancel = CancelToken::new();

        let handle = tokio::spawn(watchdog(
            Some(std::process::id()),
            request_file.clone(),
            Duration::from_millis(10),
            cancel.clone(),
        ));
        std::fs::remove_file(&request_file).unwrap();

        tokio::time::timeout(Duration::from_secs(5), handle).await.unwrap().unwrap();
        assert!(cancel.is_cancelled());
    }
}
