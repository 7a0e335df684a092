//! Parent side of the helper protocol: start the elevated helper and follow its channel.

use super::protocol::{ChannelLine, HelperResponse, decode_line};
use crate::config::HelperConfig;
use crate::core::{CancelToken, UpdateError};
use crate::events::ProgressEmitter;
use crate::platform::{ElevatedHelper, HelperChannel, HelperInvocation, Platform};
use crate::request::UpdateRequest;
use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Child;
use tracing::{debug, info, warn};

type ChannelReader = Pin<Box<dyn AsyncRead + Send>>;

/// Bounded buffer of the most recent helper output.
#[derive(Debug, Clone)]
pub struct Tail {
    lines: Arc<Mutex<VecDeque<String>>>,
    capacity: usize,
}

impl Tail {
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            lines: Arc::new(Mutex::new(VecDeque::with_capacity(capacity))),
            capacity,
        }
    }

    pub fn push(&self, line: &str) {
        if self.capacity == 0 {
            return;
        }
        if let Ok(mut lines) = self.lines.lock() {
            if lines.len() == self.capacity {
                lines.pop_front();
            }
            lines.push_back(line.to_string());
        }
    }

    #[must_use]
    pub fn snapshot(&self) -> Vec<String> {
        self.lines.lock().map(|lines| lines.iter().cloned().collect()).unwrap_or_default()
    }
}

/// Starts the elevated helper for a request and turns its output into events.
pub struct HelperLauncher {
    platform: Arc<dyn Platform>,
    config: HelperConfig,
    executable: PathBuf,
    config_file: Option<PathBuf>,
}

impl HelperLauncher {
    pub fn new(platform: Arc<dyn Platform>, config: HelperConfig, executable: PathBuf) -> Self {
        Self {
            platform,
            config,
            executable,
            config_file: None,
        }
    }

    /// Forward a configuration file to the helper.
    #[must_use]
    pub fn with_config_file(mut self, path: Option<PathBuf>) -> Self {
        self.config_file = path;
        self
    }

    /// Run the helper to completion.
    ///
    /// Returns the backup path the helper reported. The request file and pipe are
    /// removed afterwards, whatever the outcome.
    pub async fn run(
        &self,
        request: &UpdateRequest,
        emitter: &ProgressEmitter,
        cancel: &CancelToken,
    ) -> Result<Option<PathBuf>, UpdateError> {
        let request_file = request.update_dir().join(&self.config.request_file_name);
        let pipe_path = request.update_dir().join(&self.config.pipe_name);

        let result = self.run_inner(request, &request_file, &pipe_path, emitter, cancel).await;

        for path in [&request_file, &pipe_path] {
            if let Err(e) = tokio::fs::remove_file(path).await {
                if e.kind() != std::io::ErrorKind::NotFound {
                    debug!("Failed to clean up {}: {e}", path.display());
                }
            }
        }
        result
    }

    async fn run_inner(
        &self,
        request: &UpdateRequest,
        request_file: &Path,
        pipe_path: &Path,
        emitter: &ProgressEmitter,
        cancel: &CancelToken,
    ) -> Result<Option<PathBuf>, UpdateError> {
        request.write_to(request_file).await.map_err(|e| {
            UpdateError::communication(format!("Failed to write update request: {e:#}"))
        })?;

        let invocation = HelperInvocation {
            executable: self.executable.clone(),
            request_file: request_file.to_path_buf(),
            pipe_path: pipe_path.to_path_buf(),
            config_file: self.config_file.clone(),
        };
        info!("Starting elevated update helper");
        let ElevatedHelper {
            mut child,
            channel,
            denial_check,
        } = self.platform.elevate(&invocation).await?;

        let tail = Tail::new(self.config.tail_lines);
        let stderr_task = child.stderr.take().map(|stderr| {
            let tail = tail.clone();
            tokio::spawn(async move {
                let mut collected = String::new();
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    debug!(target: "hotupdater::helper", "{line}");
                    tail.push(&line);
                    collected.push_str(&line);
                    collected.push('\n');
                }
                collected
            })
        });

        let reader = match channel {
            HelperChannel::Stdout => match child.stdout.take() {
                Some(stdout) => Some(Box::pin(stdout) as ChannelReader),
                None => return Err(UpdateError::communication("Helper stdout was not captured")),
            },
            HelperChannel::Fifo(path) => open_fifo(&path, &mut child, cancel).await?,
            #[cfg(windows)]
            HelperChannel::PipeServer(server) => accept_pipe(server, &mut child, cancel).await?,
        };

        let response = match reader {
            Some(reader) => {
                let consumed = consume_channel(
                    BufReader::new(reader),
                    emitter,
                    &tail,
                    self.config.silence_warning(),
                    cancel,
                )
                .await;
                match consumed {
                    Ok(response) => response,
                    Err(e) => {
                        let _ = child.start_kill();
                        let _ = tokio::fs::remove_file(request_file).await;
                        return Err(e);
                    }
                }
            }
            None => None,
        };

        let status = child
            .wait()
            .await
            .map_err(|e| UpdateError::communication(format!("Failed to wait for helper: {e}")))?;
        let stderr = match stderr_task {
            Some(task) => task.await.unwrap_or_default(),
            None => String::new(),
        };
        debug!("Update helper exited with {status}");

        if let Some(response) = response {
            return response.into_result();
        }
        if let Some(reason) = denial_check(status.code(), &stderr) {
            return Err(UpdateError::ElevationDenied {
                reason,
            });
        }
        if status.success() {
            Err(UpdateError::communication("Helper channel closed before the final status line"))
        } else {
            Err(UpdateError::HelperFailed {
                code: status.code(),
                last_lines: tail.snapshot(),
            })
        }
    }
}

/// Open the read end of the helper's named pipe.
///
/// Opening blocks until the helper opens the write end. If the helper exits first (for
/// example because elevation was refused), the pending open is released and `None` is
/// returned.
async fn open_fifo(
    path: &Path,
    child: &mut Child,
    cancel: &CancelToken,
) -> Result<Option<ChannelReader>, UpdateError> {
    let open_path = path.to_path_buf();
    let mut open = tokio::task::spawn_blocking(move || std::fs::File::open(open_path));

    tokio::select! {
        opened = &mut open => {
            let file = opened
                .map_err(|e| UpdateError::communication(format!("Pipe open task failed: {e}")))?
                .map_err(|e| UpdateError::communication(format!("Failed to open {}: {e}", path.display())))?;
            Ok(Some(Box::pin(tokio::fs::File::from_std(file)) as ChannelReader))
        }
        status = child.wait() => {
            debug!("Helper exited before opening the channel: {status:?}");
            release_fifo(path, open).await;
            Ok(None)
        }
        () = cancel.cancelled() => {
            let _ = child.start_kill();
            release_fifo(path, open).await;
            Err(UpdateError::Cancelled)
        }
    }
}

/// Wait for the helper to connect to the pipe server.
///
/// Like [`open_fifo`], a helper that exits without connecting yields `None`.
#[cfg(windows)]
async fn accept_pipe(
    server: tokio::net::windows::named_pipe::NamedPipeServer,
    child: &mut Child,
    cancel: &CancelToken,
) -> Result<Option<ChannelReader>, UpdateError> {
    let connected = tokio::select! {
        connected = server.connect() => connected,
        status = child.wait() => {
            debug!("Helper exited before connecting to the channel: {status:?}");
            return Ok(None);
        }
        () = cancel.cancelled() => {
            let _ = child.start_kill();
            return Err(UpdateError::Cancelled);
        }
    };
    connected.map_err(|e| UpdateError::communication(format!("Helper pipe connection failed: {e}")))?;
    Ok(Some(Box::pin(server) as ChannelReader))
}

/// Unblock a reader stuck in `open` by briefly opening the write end.
async fn release_fifo(
    path: &Path,
    pending: tokio::task::JoinHandle<std::io::Result<std::fs::File>>,
) {
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        let _ = std::fs::OpenOptions::new()
            .write(true)
            .custom_flags(libc::O_NONBLOCK)
            .open(path);
    }
    #[cfg(not(unix))]
    let _ = path;
    let _ = pending.await;
}

/// Read channel lines until EOF or the terminal status line.
///
/// Progress lines go to the emitter, log lines go to the emitter and the tail. Silence
/// longer than `silence_warning` is logged and otherwise ignored; cancellation ends the
/// read with [`UpdateError::Cancelled`].
pub async fn consume_channel<R>(
    reader: R,
    emitter: &ProgressEmitter,
    tail: &Tail,
    silence_warning: Duration,
    cancel: &CancelToken,
) -> Result<Option<HelperResponse>, UpdateError>
where
    R: AsyncBufRead + Unpin,
{
    let mut lines = reader.lines();
    let ranges = *emitter.ranges();

    loop {
        let next = tokio::select! {
            next = tokio::time::timeout(silence_warning, lines.next_line()) => next,
            () = cancel.cancelled() => return Err(UpdateError::Cancelled),
        };

        let line = match next {
            Err(_) => {
                warn!("No output from update helper for {silence_warning:?}, still waiting");
                continue;
            }
            // A disconnected Windows pipe reports end of stream this way.
            Ok(Err(e)) if e.kind() == std::io::ErrorKind::BrokenPipe => return Ok(None),
            Ok(Err(e)) => {
                return Err(UpdateError::communication(format!("Failed to read helper channel: {e}")));
            }
            Ok(Ok(None)) => return Ok(None),
            Ok(Ok(Some(line))) => line,
        };

        match decode_line(&ranges, &line) {
            ChannelLine::Progress(progress) => emitter.forward(progress),
            ChannelLine::Result(response) => return Ok(Some(response)),
            ChannelLine::Log(text) => {
                if !text.is_empty() {
                    tail.push(&text);
                    emitter.log(&text);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{ChannelSink, UpdateEvent};
    use crate::progress::{PhaseRanges, UpdatePhase};

    fn emitter() -> (ProgressEmitter, tokio::sync::mpsc::UnboundedReceiver<UpdateEvent>) {
        let (sink, rx) = ChannelSink::new();
        (ProgressEmitter::new(Arc::new(sink), PhaseRanges::default()), rx)
    }

    #[tokio::test]
    async fn test_consume_forwards_progress_and_logs() {
        let input = b"hello\n@PROGRESS@install|50|copy\n@RESULT@{\"schema_version\":1}\nafter\n";
        let (emitter, mut rx) = emitter();
        let tail = Tail::new(5);

        let response = consume_channel(
            &input[..],
            &emitter,
            &tail,
            Duration::from_secs(5),
            &CancelToken::new(),
        )
        .await
        .unwrap()
        .unwrap();
        assert!(response.into_result().is_ok());

        assert_eq!(rx.try_recv().unwrap(), UpdateEvent::Log("hello".into()));
        match rx.try_recv().unwrap() {
            UpdateEvent::Progress(p) => {
                assert_eq!(p.phase, UpdatePhase::Install);
                assert_eq!(p.percentage, 90);
            }
            other => panic!("unexpected {other:?}"),
        }
        assert!(rx.try_recv().is_err(), "nothing after the result line is read");
        assert_eq!(tail.snapshot(), vec!["hello".to_string()]);
    }

    #[tokio::test]
    async fn test_eof_without_result_is_none() {
        let (emitter, _rx) = emitter();
        let response = consume_channel(
            &b"partial output\n"[..],
            &emitter,
            &Tail::new(5),
            Duration::from_secs(5),
            &CancelToken::new(),
        )
        .await
        .unwrap();
        assert!(response.is_none());
    }

    #[tokio::test]
    async fn test_silence_is_only_a_warning() {
        let (mut writer, reader) = tokio::io::duplex(1024);
        let (emitter, _rx) = emitter();
        let feeder = tokio::spawn(async move {
            use tokio::io::AsyncWriteExt;
            tokio::time::sleep(Duration::from_millis(60)).await;
            writer.write_all(b"@RESULT@{\"schema_version\":1}\n").await.unwrap();
        });

        let response = consume_channel(
            BufReader::new(reader),
            &emitter,
            &Tail::new(5),
            Duration::from_millis(10),
            &CancelToken::new(),
        )
        .await
        .unwrap();
        assert!(response.is_some());
        feeder.await.unwrap();
    }

    #[tokio::test]
    async fn test_cancel_stops_reading() {
        let (_writer, reader) = tokio::io::duplex(1024);
        let (emitter, _rx) = emitter();
        let cancel = CancelToken::new();
        cancel.cancel();

        let err = consume_channel(
            BufReader::new(reader),
            &emitter,
            &Tail::new(5),
            Duration::from_secs(5),
            &cancel,
        )
        .await
        .unwrap_err();
        assert_eq!(err, UpdateError::Cancelled);
    }

    #[test]
    fn test_tail_keeps_latest_lines() {
        let tail = Tail::new(2);
        for line in ["a", "b", "c"] {
            tail.push(line);
        }
        assert_eq!(tail.snapshot(), vec!["b".to_string(), "c".to_string()]);
    }

    /// Reader that fails the way a disconnected Windows pipe does.
    struct Disconnected;

    impl AsyncRead for Disconnected {
        fn poll_read(
            self: Pin<&mut Self>,
            _cx: &mut std::task::Context<'_>,
            _buf: &mut tokio::io::ReadBuf<'_>,
        ) -> std::task::Poll<std::io::Result<()>> {
            std::task::Poll::Ready(Err(std::io::ErrorKind::BrokenPipe.into()))
        }
    }

    #[tokio::test]
    async fn test_broken_pipe_is_end_of_channel() {
        use tokio::io::AsyncReadExt;

        let (emitter, mut rx) = emitter();
        let tail = Tail::new(5);
        let reader = BufReader::new((&b"copying\n"[..]).chain(Disconnected));

        let response = consume_channel(reader, &emitter, &tail, Duration::from_secs(5), &CancelToken::new())
            .await
            .unwrap();
        assert!(response.is_none());
        assert_eq!(rx.try_recv().unwrap(), UpdateEvent::Log("copying".into()));
    }
}
