//! Writing side of the helper channel.

use super::protocol::HelperResponse;
use crate::events::EventSink;
use crate::progress::{PhaseRanges, UpdateProgress, encode_progress_line};
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Event sink that encodes events as channel lines.
///
/// Lines are queued and written by a background task, so emitting never waits on the
/// reader. [`ChannelWriter::finish`] queues the terminal status line and waits until
/// everything has been flushed.
#[derive(Clone)]
pub struct ChannelWriter {
    tx: mpsc::UnboundedSender<Option<String>>,
    ranges: PhaseRanges,
}

impl ChannelWriter {
    pub fn spawn<W>(writer: W, ranges: PhaseRanges) -> (Self, JoinHandle<std::io::Result<()>>)
    where
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let (tx, mut rx) = mpsc::unbounded_channel::<Option<String>>();
        let task = tokio::spawn(async move {
            let mut writer = writer;
            // `None` closes the channel even while other clones are alive.
            while let Some(Some(line)) = rx.recv().await {
                writer.write_all(line.as_bytes()).await?;
                writer.write_all(b"\n").await?;
                writer.flush().await?;
            }
            writer.shutdown().await
        });
        (
            Self {
                tx,
                ranges,
            },
            task,
        )
    }

    fn send(&self, line: String) {
        // The parent may already be gone; the watchdog deals with that.
        let _ = self.tx.send(Some(line));
    }

    /// Queue the terminal status line and wait for the writer to drain.
    pub async fn finish(
        self,
        response: &HelperResponse,
        task: JoinHandle<std::io::Result<()>>,
    ) -> std::io::Result<()> {
        self.send(response.encode());
        let _ = self.tx.send(None);
        task.await.map_err(std::io::Error::other)?
    }
}

impl EventSink for ChannelWriter {
    fn emit_log(&self, message: &str) {
        for line in message.lines() {
            self.send(line.to_string());
        }
    }

    fn emit_progress(&self, progress: &UpdateProgress) {
        let local = self.ranges.to_local_percent(progress.phase, progress.percentage);
        self.send(encode_progress_line(progress.phase, local, progress.detail.as_deref()));
    }
}
