//! Event sinks: where log lines and progress events go.
//!
//! Sinks are fire-and-forget and must never block the orchestrator. A run without an
//! explicit sink reports through [`TracingSink`]. [`ProgressEmitter`] wraps a sink for one run,
//! maps phase-local progress onto the overall scale and keeps percentages from moving
//! backwards within a phase.

use crate::progress::{PhaseRanges, UpdatePhase, UpdateProgress};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tracing::{debug, info};

/// Receiver of log lines and progress events.
pub trait EventSink: Send + Sync {
    fn emit_log(&self, message: &str);
    fn emit_progress(&self, progress: &UpdateProgress);
}

/// Discards everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopSink;

impl EventSink for NoopSink {
    fn emit_log(&self, _message: &str) {}
    fn emit_progress(&self, _progress: &UpdateProgress) {}
}

/// Forwards events to `tracing`.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl EventSink for TracingSink {
    fn emit_log(&self, message: &str) {
        info!(target: "hotupdater::events", "{message}");
    }

    fn emit_progress(&self, progress: &UpdateProgress) {
        debug!(
            target: "hotupdater::events",
            "[{}] {}% {}{}",
            progress.phase,
            progress.percentage,
            progress.message,
            progress.detail.as_deref().map(|d| format!(" ({d})")).unwrap_or_default()
        );
    }
}

/// Event as delivered through a [`ChannelSink`].
#[derive(Debug, Clone, PartialEq)]
pub enum UpdateEvent {
    Log(String),
    Progress(UpdateProgress),
}

/// Pushes events into an unbounded channel, for consumers that want a stream.
#[derive(Debug, Clone)]
pub struct ChannelSink {
    tx: mpsc::UnboundedSender<UpdateEvent>,
}

impl ChannelSink {
    #[must_use]
    pub fn new() -> (Self, mpsc::UnboundedReceiver<UpdateEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl EventSink for ChannelSink {
    fn emit_log(&self, message: &str) {
        // A closed receiver means nobody is listening any more.
        let _ = self.tx.send(UpdateEvent::Log(message.to_string()));
    }

    fn emit_progress(&self, progress: &UpdateProgress) {
        let _ = self.tx.send(UpdateEvent::Progress(progress.clone()));
    }
}

/// Sends every event to several sinks.
#[derive(Clone, Default)]
pub struct FanoutSink {
    sinks: Vec<Arc<dyn EventSink>>,
}

impl FanoutSink {
    #[must_use]
    pub fn new(sinks: Vec<Arc<dyn EventSink>>) -> Self {
        Self { sinks }
    }
}

impl EventSink for FanoutSink {
    fn emit_log(&self, message: &str) {
        for sink in &self.sinks {
            sink.emit_log(message);
        }
    }

    fn emit_progress(&self, progress: &UpdateProgress) {
        for sink in &self.sinks {
            sink.emit_progress(progress);
        }
    }
}

/// Per-run progress reporter.
#[derive(Clone)]
pub struct ProgressEmitter {
    sink: Arc<dyn EventSink>,
    ranges: PhaseRanges,
    last: Arc<Mutex<Option<(UpdatePhase, u8)>>>,
}

impl ProgressEmitter {
    pub fn new(sink: Arc<dyn EventSink>, ranges: PhaseRanges) -> Self {
        Self {
            sink,
            ranges,
            last: Arc::new(Mutex::new(None)),
        }
    }

    #[must_use]
    pub const fn ranges(&self) -> &PhaseRanges {
        &self.ranges
    }

    pub fn log(&self, message: impl AsRef<str>) {
        self.sink.emit_log(message.as_ref());
    }

    /// Announce a phase at its starting percentage.
    pub fn phase_started(&self, phase: UpdatePhase, detail: Option<&str>) {
        let mut progress = UpdateProgress::new(phase, self.ranges.range(phase).start);
        if let Some(detail) = detail {
            progress = progress.with_detail(detail);
        }
        self.forward(progress);
    }

    /// Report `current / total` within a phase.
    pub fn phase_progress(
        &self,
        phase: UpdatePhase,
        current: u64,
        total: u64,
        rate: Option<f64>,
        detail: Option<&str>,
    ) {
        let mut progress = UpdateProgress::new(phase, self.ranges.calculate(phase, current, total));
        if let Some(detail) = detail {
            progress = progress.with_detail(detail);
        }
        if let Some(rate) = rate {
            progress = progress.with_rate(rate);
        }
        self.forward(progress);
    }

    /// Emit a progress event, holding its percentage at or above the last one seen for
    /// the same phase.
    pub fn forward(&self, mut progress: UpdateProgress) {
        if let Ok(mut last) = self.last.lock() {
            if let Some((phase, pct)) = *last {
                if phase == progress.phase && progress.percentage < pct {
                    progress.percentage = pct;
                }
            }
            *last = Some((progress.phase, progress.percentage));
        }
        self.sink.emit_progress(&progress);
    }

    /// Terminal 100% event.
    pub fn complete(&self, detail: &str) {
        self.forward(UpdateProgress::new(UpdatePhase::Complete, 100).with_detail(detail));
    }
}
