//! Terminal rendering of update events.

use crate::events::EventSink;
use crate::progress::UpdateProgress;
use indicatif::{ProgressBar, ProgressStyle};

/// Environment variable that disables the progress bar.
pub const NO_PROGRESS_ENV: &str = "HOTUPDATER_NO_PROGRESS";

fn is_progress_disabled() -> bool {
    std::env::var(NO_PROGRESS_ENV).is_ok()
}

fn bar_style() -> ProgressStyle {
    ProgressStyle::default_bar()
        .template("{prefix:.bold.cyan} [{bar:40.cyan/blue}] {pos:>3}% {msg}")
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("━╸━")
}

/// Draws a single 0-100 bar and prints log lines above it.
pub struct ProgressRenderer {
    bar: ProgressBar,
    quiet: bool,
}

impl ProgressRenderer {
    #[must_use]
    pub fn new(no_progress: bool, quiet: bool) -> Self {
        let bar = if no_progress || quiet || is_progress_disabled() {
            ProgressBar::hidden()
        } else {
            let bar = ProgressBar::new(100);
            bar.set_style(bar_style());
            bar
        };
        Self {
            bar,
            quiet,
        }
    }

    pub fn finish(&self) {
        self.bar.finish_and_clear();
    }
}

impl EventSink for ProgressRenderer {
    fn emit_log(&self, message: &str) {
        if self.quiet {
            return;
        }
        self.bar.suspend(|| eprintln!("  {message}"));
    }

    fn emit_progress(&self, progress: &UpdateProgress) {
        self.bar.set_prefix(progress.phase.to_string());
        self.bar.set_position(u64::from(progress.percentage));

        let mut message = progress.message.clone();
        if let Some(detail) = &progress.detail {
            message.push_str(": ");
            message.push_str(detail);
        }
        if let Some(rate) = progress.rate {
            message.push_str(&format!(" ({rate:.1} MB/s)"));
        }
        self.bar.set_message(message);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::progress::UpdatePhase;

    #[test]
    fn test_hidden_renderer_tracks_position() {
        let renderer = ProgressRenderer::new(true, false);
        renderer.emit_progress(&UpdateProgress::new(UpdatePhase::Backup, 80).with_detail("copy"));
        assert_eq!(renderer.bar.position(), 80);
        renderer.emit_log("hello");
        renderer.finish();
    }

    #[test]
    #[serial_test::serial]
    fn test_env_var_hides_bar() {
        // SAFETY: serialized with every other test that touches the environment.
        unsafe { std::env::set_var(NO_PROGRESS_ENV, "1") };
        let renderer = ProgressRenderer::new(false, false);
        unsafe { std::env::remove_var(NO_PROGRESS_ENV) };

        assert!(renderer.bar.is_hidden());
    }
}
