//! Process lifecycle monitor.
//!
//! Before the target is replaced, the previous instance of the application has to be
//! gone. [`ProcessMonitor::wait_for_exit`] polls for it, forces termination once when a
//! deadline passes, and then waits a short grace period so the OS can release the
//! executable's file handles.

use crate::config::ProcessWaitConfig;
use crate::core::UpdateError;
use crate::platform::Platform;
use std::sync::Arc;
use tokio::time::{Instant, sleep};
use tracing::{debug, info, warn};

/// Waits for named processes to exit.
#[derive(Clone)]
pub struct ProcessMonitor {
    platform: Arc<dyn Platform>,
    config: ProcessWaitConfig,
    ignored: Vec<u32>,
}

impl ProcessMonitor {
    pub fn new(platform: Arc<dyn Platform>, config: ProcessWaitConfig) -> Self {
        Self {
            platform,
            config,
            ignored: Vec::new(),
        }
    }

    /// Never count these pids as running, e.g. the process that requested the update.
    #[must_use]
    pub fn with_ignored_pids(mut self, pids: impl IntoIterator<Item = u32>) -> Self {
        self.ignored.extend(pids);
        self
    }

    /// Exact-name liveness check.
    pub async fn is_process_running(&self, name: &str) -> Result<bool, UpdateError> {
        self.platform
            .find_process(name)
            .await
            .map(|pids| pids.iter().any(|pid| !self.ignored.contains(pid)))
            .map_err(|e| UpdateError::ProcessTermination {
                name: name.to_string(),
                reason: format!("Failed to query the process list: {e:#}"),
            })
    }

    /// Wait until no process named `name` is running.
    ///
    /// Polls every `poll_interval`. If the process is still alive at `deadline`, it is
    /// terminated exactly once and re-checked after `confirm_delay`. Every successful
    /// return is followed by the handle-release grace period.
    pub async fn wait_for_exit(&self, name: &str) -> Result<(), UpdateError> {
        let deadline = Instant::now() + self.config.deadline();

        loop {
            if !self.is_process_running(name).await? {
                debug!("Process {name} has exited");
                return self.grace().await;
            }
            if Instant::now() >= deadline {
                break;
            }
            sleep(self.config.poll_interval()).await;
        }

        warn!("Process {name} still running after {:?}, forcing termination", self.config.deadline());
        if let Err(e) = self.platform.terminate_process(name, &self.ignored).await {
            warn!("Forced termination of {name} reported: {e:#}");
        }
        sleep(self.config.confirm_delay()).await;

        if self.is_process_running(name).await? {
            return Err(UpdateError::ProcessTermination {
                name: name.to_string(),
                reason: "still running after forced termination".to_string(),
            });
        }

        info!("Process {name} terminated");
        self.grace().await
    }

    async fn grace(&self) -> Result<(), UpdateError> {
        sleep(self.config.grace_period()).await;
        Ok(())
    }
}
