//! Configuration for update runs.
//!
//! [`UpdaterConfig`] is built once per run and passed by reference to every component.
//! Nothing in the crate keeps configuration in global state.
//!
//! # File Format
//!
//! ```toml
//! verify_checksum = true
//!
//! [retry]
//! delete_attempts = 5
//! delete_interval_ms = 1000
//!
//! [process]
//! deadline_ms = 5000
//! poll_interval_ms = 500
//! confirm_delay_ms = 1000
//! grace_period_ms = 1000
//!
//! [helper]
//! watchdog_interval_ms = 30000
//! silence_warning_ms = 30000
//! request_file_name = "update_info.json"
//! pipe_name = "updater.pipe"
//! tail_lines = 20
//!
//! [bundle]
//! mode = 493          # 0o755
//! owner_group = "staff"
//!
//! [ui]
//! grace_ms = 0
//! ```
//!
//! # Location
//!
//! `HOTUPDATER_CONFIG_PATH` if set, otherwise `~/.hotupdater/config.toml`
//! (`%LOCALAPPDATA%\hotupdater\config.toml` on Windows). A missing file means defaults.

use crate::constants::{
    DEFAULT_BUNDLE_MODE, DEFAULT_CONFIRM_DELAY, DEFAULT_DELETE_ATTEMPTS, DEFAULT_DELETE_INTERVAL,
    DEFAULT_EXIT_DEADLINE, DEFAULT_HANDLE_GRACE, DEFAULT_PIPE_NAME, DEFAULT_POLL_INTERVAL,
    DEFAULT_REQUEST_FILE_NAME, DEFAULT_SILENCE_WARNING, DEFAULT_TAIL_LINES,
    DEFAULT_WATCHDOG_INTERVAL,
};
use crate::progress::PhaseRanges;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::fs;

/// Environment variable overriding the configuration file location.
pub const CONFIG_PATH_ENV: &str = "HOTUPDATER_CONFIG_PATH";

const fn millis(duration: Duration) -> u64 {
    duration.as_millis() as u64
}

/// Bounded retry of the target delete.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    pub delete_attempts: u32,
    pub delete_interval_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            delete_attempts: DEFAULT_DELETE_ATTEMPTS,
            delete_interval_ms: millis(DEFAULT_DELETE_INTERVAL),
        }
    }
}

impl RetryPolicy {
    #[must_use]
    pub const fn delete_interval(&self) -> Duration {
        Duration::from_millis(self.delete_interval_ms)
    }
}

/// Timing of the process lifecycle monitor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProcessWaitConfig {
    pub deadline_ms: u64,
    pub poll_interval_ms: u64,
    pub confirm_delay_ms: u64,
    pub grace_period_ms: u64,
}

impl Default for ProcessWaitConfig {
    fn default() -> Self {
        Self {
            deadline_ms: millis(DEFAULT_EXIT_DEADLINE),
            poll_interval_ms: millis(DEFAULT_POLL_INTERVAL),
            confirm_delay_ms: millis(DEFAULT_CONFIRM_DELAY),
            grace_period_ms: millis(DEFAULT_HANDLE_GRACE),
        }
    }
}

impl ProcessWaitConfig {
    #[must_use]
    pub const fn deadline(&self) -> Duration {
        Duration::from_millis(self.deadline_ms)
    }

    #[must_use]
    pub const fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    #[must_use]
    pub const fn confirm_delay(&self) -> Duration {
        Duration::from_millis(self.confirm_delay_ms)
    }

    #[must_use]
    pub const fn grace_period(&self) -> Duration {
        Duration::from_millis(self.grace_period_ms)
    }
}

/// Settings for the elevated helper and its channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HelperConfig {
    pub watchdog_interval_ms: u64,
    pub silence_warning_ms: u64,
    pub request_file_name: String,
    pub pipe_name: String,
    /// Trailing helper log lines kept for error reports.
    pub tail_lines: usize,
}

impl Default for HelperConfig {
    fn default() -> Self {
        Self {
            watchdog_interval_ms: millis(DEFAULT_WATCHDOG_INTERVAL),
            silence_warning_ms: millis(DEFAULT_SILENCE_WARNING),
            request_file_name: DEFAULT_REQUEST_FILE_NAME.to_string(),
            pipe_name: DEFAULT_PIPE_NAME.to_string(),
            tail_lines: DEFAULT_TAIL_LINES,
        }
    }
}

impl HelperConfig {
    #[must_use]
    pub const fn watchdog_interval(&self) -> Duration {
        Duration::from_millis(self.watchdog_interval_ms)
    }

    #[must_use]
    pub const fn silence_warning(&self) -> Duration {
        Duration::from_millis(self.silence_warning_ms)
    }
}

/// Permission and ownership reset applied to installed bundles.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BundleConfig {
    pub mode: u32,
    /// Group for the ownership reset. `None` keeps the invoking user's primary group.
    pub owner_group: Option<String>,
}

impl Default for BundleConfig {
    fn default() -> Self {
        Self {
            mode: DEFAULT_BUNDLE_MODE,
            owner_group: None,
        }
    }
}

/// Presentation delays; zero in headless runs.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct UiConfig {
    pub grace_ms: u64,
}

impl UiConfig {
    #[must_use]
    pub const fn grace(&self) -> Duration {
        Duration::from_millis(self.grace_ms)
    }
}

/// Complete configuration for one update run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct UpdaterConfig {
    pub retry: RetryPolicy,
    pub process: ProcessWaitConfig,
    pub helper: HelperConfig,
    pub bundle: BundleConfig,
    pub ui: UiConfig,
    pub phase_ranges: PhaseRanges,
    /// Compare the installed file's SHA-256 against the new artifact during Verify.
    pub verify_checksum: bool,
}

impl Default for UpdaterConfig {
    fn default() -> Self {
        Self {
            retry: RetryPolicy::default(),
            process: ProcessWaitConfig::default(),
            helper: HelperConfig::default(),
            bundle: BundleConfig::default(),
            ui: UiConfig::default(),
            phase_ranges: PhaseRanges::default(),
            verify_checksum: true,
        }
    }
}

impl UpdaterConfig {
    /// Load from the default location, or defaults when no file exists.
    pub async fn load() -> Result<Self> {
        let path = Self::default_path()?;
        if path.exists() {
            Self::load_from(&path).await
        } else {
            Ok(Self::default())
        }
    }

    /// Load from an explicit path, or the default location when `None`.
    pub async fn load_with_optional(path: Option<&str>) -> Result<Self> {
        match path {
            Some(path) => Self::load_from(&expand_path(path)?).await,
            None => Self::load().await,
        }
    }

    pub async fn load_from(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .await
            .with_context(|| format!("Failed to read updater config from {}", path.display()))?;

        toml::from_str(&content)
            .with_context(|| format!("Failed to parse updater config from {}", path.display()))
    }

    pub fn default_path() -> Result<PathBuf> {
        if let Ok(path) = std::env::var(CONFIG_PATH_ENV) {
            return expand_path(&path);
        }

        let config_dir = if cfg!(target_os = "windows") {
            dirs::data_local_dir()
                .ok_or_else(|| anyhow::anyhow!("Unable to determine local data directory"))?
                .join("hotupdater")
        } else {
            dirs::home_dir()
                .ok_or_else(|| anyhow::anyhow!("Unable to determine home directory"))?
                .join(".hotupdater")
        };

        Ok(config_dir.join("config.toml"))
    }

    /// Configuration with every wait shrunk to a few milliseconds.
    #[must_use]
    pub fn for_tests() -> Self {
        Self {
            retry: RetryPolicy {
                delete_attempts: DEFAULT_DELETE_ATTEMPTS,
                delete_interval_ms: 1,
            },
            process: ProcessWaitConfig {
                deadline_ms: 40,
                poll_interval_ms: 5,
                confirm_delay_ms: 1,
                grace_period_ms: 1,
            },
            helper: HelperConfig {
                watchdog_interval_ms: 20,
                silence_warning_ms: 200,
                ..HelperConfig::default()
            },
            ..Self::default()
        }
    }
}

/// Expand `~` and environment variables in a user-supplied path.
pub fn expand_path(path: &str) -> Result<PathBuf> {
    let expanded = shellexpand::full(path)
        .with_context(|| format!("Failed to expand path: {path}"))?;
    Ok(PathBuf::from(expanded.into_owned()))
}
