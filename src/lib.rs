//! hotupdater - self-update engine for desktop applications
//!
//! Replaces an installed application (a single executable or a macOS `.app` bundle)
//! with a new version while it is not running, keeping a timestamped backup and rolling
//! back automatically when installation or verification fails.
//!
//! # Architecture Overview
//!
//! One update run goes through a fixed sequence of phases, each owning a slice of a
//! single 0-100 progress scale:
//!
//! ```text
//! Download -> PreCheck -> Backup -> Install -> Verify -> Complete
//! ```
//!
//! When the target is not writable by the current user, PreCheck through Complete run
//! in a second, elevated copy of this executable. It reads the serialized request from
//! disk and streams progress back over a line protocol.
//!
//! # Core Modules
//!
//! ## Pipeline
//! - [`orchestrator`] - The phase state machine and its error classification
//! - [`request`] - The immutable description of one update attempt
//! - [`progress`] - Phases, phase ranges and the progress line encoding
//! - [`events`] - Event sinks for logs and progress
//!
//! ## Mutation
//! - [`replace`] - File and bundle replacement, verification and rollback
//! - [`backup`] - Backup naming, the backup catalog and manual restore
//! - [`install`] - Pluggable install steps (built-in swap or external script)
//! - [`download`] - The download capability
//!
//! ## Platform
//! - [`platform`] - Elevation, process lookup and termination per OS
//! - [`process`] - Waiting for the running application to exit
//! - [`helper`] - The privilege-separated helper and its channel protocol
//!
//! ## Supporting Modules
//! - [`cli`] - Command-line interface
//! - [`config`] - TOML configuration with test-friendly timings
//! - [`core`] - Error types, user-facing error context and cancellation
//! - [`constants`] - Default timings, file names and protocol sentinels
//!
//! # Example
//!
//! ```rust,no_run
//! use hotupdater::config::UpdaterConfig;
//! use hotupdater::core::CancelToken;
//! use hotupdater::orchestrator::UpdateOrchestrator;
//! use hotupdater::platform::SystemPlatform;
//! use hotupdater::request::UpdateRequest;
//! use std::sync::Arc;
//!
//! # async fn example() -> anyhow::Result<()> {
//! let config = UpdaterConfig::load().await?;
//! let platform = Arc::new(SystemPlatform::new(&config));
//! let request = UpdateRequest::new(
//!     "/usr/local/bin/myapp",
//!     "/tmp/updates/myapp-2.0.0",
//!     "/var/backups/myapp",
//!     "/tmp/updates",
//! )
//! .with_version("2.0.0");
//!
//! let report = UpdateOrchestrator::new(config, platform)
//!     .run(&request, &CancelToken::new())
//!     .await?;
//! println!("backup kept at {:?}", report.backup_path);
//! # Ok(())
//! # }
//! ```

pub mod backup;
pub mod cli;
pub mod config;
pub mod constants;
pub mod core;
pub mod download;
pub mod events;
pub mod helper;
pub mod install;
pub mod orchestrator;
pub mod platform;
pub mod process;
pub mod progress;
pub mod replace;
pub mod request;

#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;
