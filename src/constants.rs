//! Global constants used throughout the updater.
//!
//! Timing values here are the defaults for [`crate::config::UpdaterConfig`];
//! every loop that sleeps reads its bound from the configuration so tests can
//! shrink them.

use std::time::Duration;

/// Sentinel prefix for progress lines on the helper channel.
pub const PROGRESS_PREFIX: &str = "@PROGRESS@";

/// Sentinel prefix for the helper's terminal status line.
pub const RESULT_PREFIX: &str = "@RESULT@";

/// Version of the persisted request and helper response schema.
///
/// Bumped whenever a field is added, removed or changes meaning. A parent and a
/// helper built from different schema versions refuse to talk to each other.
pub const SCHEMA_VERSION: u32 = 1;

/// Prefix shared by every backup file name.
pub const BACKUP_PREFIX: &str = "backup_";

/// `chrono` format of the timestamp embedded in backup names.
pub const BACKUP_TIME_FORMAT: &str = "%Y%m%d_%H%M%S";

/// Number of delete attempts before giving up on a locked target.
pub const DEFAULT_DELETE_ATTEMPTS: u32 = 5;

/// Pause between delete attempts.
pub const DEFAULT_DELETE_INTERVAL: Duration = Duration::from_secs(1);

/// How long a previous instance gets to exit before it is force-terminated.
pub const DEFAULT_EXIT_DEADLINE: Duration = Duration::from_secs(5);

/// Interval between liveness polls.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Delay between a forced termination and the confirming liveness check.
pub const DEFAULT_CONFIRM_DELAY: Duration = Duration::from_secs(1);

/// Pause after exit detection so the OS can release file handles.
///
/// Empirical margin, not a guarantee.
pub const DEFAULT_HANDLE_GRACE: Duration = Duration::from_secs(1);

/// Interval of the elevated helper's parent/request-file watchdog.
pub const DEFAULT_WATCHDOG_INTERVAL: Duration = Duration::from_secs(30);

/// Channel silence after which the parent logs a warning.
pub const DEFAULT_SILENCE_WARNING: Duration = Duration::from_secs(30);

/// Name of the serialized request inside the update directory.
pub const DEFAULT_REQUEST_FILE_NAME: &str = "update_info.json";

/// Name of the FIFO inside the update directory.
pub const DEFAULT_PIPE_NAME: &str = "updater.pipe";

/// Number of trailing helper log lines kept for diagnostics.
pub const DEFAULT_TAIL_LINES: usize = 20;

/// Mode applied recursively to an installed bundle.
pub const DEFAULT_BUNDLE_MODE: u32 = 0o755;

/// Delay before checking that a relaunched application is alive.
pub const RELAUNCH_CONFIRM_DELAY: Duration = Duration::from_secs(2);

/// Name of the single-instance lock file inside the update directory.
pub const UPDATE_LOCK_FILE: &str = ".update.lock";

/// First delay between attempts to take the single-instance lock.
pub const STARTING_BACKOFF_DELAY_MS: u64 = 10;

/// Upper bound for the lock retry delay.
pub const MAX_BACKOFF_DELAY_MS: u64 = 500;

/// How long the CLI waits for the single-instance lock.
pub const UPDATE_LOCK_TIMEOUT: Duration = Duration::from_secs(2);
