//! Error handling for the updater
//!
//! The error system follows two rules:
//! 1. **Strongly-typed errors** so callers can tell an ordinary rolled-back failure from
//!    the one state that can leave the application without a runnable binary
//! 2. **User-friendly messages** with recovery instructions for CLI users
//!
//! # Error Taxonomy
//!
//! - [`UpdateError::Validation`] - PreCheck failures, nothing was touched
//! - [`UpdateError::Backup`] - the backup copy could not be made, nothing to roll back
//! - [`UpdateError::InstallFailedRolledBack`] / [`UpdateError::VerifyFailedRolledBack`] -
//!   the update failed, the old version is back in place
//! - [`UpdateError::InstallFailedUnrecoverable`] / [`UpdateError::VerifyFailedUnrecoverable`] -
//!   the update failed *and* the restore failed
//! - [`UpdateError::ElevationDenied`], [`UpdateError::HelperCommunication`],
//!   [`UpdateError::HelperFailed`], [`UpdateError::SchemaMismatch`] - helper process problems
//! - [`UpdateError::ProcessTermination`] - the previous instance would not exit
//!
//! [`UpdateError`] is serializable: the elevated helper reports the exact kind back to the
//! parent inside its terminal status line, so a failure classified in the child keeps its
//! classification in the parent.
//!
//! # Examples
//!
//! ```rust,no_run
//! use hotupdater::core::{UpdateError, user_friendly_error};
//!
//! let err = UpdateError::InstallFailedRolledBack { cause: "disk full".into() };
//! let ctx = user_friendly_error(anyhow::Error::from(err));
//! ctx.display();
//! ```

use colored::Colorize;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Terminal failure of an update run.
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum UpdateError {
    #[error("Validation failed: {message}")]
    Validation {
        message: String,
    },

    #[error("Download failed: {message}")]
    Download {
        message: String,
    },

    #[error("Failed to create backup at {path}: {reason}")]
    Backup {
        path: String,
        reason: String,
    },

    #[error("Installation failed, previous version restored: {cause}")]
    InstallFailedRolledBack {
        cause: String,
    },

    #[error("Installation failed and the previous version could not be restored: {cause} (restore error: {restore})")]
    InstallFailedUnrecoverable {
        cause: String,
        restore: String,
    },

    #[error("Verification failed, previous version restored: {cause}")]
    VerifyFailedRolledBack {
        cause: String,
    },

    #[error("Verification failed and the previous version could not be restored: {cause} (restore error: {restore})")]
    VerifyFailedUnrecoverable {
        cause: String,
        restore: String,
    },

    #[error("Privilege elevation was denied: {reason}")]
    ElevationDenied {
        reason: String,
    },

    #[error("Lost contact with the update helper: {reason}")]
    HelperCommunication {
        reason: String,
    },

    #[error("Update helper exited with {}", exit_label(*.code))]
    HelperFailed {
        code: Option<i32>,
        last_lines: Vec<String>,
    },

    #[error("Process '{name}' would not exit: {reason}")]
    ProcessTermination {
        name: String,
        reason: String,
    },

    #[error("Update schema mismatch: expected version {expected}, found {found}")]
    SchemaMismatch {
        expected: u32,
        found: u32,
    },

    #[error("Update was cancelled")]
    Cancelled,
}

fn exit_label(code: Option<i32>) -> String {
    match code {
        Some(code) => format!("status {code}"),
        None => "no status (terminated by signal)".to_string(),
    }
}

/// How bad a failure is for the user.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Severity {
    /// Nothing changed, or the previous version is back in place.
    Recoverable,
    /// The application may be left without a runnable binary.
    Critical,
}

impl UpdateError {
    #[must_use]
    pub const fn severity(&self) -> Severity {
        match self {
            Self::InstallFailedUnrecoverable { .. } | Self::VerifyFailedUnrecoverable { .. } => {
                Severity::Critical
            }
            _ => Severity::Recoverable,
        }
    }

    #[must_use]
    pub const fn is_unrecoverable(&self) -> bool {
        matches!(self.severity(), Severity::Critical)
    }

    /// Whether the failure happened after the target was mutated and a rollback ran.
    #[must_use]
    pub const fn was_rolled_back(&self) -> bool {
        matches!(self, Self::InstallFailedRolledBack { .. } | Self::VerifyFailedRolledBack { .. })
    }

    /// Short machine-friendly name of the kind.
    #[must_use]
    pub const fn kind_name(&self) -> &'static str {
        match self {
            Self::Validation { .. } => "validation",
            Self::Download { .. } => "download",
            Self::Backup { .. } => "backup",
            Self::InstallFailedRolledBack { .. } => "install_failed_rolled_back",
            Self::InstallFailedUnrecoverable { .. } => "install_failed_unrecoverable",
            Self::VerifyFailedRolledBack { .. } => "verify_failed_rolled_back",
            Self::VerifyFailedUnrecoverable { .. } => "verify_failed_unrecoverable",
            Self::ElevationDenied { .. } => "elevation_denied",
            Self::HelperCommunication { .. } => "helper_communication",
            Self::HelperFailed { .. } => "helper_failed",
            Self::ProcessTermination { .. } => "process_termination",
            Self::SchemaMismatch { .. } => "schema_mismatch",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation {
            message: message.into(),
        }
    }

    pub fn communication(reason: impl Into<String>) -> Self {
        Self::HelperCommunication {
            reason: reason.into(),
        }
    }
}

/// An [`UpdateError`] with a suggestion and details for display.
#[derive(Debug)]
pub struct ErrorContext {
    pub error: UpdateError,
    pub suggestion: Option<String>,
    pub details: Option<String>,
}

impl ErrorContext {
    #[must_use]
    pub const fn new(error: UpdateError) -> Self {
        Self {
            error,
            suggestion: None,
            details: None,
        }
    }

    #[must_use]
    pub fn with_suggestion(mut self, suggestion: impl Into<String>) -> Self {
        self.suggestion = Some(suggestion.into());
        self
    }

    #[must_use]
    pub fn with_details(mut self, details: impl Into<String>) -> Self {
        self.details = Some(details.into());
        self
    }

    /// Print the error to stderr with colors.
    pub fn display(&self) {
        let label = if self.error.is_unrecoverable() {
            "critical".red().bold().underline()
        } else {
            "error".red().bold()
        };
        eprintln!("{}: {}", label, self.error);

        if let Some(details) = &self.details {
            eprintln!("{}: {}", "details".yellow(), details);
        }

        if let Some(suggestion) = &self.suggestion {
            eprintln!("{}: {}", "suggestion".green(), suggestion);
        }
    }
}

impl fmt::Display for ErrorContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.error)?;

        if let Some(details) = &self.details {
            write!(f, "\nDetails: {details}")?;
        }

        if let Some(suggestion) = &self.suggestion {
            write!(f, "\nSuggestion: {suggestion}")?;
        }

        Ok(())
    }
}

impl std::error::Error for ErrorContext {}

/// Convert any error into a displayable context with recovery advice.
#[must_use]
pub fn user_friendly_error(error: anyhow::Error) -> ErrorContext {
    if let Some(update_error) = error.downcast_ref::<UpdateError>() {
        return create_error_context(update_error.clone());
    }

    if let Some(io_error) = error.downcast_ref::<std::io::Error>() {
        if io_error.kind() == std::io::ErrorKind::PermissionDenied {
            return ErrorContext::new(UpdateError::validation(error.to_string()))
                .with_suggestion(
                    "Run the update with --elevate, or check ownership of the application directory",
                )
                .with_details("The updater could not read or write one of the update paths");
        }
    }

    ErrorContext::new(UpdateError::validation(format!("{error:#}")))
}

fn create_error_context(error: UpdateError) -> ErrorContext {
    match &error {
        UpdateError::Validation { .. } => ErrorContext::new(error)
            .with_suggestion("Check that the application and the downloaded update both exist")
            .with_details("Nothing was changed on disk"),
        UpdateError::Download { .. } => ErrorContext::new(error)
            .with_suggestion("Check your network connection and try again")
            .with_details("Nothing was changed on disk"),
        UpdateError::Backup { .. } => ErrorContext::new(error)
            .with_suggestion("Free some disk space or choose another backup directory")
            .with_details("The application was not modified; a partial backup file may remain"),
        UpdateError::InstallFailedRolledBack { .. } | UpdateError::VerifyFailedRolledBack { .. } => {
            ErrorContext::new(error)
                .with_suggestion("Close every running copy of the application and retry the update")
                .with_details("The previous version was restored and should start normally")
        }
        UpdateError::InstallFailedUnrecoverable { .. }
        | UpdateError::VerifyFailedUnrecoverable { .. } => ErrorContext::new(error)
            .with_suggestion(
                "Restore manually with `hotupdater backups restore --latest`, or reinstall the application",
            )
            .with_details("The application may not start until a backup is restored"),
        UpdateError::ElevationDenied { .. } => ErrorContext::new(error)
            .with_suggestion("Approve the administrator prompt when it appears")
            .with_details("Nothing was changed on disk"),
        UpdateError::HelperCommunication { .. } => ErrorContext::new(error)
            .with_suggestion("Retry the update; check that the update directory is writable"),
        UpdateError::HelperFailed { last_lines, .. } => {
            let details = if last_lines.is_empty() {
                "The helper produced no output".to_string()
            } else {
                format!("Last helper output:\n  {}", last_lines.join("\n  "))
            };
            ErrorContext::new(error).with_details(details)
        }
        UpdateError::ProcessTermination { .. } => ErrorContext::new(error)
            .with_suggestion("Close the application manually and retry the update"),
        UpdateError::SchemaMismatch { .. } => ErrorContext::new(error)
            .with_suggestion("The updater and its helper are from different releases; reinstall the application"),
        UpdateError::Cancelled => ErrorContext::new(error),
    }
}
