//! Line protocol between the elevated helper and its parent.
//!
//! The channel carries UTF-8 lines of three kinds:
//!
//! | Line | Meaning |
//! |------|---------|
//! | `@PROGRESS@<phase>\|<percent>\|<detail>` | phase-local progress |
//! | `@RESULT@<json>` | terminal [`HelperResponse`], always the last line |
//! | anything else | plain log text |
//!
//! A progress line that fails to decode is kept as log text rather than dropped.

use crate::constants::{PROGRESS_PREFIX, RESULT_PREFIX, SCHEMA_VERSION};
use crate::core::UpdateError;
use crate::progress::{PhaseRanges, UpdateProgress, parse_progress_with};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use tracing::warn;

/// Terminal status reported by the helper.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HelperResponse {
    pub schema_version: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<UpdateError>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backup_path: Option<PathBuf>,
}

impl HelperResponse {
    #[must_use]
    pub const fn success(backup_path: PathBuf) -> Self {
        Self {
            schema_version: SCHEMA_VERSION,
            error: None,
            backup_path: Some(backup_path),
        }
    }

    #[must_use]
    pub const fn failure(error: UpdateError) -> Self {
        Self {
            schema_version: SCHEMA_VERSION,
            error: Some(error),
            backup_path: None,
        }
    }

    /// Backup path on success, the helper's classified error otherwise.
    pub fn into_result(self) -> Result<Option<PathBuf>, UpdateError> {
        if self.schema_version != SCHEMA_VERSION {
            return Err(UpdateError::SchemaMismatch {
                expected: SCHEMA_VERSION,
                found: self.schema_version,
            });
        }
        match self.error {
            Some(error) => Err(error),
            None => Ok(self.backup_path),
        }
    }

    /// Full `@RESULT@` line.
    #[must_use]
    pub fn encode(&self) -> String {
        // Serializing plain data with string keys cannot fail.
        let json = serde_json::to_string(self).unwrap_or_else(|_| "{}".to_string());
        format!("{RESULT_PREFIX}{json}")
    }
}

/// One decoded channel line.
#[derive(Debug, Clone, PartialEq)]
pub enum ChannelLine {
    Progress(UpdateProgress),
    Result(HelperResponse),
    Log(String),
}

/// Decode a channel line.
#[must_use]
pub fn decode_line(ranges: &PhaseRanges, line: &str) -> ChannelLine {
    let line = line.trim_end_matches(['\r', '\n']);

    if let Some(payload) = line.strip_prefix(PROGRESS_PREFIX) {
        return match parse_progress_with(ranges, payload) {
            Some(progress) => ChannelLine::Progress(progress),
            None => {
                warn!("Malformed progress line from helper: {line}");
                ChannelLine::Log(line.to_string())
            }
        };
    }

    if let Some(payload) = line.strip_prefix(RESULT_PREFIX) {
        return ChannelLine::Result(decode_response(payload));
    }

    ChannelLine::Log(line.to_string())
}

/// Decode a response, checking the schema version before the shape.
fn decode_response(payload: &str) -> HelperResponse {
    let found = serde_json::from_str::<serde_json::Value>(payload)
        .ok()
        .and_then(|v| v.get("schema_version").and_then(serde_json::Value::as_u64))
        .map_or(0, |v| v as u32);

    if found != SCHEMA_VERSION {
        return HelperResponse {
            schema_version: found,
            error: None,
            backup_path: None,
        };
    }

    serde_json::from_str(payload).unwrap_or_else(|e| {
        HelperResponse::failure(UpdateError::communication(format!(
            "Unreadable helper status line: {e}"
        )))
    })
}
