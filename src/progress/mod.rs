//! Progress model for update runs.
//!
//! An update is split into [`UpdatePhase`]s. Each phase owns a slice of a single 0-100
//! scale; [`PhaseRanges`] guarantees the slices partition `[0, 100]` with no gaps or
//! overlaps, whatever boundaries it was built from. Phase-local progress is mapped onto
//! the overall scale with [`PhaseRanges::calculate`].
//!
//! # Line encoding
//!
//! Progress crosses the helper process boundary as text:
//!
//! ```text
//! @PROGRESS@install|40|copying new binary
//! ```
//!
//! The three pipe-separated fields are the phase, the phase-local percentage and an
//! optional detail. [`encode_progress_line`] produces such lines and
//! [`parse_progress_message`] decodes the payload after the prefix.

use crate::constants::PROGRESS_PREFIX;
use anyhow::{Result, bail};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// One stage of the update lifecycle, listed in progress-scale order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UpdatePhase {
    Download,
    PreCheck,
    Backup,
    Install,
    Verify,
    Complete,
}

impl UpdatePhase {
    pub const ALL: [Self; 6] = [
        Self::Download,
        Self::PreCheck,
        Self::Backup,
        Self::Install,
        Self::Verify,
        Self::Complete,
    ];

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Download => "download",
            Self::PreCheck => "precheck",
            Self::Backup => "backup",
            Self::Install => "install",
            Self::Verify => "verify",
            Self::Complete => "complete",
        }
    }

    /// Fixed user-facing message for the phase.
    #[must_use]
    pub const fn message(self) -> &'static str {
        match self {
            Self::Download => "Downloading update...",
            Self::PreCheck => "Preparing update...",
            Self::Backup => "Backing up current version...",
            Self::Install => "Installing new version...",
            Self::Verify => "Verifying installation...",
            Self::Complete => "Update complete",
        }
    }

    const fn index(self) -> usize {
        self as usize
    }
}

impl fmt::Display for UpdatePhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for UpdatePhase {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::ALL
            .into_iter()
            .find(|phase| phase.as_str() == s)
            .ok_or_else(|| anyhow::anyhow!("Unknown update phase: {s}"))
    }
}

/// Slice of the overall scale owned by one phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PhaseRange {
    pub start: u8,
    pub end: u8,
}

/// Contiguous partition of `[0, 100]` across [`UpdatePhase::ALL`].
///
/// Stored as the seven boundaries between the six phases, so adjacent ranges always
/// share an endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "Vec<u8>", into = "Vec<u8>")]
pub struct PhaseRanges {
    bounds: [u8; 7],
}

impl Default for PhaseRanges {
    fn default() -> Self {
        Self {
            bounds: [0, 70, 75, 85, 95, 98, 100],
        }
    }
}

impl PhaseRanges {
    /// Build ranges from boundaries.
    ///
    /// The first boundary must be 0, the last 100, and every phase must get a
    /// non-empty slice.
    pub fn from_bounds(bounds: [u8; 7]) -> Result<Self> {
        if bounds[0] != 0 || bounds[6] != 100 {
            bail!("Phase ranges must start at 0 and end at 100, got {bounds:?}");
        }
        if bounds.windows(2).any(|w| w[0] >= w[1]) {
            bail!("Phase range boundaries must be strictly increasing, got {bounds:?}");
        }
        Ok(Self {
            bounds,
        })
    }

    #[must_use]
    pub const fn range(&self, phase: UpdatePhase) -> PhaseRange {
        let i = phase.index();
        PhaseRange {
            start: self.bounds[i],
            end: self.bounds[i + 1],
        }
    }

    /// Map phase-local progress `current / total` onto the overall scale.
    ///
    /// A zero `total` yields the phase start; `current` beyond `total` is clamped.
    #[must_use]
    pub fn calculate(&self, phase: UpdatePhase, current: u64, total: u64) -> u8 {
        let range = self.range(phase);
        if total == 0 {
            return range.start;
        }
        let current = current.min(total);
        let span = u128::from(range.end - range.start);
        let offset = u128::from(current) * span / u128::from(total);
        // offset <= span <= 100
        range.start + offset as u8
    }

    /// Map a phase-local percentage (0-100) onto the overall scale.
    #[must_use]
    pub fn from_local_percent(&self, phase: UpdatePhase, local: u8) -> u8 {
        self.calculate(phase, u64::from(local.min(100)), 100)
    }

    /// Inverse of [`from_local_percent`](Self::from_local_percent).
    ///
    /// Rounds up, so mapping the result back gives `overall` again.
    #[must_use]
    pub fn to_local_percent(&self, phase: UpdatePhase, overall: u8) -> u8 {
        let range = self.range(phase);
        let overall = overall.clamp(range.start, range.end);
        let span = u16::from(range.end - range.start);
        let offset = u16::from(overall - range.start);
        // span > 0 by construction
        (offset * 100).div_ceil(span) as u8
    }
}

impl TryFrom<Vec<u8>> for PhaseRanges {
    type Error = anyhow::Error;

    fn try_from(value: Vec<u8>) -> Result<Self> {
        let bounds: [u8; 7] = value
            .try_into()
            .map_err(|v: Vec<u8>| anyhow::anyhow!("Expected 7 phase boundaries, got {}", v.len()))?;
        Self::from_bounds(bounds)
    }
}

impl From<PhaseRanges> for Vec<u8> {
    fn from(value: PhaseRanges) -> Self {
        value.bounds.to_vec()
    }
}

/// Map progress with the default ranges.
#[must_use]
pub fn calculate_progress(phase: UpdatePhase, current: u64, total: u64) -> u8 {
    PhaseRanges::default().calculate(phase, current, total)
}

/// A single progress event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UpdateProgress {
    pub phase: UpdatePhase,
    /// Overall percentage, 0-100.
    pub percentage: u8,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    /// Transfer rate in MB/s, only set during download.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rate: Option<f64>,
}

impl UpdateProgress {
    #[must_use]
    pub fn new(phase: UpdatePhase, percentage: u8) -> Self {
        Self {
            phase,
            percentage: percentage.min(100),
            message: phase.message().to_string(),
            detail: None,
            rate: None,
        }
    }

    #[must_use]
    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        let detail = detail.into();
        self.detail = (!detail.is_empty()).then_some(detail);
        self
    }

    #[must_use]
    pub const fn with_rate(mut self, rate: f64) -> Self {
        self.rate = Some(rate);
        self
    }
}

/// Build a full `@PROGRESS@phase|percent|detail` line.
///
/// Pipes and line breaks inside `detail` are replaced so the line always has exactly
/// three fields.
#[must_use]
pub fn encode_progress_line(phase: UpdatePhase, local_percent: u8, detail: Option<&str>) -> String {
    let detail: String = detail
        .unwrap_or_default()
        .chars()
        .map(|c| match c {
            '|' => '/',
            '\r' | '\n' => ' ',
            other => other,
        })
        .collect();
    format!("{PROGRESS_PREFIX}{}|{}|{}", phase, local_percent.min(100), detail)
}

/// Decode the payload of a progress line (without the prefix) using the default ranges.
#[must_use]
pub fn parse_progress_message(data: &str) -> Option<UpdateProgress> {
    parse_progress_with(&PhaseRanges::default(), data)
}

/// Decode the payload of a progress line against specific ranges.
///
/// Returns `None` unless the payload has exactly three fields, a known phase and a
/// numeric percentage.
#[must_use]
pub fn parse_progress_with(ranges: &PhaseRanges, data: &str) -> Option<UpdateProgress> {
    let parts: Vec<&str> = data.split('|').collect();
    let [phase, percent, detail] = parts.as_slice() else {
        return None;
    };
    let phase: UpdatePhase = phase.trim().parse().ok()?;
    let local: u64 = percent.trim().parse().ok()?;
    let overall = ranges.calculate(phase, local, 100);
    Some(UpdateProgress::new(phase, overall).with_detail(*detail))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_ranges_partition_the_scale() {
        let ranges = PhaseRanges::default();
        let mut expected_start = 0;
        for phase in UpdatePhase::ALL {
            let range = ranges.range(phase);
            assert_eq!(range.start, expected_start, "gap or overlap before {phase}");
            assert!(range.end > range.start);
            expected_start = range.end;
        }
        assert_eq!(expected_start, 100);
    }

    #[test]
    fn test_calculate_hits_range_endpoints() {
        let ranges = PhaseRanges::default();
        for phase in UpdatePhase::ALL {
            let range = ranges.range(phase);
            assert_eq!(ranges.calculate(phase, 0, 250), range.start);
            assert_eq!(ranges.calculate(phase, 250, 250), range.end);
            assert_eq!(ranges.calculate(phase, 10, 0), range.start);
        }
        assert_eq!(calculate_progress(UpdatePhase::Download, 50, 100), 35);
        assert_eq!(calculate_progress(UpdatePhase::Complete, 1, 1), 100);
    }

    #[test]
    fn test_calculate_clamps_overshoot() {
        assert_eq!(calculate_progress(UpdatePhase::Install, 500, 100), 95);
    }

    #[test]
    fn test_custom_ranges_are_validated() {
        assert!(PhaseRanges::from_bounds([0, 50, 60, 70, 80, 90, 100]).is_ok());
        assert!(PhaseRanges::from_bounds([1, 50, 60, 70, 80, 90, 100]).is_err());
        assert!(PhaseRanges::from_bounds([0, 50, 50, 70, 80, 90, 100]).is_err());
        assert!(PhaseRanges::from_bounds([0, 50, 60, 70, 80, 90, 99]).is_err());
        assert!(PhaseRanges::try_from(vec![0, 100]).is_err());
    }

    #[test]
    fn test_parse_inverts_encode() {
        let line = encode_progress_line(UpdatePhase::Backup, 50, Some("copying app"));
        let payload = line.strip_prefix(PROGRESS_PREFIX).unwrap();
        let progress = parse_progress_message(payload).unwrap();
        assert_eq!(progress.phase, UpdatePhase::Backup);
        assert_eq!(progress.detail.as_deref(), Some("copying app"));
        assert_eq!(progress.percentage, 80);
        assert_eq!(progress.message, UpdatePhase::Backup.message());
    }

    #[test]
    fn test_encode_sanitizes_separators() {
        let line = encode_progress_line(UpdatePhase::Install, 10, Some("a|b\nc"));
        let progress = parse_progress_message(line.strip_prefix(PROGRESS_PREFIX).unwrap()).unwrap();
        assert_eq!(progress.detail.as_deref(), Some("a/b c"));
    }

    #[test]
    fn test_parse_rejects_malformed_payloads() {
        assert!(parse_progress_message("install|50").is_none());
        assert!(parse_progress_message("install|50|a|b").is_none());
        assert!(parse_progress_message("reboot|50|x").is_none());
        assert!(parse_progress_message("install|half|x").is_none());
    }

    #[test]
    fn test_local_percent_inverse() {
        let ranges = PhaseRanges::default();
        for phase in UpdatePhase::ALL {
            for local in [0u8, 100] {
                let overall = ranges.from_local_percent(phase, local);
                assert_eq!(ranges.to_local_percent(phase, overall), local);
            }
        }
        assert_eq!(ranges.to_local_percent(UpdatePhase::Download, 35), 50);
        assert_eq!(ranges.to_local_percent(UpdatePhase::Install, 0), 0);
    }

    #[test]
    fn test_overall_percent_survives_local_encoding() {
        let ranges = PhaseRanges::default();
        for phase in UpdatePhase::ALL {
            let range = ranges.range(phase);
            for overall in range.start..=range.end {
                let local = ranges.to_local_percent(phase, overall);
                assert_eq!(ranges.from_local_percent(phase, local), overall, "{phase:?} {overall}");
            }
        }
        assert_eq!(ranges.to_local_percent(UpdatePhase::Verify, 96), 34);
    }

    #[test]
    fn test_empty_detail_decodes_to_none() {
        let progress = parse_progress_message("verify|100|").unwrap();
        assert_eq!(progress.detail, None);
        assert_eq!(progress.percentage, 98);
    }

    #[test]
    fn test_phase_round_trips_through_str() {
        for phase in UpdatePhase::ALL {
            assert_eq!(phase.as_str().parse::<UpdatePhase>().unwrap(), phase);
        }
    }
}
