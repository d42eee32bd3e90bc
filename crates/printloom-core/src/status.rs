//! Canonical printer status types.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Protocol-agnostic printer state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum CanonicalStatus {
    /// Not reachable, or reporting something we do not understand.
    #[default]
    Offline,
    /// Ready for a job.
    Idle,
    /// Printing.
    Busy,
    /// Print paused.
    Paused,
    /// Device-side failure.
    Error,
}

impl CanonicalStatus {
    /// Whether a job is running or paused on the device.
    pub fn is_active(&self) -> bool {
        matches!(self, CanonicalStatus::Busy | CanonicalStatus::Paused)
    }
}

impl fmt::Display for CanonicalStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            CanonicalStatus::Offline => "OFFLINE",
            CanonicalStatus::Idle => "IDLE",
            CanonicalStatus::Busy => "BUSY",
            CanonicalStatus::Paused => "PAUSED",
            CanonicalStatus::Error => "ERROR",
        };
        f.write_str(name)
    }
}

/// Adapter session state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ConnectionState {
    /// No channels open.
    #[default]
    Disconnected,
    /// Channels being established.
    Connecting,
    /// Receiving status.
    Connected,
}

/// Print progress as last reported by the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Progress {
    /// Percentage complete (0-100).
    pub percentage: u8,
    /// Current layer number.
    pub current_layer: u32,
    /// Total layer count.
    pub total_layers: u32,
    /// Remaining time in seconds.
    pub time_remaining_secs: u64,
}

/// Immutable view of one printer, replaced wholesale on every status message.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct PrinterSnapshot {
    /// Canonical state.
    pub status: CanonicalStatus,
    /// The device reported that its last job finished normally.
    pub finished: bool,
    /// Progress of the current or last job.
    pub progress: Progress,
    /// File the device is working on, if reported.
    pub file_name: Option<String>,
    /// Device error code, if any.
    pub error_code: Option<u64>,
    /// Number of status messages applied so far.
    pub sequence: u64,
    /// When the last status message arrived.
    pub received_at: Option<DateTime<Utc>>,
}

impl PrinterSnapshot {
    /// Snapshot for an adapter that is not connected.
    pub fn offline() -> Self {
        Self::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_active_states() {
        assert!(CanonicalStatus::Busy.is_active());
        assert!(CanonicalStatus::Paused.is_active());
        assert!(!CanonicalStatus::Idle.is_active());
        assert!(!CanonicalStatus::Error.is_active());
        assert!(!CanonicalStatus::Offline.is_active());
    }

    #[test]
    fn test_status_serializes_uppercase() {
        let json = serde_json::to_string(&CanonicalStatus::Paused).unwrap();
        assert_eq!(json, "\"PAUSED\"");
    }
}
