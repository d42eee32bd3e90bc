//! Bambu report parsing.
//!
//! Reports on `device/<serial>/report` are partial: a message carries only
//! the fields that changed. Each one is merged into the previous snapshot.

use chrono::{DateTime, Utc};
use printloom_core::{CanonicalStatus, PrinterSnapshot};

/// Device job state from the `gcode_state` field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GcodeState {
    /// `IDLE`
    Idle,
    /// `RUNNING`
    Running,
    /// `PAUSE`
    Pause,
    /// `FINISH`
    Finish,
    /// `FAILED`
    Failed,
    /// Anything else (`PREPARE`, `SLICING`, empty, new firmware values).
    Unknown,
}

impl GcodeState {
    /// Parse the raw field. Never fails.
    pub fn parse(raw: &str) -> Self {
        match raw {
            "IDLE" => Self::Idle,
            "RUNNING" => Self::Running,
            "PAUSE" => Self::Pause,
            "FINISH" => Self::Finish,
            "FAILED" => Self::Failed,
            _ => Self::Unknown,
        }
    }

    /// Canonical status for this state.
    pub fn canonical(self) -> CanonicalStatus {
        match self {
            Self::Idle | Self::Finish => CanonicalStatus::Idle,
            Self::Running => CanonicalStatus::Busy,
            Self::Pause => CanonicalStatus::Paused,
            Self::Failed => CanonicalStatus::Error,
            Self::Unknown => CanonicalStatus::Offline,
        }
    }
}

/// Map a raw `gcode_state` to canonical status.
pub fn map_gcode_state(raw: &str) -> CanonicalStatus {
    GcodeState::parse(raw).canonical()
}

fn as_u64(value: &serde_json::Value) -> Option<u64> {
    // Some firmware sends numbers as strings.
    value
        .as_u64()
        .or_else(|| value.as_f64().filter(|v| *v >= 0.0).map(|v| v as u64))
        .or_else(|| value.as_str().and_then(|s| s.trim().parse().ok()))
}

/// Merge one report payload into `previous`.
///
/// Returns `None` when the payload is not a JSON object; such messages are
/// dropped. Unknown fields are ignored.
pub fn merge_report(
    previous: &PrinterSnapshot,
    payload: &[u8],
    received_at: DateTime<Utc>,
) -> Option<PrinterSnapshot> {
    let value: serde_json::Value = serde_json::from_slice(payload).ok()?;
    if !value.is_object() {
        return None;
    }

    let mut next = previous.clone();
    next.sequence = previous.sequence + 1;
    next.received_at = Some(received_at);

    let Some(print) = value.get("print") else {
        return Some(next);
    };

    if let Some(state) = print.get("gcode_state").and_then(|v| v.as_str()) {
        let state = GcodeState::parse(state);
        next.status = state.canonical();
        next.finished = state == GcodeState::Finish;
    }

    if let Some(pct) = print.get("mc_percent").and_then(as_u64) {
        next.progress.percentage = pct.min(100) as u8;
    }
    if let Some(layer) = print.get("layer_num").and_then(as_u64) {
        next.progress.current_layer = layer as u32;
    }
    if let Some(total) = print.get("total_layer_num").and_then(as_u64) {
        next.progress.total_layers = total as u32;
    }
    if let Some(remaining) = print.get("mc_remaining_time").and_then(as_u64) {
        next.progress.time_remaining_secs = remaining;
    }

    if let Some(name) = print.get("gcode_file").and_then(|v| v.as_str()) {
        next.file_name = (!name.is_empty()).then(|| name.to_string());
    }
    if let Some(code) = print.get("print_error").and_then(as_u64) {
        next.error_code = (code != 0).then_some(code);
    }

    Some(next)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mapping_table() {
        assert_eq!(map_gcode_state("IDLE"), CanonicalStatus::Idle);
        assert_eq!(map_gcode_state("RUNNING"), CanonicalStatus::Busy);
        assert_eq!(map_gcode_state("PAUSE"), CanonicalStatus::Paused);
        assert_eq!(map_gcode_state("FINISH"), CanonicalStatus::Idle);
        assert_eq!(map_gcode_state("FAILED"), CanonicalStatus::Error);
    }

    #[test]
    fn test_mapping_is_total() {
        for raw in ["", "PREPARE", "SLICING", "running", "IDLE ", "\u{1F5A8}"] {
            assert_eq!(map_gcode_state(raw), CanonicalStatus::Offline, "{raw:?}");
        }
    }

    #[test]
    fn test_partial_reports_merge() {
        let now = Utc::now();
        let first = br#"{"print":{"gcode_state":"RUNNING","mc_percent":10,"layer_num":3,"total_layer_num":120,"mc_remaining_time":900,"gcode_file":"cube.gcode.3mf"}}"#;
        let snap = merge_report(&PrinterSnapshot::offline(), first, now).unwrap();
        assert_eq!(snap.status, CanonicalStatus::Busy);
        assert_eq!(snap.progress.total_layers, 120);
        assert_eq!(snap.sequence, 1);

        let second = br#"{"print":{"mc_percent":"11","layer_num":4,"nozzle_temper":219.5}}"#;
        let snap = merge_report(&snap, second, now).unwrap();
        assert_eq!(snap.status, CanonicalStatus::Busy);
        assert_eq!(snap.progress.percentage, 11);
        assert_eq!(snap.progress.current_layer, 4);
        assert_eq!(snap.progress.total_layers, 120);
        assert_eq!(snap.progress.time_remaining_secs, 900);
        assert_eq!(snap.file_name.as_deref(), Some("cube.gcode.3mf"));
        assert_eq!(snap.sequence, 2);
    }

    #[test]
    fn test_finish_sets_flag() {
        let now = Utc::now();
        let snap = merge_report(&PrinterSnapshot::offline(), br#"{"print":{"gcode_state":"FINISH","mc_percent":100}}"#, now).unwrap();
        assert_eq!(snap.status, CanonicalStatus::Idle);
        assert!(snap.finished);

        let snap = merge_report(&snap, br#"{"print":{"gcode_state":"RUNNING"}}"#, now).unwrap();
        assert!(!snap.finished);
    }

    #[test]
    fn test_non_json_dropped() {
        let prev = PrinterSnapshot::offline();
        assert!(merge_report(&prev, b"not json", Utc::now()).is_none());
        assert!(merge_report(&prev, b"[1,2]", Utc::now()).is_none());
    }

    #[test]
    fn test_other_sections_only_refresh_heartbeat() {
        let now = Utc::now();
        let prev = merge_report(&PrinterSnapshot::offline(), br#"{"print":{"gcode_state":"IDLE"}}"#, now).unwrap();
        let snap = merge_report(&prev, br#"{"info":{"command":"get_version"}}"#, now).unwrap();
        assert_eq!(snap.status, CanonicalStatus::Idle);
        assert_eq!(snap.sequence, 2);
    }

    #[test]
    fn test_error_code() {
        let snap = merge_report(
            &PrinterSnapshot::offline(),
            br#"{"print":{"gcode_state":"FAILED","print_error":50348044}}"#,
            Utc::now(),
        )
        .unwrap();
        assert_eq!(snap.status, CanonicalStatus::Error);
        assert_eq!(snap.error_code, Some(50348044));
    }
}
