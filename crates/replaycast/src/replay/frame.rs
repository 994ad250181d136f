//! Frame model for the snapshot feed.
//!
//! A frame is one immutable snapshot of match state at a single epoch-ms
//! timestamp. Two payload kinds share the timestamp key: "window" frames carry
//! coarse team/objective stats, "details" frames carry fine per-participant
//! stats. The engine treats both payloads as opaque JSON.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Native granularity of the feed: snapshots land on 10-second boundaries.
pub const SLICE_MS: i64 = 10_000;

/// Feed-reported phase tag carried by some frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum MatchPhase {
    InProgress,
    Finished,
}

/// One immutable snapshot of match state.
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    /// Epoch milliseconds at which the snapshot was recorded.
    pub recorded_at: i64,
    /// Opaque snapshot body; never inspected by the engine.
    pub payload: Value,
    /// Phase tag, when the feed includes one.
    pub phase: Option<MatchPhase>,
}

impl Frame {
    pub fn new(recorded_at: i64, payload: Value) -> Self {
        Self {
            recorded_at,
            payload,
            phase: None,
        }
    }

    pub fn with_phase(recorded_at: i64, payload: Value, phase: MatchPhase) -> Self {
        Self {
            recorded_at,
            payload,
            phase: Some(phase),
        }
    }

    /// True when the feed tagged this snapshot as the end of the match.
    pub fn is_terminal(&self) -> bool {
        matches!(self.phase, Some(MatchPhase::Finished))
    }
}

/// Static per-event descriptive data.
///
/// Set at most once per session: the first non-empty value wins and is never
/// overwritten by later fetches.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MatchMeta {
    #[serde(default)]
    pub home_team: Option<String>,
    #[serde(default)]
    pub away_team: Option<String>,
    #[serde(default)]
    pub competition: Option<String>,
    /// Anything else the feed sends along; opaque.
    #[serde(default)]
    pub extra: Value,
}

impl MatchMeta {
    pub fn is_empty(&self) -> bool {
        self.home_team.is_none()
            && self.away_team.is_none()
            && self.competition.is_none()
            && self.extra.is_null()
    }
}

/// Rounds an epoch-ms stamp down to the feed grid.
pub fn floor_to_slice(stamp_ms: i64) -> i64 {
    stamp_ms.div_euclid(SLICE_MS) * SLICE_MS
}

/// Start of the slice immediately before the one containing `stamp_ms`.
pub fn previous_slice(stamp_ms: i64) -> i64 {
    floor_to_slice(stamp_ms) - SLICE_MS
}

/// Current wall-clock time as an epoch-ms stamp.
pub fn now_stamp() -> i64 {
    Utc::now().timestamp_millis()
}

/// Converts an epoch-ms stamp into the UTC datetime handed to sources.
///
/// Out-of-range stamps (never produced by the engine itself) collapse to the
/// epoch rather than panicking.
pub fn slice_start(stamp_ms: i64) -> DateTime<Utc> {
    DateTime::<Utc>::from_timestamp_millis(stamp_ms).unwrap_or(DateTime::<Utc>::UNIX_EPOCH)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_floor_to_slice() {
        assert_eq!(floor_to_slice(0), 0);
        assert_eq!(floor_to_slice(9_999), 0);
        assert_eq!(floor_to_slice(10_000), 10_000);
        assert_eq!(floor_to_slice(24_500), 20_000);
    }

    /// Negative stamps must still round toward earlier slices.
    #[test]
    fn test_floor_to_slice_negative() {
        assert_eq!(floor_to_slice(-1), -10_000);
        assert_eq!(floor_to_slice(-10_000), -10_000);
        assert_eq!(floor_to_slice(-10_001), -20_000);
    }

    #[test]
    fn test_previous_slice() {
        assert_eq!(previous_slice(24_500), 10_000);
        assert_eq!(previous_slice(10_000), 0);
        assert_eq!(previous_slice(0), -10_000);
    }

    #[test]
    fn test_frame_terminal() {
        let live = Frame::new(1_000, json!({"score": 1}));
        assert!(!live.is_terminal());

        let done = Frame::with_phase(2_000, json!({"score": 2}), MatchPhase::Finished);
        assert!(done.is_terminal());
    }

    #[test]
    fn test_meta_is_empty() {
        assert!(MatchMeta::default().is_empty());

        let named = MatchMeta {
            home_team: Some("Blue".into()),
            ..Default::default()
        };
        assert!(!named.is_empty());

        let extra_only = MatchMeta {
            extra: json!({"venue": "arena"}),
            ..Default::default()
        };
        assert!(!extra_only.is_empty());
    }

    #[test]
    fn test_phase_wire_names() {
        assert_eq!(
            serde_json::to_string(&MatchPhase::InProgress).unwrap(),
            "\"inProgress\""
        );
        assert_eq!(
            serde_json::from_str::<MatchPhase>("\"finished\"").unwrap(),
            MatchPhase::Finished
        );
    }
}
