//! Event types broadcast to hosts.
//!
//! | Event | Subscribe with |
//! |-------|----------------|
//! | `EngineStatusEvent` | `Engine::subscribe_status` |
//! | `NoiseChannelEvent` | `Engine::subscribe_noise_channel` |
//!
//! Decoded device events travel separately, on the serial link's crossbeam
//! channel.

use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Noise channel events
// ---------------------------------------------------------------------------

/// Emitted once each time the selected noise channel changes.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NoiseChannelEvent {
    /// Monotonically increasing event sequence number.
    pub seq: u64,
    /// Audio frame at which the change happened.
    pub frame: u64,
    /// Newly selected beam, or `None` when the selection was released.
    pub channel: Option<usize>,
    /// Nominal steering angle of `channel` in degrees.
    pub angle: Option<u32>,
}

/// Result of a hotword direction query.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HotwordDirection {
    /// Beam with the most energy while the hotword was spoken.
    pub channel: usize,
    /// Windowed energy of that beam.
    pub energy: u64,
    /// Direction of arrival reported by the DSP for the detection frame.
    pub angle: f32,
}

// ---------------------------------------------------------------------------
// Engine status events
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EngineStatusEvent {
    pub status: EngineStatus,
    /// Optional human-readable detail (e.g. error message).
    pub detail: Option<String>,
}

/// Current state of the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EngineStatus {
    /// Created, `start()` not yet called.
    Idle,
    /// Capturing and processing with the control link up.
    Running,
    /// Capturing and processing without a control link; direction and
    /// indicator features are unavailable.
    Degraded,
    /// Capture stopped; the engine may be restarted.
    Stopped,
    /// Start failed.
    Error,
}

impl EngineStatus {
    pub fn is_active(self) -> bool {
        matches!(self, EngineStatus::Running | EngineStatus::Degraded)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn noise_channel_event_serializes_with_camel_case() {
        let event = NoiseChannelEvent {
            seq: 4,
            frame: 1_234,
            channel: Some(3),
            angle: Some(90),
        };
        let json = serde_json::to_value(&event).expect("serialize noise channel event");
        assert_eq!(json["seq"], 4);
        assert_eq!(json["frame"], 1_234);
        assert_eq!(json["channel"], 3);
        assert_eq!(json["angle"], 90);

        let released = NoiseChannelEvent {
            channel: None,
            angle: None,
            ..event
        };
        let json = serde_json::to_value(&released).expect("serialize released event");
        assert!(json["channel"].is_null());
    }

    #[test]
    fn engine_status_event_serializes_with_lowercase_status() {
        let event = EngineStatusEvent {
            status: EngineStatus::Degraded,
            detail: Some("control link unavailable".into()),
        };

        let json = serde_json::to_value(&event).expect("serialize status event");
        assert_eq!(json["status"], "degraded");
        assert_eq!(json["detail"], "control link unavailable");

        let round_trip: EngineStatusEvent =
            serde_json::from_value(json).expect("deserialize status event");
        assert_eq!(round_trip.status, EngineStatus::Degraded);
        assert!(round_trip.status.is_active());
    }

    #[test]
    fn engine_status_rejects_non_lowercase_values() {
        let err = serde_json::from_str::<EngineStatus>(r#""Running""#);
        assert!(err.is_err(), "expected invalid casing to fail");
    }

    #[test]
    fn hotword_direction_round_trips() {
        let dir = HotwordDirection {
            channel: 5,
            energy: 42,
            angle: 150.0,
        };
        let json = serde_json::to_string(&dir).unwrap();
        let back: HotwordDirection = serde_json::from_str(&json).unwrap();
        assert_eq!(back, dir);
    }
}
