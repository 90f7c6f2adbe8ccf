//! Event types pushed to engine observers.
//!
//! ## Subscriptions
//!
//! | Event | Subscription |
//! |-------|--------------|
//! | `AudioMetrics` | [`TalkbackEngine::subscribe_metrics`](crate::engine::TalkbackEngine::subscribe_metrics) |
//! | `EngineStatusEvent` | [`TalkbackEngine::subscribe_status`](crate::engine::TalkbackEngine::subscribe_status) |
//!
//! Field names serialize in camelCase so payloads can be forwarded to a
//! JavaScript UI unchanged.

use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Capture metrics
// ---------------------------------------------------------------------------

/// Loudness metrics for one full capture buffer, pushed after every encode.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AudioMetrics {
    /// Root-mean-square level of the buffer, non-negative.
    pub rms: f32,
    /// Largest absolute sample value in the buffer, in [0.0, 1.0].
    pub peak: f32,
    /// Running total of samples consumed by the framer since start.
    pub sample_count: u64,
}

// ---------------------------------------------------------------------------
// Engine status events
// ---------------------------------------------------------------------------

/// Emitted when the engine state changes.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EngineStatusEvent {
    pub status: EngineStatus,
    /// Optional human-readable detail (e.g. error message).
    pub detail: Option<String>,
}

/// Current state of the talkback engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EngineStatus {
    /// Engine created but `start()` not yet called.
    Idle,
    /// Actively capturing microphone audio and playing responses.
    Listening,
    /// Capture stopped; engine may be restarted.
    Stopped,
    /// Unrecoverable error — restart required.
    Error,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn audio_metrics_serialize_with_camel_case_fields() {
        let metrics = AudioMetrics {
            rms: 0.42,
            peak: 0.9,
            sample_count: 9600,
        };

        let json = serde_json::to_value(metrics).expect("serialize metrics");
        let rms = json["rms"].as_f64().expect("rms should serialize as number");
        assert!((rms - 0.42).abs() < 1e-5);
        assert_eq!(json["sampleCount"], 9600);
        assert!(
            json.get("sample_count").is_none(),
            "snake_case key must not appear"
        );

        let round_trip: AudioMetrics =
            serde_json::from_value(json).expect("deserialize metrics");
        assert_eq!(round_trip.sample_count, 9600);
    }

    #[test]
    fn engine_status_event_serializes_with_lowercase_status() {
        let event = EngineStatusEvent {
            status: EngineStatus::Listening,
            detail: None,
        };

        let json = serde_json::to_value(&event).expect("serialize status event");
        assert_eq!(json["status"], "listening");
        assert_eq!(json["detail"], serde_json::Value::Null);

        let round_trip: EngineStatusEvent =
            serde_json::from_value(json).expect("deserialize status event");
        assert_eq!(round_trip.status, EngineStatus::Listening);
    }

    #[test]
    fn engine_status_rejects_non_lowercase_values() {
        let invalid = r#""Listening""#;
        let err = serde_json::from_str::<EngineStatus>(invalid);
        assert!(err.is_err(), "expected invalid casing to fail");
    }
}
