//! Telemetry Payloads
//!
//! Decoded frames from the live stream and the synthetic heartbeat emitted
//! while no live connection is up.

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;

use super::TelemetryError;

/// Where a payload came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PayloadSource {
    Live,
    Synthetic,
}

/// Heartbeat marker body
#[derive(Debug, Clone, Serialize)]
pub struct HeartbeatEvent {
    /// Always `"heartbeat"`
    #[serde(rename = "type")]
    pub kind: &'static str,
    /// Emission time (ISO 8601)
    pub timestamp: String,
    /// Heartbeats emitted by this channel so far
    pub sequence: u64,
    /// Seconds since the channel was created
    pub uptime_secs: u64,
}

/// One payload delivered to `on_data` listeners
#[derive(Debug, Clone, Serialize)]
pub struct TelemetryPayload {
    pub source: PayloadSource,
    pub body: Value,
    pub received_at: DateTime<Utc>,
}

impl TelemetryPayload {
    /// Wrap a decoded live message
    pub fn live(body: Value) -> Self {
        Self {
            source: PayloadSource::Live,
            body,
            received_at: Utc::now(),
        }
    }

    /// Build a synthetic heartbeat
    pub fn heartbeat(sequence: u64, uptime_secs: u64) -> Self {
        let received_at = Utc::now();
        let event = HeartbeatEvent {
            kind: "heartbeat",
            timestamp: received_at.to_rfc3339(),
            sequence,
            uptime_secs,
        };

        Self {
            source: PayloadSource::Synthetic,
            body: serde_json::to_value(&event).unwrap_or(Value::Null),
            received_at,
        }
    }

    pub fn is_heartbeat(&self) -> bool {
        self.source == PayloadSource::Synthetic
    }
}

/// Split a transport frame into newline-delimited JSON documents.
///
/// Blank lines are skipped; each remaining line decodes independently.
pub fn decode_frame(text: &str) -> Vec<Result<Value, TelemetryError>> {
    text.lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(|line| {
            serde_json::from_str::<Value>(line).map_err(|e| TelemetryError::Decode(e.to_string()))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_heartbeat_shape() {
        let hb = TelemetryPayload::heartbeat(3, 42);
        assert!(hb.is_heartbeat());
        assert_eq!(hb.body["type"], "heartbeat");
        assert_eq!(hb.body["sequence"], 3);
        assert_eq!(hb.body["uptime_secs"], 42);
        assert!(hb.body["timestamp"].is_string());
    }

    #[test]
    fn test_decode_single_document() {
        let decoded = decode_frame(r#"{"severity":"high","rule":"ssh-bruteforce"}"#);
        assert_eq!(decoded.len(), 1);
        assert_eq!(decoded[0].as_ref().unwrap()["severity"], "high");
    }

    #[test]
    fn test_decode_newline_delimited() {
        let decoded = decode_frame("{\"a\":1}\n\n{\"b\":2}\r\nnot-json\n");
        assert_eq!(decoded.len(), 3);
        assert_eq!(decoded[0].as_ref().unwrap()["a"], 1);
        assert_eq!(decoded[1].as_ref().unwrap()["b"], 2);
        assert!(matches!(decoded[2], Err(TelemetryError::Decode(_))));
    }

    #[test]
    fn test_decode_blank_frame() {
        assert!(decode_frame("  \n ").is_empty());
    }

    #[test]
    fn test_payload_serialization() {
        let payload = TelemetryPayload::live(serde_json::json!({"cpu": 12}));
        let json = serde_json::to_string(&payload).unwrap();
        assert!(json.contains("\"source\":\"live\""));
        assert!(json.contains("\"cpu\":12"));
    }
}
