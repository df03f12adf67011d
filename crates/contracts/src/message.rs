//! Wire message envelope and payload variants.
//!
//! One `Message` per wire frame. The payload is a closed tagged enum so new
//! command types are a compile-time-checked surface; tags a peer does not know
//! decode to `Unrecognized` instead of failing the frame.

use serde::{Deserialize, Serialize};

use crate::{DataEvent, DeviceId};

/// Wire message envelope.
///
/// `sequence` increases monotonically per sender and is used by higher layers
/// for duplicate/stale detection; the codec does not enforce it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Message {
    /// Identity of the sending peer
    pub sender_id: DeviceId,

    /// Per-sender monotonic sequence number
    pub sequence: u64,

    /// Sender-local send timestamp (nanoseconds)
    pub sent_at_nanos: i64,

    /// Typed payload
    #[serde(flatten)]
    pub payload: Payload,
}

impl Message {
    /// Construct a message envelope.
    pub fn new(sender_id: DeviceId, sequence: u64, sent_at_nanos: i64, payload: Payload) -> Self {
        Self {
            sender_id,
            sequence,
            sent_at_nanos,
            payload,
        }
    }

    /// Payload discriminant, for logging and ack correlation.
    pub fn kind(&self) -> PayloadKind {
        self.payload.kind()
    }
}

/// Message payload variants.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Payload {
    /// Device introduction; first frame on every connection
    Hello { capabilities: Vec<String> },

    /// Clock-sync probe: controller send time `t0`
    SyncPing { t0_nanos: i64 },

    /// Clock-sync reply: echoes `t0`, adds device receive/transmit times
    SyncPong {
        t0_nanos: i64,
        t1_nanos: i64,
        t2_nanos: i64,
    },

    /// Begin capture at `scheduled_start_nanos` (reference time)
    CmdStart {
        session_id: String,
        scheduled_start_nanos: i64,
    },

    /// End capture for the named session
    CmdStop { session_id: String },

    /// Request a health report
    StatusRequest,

    /// Health report response
    StatusReport { health: DeviceHealth },

    /// Acknowledgment of a prior message, correlated by sequence
    Ack {
        ack_sequence: u64,
        ack_kind: PayloadKind,
    },

    /// Liveness probe
    Heartbeat { probe: u64 },

    /// Liveness reply, echoes the probe counter
    HeartbeatAck { probe: u64 },

    /// Peer-reported error
    Error { code: ErrorCode, message: String },

    /// Sensor data relayed through the control channel
    Data { event: DataEvent },

    /// Unknown message type from a newer peer; dropped by consumers
    #[serde(other)]
    Unrecognized,
}

impl Payload {
    /// Discriminant of this payload.
    pub fn kind(&self) -> PayloadKind {
        match self {
            Payload::Hello { .. } => PayloadKind::Hello,
            Payload::SyncPing { .. } => PayloadKind::SyncPing,
            Payload::SyncPong { .. } => PayloadKind::SyncPong,
            Payload::CmdStart { .. } => PayloadKind::CmdStart,
            Payload::CmdStop { .. } => PayloadKind::CmdStop,
            Payload::StatusRequest => PayloadKind::StatusRequest,
            Payload::StatusReport { .. } => PayloadKind::StatusReport,
            Payload::Ack { .. } => PayloadKind::Ack,
            Payload::Heartbeat { .. } => PayloadKind::Heartbeat,
            Payload::HeartbeatAck { .. } => PayloadKind::HeartbeatAck,
            Payload::Error { .. } => PayloadKind::Error,
            Payload::Data { .. } => PayloadKind::Data,
            Payload::Unrecognized => PayloadKind::Unrecognized,
        }
    }
}

/// Payload discriminant without fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PayloadKind {
    Hello,
    SyncPing,
    SyncPong,
    CmdStart,
    CmdStop,
    StatusRequest,
    StatusReport,
    Ack,
    Heartbeat,
    HeartbeatAck,
    Error,
    Data,
    Unrecognized,
}

/// Device health snapshot carried by `StatusReport`.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct DeviceHealth {
    /// Battery level 0-100, if the device reports one
    pub battery_percent: Option<f32>,

    /// Free storage in bytes, if known
    pub free_storage_bytes: Option<u64>,

    /// Whether the device is currently capturing
    pub recording: bool,
}

/// Error codes reported over the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    General,
    NotConnected,
    Busy,
    Timeout,
    InvalidCommand,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn envelope(payload: Payload) -> Message {
        Message::new("dev_a".into(), 7, 1_000, payload)
    }

    #[test]
    fn test_payload_tag_round_trip() {
        let msg = envelope(Payload::CmdStart {
            session_id: "s1".to_string(),
            scheduled_start_nanos: 42,
        });

        let json = serde_json::to_string(&msg).unwrap();
        assert!(json.contains("\"type\":\"cmd_start\""));

        let parsed: Message = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, msg);
    }

    #[test]
    fn test_unknown_type_decodes_to_unrecognized() {
        let json = r#"{"sender_id":"dev_a","sequence":1,"sent_at_nanos":5,"type":"cmd_teleport"}"#;
        let parsed: Message = serde_json::from_str(json).unwrap();
        assert_eq!(parsed.payload, Payload::Unrecognized);
        assert_eq!(parsed.sender_id, "dev_a");
    }

    #[test]
    fn test_kind_matches_variant() {
        let msg = envelope(Payload::Heartbeat { probe: 3 });
        assert_eq!(msg.kind(), PayloadKind::Heartbeat);
    }

    #[test]
    fn test_sync_pong_fields() {
        let msg = envelope(Payload::SyncPong {
            t0_nanos: 1,
            t1_nanos: 2,
            t2_nanos: 3,
        });
        let json = serde_json::to_string(&msg).unwrap();
        let parsed: Message = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, msg);
    }
}
