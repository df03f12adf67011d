//! Per-device connection and clock state shared across modules.

use serde::{Deserialize, Serialize};

use crate::DeviceId;

/// Connection lifecycle state of a device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceState {
    /// Transport accepted, identity not yet established or first sync pending
    Connecting,
    /// Synced and eligible for session membership
    Ready,
    /// Actively capturing as part of a session
    Recording,
    /// Missed too many heartbeats; excluded from broadcasts
    Unreachable,
    /// Connection closed; record pending eviction
    Closed,
}

impl DeviceState {
    /// Whether the device should receive heartbeat probes.
    pub fn is_live(&self) -> bool {
        matches!(self, DeviceState::Ready | DeviceState::Recording)
    }
}

/// Role of a peer. The controller is singular and owns reference time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceRole {
    Controller,
    #[default]
    Capture,
}

/// Estimated clock offset of one device relative to the reference clock.
///
/// Defined only after at least one successful sync round trip. Published
/// atomically; readers never observe a partial update.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClockOffset {
    /// device-local + offset = reference time
    pub offset_nanos: i64,

    /// Round-trip delay of the selected (minimum-delay) probe
    pub round_trip_nanos: i64,

    /// Declared uncertainty bound (half the selected round trip)
    pub uncertainty_nanos: i64,

    /// Minimum round trip exceeded the configured ceiling
    pub high_jitter: bool,

    /// Reference time when the estimate was taken
    pub measured_at_nanos: i64,
}

/// Read-only device view published to dashboards.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceSnapshot {
    pub device_id: DeviceId,
    pub state: DeviceState,
    pub role: DeviceRole,
    pub capabilities: Vec<String>,
    pub offset: Option<ClockOffset>,
    pub last_heartbeat_nanos: Option<i64>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_live_states() {
        assert!(DeviceState::Ready.is_live());
        assert!(DeviceState::Recording.is_live());
        assert!(!DeviceState::Connecting.is_live());
        assert!(!DeviceState::Unreachable.is_live());
        assert!(!DeviceState::Closed.is_live());
    }

    #[test]
    fn test_state_serde_names() {
        let json = serde_json::to_string(&DeviceState::Unreachable).unwrap();
        assert_eq!(json, "\"unreachable\"");
    }
}
