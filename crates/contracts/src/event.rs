//! DataEvent - sensor event payloads
//!
//! Produced by capture devices in device-local time, normalized onto the
//! reference timeline by the event tagger, never mutated after tagging.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::DeviceId;

/// Sensor event kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DataEventKind {
    Gsr,
    RgbFrame,
    ThermalFrame,
    Audio,
    SyncMarker,
}

/// Sensor event as emitted by a capture device.
///
/// `local_nanos` is in the *device's* clock domain until the event tagger
/// rewrites it onto the reference timeline.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DataEvent {
    /// Event kind
    pub kind: DataEventKind,

    /// Source device
    pub device_id: DeviceId,

    /// Device-local timestamp (nanoseconds)
    pub local_nanos: i64,

    /// Kind-dependent key/value payload
    #[serde(default)]
    pub data: HashMap<String, Value>,
}

impl DataEvent {
    /// Create an event with an empty payload map.
    pub fn new(kind: DataEventKind, device_id: DeviceId, local_nanos: i64) -> Self {
        Self {
            kind,
            device_id,
            local_nanos,
            data: HashMap::new(),
        }
    }

    /// Attach a payload value.
    pub fn with_value(mut self, key: impl Into<String>, value: Value) -> Self {
        self.data.insert(key.into(), value);
        self
    }
}

/// Event after clock-offset normalization.
///
/// Immutable once produced; downstream sinks consume it as-is.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TaggedEvent {
    /// The original event (timestamp still device-local)
    pub event: DataEvent,

    /// Reference-clock timestamp after offset correction
    pub global_nanos: i64,

    /// Declared uncertainty of the correction (half the sync round-trip)
    pub uncertainty_nanos: i64,

    /// True when the offset came from a high-jitter sync round
    pub low_confidence: bool,
}
