//! Synthetic sensor streams.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::debug;

use contracts::{Clock, DataEvent, DataEventKind, DeviceId};

use crate::device::SkewedClock;

/// One synthetic sensor stream.
#[derive(Debug, Clone)]
pub struct SensorSpec {
    pub kind: DataEventKind,
    pub frequency_hz: f64,
}

impl SensorSpec {
    pub fn new(kind: DataEventKind, frequency_hz: f64) -> Self {
        Self { kind, frequency_hz }
    }

    pub fn gsr(frequency_hz: f64) -> Self {
        Self::new(DataEventKind::Gsr, frequency_hz)
    }

    pub fn rgb(frequency_hz: f64) -> Self {
        Self::new(DataEventKind::RgbFrame, frequency_hz)
    }

    pub fn thermal(frequency_hz: f64) -> Self {
        Self::new(DataEventKind::ThermalFrame, frequency_hz)
    }

    pub fn audio(frequency_hz: f64) -> Self {
        Self::new(DataEventKind::Audio, frequency_hz)
    }

    pub fn sync_marker(frequency_hz: f64) -> Self {
        Self::new(DataEventKind::SyncMarker, frequency_hz)
    }

    /// Capability string advertised in the HELLO introduction.
    pub fn capability(&self) -> String {
        match self.kind {
            DataEventKind::Gsr => "gsr",
            DataEventKind::RgbFrame => "rgb_frame",
            DataEventKind::ThermalFrame => "thermal_frame",
            DataEventKind::Audio => "audio",
            DataEventKind::SyncMarker => "sync_marker",
        }
        .to_string()
    }
}

/// Kind-appropriate fake measurement payload.
pub(crate) fn sample_payload(kind: DataEventKind, counter: u64) -> HashMap<String, Value> {
    let mut rng = rand::rng();
    let mut data = HashMap::new();
    match kind {
        DataEventKind::Gsr => {
            data.insert(
                "conductance_us".to_string(),
                json!(4.0 + rng.random_range(-0.5..0.5)),
            );
        }
        DataEventKind::RgbFrame => {
            data.insert("frame_number".to_string(), json!(counter));
            data.insert("exposure_ms".to_string(), json!(16.6));
        }
        DataEventKind::ThermalFrame => {
            data.insert("frame_number".to_string(), json!(counter));
            data.insert(
                "max_temp_c".to_string(),
                json!(36.0 + rng.random_range(0.0..1.5)),
            );
        }
        DataEventKind::Audio => {
            data.insert("rms_db".to_string(), json!(-40.0 + rng.random_range(0.0..20.0)));
        }
        DataEventKind::SyncMarker => {
            data.insert("marker_id".to_string(), json!(counter));
        }
    }
    data
}

/// Emit events at the configured rate while `recording` holds true.
pub(crate) fn spawn_stream(
    spec: SensorSpec,
    device_id: DeviceId,
    clock: SkewedClock,
    recording: Arc<AtomicBool>,
    tx: mpsc::Sender<DataEvent>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let period = Duration::from_secs_f64(1.0 / spec.frequency_hz);
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        let mut counter: u64 = 0;

        loop {
            ticker.tick().await;
            if !recording.load(Ordering::Relaxed) {
                continue;
            }
            counter += 1;

            let mut event = DataEvent::new(spec.kind, device_id.clone(), clock.now_nanos());
            event.data = sample_payload(spec.kind, counter);

            if tx.send(event).await.is_err() {
                debug!(device = %device_id, kind = ?spec.kind, "sensor stream closed");
                break;
            }
        }
    })
}
