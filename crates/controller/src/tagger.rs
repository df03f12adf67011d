//! Event tagger - rewrites device-local event timestamps onto the reference
//! timeline.
//!
//! Events from a device with no offset estimate yet are parked in a bounded
//! per-device buffer and tagged retroactively once the first sync round
//! lands. Tagged timestamps are kept non-decreasing per device: a resync that
//! shifts the offset backwards must not make the stream jump back in time, so
//! regressions are clamped to the last emitted timestamp and logged when they
//! exceed the estimate's own uncertainty.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

use tokio::sync::mpsc;
use tracing::{debug, trace, warn};

use contracts::{ClockOffset, DataEvent, DeviceId, TaggedEvent, TaggerConfig};

use crate::Registry;

pub struct EventTagger {
    registry: Arc<Registry>,
    config: TaggerConfig,
    output: mpsc::Sender<TaggedEvent>,
    /// Events waiting for their device's first offset
    pending: Mutex<HashMap<String, VecDeque<DataEvent>>>,
    /// Last emitted reference timestamp per device, for the monotonic clamp
    last_global: Mutex<HashMap<String, i64>>,
}

impl EventTagger {
    pub fn new(registry: Arc<Registry>, config: TaggerConfig, output: mpsc::Sender<TaggedEvent>) -> Self {
        Self {
            registry,
            config,
            output,
            pending: Mutex::new(HashMap::new()),
            last_global: Mutex::new(HashMap::new()),
        }
    }

    /// Tag and emit an event, or buffer it until its device has synced.
    pub fn ingest(&self, event: DataEvent) {
        match self.registry.offset(&event.device_id) {
            Some(offset) => {
                let tagged = self.tag(event, &offset);
                self.emit(tagged);
            }
            None => self.buffer(event),
        }
    }

    /// Retroactively tag everything buffered for a device. Called when its
    /// first offset estimate lands.
    pub fn flush_device(&self, device_id: &DeviceId) {
        let Some(offset) = self.registry.offset(device_id) else {
            return;
        };
        let drained = {
            let mut pending = self.pending.lock().expect("pending buffer poisoned");
            pending.remove(device_id.as_str())
        };
        let Some(events) = drained else { return };

        debug!(
            device = %device_id,
            events = events.len(),
            "tagging buffered pre-sync events"
        );
        for event in events {
            let tagged = self.tag(event, &offset);
            self.emit(tagged);
        }
    }

    /// Discard buffered events for a device that went away before syncing.
    /// The monotonic floor survives so a reconnect cannot rewind the stream.
    pub fn forget_device(&self, device_id: &DeviceId) {
        let dropped = self
            .pending
            .lock()
            .expect("pending buffer poisoned")
            .remove(device_id.as_str())
            .map(|q| q.len())
            .unwrap_or(0);
        if dropped > 0 {
            warn!(device = %device_id, dropped, "discarding unsynced buffered events");
            metrics::counter!("capture_hub_events_dropped_total", "reason" => "never_synced")
                .increment(dropped as u64);
        }
    }

    fn buffer(&self, event: DataEvent) {
        let mut pending = self.pending.lock().expect("pending buffer poisoned");
        let queue = pending
            .entry(event.device_id.to_string())
            .or_insert_with(VecDeque::new);
        if queue.len() >= self.config.presync_buffer {
            // Keep the newest; the oldest is the least useful once synced
            queue.pop_front();
            metrics::counter!("capture_hub_events_dropped_total", "reason" => "presync_overflow")
                .increment(1);
            warn!(device = %event.device_id, "pre-sync buffer full, dropped oldest event");
        }
        queue.push_back(event);
    }

    fn tag(&self, event: DataEvent, offset: &ClockOffset) -> TaggedEvent {
        let device_key = event.device_id.to_string();
        let mut global_nanos = event.local_nanos + offset.offset_nanos;

        {
            let mut last = self.last_global.lock().expect("clamp state poisoned");
            match last.get(&device_key) {
                Some(&prev) if global_nanos < prev => {
                    let regression = prev - global_nanos;
                    if regression > offset.uncertainty_nanos {
                        warn!(
                            device = %event.device_id,
                            regression_us = regression / 1_000,
                            uncertainty_us = offset.uncertainty_nanos / 1_000,
                            "timestamp regression beyond uncertainty, clamping"
                        );
                    }
                    metrics::counter!("capture_hub_events_clamped_total").increment(1);
                    global_nanos = prev;
                    last.insert(device_key, global_nanos);
                }
                _ => {
                    last.insert(device_key, global_nanos);
                }
            }
        }

        TaggedEvent {
            event,
            global_nanos,
            uncertainty_nanos: offset.uncertainty_nanos,
            low_confidence: offset.high_jitter,
        }
    }

    fn emit(&self, tagged: TaggedEvent) {
        match self.output.try_send(tagged) {
            Ok(()) => {
                metrics::counter!("capture_hub_events_tagged_total").increment(1);
            }
            Err(mpsc::error::TrySendError::Full(tagged)) => {
                metrics::counter!("capture_hub_events_dropped_total", "reason" => "backpressure")
                    .increment(1);
                warn!(
                    device = %tagged.event.device_id,
                    "event pipeline full, dropping tagged event"
                );
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                trace!("event pipeline closed, tagged event discarded");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use contracts::{DataEventKind, ManualClock, SharedClock};

    fn offset(nanos: i64, high_jitter: bool) -> ClockOffset {
        ClockOffset {
            offset_nanos: nanos,
            round_trip_nanos: 2_000_000,
            uncertainty_nanos: 1_000_000,
            high_jitter,
            measured_at_nanos: 0,
        }
    }

    fn harness(presync_buffer: usize) -> (EventTagger, Arc<Registry>, mpsc::Receiver<TaggedEvent>) {
        let clock: SharedClock = Arc::new(ManualClock::starting_at(0));
        let registry = Arc::new(Registry::new(clock));
        let (tx, rx) = mpsc::channel(64);
        let tagger = EventTagger::new(
            Arc::clone(&registry),
            TaggerConfig { presync_buffer },
            tx,
        );
        (tagger, registry, rx)
    }

    fn event(device: &str, local_nanos: i64) -> DataEvent {
        DataEvent::new(DataEventKind::Gsr, device.into(), local_nanos)
    }

    #[test]
    fn test_synced_device_events_tagged_directly() {
        let (tagger, registry, mut rx) = harness(8);
        let device = DeviceId::from("dev_a");
        registry.register(&device, vec![]);
        registry.set_offset(&device, offset(5_000_000, false));

        tagger.ingest(event("dev_a", 1_000_000));
        let tagged = rx.try_recv().unwrap();
        assert_eq!(tagged.global_nanos, 6_000_000);
        assert_eq!(tagged.uncertainty_nanos, 1_000_000);
        assert!(!tagged.low_confidence);
        // Original device-local timestamp preserved
        assert_eq!(tagged.event.local_nanos, 1_000_000);
    }

    #[test]
    fn test_presync_events_buffered_then_flushed_in_order() {
        let (tagger, registry, mut rx) = harness(8);
        let device = DeviceId::from("dev_a");
        registry.register(&device, vec![]);

        tagger.ingest(event("dev_a", 100));
        tagger.ingest(event("dev_a", 200));
        assert!(rx.try_recv().is_err());

        registry.set_offset(&device, offset(1_000, false));
        tagger.flush_device(&device);

        assert_eq!(rx.try_recv().unwrap().global_nanos, 1_100);
        assert_eq!(rx.try_recv().unwrap().global_nanos, 1_200);
    }

    #[test]
    fn test_presync_overflow_drops_oldest() {
        let (tagger, registry, mut rx) = harness(2);
        let device = DeviceId::from("dev_a");
        registry.register(&device, vec![]);

        tagger.ingest(event("dev_a", 1));
        tagger.ingest(event("dev_a", 2));
        tagger.ingest(event("dev_a", 3)); // evicts local_nanos=1

        registry.set_offset(&device, offset(0, false));
        tagger.flush_device(&device);

        assert_eq!(rx.try_recv().unwrap().global_nanos, 2);
        assert_eq!(rx.try_recv().unwrap().global_nanos, 3);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_offset_shift_backwards_is_clamped() {
        let (tagger, registry, mut rx) = harness(8);
        let device = DeviceId::from("dev_a");
        registry.register(&device, vec![]);
        registry.set_offset(&device, offset(10_000, false));
        tagger.ingest(event("dev_a", 1_000)); // global 11_000

        // Resync shifts the offset down; the next event would go backwards
        registry.set_offset(&device, offset(5_000, false));
        tagger.ingest(event("dev_a", 1_100)); // raw 6_100 < 11_000

        assert_eq!(rx.try_recv().unwrap().global_nanos, 11_000);
        assert_eq!(rx.try_recv().unwrap().global_nanos, 11_000);

        // Stream resumes once raw timestamps pass the floor
        tagger.ingest(event("dev_a", 7_000)); // raw 12_000
        assert_eq!(rx.try_recv().unwrap().global_nanos, 12_000);
    }

    #[test]
    fn test_high_jitter_offset_marks_low_confidence() {
        let (tagger, registry, mut rx) = harness(8);
        let device = DeviceId::from("dev_a");
        registry.register(&device, vec![]);
        registry.set_offset(&device, offset(0, true));

        tagger.ingest(event("dev_a", 42));
        assert!(rx.try_recv().unwrap().low_confidence);
    }

    #[test]
    fn test_forget_discards_pending_only() {
        let (tagger, registry, mut rx) = harness(8);
        let device = DeviceId::from("dev_a");
        registry.register(&device, vec![]);

        tagger.ingest(event("dev_a", 1));
        tagger.forget_device(&device);

        registry.set_offset(&device, offset(0, false));
        tagger.flush_device(&device);
        assert!(rx.try_recv().is_err());
    }
}
