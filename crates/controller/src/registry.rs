//! Device registry - authoritative per-device connection and clock state.
//!
//! One record per connected device, mutated only under the registry lock and
//! re-published as a whole snapshot over a watch channel after every change.
//! Readers (dashboards, CLI status) observe consistent snapshots and never
//! touch the live map.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::RwLock;

use tokio::sync::watch;
use tracing::{debug, info};

use contracts::{
    ClockOffset, DeviceHealth, DeviceId, DeviceRole, DeviceSnapshot, DeviceState, SharedClock,
};

/// Mutable per-device state.
#[derive(Debug, Clone)]
pub struct DeviceRecord {
    pub device_id: DeviceId,
    pub state: DeviceState,
    pub role: DeviceRole,
    pub capabilities: Vec<String>,
    pub offset: Option<ClockOffset>,
    pub health: Option<DeviceHealth>,
    pub last_heartbeat_nanos: Option<i64>,
    /// Highest inbound sequence accepted from this connection
    pub last_sequence: u64,
    pub missed_heartbeats: u32,
    /// Bumped on every (re)registration; per-device background tasks exit
    /// when the generation they captured is no longer current
    pub generation: u64,
}

pub struct Registry {
    devices: RwLock<HashMap<DeviceId, DeviceRecord>>,
    snapshot_tx: watch::Sender<Vec<DeviceSnapshot>>,
    clock: SharedClock,
    next_generation: AtomicU64,
}

impl Registry {
    pub fn new(clock: SharedClock) -> Self {
        let (snapshot_tx, _) = watch::channel(Vec::new());
        Self {
            devices: RwLock::new(HashMap::new()),
            snapshot_tx,
            clock,
            next_generation: AtomicU64::new(1),
        }
    }

    /// Register a device in `Connecting` state, replacing any stale record of
    /// the same id. Returns the record's generation.
    pub fn register(&self, device_id: &DeviceId, capabilities: Vec<String>) -> u64 {
        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
        {
            let mut devices = self.devices.write().expect("registry poisoned");
            devices.insert(
                device_id.clone(),
                DeviceRecord {
                    device_id: device_id.clone(),
                    state: DeviceState::Connecting,
                    role: DeviceRole::Capture,
                    capabilities,
                    offset: None,
                    health: None,
                    last_heartbeat_nanos: None,
                    last_sequence: 0,
                    missed_heartbeats: 0,
                    generation,
                },
            );
        }
        info!(device = %device_id, "device registered");
        metrics::gauge!("capture_hub_devices_connected").set(self.len() as f64);
        self.publish();
        generation
    }

    /// Drop a device record. Returns whether one existed.
    pub fn evict(&self, device_id: &DeviceId) -> bool {
        let removed = self
            .devices
            .write()
            .expect("registry poisoned")
            .remove(device_id.as_str())
            .is_some();
        if removed {
            debug!(device = %device_id, "device evicted");
            metrics::gauge!("capture_hub_devices_connected").set(self.len() as f64);
            self.publish();
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.devices.read().expect("registry poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, device_id: &DeviceId) -> bool {
        self.devices
            .read()
            .expect("registry poisoned")
            .contains_key(device_id.as_str())
    }

    pub fn state(&self, device_id: &DeviceId) -> Option<DeviceState> {
        self.with_record(device_id, |r| r.state)
    }

    pub fn generation(&self, device_id: &DeviceId) -> Option<u64> {
        self.with_record(device_id, |r| r.generation)
    }

    pub fn offset(&self, device_id: &DeviceId) -> Option<ClockOffset> {
        self.with_record(device_id, |r| r.offset).flatten()
    }

    /// Set the connection state. Returns true when the state actually changed.
    pub fn set_state(&self, device_id: &DeviceId, state: DeviceState) -> bool {
        let changed = self.update(device_id, |r| {
            let changed = r.state != state;
            r.state = state;
            changed
        });
        if changed == Some(true) {
            debug!(device = %device_id, state = ?state, "device state changed");
            self.publish();
            true
        } else {
            false
        }
    }

    /// Promote a freshly synced or recovered device to `Ready` without
    /// touching devices already in a session.
    pub fn mark_ready(&self, device_id: &DeviceId) -> bool {
        let promoted = self.update(device_id, |r| {
            if matches!(r.state, DeviceState::Connecting | DeviceState::Unreachable) {
                r.state = DeviceState::Ready;
                true
            } else {
                false
            }
        });
        if promoted == Some(true) {
            info!(device = %device_id, "device ready");
            self.publish();
            true
        } else {
            false
        }
    }

    /// Store a fresh offset estimate. Returns true when it is the device's
    /// first.
    pub fn set_offset(&self, device_id: &DeviceId, offset: ClockOffset) -> bool {
        let first = self.update(device_id, |r| {
            let first = r.offset.is_none();
            r.offset = Some(offset);
            first
        });
        self.publish();
        first == Some(true)
    }

    pub fn set_health(&self, device_id: &DeviceId, health: DeviceHealth) {
        self.update(device_id, |r| r.health = Some(health));
        self.publish();
    }

    pub fn set_capabilities(&self, device_id: &DeviceId, capabilities: Vec<String>) {
        self.update(device_id, |r| r.capabilities = capabilities);
        self.publish();
    }

    /// Accept an inbound sequence number, rejecting duplicates and stale
    /// replays. Sequences start at 1, so a fresh record accepts anything.
    pub fn accept_sequence(&self, device_id: &DeviceId, sequence: u64) -> bool {
        self.update(device_id, |r| {
            if sequence > r.last_sequence {
                r.last_sequence = sequence;
                true
            } else {
                false
            }
        })
        .unwrap_or(false)
    }

    /// Record a heartbeat reply: reset the miss counter, stamp the time.
    pub fn record_heartbeat(&self, device_id: &DeviceId) {
        let now = self.clock.now_nanos();
        self.update(device_id, |r| {
            r.missed_heartbeats = 0;
            r.last_heartbeat_nanos = Some(now);
        });
    }

    /// Increment the consecutive-miss counter; returns the new count.
    pub fn bump_missed(&self, device_id: &DeviceId) -> Option<u32> {
        self.update(device_id, |r| {
            r.missed_heartbeats += 1;
            r.missed_heartbeats
        })
    }

    /// Devices eligible for heartbeat probing.
    pub fn live_devices(&self) -> Vec<DeviceId> {
        self.collect(|r| r.state.is_live())
    }

    /// Devices eligible for session membership.
    pub fn ready_devices(&self) -> Vec<DeviceId> {
        self.collect(|r| r.state == DeviceState::Ready)
    }

    /// Current snapshot, sorted by device id.
    pub fn snapshot(&self) -> Vec<DeviceSnapshot> {
        let devices = self.devices.read().expect("registry poisoned");
        let mut out: Vec<DeviceSnapshot> = devices
            .values()
            .map(|r| DeviceSnapshot {
                device_id: r.device_id.clone(),
                state: r.state,
                role: r.role,
                capabilities: r.capabilities.clone(),
                offset: r.offset,
                last_heartbeat_nanos: r.last_heartbeat_nanos,
            })
            .collect();
        out.sort_by(|a, b| a.device_id.as_str().cmp(b.device_id.as_str()));
        out
    }

    /// Watch the snapshot stream; a new value is published after every change.
    pub fn subscribe(&self) -> watch::Receiver<Vec<DeviceSnapshot>> {
        self.snapshot_tx.subscribe()
    }

    fn with_record<R>(&self, device_id: &DeviceId, f: impl FnOnce(&DeviceRecord) -> R) -> Option<R> {
        let devices = self.devices.read().expect("registry poisoned");
        devices.get(device_id.as_str()).map(f)
    }

    fn update<R>(&self, device_id: &DeviceId, f: impl FnOnce(&mut DeviceRecord) -> R) -> Option<R> {
        let mut devices = self.devices.write().expect("registry poisoned");
        devices.get_mut(device_id.as_str()).map(f)
    }

    fn collect(&self, keep: impl Fn(&DeviceRecord) -> bool) -> Vec<DeviceId> {
        let devices = self.devices.read().expect("registry poisoned");
        let mut out: Vec<DeviceId> = devices
            .values()
            .filter(|r| keep(r))
            .map(|r| r.device_id.clone())
            .collect();
        out.sort_by(|a, b| a.as_str().cmp(b.as_str()));
        out
    }

    fn publish(&self) {
        self.snapshot_tx.send_replace(self.snapshot());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use contracts::ManualClock;
    use std::sync::Arc;

    fn registry() -> Registry {
        Registry::new(Arc::new(ManualClock::starting_at(1_000)))
    }

    fn offset(nanos: i64) -> ClockOffset {
        ClockOffset {
            offset_nanos: nanos,
            round_trip_nanos: 2_000_000,
            uncertainty_nanos: 1_000_000,
            high_jitter: false,
            measured_at_nanos: 0,
        }
    }

    #[test]
    fn test_register_and_promote() {
        let registry = registry();
        let device = DeviceId::from("dev_a");
        registry.register(&device, vec!["gsr".to_string()]);

        assert_eq!(registry.state(&device), Some(DeviceState::Connecting));
        assert!(registry.ready_devices().is_empty());

        assert!(registry.set_offset(&device, offset(5)));
        assert!(registry.mark_ready(&device));
        assert_eq!(registry.ready_devices(), vec![device.clone()]);

        // Second offset is not "first", and Ready stays Ready
        assert!(!registry.set_offset(&device, offset(6)));
        assert!(!registry.mark_ready(&device));
    }

    #[test]
    fn test_mark_ready_does_not_touch_recording() {
        let registry = registry();
        let device = DeviceId::from("dev_a");
        registry.register(&device, vec![]);
        registry.set_state(&device, DeviceState::Recording);

        assert!(!registry.mark_ready(&device));
        assert_eq!(registry.state(&device), Some(DeviceState::Recording));
    }

    #[test]
    fn test_sequence_duplicates_rejected() {
        let registry = registry();
        let device = DeviceId::from("dev_a");
        registry.register(&device, vec![]);

        assert!(registry.accept_sequence(&device, 1));
        assert!(registry.accept_sequence(&device, 3));
        assert!(!registry.accept_sequence(&device, 3));
        assert!(!registry.accept_sequence(&device, 2));

        // Re-registration resets the window
        registry.register(&device, vec![]);
        assert!(registry.accept_sequence(&device, 1));
    }

    #[test]
    fn test_reregistration_bumps_generation() {
        let registry = registry();
        let device = DeviceId::from("dev_a");
        let g1 = registry.register(&device, vec![]);
        let g2 = registry.register(&device, vec![]);
        assert!(g2 > g1);
        assert_eq!(registry.generation(&device), Some(g2));
    }

    #[test]
    fn test_heartbeat_bookkeeping() {
        let registry = registry();
        let device = DeviceId::from("dev_a");
        registry.register(&device, vec![]);

        assert_eq!(registry.bump_missed(&device), Some(1));
        assert_eq!(registry.bump_missed(&device), Some(2));
        registry.record_heartbeat(&device);
        assert_eq!(registry.bump_missed(&device), Some(1));
    }

    #[test]
    fn test_watch_publishes_changes() {
        let registry = registry();
        let mut rx = registry.subscribe();
        assert!(rx.borrow().is_empty());

        registry.register(&DeviceId::from("dev_a"), vec![]);
        assert!(rx.has_changed().unwrap());
        assert_eq!(rx.borrow_and_update().len(), 1);
    }
}
