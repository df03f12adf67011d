//! Heartbeat monitor - periodic liveness probing of live devices.
//!
//! Every tick the monitor charges each live device one miss, then sends it a
//! probe; a `HEARTBEAT_ACK` routed through [`HeartbeatMonitor::handle_ack`]
//! clears the charge. A device whose miss count passes `max_missed` is
//! declared unreachable: its registry state flips, the session orchestrator
//! sheds it, and the heartbeat stops probing it. The per-device clock-sync
//! loop keeps probing, so a device that comes back is promoted to Ready again
//! without a reconnect.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

use contracts::{DeviceId, DeviceState, HeartbeatConfig, Outbox, Payload};
use transport::Transport;

use crate::{Registry, SessionOrchestrator};

/// Every this many probe rounds, piggyback a STATUS_REQUEST so the registry
/// carries reasonably fresh battery/storage health for dashboards.
const STATUS_POLL_EVERY: u64 = 10;

pub struct HeartbeatMonitor<T: Transport> {
    transport: Arc<T>,
    outbox: Arc<Outbox>,
    registry: Arc<Registry>,
    orchestrator: Arc<SessionOrchestrator<T>>,
    config: HeartbeatConfig,
    probe_counter: AtomicU64,
    tick_counter: AtomicU64,
}

impl<T: Transport + Sync + 'static> HeartbeatMonitor<T> {
    pub fn new(
        transport: Arc<T>,
        outbox: Arc<Outbox>,
        registry: Arc<Registry>,
        orchestrator: Arc<SessionOrchestrator<T>>,
        config: HeartbeatConfig,
    ) -> Self {
        Self {
            transport,
            outbox,
            registry,
            orchestrator,
            config,
            probe_counter: AtomicU64::new(1),
            tick_counter: AtomicU64::new(0),
        }
    }

    /// Run the probe loop until the task is aborted.
    pub fn spawn(self: Arc<Self>) -> JoinHandle<()> {
        let period = Duration::from_millis(self.config.interval_ms);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            // First tick fires immediately; skip it so devices get a full
            // interval to answer their first probe
            ticker.tick().await;
            loop {
                ticker.tick().await;
                self.tick().await;
            }
        })
    }

    /// One probe round across all live devices.
    async fn tick(&self) {
        let round = self.tick_counter.fetch_add(1, Ordering::Relaxed);
        let poll_status = round % STATUS_POLL_EVERY == 0 && round > 0;
        for device in self.registry.live_devices() {
            let missed = match self.registry.bump_missed(&device) {
                Some(missed) => missed,
                None => continue, // evicted between collect and bump
            };

            if missed > self.config.max_missed {
                warn!(
                    device = %device,
                    missed = missed - 1,
                    "heartbeat timeout, declaring device unreachable"
                );
                metrics::counter!("capture_hub_heartbeat_timeouts_total").increment(1);
                self.registry.set_state(&device, DeviceState::Unreachable);
                self.orchestrator.member_lost(&device);
                continue;
            }

            let probe = self.probe_counter.fetch_add(1, Ordering::Relaxed);
            let msg = self.outbox.message(Payload::Heartbeat { probe });
            if let Err(e) = self.transport.send(&device, msg).await {
                debug!(device = %device, error = %e, "heartbeat probe not delivered");
                continue;
            }

            if poll_status {
                let msg = self.outbox.message(Payload::StatusRequest);
                if let Err(e) = self.transport.send(&device, msg).await {
                    debug!(device = %device, error = %e, "status request not delivered");
                }
            }
        }
    }

    /// Record a heartbeat reply.
    pub fn handle_ack(&self, device_id: &DeviceId, probe: u64) {
        trace!(device = %device_id, probe, "heartbeat ack");
        self.registry.record_heartbeat(device_id);
    }
}
