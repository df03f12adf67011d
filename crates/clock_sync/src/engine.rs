//! Main clock-sync engine implementation.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::oneshot;
use tokio::time::timeout;
use tracing::{debug, instrument, trace, warn};

use contracts::{ClockOffset, ClockSyncConfig, DeviceId, Outbox, Payload, SharedClock};
use transport::Transport;

use crate::estimate::{estimate_sample, ProbeSample};
use crate::SyncError;

/// Pause between probes so consecutive samples do not share one congestion
/// burst.
const INTER_PROBE_GAP: Duration = Duration::from_millis(10);

/// Pending probes are keyed by (device, t0); t0 is unique per probe because
/// the reference clock is nanosecond-resolution and probes are spaced apart.
type PendingKey = (String, i64);

/// NTP-style offset estimation engine.
///
/// The engine sends probes itself but never reads from the transport: the
/// controller's event loop routes every inbound SYNC_PONG to [`handle_pong`],
/// which resolves the matching in-flight probe.
///
/// [`handle_pong`]: ClockSyncEngine::handle_pong
pub struct ClockSyncEngine<T: Transport> {
    transport: Arc<T>,
    outbox: Arc<Outbox>,
    clock: SharedClock,
    config: ClockSyncConfig,
    pending: Mutex<HashMap<PendingKey, oneshot::Sender<ProbeSample>>>,
}

impl<T: Transport> ClockSyncEngine<T> {
    pub fn new(
        transport: Arc<T>,
        outbox: Arc<Outbox>,
        clock: SharedClock,
        config: ClockSyncConfig,
    ) -> Self {
        Self {
            transport,
            outbox,
            clock,
            config,
            pending: Mutex::new(HashMap::new()),
        }
    }

    /// Resolve an inbound SYNC_PONG against its in-flight probe.
    ///
    /// `t3` is taken here, at receipt. Unmatched pongs (probe already timed
    /// out, or duplicates) are dropped.
    pub fn handle_pong(&self, device_id: &DeviceId, t0_nanos: i64, t1_nanos: i64, t2_nanos: i64) {
        let t3_nanos = self.clock.now_nanos();
        let sample = estimate_sample(t0_nanos, t1_nanos, t2_nanos, t3_nanos);

        let waiter = {
            let mut pending = self.pending.lock().expect("pending map poisoned");
            pending.remove(&(device_id.to_string(), t0_nanos))
        };

        match waiter {
            Some(tx) => {
                let _ = tx.send(sample);
            }
            None => trace!(device = %device_id, t0 = t0_nanos, "pong without pending probe"),
        }
    }

    /// Run one full sync round against a device and return the winning
    /// estimate.
    ///
    /// Sends `probes_per_round` pings, keeps the sample with the minimum
    /// round-trip delay, and flags the result high-jitter when even that
    /// minimum exceeds the configured ceiling.
    #[instrument(name = "clock_sync_round", skip(self), fields(device = %device_id))]
    pub async fn sync_device(&self, device_id: &DeviceId) -> Result<ClockOffset, SyncError> {
        let mut best: Option<ProbeSample> = None;
        let mut completed = 0usize;

        for probe in 0..self.config.probes_per_round {
            if probe > 0 {
                tokio::time::sleep(INTER_PROBE_GAP).await;
            }

            match self.run_probe(device_id).await {
                Ok(sample) => {
                    completed += 1;
                    let better = best
                        .map(|b| sample.round_trip_nanos < b.round_trip_nanos)
                        .unwrap_or(true);
                    if better {
                        best = Some(sample);
                    }
                }
                Err(SyncError::Transport(e)) => {
                    // Peer went away mid-round; remaining probes cannot fare better
                    debug!(device = %device_id, error = %e, "probe send failed, ending round");
                    break;
                }
                Err(_) => {} // per-probe timeout, keep going
            }
        }

        let Some(sample) = best else {
            metrics::counter!("capture_hub_sync_rounds_failed_total").increment(1);
            return Err(SyncError::NoSamples {
                device_id: device_id.to_string(),
                attempts: self.config.probes_per_round,
            });
        };

        let rtt_ceiling_nanos = self.config.rtt_ceiling_ms as i64 * 1_000_000;
        let high_jitter = sample.round_trip_nanos > rtt_ceiling_nanos;
        let offset = ClockOffset {
            offset_nanos: sample.offset_nanos,
            round_trip_nanos: sample.round_trip_nanos,
            uncertainty_nanos: sample.round_trip_nanos / 2,
            high_jitter,
            measured_at_nanos: self.clock.now_nanos(),
        };

        if high_jitter {
            warn!(
                device = %device_id,
                rtt_ms = sample.round_trip_nanos / 1_000_000,
                ceiling_ms = self.config.rtt_ceiling_ms,
                "minimum round trip above ceiling, offset flagged high-jitter"
            );
        }
        debug!(
            device = %device_id,
            offset_us = offset.offset_nanos / 1_000,
            rtt_us = offset.round_trip_nanos / 1_000,
            samples = completed,
            "sync round complete"
        );

        metrics::counter!("capture_hub_sync_rounds_total").increment(1);
        metrics::gauge!("capture_hub_clock_offset_ms", "device_id" => device_id.to_string())
            .set(offset.offset_nanos as f64 / 1e6);
        metrics::histogram!("capture_hub_sync_rtt_ms").record(offset.round_trip_nanos as f64 / 1e6);

        Ok(offset)
    }

    /// One ping/pong exchange.
    async fn run_probe(&self, device_id: &DeviceId) -> Result<ProbeSample, SyncError> {
        let t0_nanos = self.clock.now_nanos();
        let (tx, rx) = oneshot::channel();
        let key: PendingKey = (device_id.to_string(), t0_nanos);

        self.pending
            .lock()
            .expect("pending map poisoned")
            .insert(key.clone(), tx);

        let ping = self.outbox.message(Payload::SyncPing { t0_nanos });
        if let Err(e) = self.transport.send(device_id, ping).await {
            self.pending
                .lock()
                .expect("pending map poisoned")
                .remove(&key);
            return Err(SyncError::Transport(e));
        }

        match timeout(Duration::from_millis(self.config.probe_timeout_ms), rx).await {
            Ok(Ok(sample)) => Ok(sample),
            // Elapsed, or sender dropped (engine shutdown)
            _ => {
                self.pending
                    .lock()
                    .expect("pending map poisoned")
                    .remove(&key);
                metrics::counter!("capture_hub_sync_probes_lost_total").increment(1);
                Err(SyncError::NoSamples {
                    device_id: device_id.to_string(),
                    attempts: 1,
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use contracts::{ManualClock, Message};
    use transport::MemoryTransport;

    struct Harness {
        engine: Arc<ClockSyncEngine<MemoryTransport>>,
        clock: ManualClock,
        peer_inbox: tokio::sync::mpsc::Receiver<Message>,
    }

    async fn harness(config: ClockSyncConfig) -> Harness {
        let clock = ManualClock::starting_at(1_000_000_000);
        let shared: SharedClock = Arc::new(clock.clone());

        let mut transport = MemoryTransport::new();
        let _events = transport.start().await.unwrap();
        let peer = transport.attach_peer("dev_a", vec![]).await.unwrap();

        let outbox = Arc::new(Outbox::new("controller".into(), Arc::clone(&shared)));
        let engine = Arc::new(ClockSyncEngine::new(
            Arc::new(transport),
            outbox,
            shared,
            config,
        ));

        Harness {
            engine,
            clock,
            peer_inbox: peer.inbox,
        }
    }

    /// Drive the device side of a round: for ping `i`, simulate a device
    /// `behind` ns behind the reference with round trip `rtts[i]`.
    fn respond(mut h: Harness, behind: i64, rtts: Vec<i64>) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut i = 0;
            while let Some(msg) = h.peer_inbox.recv().await {
                let Payload::SyncPing { t0_nanos } = msg.payload else {
                    continue;
                };
                let rtt = rtts[i.min(rtts.len() - 1)];
                i += 1;

                let t1 = t0_nanos + rtt / 2 - behind;
                let t2 = t1;
                h.clock.set(t0_nanos + rtt);
                h.engine.handle_pong(&"dev_a".into(), t0_nanos, t1, t2);
            }
        })
    }

    #[tokio::test]
    async fn test_round_selects_minimum_rtt_sample() {
        let config = ClockSyncConfig {
            probes_per_round: 4,
            probe_timeout_ms: 1_000,
            rtt_ceiling_ms: 50,
            ..Default::default()
        };
        let h = harness(config).await;
        let engine = Arc::clone(&h.engine);

        // Third probe has the cleanest path
        let _responder = respond(h, 5_000_000, vec![8_000_000, 6_000_000, 2_000_000, 9_000_000]);

        let offset = engine.sync_device(&"dev_a".into()).await.unwrap();
        assert_eq!(offset.round_trip_nanos, 2_000_000);
        assert_eq!(offset.offset_nanos, 5_000_000);
        assert_eq!(offset.uncertainty_nanos, 1_000_000);
        assert!(!offset.high_jitter);
    }

    #[tokio::test]
    async fn test_high_jitter_flagged_above_ceiling() {
        let config = ClockSyncConfig {
            probes_per_round: 2,
            probe_timeout_ms: 1_000,
            rtt_ceiling_ms: 10,
            ..Default::default()
        };
        let h = harness(config).await;
        let engine = Arc::clone(&h.engine);

        // 40ms round trips, ceiling is 10ms
        let _responder = respond(h, -2_000_000, vec![40_000_000]);

        let offset = engine.sync_device(&"dev_a".into()).await.unwrap();
        assert!(offset.high_jitter);
        assert_eq!(offset.offset_nanos, -2_000_000);
    }

    #[tokio::test]
    async fn test_silent_device_yields_no_samples() {
        let config = ClockSyncConfig {
            probes_per_round: 2,
            probe_timeout_ms: 20,
            ..Default::default()
        };
        let h = harness(config).await;

        // No responder task: every probe times out
        let err = h.engine.sync_device(&"dev_a".into()).await.unwrap_err();
        assert!(matches!(err, SyncError::NoSamples { attempts: 2, .. }));
    }

    #[tokio::test]
    async fn test_unmatched_pong_is_ignored() {
        let h = harness(ClockSyncConfig::default()).await;
        // Must not panic or leave state behind
        h.engine.handle_pong(&"dev_a".into(), 1, 2, 3);
        assert!(h.engine.pending.lock().unwrap().is_empty());
    }
}
