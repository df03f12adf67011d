//! Controller wiring and the transport event loop.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use clock_sync::ClockSyncEngine;
use contracts::{
    DeviceId, DisconnectReason, ErrorCode, HubConfig, HubError, Message, Outbox, Payload,
    SessionSnapshot, SharedClock, TaggedEvent, TransportEvent,
};
use transport::Transport;

use crate::{EventTagger, HeartbeatMonitor, Registry, SessionOrchestrator};

/// Retry pause after a failed sync round, instead of waiting out the full
/// resync interval against a device that may just have hiccuped.
const SYNC_RETRY: Duration = Duration::from_secs(5);

/// Owns every hub component and the single transport event stream.
///
/// Tagged events flow out through the `output` channel handed to
/// [`Controller::start`]; the dispatcher is the intended consumer.
pub struct Controller<T: Transport> {
    transport: Arc<T>,
    clock: SharedClock,
    config: HubConfig,
    outbox: Arc<Outbox>,
    registry: Arc<Registry>,
    engine: Arc<ClockSyncEngine<T>>,
    orchestrator: Arc<SessionOrchestrator<T>>,
    heartbeat: Arc<HeartbeatMonitor<T>>,
    tagger: Arc<EventTagger>,
    events: mpsc::Receiver<TransportEvent>,
    sync_tasks: Arc<Mutex<Vec<JoinHandle<()>>>>,
}

/// Accessors for a controller whose event loop runs in the background.
pub struct ControllerHandle<T: Transport> {
    transport: Arc<T>,
    registry: Arc<Registry>,
    orchestrator: Arc<SessionOrchestrator<T>>,
    run_task: JoinHandle<()>,
    heartbeat_task: JoinHandle<()>,
    sync_tasks: Arc<Mutex<Vec<JoinHandle<()>>>>,
}

impl<T: Transport + Sync + 'static> Controller<T> {
    /// Start the transport and assemble the component graph.
    pub async fn start(
        mut transport: T,
        clock: SharedClock,
        config: HubConfig,
        output: mpsc::Sender<TaggedEvent>,
    ) -> Result<Self, HubError> {
        let events = transport.start().await?;
        let transport = Arc::new(transport);

        let outbox = Arc::new(Outbox::new(
            DeviceId::from(config.server.controller_id.as_str()),
            Arc::clone(&clock),
        ));
        let registry = Arc::new(Registry::new(Arc::clone(&clock)));
        let engine = Arc::new(ClockSyncEngine::new(
            Arc::clone(&transport),
            Arc::clone(&outbox),
            Arc::clone(&clock),
            config.clock_sync.clone(),
        ));
        let orchestrator = Arc::new(SessionOrchestrator::new(
            Arc::clone(&transport),
            Arc::clone(&outbox),
            Arc::clone(&registry),
            Arc::clone(&clock),
            config.session.clone(),
        ));
        let heartbeat = Arc::new(HeartbeatMonitor::new(
            Arc::clone(&transport),
            Arc::clone(&outbox),
            Arc::clone(&registry),
            Arc::clone(&orchestrator),
            config.heartbeat.clone(),
        ));
        let tagger = Arc::new(EventTagger::new(
            Arc::clone(&registry),
            config.tagger.clone(),
            output,
        ));

        info!(controller_id = %config.server.controller_id, "controller started");
        Ok(Self {
            transport,
            clock,
            config,
            outbox,
            registry,
            engine,
            orchestrator,
            heartbeat,
            tagger,
            events,
            sync_tasks: Arc::new(Mutex::new(Vec::new())),
        })
    }

    /// Move the event loop and heartbeat monitor onto background tasks.
    pub fn spawn(self) -> ControllerHandle<T> {
        let transport = Arc::clone(&self.transport);
        let registry = Arc::clone(&self.registry);
        let orchestrator = Arc::clone(&self.orchestrator);
        let sync_tasks = Arc::clone(&self.sync_tasks);
        let heartbeat_task = Arc::clone(&self.heartbeat).spawn();
        let run_task = tokio::spawn(self.run());
        ControllerHandle {
            transport,
            registry,
            orchestrator,
            run_task,
            heartbeat_task,
            sync_tasks,
        }
    }

    /// Consume transport events until the stream closes.
    pub async fn run(mut self) {
        while let Some(event) = self.events.recv().await {
            match event {
                TransportEvent::Connected {
                    device_id,
                    capabilities,
                } => self.on_connected(device_id, capabilities),
                TransportEvent::Disconnected { device_id, reason } => {
                    self.on_disconnected(device_id, reason)
                }
                TransportEvent::Message { device_id, message } => {
                    self.on_message(device_id, message).await
                }
                TransportEvent::Error { device_id, message } => {
                    warn!(device = ?device_id, error = %message, "transport error");
                    metrics::counter!("capture_hub_transport_errors_total").increment(1);
                }
            }
        }
        info!("transport event stream closed, controller loop exiting");
    }

    fn on_connected(&self, device_id: DeviceId, capabilities: Vec<String>) {
        let generation = self.registry.register(&device_id, capabilities);
        self.spawn_sync_loop(device_id, generation);
    }

    fn on_disconnected(&self, device_id: DeviceId, reason: DisconnectReason) {
        info!(device = %device_id, reason = %reason, "device disconnected");
        self.registry.evict(&device_id);
        self.orchestrator.member_lost(&device_id);
        self.tagger.forget_device(&device_id);
    }

    async fn on_message(&self, device_id: DeviceId, message: Message) {
        if !self.registry.accept_sequence(&device_id, message.sequence) {
            trace!(device = %device_id, sequence = message.sequence, "duplicate frame dropped");
            metrics::counter!("capture_hub_duplicate_frames_total").increment(1);
            return;
        }

        match message.payload {
            Payload::SyncPong {
                t0_nanos,
                t1_nanos,
                t2_nanos,
            } => self.engine.handle_pong(&device_id, t0_nanos, t1_nanos, t2_nanos),

            Payload::HeartbeatAck { probe } => self.heartbeat.handle_ack(&device_id, probe),

            Payload::Heartbeat { probe } => {
                let reply = self.outbox.message(Payload::HeartbeatAck { probe });
                if let Err(e) = self.transport.send(&device_id, reply).await {
                    debug!(device = %device_id, error = %e, "heartbeat reply not delivered");
                }
            }

            // Devices may probe the reference clock directly
            Payload::SyncPing { t0_nanos } => {
                let now = self.clock.now_nanos();
                let reply = self.outbox.message(Payload::SyncPong {
                    t0_nanos,
                    t1_nanos: now,
                    t2_nanos: now,
                });
                if let Err(e) = self.transport.send(&device_id, reply).await {
                    debug!(device = %device_id, error = %e, "sync reply not delivered");
                }
            }

            Payload::Ack { ack_kind, .. } => self.orchestrator.handle_ack(&device_id, ack_kind),

            Payload::Data { event } => {
                if event.device_id != device_id {
                    warn!(
                        connection = %device_id,
                        claimed = %event.device_id,
                        "event source does not match connection identity"
                    );
                }
                self.tagger.ingest(event);
            }

            Payload::StatusReport { health } => self.registry.set_health(&device_id, health),

            // Re-introduction on an established connection refreshes metadata
            Payload::Hello { capabilities } => {
                self.registry.set_capabilities(&device_id, capabilities)
            }

            Payload::Error { code, message } => {
                warn!(device = %device_id, code = ?code, error = %message, "device reported error");
            }

            // Controller-bound commands coming *from* a device are invalid
            Payload::CmdStart { .. } | Payload::CmdStop { .. } | Payload::StatusRequest => {
                let reply = self.outbox.message(Payload::Error {
                    code: ErrorCode::InvalidCommand,
                    message: format!("{:?} is not valid from a capture device", message.payload.kind()),
                });
                if let Err(e) = self.transport.send(&device_id, reply).await {
                    debug!(device = %device_id, error = %e, "error reply not delivered");
                }
            }

            Payload::Unrecognized => {
                debug!(device = %device_id, "unrecognized message type dropped");
                metrics::counter!("capture_hub_unrecognized_frames_total").increment(1);
            }
        }
    }

    /// Per-device sync loop: an immediate first round, then periodic resyncs.
    /// Exits when the device's registry generation moves on.
    fn spawn_sync_loop(&self, device_id: DeviceId, generation: u64) {
        let engine = Arc::clone(&self.engine);
        let registry = Arc::clone(&self.registry);
        let tagger = Arc::clone(&self.tagger);
        let orchestrator = Arc::clone(&self.orchestrator);
        let resync = Duration::from_secs(self.config.clock_sync.resync_interval_s);

        let task = tokio::spawn(async move {
            loop {
                if registry.generation(&device_id) != Some(generation) {
                    break;
                }
                match engine.sync_device(&device_id).await {
                    Ok(offset) => {
                        if registry.generation(&device_id) != Some(generation) {
                            break;
                        }
                        let first = registry.set_offset(&device_id, offset);
                        let promoted = registry.mark_ready(&device_id);
                        if first {
                            tagger.flush_device(&device_id);
                        }
                        if promoted {
                            // Recovered or newly synced: offer a seat if a
                            // session is running and late join is allowed
                            orchestrator.offer_rejoin(&device_id).await;
                        }
                        tokio::time::sleep(resync).await;
                    }
                    Err(e) => {
                        debug!(device = %device_id, error = %e, "sync round failed");
                        tokio::time::sleep(SYNC_RETRY.min(resync)).await;
                    }
                }
            }
            trace!(device = %device_id, generation, "sync loop ended");
        });

        let mut tasks = self.sync_tasks.lock().expect("sync task list poisoned");
        tasks.retain(|t| !t.is_finished());
        tasks.push(task);
    }
}

impl<T: Transport + Sync + 'static> ControllerHandle<T> {
    pub fn transport(&self) -> Arc<T> {
        Arc::clone(&self.transport)
    }

    pub fn registry(&self) -> Arc<Registry> {
        Arc::clone(&self.registry)
    }

    pub fn orchestrator(&self) -> Arc<SessionOrchestrator<T>> {
        Arc::clone(&self.orchestrator)
    }

    pub fn session_snapshot(&self) -> SessionSnapshot {
        self.orchestrator.snapshot()
    }

    /// Stop every background task and the transport. Aborting the event loop
    /// and the per-device sync loops drops the last clones of the tagger,
    /// which closes the tagged-event channel so a downstream dispatcher can
    /// drain and flush. In-flight session state is dropped.
    pub fn shutdown(self) {
        self.heartbeat_task.abort();
        self.run_task.abort();
        for task in self
            .sync_tasks
            .lock()
            .expect("sync task list poisoned")
            .drain(..)
        {
            task.abort();
        }

        let transport = self.transport;
        tokio::spawn(async move { transport.stop().await });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use contracts::{
        Clock, ClockSyncConfig, DataEvent, DataEventKind, DeviceState, HeartbeatConfig,
        PayloadKind, SessionConfig, SessionMode, SessionOutcome, SystemClock,
    };
    use transport::{MemoryPeer, MemoryTransport};

    fn test_config(mode: SessionMode, quorum: Option<usize>) -> HubConfig {
        HubConfig {
            clock_sync: ClockSyncConfig {
                probes_per_round: 2,
                probe_timeout_ms: 500,
                resync_interval_s: 30,
                rtt_ceiling_ms: 200,
            },
            heartbeat: HeartbeatConfig {
                interval_ms: 50,
                max_missed: 5,
            },
            session: SessionConfig {
                arming_timeout_ms: 400,
                start_delay_ms: 10,
                stop_timeout_ms: 300,
                quorum,
                mode,
                allow_late_join: false,
            },
            ..Default::default()
        }
    }

    async fn start_hub(
        config: HubConfig,
    ) -> (ControllerHandle<MemoryTransport>, mpsc::Receiver<TaggedEvent>) {
        let clock: SharedClock = Arc::new(SystemClock);
        let (out_tx, out_rx) = mpsc::channel(256);
        let controller = Controller::start(MemoryTransport::new(), clock, config, out_tx)
            .await
            .unwrap();
        (controller.spawn(), out_rx)
    }

    /// Device-side behaviour: answers sync probes with a skewed clock
    /// (`lead_nanos` ahead of the reference) and heartbeats, and acks
    /// lifecycle commands when `ack_commands` is set.
    fn run_device(
        transport: Arc<MemoryTransport>,
        mut peer: MemoryPeer,
        lead_nanos: i64,
        ack_commands: bool,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let device_id = peer.device_id.clone();
            let mut sequence = 0u64;
            while let Some(msg) = peer.inbox.recv().await {
                let reply = match msg.payload {
                    Payload::SyncPing { t0_nanos } => {
                        let local = t0_nanos + lead_nanos;
                        Some(Payload::SyncPong {
                            t0_nanos,
                            t1_nanos: local,
                            t2_nanos: local,
                        })
                    }
                    Payload::Heartbeat { probe } => Some(Payload::HeartbeatAck { probe }),
                    Payload::CmdStart { .. } if ack_commands => Some(Payload::Ack {
                        ack_sequence: msg.sequence,
                        ack_kind: PayloadKind::CmdStart,
                    }),
                    Payload::CmdStop { .. } if ack_commands => Some(Payload::Ack {
                        ack_sequence: msg.sequence,
                        ack_kind: PayloadKind::CmdStop,
                    }),
                    _ => None,
                };
                if let Some(payload) = reply {
                    sequence += 1;
                    let frame = Message::new(device_id.clone(), sequence, 0, payload);
                    if transport.inject(frame).await.is_err() {
                        break;
                    }
                }
            }
        })
    }

    async fn wait_for_state(registry: &Registry, device: &DeviceId, state: DeviceState) {
        tokio::time::timeout(Duration::from_secs(3), async {
            loop {
                if registry.state(device) == Some(state) {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap_or_else(|_| panic!("device {device} never reached {state:?}"));
    }

    #[tokio::test]
    async fn test_device_syncs_and_becomes_ready() {
        let (hub, _out) = start_hub(test_config(SessionMode::Strict, None)).await;
        let transport = hub.transport();

        let peer = transport.attach_peer("dev_a", vec!["gsr".to_string()]).await.unwrap();
        // Device runs 5ms behind the reference clock
        let _device = run_device(Arc::clone(&transport), peer, -5_000_000, true);

        let device = DeviceId::from("dev_a");
        wait_for_state(&hub.registry(), &device, DeviceState::Ready).await;

        let offset = hub.registry().offset(&device).unwrap();
        // Correction maps device-local time back onto the reference line
        assert!(
            (offset.offset_nanos - 5_000_000).abs() < 20_000_000,
            "offset {} not near +5ms",
            offset.offset_nanos
        );
        hub.shutdown();
    }

    #[tokio::test]
    async fn test_full_session_cycle_completes() {
        let (hub, _out) = start_hub(test_config(SessionMode::Strict, None)).await;
        let transport = hub.transport();
        let registry = hub.registry();

        for id in ["dev_a", "dev_b"] {
            let peer = transport.attach_peer(id, vec![]).await.unwrap();
            run_device(Arc::clone(&transport), peer, 0, true);
            wait_for_state(&registry, &DeviceId::from(id), DeviceState::Ready).await;
        }

        let outcome = hub
            .orchestrator()
            .start_session(Some("s1".to_string()))
            .await
            .unwrap();
        assert_eq!(
            outcome,
            SessionOutcome::Complete {
                session_id: "s1".to_string()
            }
        );
        assert_eq!(
            registry.state(&DeviceId::from("dev_a")),
            Some(DeviceState::Recording)
        );

        let outcome = hub.orchestrator().stop_session().await.unwrap();
        assert_eq!(
            outcome,
            SessionOutcome::Complete {
                session_id: "s1".to_string()
            }
        );
        assert_eq!(
            registry.state(&DeviceId::from("dev_a")),
            Some(DeviceState::Ready)
        );
        hub.shutdown();
    }

    #[tokio::test]
    async fn test_degraded_mode_proceeds_on_quorum() {
        let (hub, _out) = start_hub(test_config(SessionMode::Degraded, Some(2))).await;
        let transport = hub.transport();
        let registry = hub.registry();

        for (id, acks) in [("dev_a", true), ("dev_b", true), ("dev_c", false)] {
            let peer = transport.attach_peer(id, vec![]).await.unwrap();
            run_device(Arc::clone(&transport), peer, 0, acks);
            wait_for_state(&registry, &DeviceId::from(id), DeviceState::Ready).await;
        }

        let outcome = hub
            .orchestrator()
            .start_session(Some("s2".to_string()))
            .await
            .unwrap();
        assert_eq!(
            outcome,
            SessionOutcome::Degraded {
                session_id: "s2".to_string(),
                excluded: vec!["dev_c".to_string()],
            }
        );

        let snapshot = hub.session_snapshot();
        assert!(snapshot.members.contains("dev_a"));
        assert!(snapshot.members.contains("dev_b"));
        assert!(snapshot.excluded.contains("dev_c"));
        hub.shutdown();
    }

    #[tokio::test]
    async fn test_strict_mode_aborts_on_missing_ack() {
        let (hub, _out) = start_hub(test_config(SessionMode::Strict, None)).await;
        let transport = hub.transport();
        let registry = hub.registry();

        for (id, acks) in [("dev_a", true), ("dev_b", false)] {
            let peer = transport.attach_peer(id, vec![]).await.unwrap();
            run_device(Arc::clone(&transport), peer, 0, acks);
            wait_for_state(&registry, &DeviceId::from(id), DeviceState::Ready).await;
        }

        let outcome = hub
            .orchestrator()
            .start_session(Some("s3".to_string()))
            .await
            .unwrap();
        assert!(matches!(outcome, SessionOutcome::Aborted { .. }));

        // Everything returns to idle and the armed device is released
        assert_eq!(hub.session_snapshot().state, contracts::SessionState::Idle);
        assert_eq!(
            registry.state(&DeviceId::from("dev_a")),
            Some(DeviceState::Ready)
        );
        hub.shutdown();
    }

    #[tokio::test]
    async fn test_events_tagged_onto_reference_timeline() {
        let (hub, mut out) = start_hub(test_config(SessionMode::Strict, None)).await;
        let transport = hub.transport();

        let peer = transport.attach_peer("dev_a", vec![]).await.unwrap();
        let lead = -5_000_000; // 5ms behind the reference
        let _device = run_device(Arc::clone(&transport), peer, lead, true);

        let device = DeviceId::from("dev_a");
        wait_for_state(&hub.registry(), &device, DeviceState::Ready).await;

        let reference_now = SystemClock.now_nanos();
        let local_nanos = reference_now + lead;
        let event = DataEvent::new(DataEventKind::Gsr, device.clone(), local_nanos);
        transport
            .inject(Message::new(
                device.clone(),
                1_000, // well past the device task's counter
                local_nanos,
                Payload::Data { event },
            ))
            .await
            .unwrap();

        let tagged = tokio::time::timeout(Duration::from_secs(2), out.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(
            (tagged.global_nanos - reference_now).abs() < 20_000_000,
            "tagged {} not near reference {}",
            tagged.global_nanos,
            reference_now
        );
        assert!(!tagged.low_confidence);
        hub.shutdown();
    }

    #[tokio::test]
    async fn test_shutdown_closes_event_pipeline() {
        let (hub, mut out) = start_hub(test_config(SessionMode::Strict, None)).await;
        let transport = hub.transport();

        let peer = transport.attach_peer("dev_a", vec![]).await.unwrap();
        let _device = run_device(Arc::clone(&transport), peer, 0, true);
        wait_for_state(&hub.registry(), &DeviceId::from("dev_a"), DeviceState::Ready).await;

        hub.shutdown();

        // The event loop, heartbeat and per-device sync loops all hold tagger
        // clones; shutdown must release every one of them so the channel
        // closes and a downstream dispatcher can drain
        tokio::time::timeout(Duration::from_secs(2), async {
            while out.recv().await.is_some() {}
        })
        .await
        .expect("tagged-event channel never closed after shutdown");

        // Shutdown also stops the transport, releasing its connections
        tokio::time::timeout(Duration::from_secs(2), async {
            while transport.is_connected("dev_a") {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("transport peers never released after shutdown");
    }

    #[tokio::test]
    async fn test_disconnect_during_recording_shrinks_membership() {
        let (hub, _out) = start_hub(test_config(SessionMode::Strict, None)).await;
        let transport = hub.transport();
        let registry = hub.registry();

        for id in ["dev_a", "dev_b"] {
            let peer = transport.attach_peer(id, vec![]).await.unwrap();
            run_device(Arc::clone(&transport), peer, 0, true);
            wait_for_state(&registry, &DeviceId::from(id), DeviceState::Ready).await;
        }

        let outcome = hub
            .orchestrator()
            .start_session(Some("s4".to_string()))
            .await
            .unwrap();
        assert!(matches!(outcome, SessionOutcome::Complete { .. }));

        transport
            .detach_peer(&DeviceId::from("dev_b"), DisconnectReason::PeerClosed)
            .await
            .unwrap();

        tokio::time::timeout(Duration::from_secs(2), async {
            loop {
                let snapshot = hub.session_snapshot();
                if snapshot.excluded.contains("dev_b") && !snapshot.members.contains("dev_b") {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("lost member never excluded");

        // Session keeps recording and still stops cleanly, reporting the loss
        let outcome = hub.orchestrator().stop_session().await.unwrap();
        assert_eq!(
            outcome,
            SessionOutcome::Degraded {
                session_id: "s4".to_string(),
                excluded: vec!["dev_b".to_string()],
            }
        );
        hub.shutdown();
    }
}
