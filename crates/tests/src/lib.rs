//! # Integration Tests
//!
//! End-to-end tests over real TCP.
//!
//! Covers:
//! - Contract snapshot checks
//! - Full hub cycles against simulated devices (skewed clocks, quorum,
//!   device loss)
//! - Tagged-event delivery through the dispatcher

#[cfg(test)]
mod contract_tests {
    #[test]
    fn test_contracts_compile() {
        // The wire default is strict mode with no quorum
        let config = contracts::SessionConfig::default();
        assert_eq!(config.mode, contracts::SessionMode::Strict);
        assert_eq!(config.quorum, None);
    }
}

#[cfg(test)]
mod e2e_tests {
    use std::sync::Arc;
    use std::time::{Duration, Instant};

    use contracts::{
        DeviceId, DeviceState, HubConfig, SessionMode, SessionOutcome, SharedClock, SystemClock,
        TaggedEvent,
    };
    use controller::{Controller, ControllerHandle, Registry};
    use device_sim::{DeviceSimConfig, SensorSpec, SimulatedDevice};
    use tokio::sync::mpsc;
    use tokio::time::sleep;
    use transport::{TcpTransport, TcpTransportConfig};

    fn test_config(mode: SessionMode, quorum: Option<usize>) -> HubConfig {
        let mut config = HubConfig::default();
        config.server.controller_id = "hub".to_string();
        config.server.bind_addr = "127.0.0.1".to_string();
        config.server.port = 0;
        config.clock_sync.probes_per_round = 3;
        config.clock_sync.probe_timeout_ms = 200;
        config.clock_sync.resync_interval_s = 1;
        config.heartbeat.interval_ms = 100;
        config.heartbeat.max_missed = 5;
        config.session.arming_timeout_ms = 800;
        config.session.start_delay_ms = 50;
        config.session.stop_timeout_ms = 400;
        config.session.mode = mode;
        config.session.quorum = quorum;
        config
    }

    async fn start_hub(
        config: HubConfig,
    ) -> (
        ControllerHandle<TcpTransport>,
        mpsc::Receiver<TaggedEvent>,
        String,
    ) {
        let transport = TcpTransport::new(TcpTransportConfig {
            bind_addr: config.server.bind_addr.clone(),
            port: config.server.port,
            ..Default::default()
        });
        let clock: SharedClock = Arc::new(SystemClock);
        let (tx, rx) = mpsc::channel(1024);
        let controller = Controller::start(transport, clock, config, tx)
            .await
            .expect("hub start");
        let handle = controller.spawn();
        let addr = handle
            .transport()
            .local_addr()
            .expect("listener bound")
            .to_string();
        (handle, rx, addr)
    }

    async fn connect_device(
        addr: &str,
        device_id: &str,
        skew_ms: i64,
        ack_commands: bool,
    ) -> SimulatedDevice {
        SimulatedDevice::connect(DeviceSimConfig {
            device_id: device_id.to_string(),
            server_addr: addr.to_string(),
            clock_skew_nanos: skew_ms * 1_000_000,
            sensors: vec![SensorSpec::gsr(32.0)],
            reply_jitter_ms: 0,
            ack_commands,
        })
        .await
        .expect("device connect")
    }

    async fn wait_for_ready(registry: &Registry, count: usize) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while registry.ready_devices().len() < count {
            assert!(
                Instant::now() < deadline,
                "devices not ready in time: {}/{count}",
                registry.ready_devices().len()
            );
            sleep(Duration::from_millis(50)).await;
        }
    }

    async fn drain_events(rx: &mut mpsc::Receiver<TaggedEvent>) -> Vec<TaggedEvent> {
        let mut events = Vec::new();
        while let Ok(Some(event)) =
            tokio::time::timeout(Duration::from_millis(200), rx.recv()).await
        {
            events.push(event);
        }
        events
    }

    /// Two devices with opposite clock skews end up on one timeline: each
    /// tagged event's global timestamp is the local one shifted back by
    /// roughly the device's skew.
    #[tokio::test]
    async fn test_skewed_devices_share_reference_timeline() {
        let (hub, mut events, addr) = start_hub(test_config(SessionMode::Strict, None)).await;

        let dev_a = connect_device(&addr, "dev_a", 40, true).await;
        let dev_b = connect_device(&addr, "dev_b", -25, true).await;
        wait_for_ready(&hub.registry(), 2).await;

        // Offset estimates are visible in the registry aggregation too
        let mut aggregator = observability::HubMetricsAggregator::new();
        aggregator.observe_devices(&hub.registry().snapshot());
        assert_eq!(aggregator.summary().device_offset_ms.len(), 2);

        let outcome = hub.orchestrator().start_session(None).await.expect("arm");
        assert!(matches!(outcome, SessionOutcome::Complete { .. }));

        sleep(Duration::from_millis(700)).await;
        let outcome = hub.orchestrator().stop_session().await.expect("stop");
        assert!(matches!(outcome, SessionOutcome::Complete { .. }));

        let tagged = drain_events(&mut events).await;
        let from = |id: &str| {
            tagged
                .iter()
                .filter(|e| e.event.device_id.as_str() == id)
                .collect::<Vec<_>>()
        };
        let a_events = from("dev_a");
        let b_events = from("dev_b");
        assert!(!a_events.is_empty(), "no events from dev_a");
        assert!(!b_events.is_empty(), "no events from dev_b");

        // global = local + offset, offset ~ -skew; loopback RTT leaves a
        // few ms of estimation error at most
        for (events, skew_ms) in [(&a_events, 40.0), (&b_events, -25.0)] {
            for event in events.iter() {
                let diff_ms = (event.global_nanos - event.event.local_nanos) as f64 / 1e6;
                assert!(
                    (diff_ms + skew_ms).abs() < 15.0,
                    "correction off: diff {diff_ms:.2}ms for skew {skew_ms}ms"
                );
                assert!(!event.low_confidence);
                assert!(event.uncertainty_nanos < 50_000_000);
            }
        }

        dev_a.stop().await;
        dev_b.stop().await;
        hub.shutdown();
    }

    /// Degraded mode with quorum 2 proceeds without the silent device.
    #[tokio::test]
    async fn test_degraded_session_excludes_silent_device() {
        let (hub, _events, addr) = start_hub(test_config(SessionMode::Degraded, Some(2))).await;

        let dev_a = connect_device(&addr, "dev_a", 5, true).await;
        let dev_b = connect_device(&addr, "dev_b", -5, true).await;
        let dev_c = connect_device(&addr, "dev_c", 10, false).await;
        wait_for_ready(&hub.registry(), 3).await;

        let outcome = hub.orchestrator().start_session(None).await.expect("arm");
        match &outcome {
            SessionOutcome::Degraded { excluded, .. } => {
                assert_eq!(excluded, &vec!["dev_c".to_string()]);
            }
            other => panic!("expected degraded outcome, got {other:?}"),
        }

        let outcome = hub.orchestrator().stop_session().await.expect("stop");
        assert!(matches!(outcome, SessionOutcome::Degraded { .. }));

        dev_a.stop().await;
        dev_b.stop().await;
        dev_c.stop().await;
        hub.shutdown();
    }

    /// Strict mode aborts when any member misses the arming window, and
    /// the members that did ack are stood back down to ready.
    #[tokio::test]
    async fn test_strict_session_aborts_without_full_acks() {
        let (hub, _events, addr) = start_hub(test_config(SessionMode::Strict, None)).await;

        let dev_a = connect_device(&addr, "dev_a", 0, true).await;
        let dev_b = connect_device(&addr, "dev_b", 0, false).await;
        wait_for_ready(&hub.registry(), 2).await;

        let outcome = hub.orchestrator().start_session(None).await.expect("arm");
        assert!(matches!(outcome, SessionOutcome::Aborted { .. }));

        sleep(Duration::from_millis(200)).await;
        assert_eq!(
            hub.registry().state(&DeviceId::from("dev_a")),
            Some(DeviceState::Ready)
        );

        dev_a.stop().await;
        dev_b.stop().await;
        hub.shutdown();
    }

    /// Losing a device mid-recording shrinks the membership; the session
    /// finishes degraded instead of failing.
    #[tokio::test]
    async fn test_device_loss_during_recording() {
        let (hub, _events, addr) = start_hub(test_config(SessionMode::Strict, None)).await;

        let dev_a = connect_device(&addr, "dev_a", 0, true).await;
        let dev_b = connect_device(&addr, "dev_b", 0, true).await;
        wait_for_ready(&hub.registry(), 2).await;

        let outcome = hub.orchestrator().start_session(None).await.expect("arm");
        assert!(matches!(outcome, SessionOutcome::Complete { .. }));

        dev_b.stop().await;
        let deadline = Instant::now() + Duration::from_secs(3);
        while hub.session_snapshot().members.len() > 1 {
            assert!(Instant::now() < deadline, "membership did not shrink");
            sleep(Duration::from_millis(50)).await;
        }

        let outcome = hub.orchestrator().stop_session().await.expect("stop");
        match &outcome {
            SessionOutcome::Degraded { excluded, .. } => {
                assert_eq!(excluded, &vec!["dev_b".to_string()]);
            }
            other => panic!("expected degraded outcome, got {other:?}"),
        }

        dev_a.stop().await;
        hub.shutdown();
    }

    /// Tagged events flow all the way into a JSONL sink file.
    #[tokio::test]
    async fn test_events_reach_jsonl_sink() {
        use contracts::{SinkConfig, SinkType};
        use std::collections::HashMap;

        let (hub, events, addr) = start_hub(test_config(SessionMode::Strict, None)).await;

        let dir = tempfile::tempdir().expect("tempdir");
        let sink_config = SinkConfig {
            name: "archive".to_string(),
            sink_type: SinkType::Jsonl,
            queue_capacity: 256,
            params: HashMap::from([
                (
                    "base_path".to_string(),
                    dir.path().to_string_lossy().to_string(),
                ),
                ("file_name".to_string(), "events.jsonl".to_string()),
            ]),
        };
        let dispatcher = dispatcher::create_dispatcher(vec![sink_config], events)
            .await
            .expect("dispatcher");
        let dispatcher_task = dispatcher.spawn();

        let device = connect_device(&addr, "dev_a", 15, true).await;
        wait_for_ready(&hub.registry(), 1).await;

        hub.orchestrator().start_session(None).await.expect("arm");
        sleep(Duration::from_millis(600)).await;
        hub.orchestrator().stop_session().await.expect("stop");

        device.stop().await;
        // Dropping the controller closes the tagger's channel; the
        // dispatcher drains and flushes before exiting
        hub.shutdown();
        tokio::time::timeout(Duration::from_secs(5), dispatcher_task)
            .await
            .expect("dispatcher drain")
            .expect("dispatcher task");

        let content = std::fs::read_to_string(dir.path().join("events.jsonl")).expect("read file");
        let lines: Vec<&str> = content.lines().collect();
        assert!(!lines.is_empty(), "no events written");
        for line in &lines {
            let event: TaggedEvent = serde_json::from_str(line).expect("parse line");
            assert_eq!(event.event.device_id.as_str(), "dev_a");
        }
    }

    /// A hub can be started straight from a parsed configuration file.
    #[tokio::test]
    async fn test_hub_starts_from_loaded_config() {
        let toml = r#"
[server]
controller_id = "hub"
bind_addr = "127.0.0.1"
port = 0

[[sinks]]
name = "console"
sink_type = "log"
"#;
        let config = config_loader::ConfigLoader::load_from_str(
            toml,
            config_loader::ConfigFormat::Toml,
        )
        .expect("config");

        let (hub, _events, addr) = start_hub(config).await;
        assert!(addr.starts_with("127.0.0.1:"));
        hub.shutdown();
    }
}
