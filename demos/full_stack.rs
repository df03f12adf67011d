//! Full Stack Demo
//!
//! Starts a hub on a loopback port, connects three simulated devices with
//! deliberately skewed clocks, runs one arm/record/stop cycle and prints the
//! sync-quality summary. No hardware required.
//!
//! Run with: cargo run --bin full_stack

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use contracts::{HubConfig, SharedClock, SinkConfig, SinkType, SystemClock};
use controller::Controller;
use device_sim::{DeviceSimConfig, SensorSpec, SimulatedDevice};
use dispatcher::create_dispatcher;
use observability::HubMetricsAggregator;
use tokio::sync::mpsc;
use transport::{TcpTransport, TcpTransportConfig};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::INFO)
        .init();

    tracing::info!("Starting Full Stack Demo");

    // ==== Stage 1: Hub on an ephemeral loopback port ====
    let mut config = HubConfig::default();
    config.server.bind_addr = "127.0.0.1".to_string();
    config.server.port = 0;
    config.clock_sync.resync_interval_s = 5;
    config.heartbeat.interval_ms = 500;
    config.session.arming_timeout_ms = 2_000;
    config.sinks = vec![SinkConfig {
        name: "console".to_string(),
        sink_type: SinkType::Log,
        queue_capacity: 256,
        params: HashMap::new(),
    }];

    let transport = TcpTransport::new(TcpTransportConfig {
        bind_addr: config.server.bind_addr.clone(),
        port: config.server.port,
        ..Default::default()
    });
    let clock: SharedClock = Arc::new(SystemClock);
    let (event_tx, event_rx) = mpsc::channel(256);

    let hub = Controller::start(transport, clock, config.clone(), event_tx)
        .await?
        .spawn();
    let addr = hub
        .transport()
        .local_addr()
        .ok_or("listener not bound")?
        .to_string();
    tracing::info!(addr = %addr, "Hub listening");

    // ==== Stage 2: Dispatcher with a log sink ====
    let dispatcher = create_dispatcher(config.sinks.clone(), event_rx).await?;
    let dispatcher_task = dispatcher.spawn();

    // ==== Stage 3: Simulated device fleet with skewed clocks ====
    let mut fleet = Vec::new();
    for (device_id, skew_ms) in [("wrist_a", -30i64), ("chest_b", 0), ("cam_c", 30)] {
        let device = SimulatedDevice::connect(DeviceSimConfig {
            device_id: device_id.to_string(),
            server_addr: addr.clone(),
            clock_skew_nanos: skew_ms * 1_000_000,
            sensors: vec![SensorSpec::gsr(16.0), SensorSpec::sync_marker(1.0)],
            reply_jitter_ms: 2,
            ack_commands: true,
        })
        .await?;
        tracing::info!(device = device_id, skew_ms, "Device connected");
        fleet.push(device);
    }

    // Wait for every device to sync and report ready
    let registry = hub.registry();
    while registry.ready_devices().len() < fleet.len() {
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    tracing::info!("All devices ready");

    let mut aggregator = HubMetricsAggregator::new();
    aggregator.observe_devices(&registry.snapshot());

    // ==== Stage 4: One arm/record/stop cycle ====
    let orchestrator = hub.orchestrator();
    let outcome = orchestrator.start_session(Some("demo".to_string())).await?;
    tracing::info!(?outcome, "Session armed");

    tokio::time::sleep(Duration::from_secs(3)).await;

    let outcome = orchestrator.stop_session().await?;
    tracing::info!(?outcome, "Session stopped");
    aggregator.observe_session(&outcome);

    // ==== Stage 5: Shutdown and summary ====
    for device in fleet {
        device.stop().await;
    }
    hub.shutdown();
    let _ = tokio::time::timeout(Duration::from_secs(5), dispatcher_task).await;

    println!("{}", aggregator.summary());
    Ok(())
}
