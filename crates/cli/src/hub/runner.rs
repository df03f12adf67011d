//! Hub runner - wires the transport, controller and dispatcher together
//! and manages their lifecycle for one `run` invocation.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use contracts::{HubConfig, SessionOutcome, SharedClock, SystemClock};
use controller::{Controller, ControllerHandle};
use dispatcher::create_dispatcher;
use observability::HubMetricsAggregator;
use tokio::sync::mpsc;
use tracing::{info, warn};
use transport::{TcpTransport, TcpTransportConfig};

use super::HubStats;

/// Event channel depth between the tagger and the dispatcher
const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Poll period while waiting for devices to become ready
const READY_POLL_INTERVAL: Duration = Duration::from_millis(250);

/// Runner configuration
#[derive(Debug, Clone)]
pub struct RunnerConfig {
    /// The hub configuration
    pub config: HubConfig,

    /// Run time bound (None = run until the task is cancelled)
    pub duration: Option<Duration>,

    /// Automatic session cycle (None = sessions are never self-started)
    pub auto_session: Option<AutoSessionConfig>,

    /// Metrics server port (None = disabled)
    pub metrics_port: Option<u16>,
}

/// One automatic arm/record/stop cycle.
#[derive(Debug, Clone)]
pub struct AutoSessionConfig {
    /// Ready devices required before arming
    pub min_devices: usize,

    /// Recording length between start and stop
    pub record_for: Duration,
}

/// Main hub runner
pub struct HubRunner {
    config: RunnerConfig,
}

impl HubRunner {
    /// Create a new runner with the given configuration
    pub fn new(config: RunnerConfig) -> Self {
        Self { config }
    }

    /// Run the hub to completion
    pub async fn run(self) -> Result<HubStats> {
        let start_time = Instant::now();
        let hub_config = self.config.config.clone();

        // Initialize Metrics (optional)
        if let Some(port) = self.config.metrics_port {
            observability::init_metrics_only(port)?;
            info!("Metrics endpoint available on port {}", port);
        }

        // Start transport + controller
        let bind_addr = hub_config.server.bind_addr.clone();
        let port = hub_config.server.port;
        info!(bind = %bind_addr, port, "Starting hub listener...");

        let transport = TcpTransport::new(TcpTransportConfig {
            bind_addr,
            port,
            ..Default::default()
        });
        let clock: SharedClock = Arc::new(SystemClock);

        let (event_tx, event_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let controller = Controller::start(transport, clock, hub_config.clone(), event_tx)
            .await
            .with_context(|| {
                format!(
                    "Failed to start hub on {}:{}",
                    hub_config.server.bind_addr, hub_config.server.port
                )
            })?;
        let handle = controller.spawn();

        // Setup Dispatcher
        if hub_config.sinks.is_empty() {
            warn!("No sinks configured - tagged events will be dropped");
        }
        let active_sinks = hub_config.sinks.len();
        let dispatcher = create_dispatcher(hub_config.sinks.clone(), event_rx)
            .await
            .context("Failed to create dispatcher")?;
        let dispatcher_task = dispatcher.spawn();
        info!(active_sinks, "Dispatcher started");

        // Fold registry snapshots into the run statistics as they publish
        let aggregator = Arc::new(Mutex::new(HubMetricsAggregator::new()));
        let devices_peak = Arc::new(AtomicUsize::new(0));
        let watcher = {
            let aggregator = Arc::clone(&aggregator);
            let devices_peak = Arc::clone(&devices_peak);
            let mut snapshots = handle.registry().subscribe();
            tokio::spawn(async move {
                while snapshots.changed().await.is_ok() {
                    let devices = snapshots.borrow_and_update().clone();
                    devices_peak.fetch_max(devices.len(), Ordering::Relaxed);
                    if let Ok(mut agg) = aggregator.lock() {
                        agg.observe_devices(&devices);
                    }
                }
            })
        };

        info!(
            auto_session = ?self.config.auto_session,
            duration = ?self.config.duration,
            "Hub running"
        );

        // Main run phase
        let mut sessions_run = 0u64;
        if let Some(auto) = self.config.auto_session.clone() {
            match self.auto_session_cycle(&handle, &auto).await {
                Ok(outcome) => {
                    sessions_run = 1;
                    if let Ok(mut agg) = aggregator.lock() {
                        agg.observe_session(&outcome);
                    }
                }
                Err(e) => warn!(error = %e, "Automatic session cycle failed"),
            }
        } else if let Some(duration) = self.config.duration {
            tokio::time::sleep(duration).await;
            info!(secs = duration.as_secs(), "Run time elapsed");
        } else {
            std::future::pending::<()>().await;
        }

        // Shutdown: stopping the controller drops the tagger's sender, which
        // lets the dispatcher drain and flush its sinks
        info!("Shutting down hub...");
        handle.shutdown();
        watcher.abort();
        let _ = tokio::time::timeout(Duration::from_secs(5), dispatcher_task).await;

        let sync = aggregator
            .lock()
            .map(|agg| agg.clone())
            .unwrap_or_default();

        Ok(HubStats {
            sessions_run,
            devices_peak: devices_peak.load(Ordering::Relaxed),
            active_sinks,
            duration: start_time.elapsed(),
            sync,
        })
    }

    /// Wait for the fleet, then run one arm/record/stop cycle.
    async fn auto_session_cycle(
        &self,
        handle: &ControllerHandle<TcpTransport>,
        auto: &AutoSessionConfig,
    ) -> Result<SessionOutcome> {
        let registry = handle.registry();
        let wait_deadline = self.config.duration.map(|d| Instant::now() + d);

        info!(min_devices = auto.min_devices, "Waiting for ready devices...");
        loop {
            let ready = registry.ready_devices().len();
            if ready >= auto.min_devices {
                info!(ready, "Device quorum present, arming session");
                break;
            }
            if let Some(deadline) = wait_deadline {
                if Instant::now() >= deadline {
                    anyhow::bail!(
                        "only {ready}/{} devices became ready within the run time",
                        auto.min_devices
                    );
                }
            }
            tokio::time::sleep(READY_POLL_INTERVAL).await;
        }

        let orchestrator = handle.orchestrator();
        let outcome = orchestrator
            .start_session(None)
            .await
            .context("Failed to arm session")?;

        if let SessionOutcome::Aborted { ref reason, .. } = outcome {
            warn!(reason = %reason, "Session aborted while arming");
            return Ok(outcome);
        }

        info!(
            session_id = outcome.session_id(),
            secs = auto.record_for.as_secs(),
            "Recording"
        );
        tokio::time::sleep(auto.record_for).await;

        let outcome = orchestrator
            .stop_session()
            .await
            .context("Failed to stop session")?;
        info!(session_id = outcome.session_id(), "Session stopped");
        Ok(outcome)
    }
}
