//! Simulated device client.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::BytesMut;
use rand::Rng;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, trace, warn};

use contracts::{
    Clock, DataEvent, DeviceHealth, DeviceId, HubError, Message, Outbox, Payload, PayloadKind,
    SystemClock,
};
use wire::FrameCodec;

use crate::sensors::{spawn_stream, SensorSpec};

const EVENT_CHANNEL_CAPACITY: usize = 64;
const READ_BUF_CAPACITY: usize = 8 * 1024;

/// Clock running a fixed skew away from wall time. The skew only shows in
/// the timestamps the device reports; scheduling still happens in wall time.
#[derive(Debug, Clone, Copy)]
pub struct SkewedClock {
    skew_nanos: i64,
}

impl SkewedClock {
    pub fn new(skew_nanos: i64) -> Self {
        Self { skew_nanos }
    }
}

impl Clock for SkewedClock {
    fn now_nanos(&self) -> i64 {
        SystemClock.now_nanos() + self.skew_nanos
    }
}

/// Simulated device configuration.
#[derive(Debug, Clone)]
pub struct DeviceSimConfig {
    pub device_id: String,

    /// Controller address, `host:port`
    pub server_addr: String,

    /// How far the simulated device clock runs from wall time. Negative
    /// means the device is behind the reference.
    pub clock_skew_nanos: i64,

    /// Synthetic sensor streams; also determine advertised capabilities
    pub sensors: Vec<SensorSpec>,

    /// Random extra delay before answering sync probes, to simulate a noisy
    /// link
    pub reply_jitter_ms: u64,

    /// Whether lifecycle commands are acknowledged (turn off to play a
    /// misbehaving device)
    pub ack_commands: bool,
}

impl Default for DeviceSimConfig {
    fn default() -> Self {
        Self {
            device_id: "sim_device".to_string(),
            server_addr: "127.0.0.1:8080".to_string(),
            clock_skew_nanos: 0,
            sensors: vec![SensorSpec::gsr(10.0)],
            reply_jitter_ms: 0,
            ack_commands: true,
        }
    }
}

/// Handle to a running simulated device.
pub struct SimulatedDevice {
    device_id: DeviceId,
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl SimulatedDevice {
    /// Connect to the controller and start the protocol loop.
    #[instrument(name = "device_sim_connect", skip(config), fields(device = %config.device_id))]
    pub async fn connect(config: DeviceSimConfig) -> Result<Self, HubError> {
        let stream = TcpStream::connect(&config.server_addr).await?;
        stream.set_nodelay(true).ok();
        info!(
            device = %config.device_id,
            server = %config.server_addr,
            skew_ms = config.clock_skew_nanos / 1_000_000,
            "simulated device connected"
        );

        let device_id = DeviceId::from(config.device_id.as_str());
        let (shutdown, shutdown_rx) = watch::channel(false);
        let runner = Runner::new(config, stream);
        let task = tokio::spawn(runner.run(shutdown_rx));

        Ok(Self {
            device_id,
            shutdown,
            task,
        })
    }

    pub fn device_id(&self) -> &DeviceId {
        &self.device_id
    }

    /// Disconnect and wait for the protocol loop to finish.
    pub async fn stop(self) {
        let _ = self.shutdown.send(true);
        let _ = self.task.await;
    }
}

struct Runner {
    device_id: DeviceId,
    clock: SkewedClock,
    outbox: Outbox,
    codec: FrameCodec,
    config: DeviceSimConfig,
    recording: Arc<AtomicBool>,
    read_half: OwnedReadHalf,
    write_half: OwnedWriteHalf,
}

impl Runner {
    fn new(config: DeviceSimConfig, stream: TcpStream) -> Self {
        let device_id = DeviceId::from(config.device_id.as_str());
        let clock = SkewedClock::new(config.clock_skew_nanos);
        let outbox = Outbox::new(device_id.clone(), Arc::new(clock));
        let (read_half, write_half) = stream.into_split();
        Self {
            device_id,
            clock,
            outbox,
            codec: FrameCodec::default(),
            config,
            recording: Arc::new(AtomicBool::new(false)),
            read_half,
            write_half,
        }
    }

    async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        let capabilities: Vec<String> =
            self.config.sensors.iter().map(|s| s.capability()).collect();
        if self
            .send(Payload::Hello { capabilities })
            .await
            .is_err()
        {
            return;
        }

        let (event_tx, mut event_rx) = mpsc::channel::<DataEvent>(EVENT_CHANNEL_CAPACITY);
        let streams: Vec<JoinHandle<()>> = self
            .config
            .sensors
            .clone()
            .into_iter()
            .map(|spec| {
                spawn_stream(
                    spec,
                    self.device_id.clone(),
                    self.clock,
                    Arc::clone(&self.recording),
                    event_tx.clone(),
                )
            })
            .collect();
        drop(event_tx);

        let mut buf = BytesMut::with_capacity(READ_BUF_CAPACITY);
        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    debug!(device = %self.device_id, "shutdown requested");
                    break;
                }
                read = self.read_half.read_buf(&mut buf) => {
                    match read {
                        Ok(0) => {
                            debug!(device = %self.device_id, "controller closed the connection");
                            break;
                        }
                        Ok(_) => {
                            if self.drain_frames(&mut buf).await.is_err() {
                                break;
                            }
                        }
                        Err(e) => {
                            warn!(device = %self.device_id, error = %e, "read failed");
                            break;
                        }
                    }
                }
                Some(event) = event_rx.recv() => {
                    if self.send(Payload::Data { event }).await.is_err() {
                        break;
                    }
                }
            }
        }

        for stream in streams {
            stream.abort();
        }
        info!(device = %self.device_id, "simulated device stopped");
    }

    async fn drain_frames(&mut self, buf: &mut BytesMut) -> Result<(), HubError> {
        loop {
            match self.codec.decode(buf) {
                Ok(Some(message)) => self.handle_message(message).await?,
                Ok(None) => return Ok(()),
                Err(e) => {
                    warn!(device = %self.device_id, error = %e, "undecodable frame from controller");
                    return Err(HubError::protocol(self.device_id.as_str(), e.to_string()));
                }
            }
        }
    }

    async fn handle_message(&mut self, message: Message) -> Result<(), HubError> {
        match message.payload {
            Payload::SyncPing { t0_nanos } => {
                let t1_nanos = self.clock.now_nanos();
                self.jitter().await;
                let t2_nanos = self.clock.now_nanos();
                self.send(Payload::SyncPong {
                    t0_nanos,
                    t1_nanos,
                    t2_nanos,
                })
                .await
            }

            Payload::Heartbeat { probe } => self.send(Payload::HeartbeatAck { probe }).await,

            Payload::CmdStart {
                session_id,
                scheduled_start_nanos,
            } => {
                if !self.config.ack_commands {
                    debug!(device = %self.device_id, "ignoring start command");
                    return Ok(());
                }
                self.send(Payload::Ack {
                    ack_sequence: message.sequence,
                    ack_kind: PayloadKind::CmdStart,
                })
                .await?;
                self.schedule_start(session_id, scheduled_start_nanos);
                Ok(())
            }

            Payload::CmdStop { session_id } => {
                if !self.config.ack_commands {
                    return Ok(());
                }
                self.recording.store(false, Ordering::Relaxed);
                info!(device = %self.device_id, session_id = %session_id, "capture stopped");
                self.send(Payload::Ack {
                    ack_sequence: message.sequence,
                    ack_kind: PayloadKind::CmdStop,
                })
                .await
            }

            Payload::StatusRequest => {
                let health = DeviceHealth {
                    battery_percent: Some(87.0),
                    free_storage_bytes: Some(32 << 30),
                    recording: self.recording.load(Ordering::Relaxed),
                };
                self.send(Payload::StatusReport { health }).await
            }

            Payload::Error { code, message } => {
                warn!(device = %self.device_id, code = ?code, error = %message, "controller error");
                Ok(())
            }

            other => {
                trace!(device = %self.device_id, kind = ?other.kind(), "ignored message");
                Ok(())
            }
        }
    }

    /// Begin emitting events once the reference-time start mark passes.
    /// Scheduling uses wall time; the skew exists only in reported stamps.
    fn schedule_start(&self, session_id: String, scheduled_start_nanos: i64) {
        let recording = Arc::clone(&self.recording);
        let device_id = self.device_id.clone();
        let delay_nanos = (scheduled_start_nanos - SystemClock.now_nanos()).max(0);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_nanos(delay_nanos as u64)).await;
            recording.store(true, Ordering::Relaxed);
            info!(device = %device_id, session_id = %session_id, "capture started");
        });
    }

    async fn jitter(&self) {
        if self.config.reply_jitter_ms > 0 {
            let ms = rand::rng().random_range(0..=self.config.reply_jitter_ms);
            tokio::time::sleep(Duration::from_millis(ms)).await;
        }
    }

    async fn send(&mut self, payload: Payload) -> Result<(), HubError> {
        let message = self.outbox.message(payload);
        let frame = self
            .codec
            .encode(&message)
            .map_err(|e| HubError::protocol(self.device_id.as_str(), e.to_string()))?;
        self.write_half.write_all(&frame).await.map_err(|e| {
            debug!(device = %self.device_id, error = %e, "write failed");
            HubError::from(e)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use contracts::{DataEventKind, TransportEvent};
    use transport::{TcpTransport, TcpTransportConfig, Transport};

    #[test]
    fn test_skewed_clock_offset_applied() {
        let behind = SkewedClock::new(-5_000_000);
        let ahead = SkewedClock::new(5_000_000);
        let wall = SystemClock.now_nanos();

        assert!(behind.now_nanos() < wall);
        assert!(ahead.now_nanos() > wall + 4_000_000);
    }

    #[tokio::test]
    async fn test_device_introduces_itself_over_tcp() {
        let mut transport = TcpTransport::new(TcpTransportConfig {
            bind_addr: "127.0.0.1".to_string(),
            port: 0,
            ..Default::default()
        });
        let mut events = transport.start().await.unwrap();
        let addr = transport.local_addr().unwrap();

        let device = SimulatedDevice::connect(DeviceSimConfig {
            device_id: "sim_a".to_string(),
            server_addr: addr.to_string(),
            sensors: vec![SensorSpec::gsr(10.0), SensorSpec::thermal(5.0)],
            ..Default::default()
        })
        .await
        .unwrap();

        let event = tokio::time::timeout(Duration::from_secs(2), events.recv())
            .await
            .unwrap()
            .unwrap();
        match event {
            TransportEvent::Connected {
                device_id,
                capabilities,
            } => {
                assert_eq!(device_id, "sim_a");
                assert_eq!(capabilities, vec!["gsr", "thermal_frame"]);
            }
            other => panic!("expected Connected, got {other:?}"),
        }

        device.stop().await;
        transport.stop().await;
    }

    #[tokio::test]
    async fn test_device_answers_sync_probe() {
        let mut transport = TcpTransport::new(TcpTransportConfig {
            bind_addr: "127.0.0.1".to_string(),
            port: 0,
            ..Default::default()
        });
        let mut events = transport.start().await.unwrap();
        let addr = transport.local_addr().unwrap();

        let device = SimulatedDevice::connect(DeviceSimConfig {
            device_id: "sim_b".to_string(),
            server_addr: addr.to_string(),
            clock_skew_nanos: -3_000_000,
            sensors: vec![SensorSpec::new(DataEventKind::Audio, 1.0)],
            ..Default::default()
        })
        .await
        .unwrap();

        // Consume Connected
        let _ = tokio::time::timeout(Duration::from_secs(2), events.recv())
            .await
            .unwrap()
            .unwrap();

        let t0_nanos = SystemClock.now_nanos();
        transport
            .send(
                &"sim_b".into(),
                Message::new("controller".into(), 1, t0_nanos, Payload::SyncPing { t0_nanos }),
            )
            .await
            .unwrap();

        let reply = tokio::time::timeout(Duration::from_secs(2), async {
            loop {
                match events.recv().await {
                    Some(TransportEvent::Message { message, .. }) => {
                        if let Payload::SyncPong {
                            t0_nanos: t0,
                            t1_nanos,
                            ..
                        } = message.payload
                        {
                            break (t0, t1_nanos);
                        }
                    }
                    Some(_) => continue,
                    None => panic!("event stream closed"),
                }
            }
        })
        .await
        .unwrap();

        assert_eq!(reply.0, t0_nanos);
        // Device timestamps run ~3ms behind the reference
        assert!(reply.1 < SystemClock.now_nanos());

        device.stop().await;
        transport.stop().await;
    }
}
