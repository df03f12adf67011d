//! TCP server transport.
//!
//! One listener task accepts connections; each connection gets a reader task
//! (frame decode + event forwarding) and a writer task (fed by a bounded
//! mpsc), so a stalled peer backpressures only its own queue.
//!
//! A connection is registered under the `sender_id` of its first decoded
//! frame - HELLO by convention, but any frame identifies the peer, which keeps
//! this layer free of command semantics. A reconnect under the same device id
//! supersedes the previous connection.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use bytes::BytesMut;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, trace, warn};

use contracts::{DeviceId, DisconnectReason, HubError, Message, Payload, TransportEvent};
use wire::{FrameCodec, WireError};

const EVENT_CHANNEL_CAPACITY: usize = 1024;
const PEER_QUEUE_CAPACITY: usize = 64;
const READ_BUF_CAPACITY: usize = 8 * 1024;

/// TCP transport configuration.
#[derive(Debug, Clone)]
pub struct TcpTransportConfig {
    pub bind_addr: String,
    pub port: u16,
    /// Malformed frames tolerated per connection before it is closed
    pub protocol_error_threshold: u32,
    pub max_frame_bytes: usize,
}

impl Default for TcpTransportConfig {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0".to_string(),
            port: 8080,
            protocol_error_threshold: 8,
            max_frame_bytes: 1024 * 1024,
        }
    }
}

/// Handle to one registered connection.
///
/// Dropping the handle closes the peer's write queue, which ends the writer
/// task; the `close` signal ends the reader task.
struct PeerHandle {
    conn_id: u64,
    addr: SocketAddr,
    tx: mpsc::Sender<Message>,
    close: watch::Sender<bool>,
}

type PeerMap = Arc<RwLock<HashMap<DeviceId, PeerHandle>>>;

/// TCP listener transport for the controller.
pub struct TcpTransport {
    config: TcpTransportConfig,
    codec: FrameCodec,
    peers: PeerMap,
    events: Option<mpsc::Sender<TransportEvent>>,
    accept_task: Mutex<Option<JoinHandle<()>>>,
    next_conn_id: Arc<AtomicU64>,
    bound_addr: Option<SocketAddr>,
}

impl TcpTransport {
    /// Create a transport; nothing is bound until `start`.
    pub fn new(config: TcpTransportConfig) -> Self {
        let codec = FrameCodec::with_max_frame_bytes(config.max_frame_bytes);
        Self {
            config,
            codec,
            peers: Arc::new(RwLock::new(HashMap::new())),
            events: None,
            accept_task: Mutex::new(None),
            next_conn_id: Arc::new(AtomicU64::new(1)),
            bound_addr: None,
        }
    }

    /// Address the listener will bind to.
    fn bind_target(&self) -> String {
        format!("{}:{}", self.config.bind_addr, self.config.port)
    }

    /// Actual bound address; `None` before `start`. Port 0 in the config
    /// binds an ephemeral port, readable here.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.bound_addr
    }
}

impl super::Transport for TcpTransport {
    #[instrument(name = "tcp_transport_start", skip(self), fields(addr = %self.bind_target()))]
    async fn start(&mut self) -> Result<mpsc::Receiver<TransportEvent>, HubError> {
        let addr = self.bind_target();
        let listener = TcpListener::bind(&addr)
            .await
            .map_err(|e| HubError::TransportBind {
                addr: addr.clone(),
                message: e.to_string(),
            })?;
        self.bound_addr = listener.local_addr().ok();

        let (event_tx, event_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        self.events = Some(event_tx.clone());

        let peers = Arc::clone(&self.peers);
        let codec = self.codec;
        let threshold = self.config.protocol_error_threshold;
        let next_conn_id = Arc::clone(&self.next_conn_id);

        let accept_task = tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, remote)) => {
                        let conn_id = next_conn_id.fetch_add(1, Ordering::Relaxed);
                        debug!(conn_id, %remote, "connection accepted");
                        metrics::counter!("capture_hub_connections_accepted_total").increment(1);

                        spawn_connection(
                            conn_id,
                            stream,
                            remote,
                            codec,
                            Arc::clone(&peers),
                            event_tx.clone(),
                            threshold,
                        );
                    }
                    Err(e) => {
                        // Accept errors are transient (EMFILE, reset before
                        // accept); keep the listener alive.
                        warn!(error = %e, "accept failed");
                    }
                }
            }
        });
        *self.accept_task.lock().expect("accept task poisoned") = Some(accept_task);

        info!(%addr, "TCP transport listening");
        Ok(event_rx)
    }

    #[instrument(name = "tcp_transport_stop", skip(self))]
    async fn stop(&self) {
        if let Some(task) = self.accept_task.lock().expect("accept task poisoned").take() {
            task.abort();
        }

        let drained: Vec<(DeviceId, PeerHandle)> = {
            let mut peers = self.peers.write().expect("peer map poisoned");
            peers.drain().collect()
        };

        for (device_id, handle) in drained {
            let _ = handle.close.send(true);
            if let Some(events) = &self.events {
                let _ = events
                    .send(TransportEvent::Disconnected {
                        device_id,
                        reason: DisconnectReason::Stopped,
                    })
                    .await;
            }
        }

        info!("TCP transport stopped");
    }

    async fn send(&self, target: &DeviceId, message: Message) -> Result<(), HubError> {
        let tx = {
            let peers = self.peers.read().expect("peer map poisoned");
            peers
                .get(target.as_str())
                .map(|h| h.tx.clone())
                .ok_or_else(|| HubError::NotConnected {
                    device_id: target.to_string(),
                })?
        };

        tx.send(message)
            .await
            .map_err(|_| HubError::transport_send(target.as_str(), "peer write queue closed"))
    }

    async fn broadcast(&self, message: Message) -> usize {
        let targets: Vec<(DeviceId, mpsc::Sender<Message>)> = {
            let peers = self.peers.read().expect("peer map poisoned");
            peers
                .iter()
                .map(|(id, h)| (id.clone(), h.tx.clone()))
                .collect()
        };

        let mut delivered = 0;
        for (device_id, tx) in targets {
            if tx.send(message.clone()).await.is_ok() {
                delivered += 1;
            } else if let Some(events) = &self.events {
                let _ = events
                    .send(TransportEvent::Error {
                        device_id: Some(device_id),
                        message: "broadcast enqueue failed: peer queue closed".to_string(),
                    })
                    .await;
            }
        }
        delivered
    }

    fn is_connected(&self, device_id: &str) -> bool {
        self.peers
            .read()
            .expect("peer map poisoned")
            .contains_key(device_id)
    }

    fn connected_devices(&self) -> Vec<DeviceId> {
        self.peers
            .read()
            .expect("peer map poisoned")
            .keys()
            .cloned()
            .collect()
    }
}

/// Spawn reader + writer tasks for a fresh connection.
fn spawn_connection(
    conn_id: u64,
    stream: TcpStream,
    remote: SocketAddr,
    codec: FrameCodec,
    peers: PeerMap,
    events: mpsc::Sender<TransportEvent>,
    threshold: u32,
) {
    let (read_half, write_half) = stream.into_split();
    let (peer_tx, peer_rx) = mpsc::channel(PEER_QUEUE_CAPACITY);
    let (close_tx, close_rx) = watch::channel(false);

    tokio::spawn(write_loop(conn_id, write_half, peer_rx, codec));

    let conn = Connection {
        conn_id,
        remote,
        codec,
        peers,
        events,
        threshold,
        peer_tx,
        close_tx,
        close_rx,
    };
    tokio::spawn(conn.read_loop(read_half));
}

/// Writer task: drains the peer queue onto the socket. Ends when every sender
/// (the map entry and the reader's clone) is gone.
async fn write_loop(
    conn_id: u64,
    mut write_half: OwnedWriteHalf,
    mut rx: mpsc::Receiver<Message>,
    codec: FrameCodec,
) {
    while let Some(message) = rx.recv().await {
        let frame = match codec.encode(&message) {
            Ok(frame) => frame,
            Err(e) => {
                warn!(conn_id, error = %e, "encode failed, frame skipped");
                continue;
            }
        };
        if let Err(e) = write_half.write_all(&frame).await {
            debug!(conn_id, error = %e, "write failed, closing writer");
            break;
        }
        metrics::counter!("capture_hub_frames_sent_total").increment(1);
    }
}

/// Per-connection reader state.
struct Connection {
    conn_id: u64,
    remote: SocketAddr,
    codec: FrameCodec,
    peers: PeerMap,
    events: mpsc::Sender<TransportEvent>,
    threshold: u32,
    peer_tx: mpsc::Sender<Message>,
    close_tx: watch::Sender<bool>,
    close_rx: watch::Receiver<bool>,
}

enum FrameStep {
    Continue,
    Close(DisconnectReason),
}

impl Connection {
    /// Reader task body: decode frames, register the peer on the first one,
    /// forward the rest as transport events.
    async fn read_loop(mut self, mut read_half: OwnedReadHalf) {
        let mut buf = BytesMut::with_capacity(READ_BUF_CAPACITY);
        let mut identity: Option<DeviceId> = None;
        let mut protocol_errors: u32 = 0;
        let mut close_rx = self.close_rx.clone();

        let reason = 'conn: loop {
            // Drain every complete frame before reading more bytes
            loop {
                match self.step(&mut buf, &mut identity, &mut protocol_errors).await {
                    Ok(FrameStep::Continue) => {}
                    Ok(FrameStep::Close(reason)) => break 'conn reason,
                    Err(()) => break, // need more bytes
                }
            }

            tokio::select! {
                read = read_half.read_buf(&mut buf) => match read {
                    Ok(0) => break DisconnectReason::PeerClosed,
                    Ok(_) => {}
                    Err(e) => break DisconnectReason::IoError(e.to_string()),
                },
                _ = close_rx.changed() => break DisconnectReason::Stopped,
            }
        };

        self.finish(identity, reason).await;
    }

    /// Process at most one frame from the buffer. `Err(())` means the buffer
    /// holds no complete frame yet.
    async fn step(
        &mut self,
        buf: &mut BytesMut,
        identity: &mut Option<DeviceId>,
        protocol_errors: &mut u32,
    ) -> Result<FrameStep, ()> {
        match self.codec.decode(buf) {
            Ok(Some(message)) => {
                metrics::counter!("capture_hub_frames_received_total").increment(1);

                if identity.is_none() {
                    let device_id = message.sender_id.clone();
                    self.register(&device_id, &message).await;
                    *identity = Some(device_id);

                    // The HELLO itself is fully consumed by the Connected event
                    if matches!(message.payload, Payload::Hello { .. }) {
                        return Ok(FrameStep::Continue);
                    }
                }

                let device_id = identity.clone().expect("identity set above");
                if self
                    .events
                    .send(TransportEvent::Message { device_id, message })
                    .await
                    .is_err()
                {
                    // Controller gone; tear the connection down quietly
                    return Ok(FrameStep::Close(DisconnectReason::Stopped));
                }
                Ok(FrameStep::Continue)
            }
            Ok(None) => Err(()),
            Err(WireError::Malformed { message, .. }) => {
                *protocol_errors += 1;
                metrics::counter!("capture_hub_frames_malformed_total").increment(1);
                let _ = self
                    .events
                    .send(TransportEvent::Error {
                        device_id: identity.clone(),
                        message: format!("malformed frame dropped: {message}"),
                    })
                    .await;

                if *protocol_errors > self.threshold {
                    warn!(conn_id = self.conn_id, errors = *protocol_errors, "error threshold exceeded");
                    Ok(FrameStep::Close(DisconnectReason::ProtocolErrors))
                } else {
                    Ok(FrameStep::Continue)
                }
            }
            Err(e) => {
                // Oversize: the stream framing cannot be trusted past this point
                warn!(conn_id = self.conn_id, error = %e, "unrecoverable frame error");
                Ok(FrameStep::Close(DisconnectReason::ProtocolErrors))
            }
        }
    }

    /// Register (or supersede) the peer-map entry for this connection.
    async fn register(&self, device_id: &DeviceId, first: &Message) {
        let capabilities = match &first.payload {
            Payload::Hello { capabilities } => capabilities.clone(),
            other => {
                trace!(conn_id = self.conn_id, kind = ?other.kind(), "identified by non-hello frame");
                Vec::new()
            }
        };

        let old = {
            let mut map = self.peers.write().expect("peer map poisoned");
            map.insert(
                device_id.clone(),
                PeerHandle {
                    conn_id: self.conn_id,
                    addr: self.remote,
                    tx: self.peer_tx.clone(),
                    close: self.close_tx.clone(),
                },
            )
        };

        if let Some(old) = old {
            debug!(
                conn_id = self.conn_id,
                old_conn = old.conn_id,
                old_remote = %old.addr,
                device = %device_id,
                "connection superseded"
            );
            let _ = old.close.send(true);
            let _ = self
                .events
                .send(TransportEvent::Disconnected {
                    device_id: device_id.clone(),
                    reason: DisconnectReason::Superseded,
                })
                .await;
        } else {
            debug!(conn_id = self.conn_id, device = %device_id, remote = %self.remote, "peer registered");
        }

        let _ = self
            .events
            .send(TransportEvent::Connected {
                device_id: device_id.clone(),
                capabilities,
            })
            .await;
    }

    /// Deregister and announce the end of this connection.
    async fn finish(self, identity: Option<DeviceId>, reason: DisconnectReason) {
        let Some(device_id) = identity else {
            debug!(conn_id = self.conn_id, "unidentified connection closed");
            return;
        };

        let still_registered = {
            let mut map = self.peers.write().expect("peer map poisoned");
            match map.get(device_id.as_str()) {
                Some(handle) if handle.conn_id == self.conn_id => {
                    map.remove(device_id.as_str());
                    true
                }
                // A newer connection owns the entry; supersede announced it
                _ => false,
            }
        };

        if still_registered && reason != DisconnectReason::Stopped {
            debug!(conn_id = self.conn_id, device = %device_id, %reason, "peer deregistered");
            metrics::counter!("capture_hub_disconnects_total").increment(1);
            let _ = self
                .events
                .send(TransportEvent::Disconnected { device_id, reason })
                .await;
        }
    }
}
