//! In-memory transport for deterministic tests.
//!
//! Mirrors the TCP transport's contract without sockets: test code attaches
//! peers, injects inbound frames, and reads controller-to-device messages from
//! a per-peer inbox.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use tokio::sync::mpsc;
use tracing::debug;

use contracts::{DeviceId, DisconnectReason, HubError, Message, TransportEvent};

const EVENT_CHANNEL_CAPACITY: usize = 256;
const PEER_INBOX_CAPACITY: usize = 64;

type PeerMap = Arc<RwLock<HashMap<DeviceId, mpsc::Sender<Message>>>>;

/// Test double for the controller-side transport.
pub struct MemoryTransport {
    peers: PeerMap,
    events: Option<mpsc::Sender<TransportEvent>>,
}

/// Device-side handle produced by [`MemoryTransport::attach_peer`].
pub struct MemoryPeer {
    pub device_id: DeviceId,
    /// Messages the controller sent to this device
    pub inbox: mpsc::Receiver<Message>,
}

impl Default for MemoryTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryTransport {
    pub fn new() -> Self {
        Self {
            peers: Arc::new(RwLock::new(HashMap::new())),
            events: None,
        }
    }

    fn events(&self) -> Result<&mpsc::Sender<TransportEvent>, HubError> {
        self.events
            .as_ref()
            .ok_or_else(|| HubError::TransportUnavailable {
                message: "memory transport not started".to_string(),
            })
    }

    /// Attach a simulated peer, emitting `Connected`.
    pub async fn attach_peer(
        &self,
        device_id: impl Into<DeviceId>,
        capabilities: Vec<String>,
    ) -> Result<MemoryPeer, HubError> {
        let device_id = device_id.into();
        let (tx, rx) = mpsc::channel(PEER_INBOX_CAPACITY);
        self.peers
            .write()
            .expect("peer map poisoned")
            .insert(device_id.clone(), tx);

        self.events()?
            .send(TransportEvent::Connected {
                device_id: device_id.clone(),
                capabilities,
            })
            .await
            .map_err(|_| HubError::TransportUnavailable {
                message: "event channel closed".to_string(),
            })?;

        Ok(MemoryPeer {
            device_id,
            inbox: rx,
        })
    }

    /// Detach a peer, emitting `Disconnected`.
    pub async fn detach_peer(
        &self,
        device_id: &DeviceId,
        reason: DisconnectReason,
    ) -> Result<(), HubError> {
        self.peers
            .write()
            .expect("peer map poisoned")
            .remove(device_id.as_str());

        self.events()?
            .send(TransportEvent::Disconnected {
                device_id: device_id.clone(),
                reason,
            })
            .await
            .map_err(|_| HubError::TransportUnavailable {
                message: "event channel closed".to_string(),
            })
    }

    /// Inject an inbound frame as if it arrived from the named device.
    pub async fn inject(&self, message: Message) -> Result<(), HubError> {
        let device_id = message.sender_id.clone();
        self.events()?
            .send(TransportEvent::Message { device_id, message })
            .await
            .map_err(|_| HubError::TransportUnavailable {
                message: "event channel closed".to_string(),
            })
    }
}

impl super::Transport for MemoryTransport {
    async fn start(&mut self) -> Result<mpsc::Receiver<TransportEvent>, HubError> {
        let (tx, rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        self.events = Some(tx);
        debug!("memory transport started");
        Ok(rx)
    }

    async fn stop(&self) {
        self.peers.write().expect("peer map poisoned").clear();
    }

    async fn send(&self, target: &DeviceId, message: Message) -> Result<(), HubError> {
        let tx = {
            let peers = self.peers.read().expect("peer map poisoned");
            peers
                .get(target.as_str())
                .cloned()
                .ok_or_else(|| HubError::NotConnected {
                    device_id: target.to_string(),
                })?
        };

        tx.send(message)
            .await
            .map_err(|_| HubError::transport_send(target.as_str(), "peer inbox closed"))
    }

    async fn broadcast(&self, message: Message) -> usize {
        let targets: Vec<(DeviceId, mpsc::Sender<Message>)> = {
            let peers = self.peers.read().expect("peer map poisoned");
            peers.iter().map(|(k, v)| (k.clone(), v.clone())).collect()
        };

        let mut delivered = 0;
        for (_, tx) in targets {
            if tx.send(message.clone()).await.is_ok() {
                delivered += 1;
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Transport;
    use contracts::Payload;

    fn message(sender: &str, seq: u64, payload: Payload) -> Message {
        Message::new(sender.into(), seq, 0, payload)
    }

    #[tokio::test]
    async fn test_attach_send_and_inject() {
        let mut transport = MemoryTransport::new();
        let mut events = transport.start().await.unwrap();

        let mut peer = transport
            .attach_peer("dev_a", vec!["gsr".to_string()])
            .await
            .unwrap();

        assert!(matches!(
            events.recv().await,
            Some(TransportEvent::Connected { device_id, .. }) if device_id == "dev_a"
        ));
        assert!(transport.is_connected("dev_a"));

        transport
            .send(&"dev_a".into(), message("controller", 1, Payload::StatusRequest))
            .await
            .unwrap();
        let delivered = peer.inbox.recv().await.unwrap();
        assert_eq!(delivered.payload, Payload::StatusRequest);

        transport
            .inject(message("dev_a", 1, Payload::Heartbeat { probe: 1 }))
            .await
            .unwrap();
        assert!(matches!(
            events.recv().await,
            Some(TransportEvent::Message { device_id, .. }) if device_id == "dev_a"
        ));
    }

    #[tokio::test]
    async fn test_send_to_unknown_peer_fails() {
        let mut transport = MemoryTransport::new();
        let _events = transport.start().await.unwrap();

        let err = transport
            .send(&"ghost".into(), message("controller", 1, Payload::StatusRequest))
            .await
            .unwrap_err();
        assert!(matches!(err, HubError::NotConnected { .. }));
    }

    #[tokio::test]
    async fn test_broadcast_counts_successes() {
        let mut transport = MemoryTransport::new();
        let _events = transport.start().await.unwrap();

        let _a = transport.attach_peer("a", vec![]).await.unwrap();
        let _b = transport.attach_peer("b", vec![]).await.unwrap();

        let delivered = transport
            .broadcast(message("controller", 2, Payload::StatusRequest))
            .await;
        assert_eq!(delivered, 2);
    }
}
