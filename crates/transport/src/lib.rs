//! # Transport
//!
//! Bi-directional framed channel abstraction between the controller and its
//! capture devices, independent of message semantics.
//!
//! Side effects are reported exclusively as [`contracts::TransportEvent`]s on
//! the channel returned by [`Transport::start`]; there are no re-entrant
//! callbacks. A transient failure on one peer never affects other peers.
//!
//! Two implementations:
//! - [`TcpTransport`] - production TCP listener, one reader/writer task pair
//!   per connection
//! - [`MemoryTransport`] - in-process channel pairs for deterministic tests

mod memory;
mod tcp;

pub use memory::{MemoryPeer, MemoryTransport};
pub use tcp::{TcpTransport, TcpTransportConfig};

use contracts::{DeviceId, HubError, Message, TransportEvent};
use tokio::sync::mpsc;

/// Pluggable controller-side transport.
///
/// `start` binds local resources and hands back the event stream; `stop`
/// releases everything and closes open connections.
#[trait_variant::make(Transport: Send)]
pub trait LocalTransport {
    /// Begin accepting connections; returns the event stream.
    async fn start(&mut self) -> Result<mpsc::Receiver<TransportEvent>, HubError>;

    /// Close all connections and release resources. Shared so it can run
    /// through the `Arc` the controller holds.
    async fn stop(&self);

    /// Deliver to exactly one peer or fail.
    async fn send(&self, target: &DeviceId, message: Message) -> Result<(), HubError>;

    /// Best-effort delivery to all connected peers; returns the success count.
    /// Per-peer failures surface as `TransportEvent::Error`, not as an `Err`.
    async fn broadcast(&self, message: Message) -> usize;

    /// Whether the given device currently has a registered connection.
    fn is_connected(&self, device_id: &str) -> bool;

    /// Ids of all currently connected devices.
    fn connected_devices(&self) -> Vec<DeviceId>;
}
