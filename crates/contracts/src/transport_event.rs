//! Transport lifecycle events.
//!
//! The transport reports side effects exclusively as typed events on a channel
//! consumed by the controller, instead of re-entrant listener callbacks.

use crate::{DeviceId, Message};

/// Why a connection went away.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DisconnectReason {
    /// Peer closed the stream
    PeerClosed,
    /// Read or write failed
    IoError(String),
    /// Too many undecodable frames from this peer
    ProtocolErrors,
    /// Local shutdown
    Stopped,
    /// Same device id reconnected; the old connection is replaced
    Superseded,
}

impl std::fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DisconnectReason::PeerClosed => write!(f, "peer closed"),
            DisconnectReason::IoError(e) => write!(f, "io error: {e}"),
            DisconnectReason::ProtocolErrors => write!(f, "repeated protocol errors"),
            DisconnectReason::Stopped => write!(f, "transport stopped"),
            DisconnectReason::Superseded => write!(f, "superseded by reconnect"),
        }
    }
}

/// Event emitted by a transport implementation.
#[derive(Debug)]
pub enum TransportEvent {
    /// A peer identified itself; `capabilities` from its HELLO, if any
    Connected {
        device_id: DeviceId,
        capabilities: Vec<String>,
    },

    /// A peer's connection ended
    Disconnected {
        device_id: DeviceId,
        reason: DisconnectReason,
    },

    /// A decoded inbound frame
    Message { device_id: DeviceId, message: Message },

    /// A non-fatal per-peer error (dropped frame, failed send)
    Error {
        device_id: Option<DeviceId>,
        message: String,
    },
}
