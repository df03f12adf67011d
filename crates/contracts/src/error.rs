//! Layered error definitions
//!
//! Categorized by source: config / transport / protocol / sync / session / sink

use thiserror::Error;

/// Unified error type
#[derive(Debug, Error)]
pub enum HubError {
    // ===== Configuration Errors =====
    /// Configuration parse error
    #[error("config parse error: {message}")]
    ConfigParse {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// Configuration validation error
    #[error("config validation error at '{field}': {message}")]
    ConfigValidation { field: String, message: String },

    // ===== Transport Errors =====
    /// Peer is not connected
    #[error("device not connected: {device_id}")]
    NotConnected { device_id: String },

    /// Send to a single peer failed
    #[error("transport send to '{device_id}' failed: {message}")]
    TransportSend { device_id: String, message: String },

    /// Listener could not be bound; fatal at startup
    #[error("transport bind error on {addr}: {message}")]
    TransportBind { addr: String, message: String },

    /// Transport already stopped or not started
    #[error("transport unavailable: {message}")]
    TransportUnavailable { message: String },

    // ===== Protocol Errors =====
    /// Frame could not be decoded; the frame is dropped, not the connection
    #[error("protocol error from '{device_id}': {message}")]
    Protocol { device_id: String, message: String },

    // ===== Synchronization Errors =====
    /// No probe in a sync round produced a usable sample
    #[error("clock sync failed for '{device_id}': no pong within timeout over {attempts} probes")]
    SyncNoSamples { device_id: String, attempts: usize },

    /// Events arrived before the first sync and overflowed the holding buffer
    #[error("pre-sync buffer overflow for '{device_id}': capacity {capacity}")]
    PresyncOverflow { device_id: String, capacity: usize },

    // ===== Session Errors =====
    /// Quorum not reached within the arming timeout (strict mode)
    #[error("quorum not reached: {acked}/{required} acks within {timeout_ms}ms")]
    QuorumNotReached {
        acked: usize,
        required: usize,
        timeout_ms: u64,
    },

    /// Lifecycle operation invalid in the current state
    #[error("invalid session transition: {message}")]
    SessionState { message: String },

    // ===== Sink Errors =====
    /// Sink write error
    #[error("sink '{sink_name}' write error: {message}")]
    SinkWrite { sink_name: String, message: String },

    // ===== General Errors =====
    /// IO error
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Other error
    #[error("{0}")]
    Other(String),
}

impl HubError {
    /// Create configuration parse error
    pub fn config_parse(message: impl Into<String>) -> Self {
        Self::ConfigParse {
            message: message.into(),
            source: None,
        }
    }

    /// Create configuration validation error
    pub fn config_validation(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self::ConfigValidation {
            field: field.into(),
            message: message.into(),
        }
    }

    /// Create transport send error
    pub fn transport_send(device_id: impl Into<String>, message: impl Into<String>) -> Self {
        Self::TransportSend {
            device_id: device_id.into(),
            message: message.into(),
        }
    }

    /// Create protocol error
    pub fn protocol(device_id: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Protocol {
            device_id: device_id.into(),
            message: message.into(),
        }
    }

    /// Create sink write error
    pub fn sink_write(sink_name: impl Into<String>, message: impl Into<String>) -> Self {
        Self::SinkWrite {
            sink_name: sink_name.into(),
            message: message.into(),
        }
    }
}
