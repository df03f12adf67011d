//! UdpSink - fire-and-forget event streaming to an external consumer

use contracts::{EventSink, HubError, TaggedEvent};
use std::collections::HashMap;
use std::net::SocketAddr;
use tokio::net::UdpSocket;
use tracing::{debug, error, instrument, warn};

/// Serialization format for the datagram body
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum UdpFormat {
    /// JSON (human-readable, larger)
    #[default]
    Json,
    /// Bincode (binary, compact)
    Bincode,
}

/// Configuration for UdpSink
#[derive(Debug, Clone)]
pub struct UdpSinkConfig {
    /// Target address
    pub addr: SocketAddr,
    /// Serialization format
    pub format: UdpFormat,
    /// Max datagram size (65507 for IPv4 in theory, keep headroom)
    pub max_packet_size: usize,
}

impl UdpSinkConfig {
    /// Create config from params map
    pub fn from_params(params: &HashMap<String, String>) -> Result<Self, String> {
        let addr_str = params
            .get("addr")
            .ok_or_else(|| "missing 'addr' parameter".to_string())?;
        let addr: SocketAddr = addr_str
            .parse()
            .map_err(|e| format!("invalid address '{addr_str}': {e}"))?;

        let format = match params.get("format").map(String::as_str) {
            Some("bincode") => UdpFormat::Bincode,
            Some("json") | None => UdpFormat::Json,
            Some(other) => return Err(format!("unknown format '{other}'")),
        };

        let max_packet_size = params
            .get("max_packet_size")
            .and_then(|s| s.parse().ok())
            .unwrap_or(65_000);

        Ok(Self {
            addr,
            format,
            max_packet_size,
        })
    }
}

/// Sink that sends one datagram per tagged event
pub struct UdpSink {
    name: String,
    config: UdpSinkConfig,
    socket: Option<UdpSocket>,
}

impl UdpSink {
    #[instrument(name = "udp_sink_new", skip(name, config))]
    pub async fn new(name: impl Into<String>, config: UdpSinkConfig) -> std::io::Result<Self> {
        let name = name.into();
        let socket = UdpSocket::bind("0.0.0.0:0").await?;
        socket.connect(&config.addr).await?;

        debug!(sink = %name, target = %config.addr, "udp sink connected");
        Ok(Self {
            name,
            config,
            socket: Some(socket),
        })
    }

    /// Create from params (for the factory)
    pub async fn from_params(
        name: impl Into<String>,
        params: &HashMap<String, String>,
    ) -> Result<Self, HubError> {
        let name = name.into();
        let config = UdpSinkConfig::from_params(params)
            .map_err(|e| HubError::sink_write(&name, e))?;
        Self::new(name.clone(), config)
            .await
            .map_err(|e| HubError::sink_write(&name, e.to_string()))
    }

    fn serialize_event(&self, event: &TaggedEvent) -> Result<Vec<u8>, String> {
        match self.config.format {
            UdpFormat::Json => serde_json::to_vec(event).map_err(|e| format!("json error: {e}")),
            UdpFormat::Bincode => {
                bincode::serialize(event).map_err(|e| format!("bincode error: {e}"))
            }
        }
    }

    fn socket(&self) -> Result<&UdpSocket, HubError> {
        self.socket
            .as_ref()
            .ok_or_else(|| HubError::sink_write(&self.name, "socket not connected"))
    }

    async fn transmit(&self, socket: &UdpSocket, data: &[u8]) {
        match socket.send(data).await {
            Ok(sent) => debug!(sink = %self.name, bytes = sent, "sent"),
            // Best-effort; the consumer may simply not be listening
            Err(e) => error!(sink = %self.name, error = %e, "udp send failed"),
        }
    }
}

impl EventSink for UdpSink {
    fn name(&self) -> &str {
        &self.name
    }

    #[instrument(
        name = "udp_sink_write",
        skip(self, event),
        fields(sink = %self.name, device = %event.event.device_id)
    )]
    async fn write(&mut self, event: &TaggedEvent) -> Result<(), HubError> {
        let socket = self.socket()?;
        let data = self
            .serialize_event(event)
            .map_err(|e| HubError::sink_write(&self.name, e))?;

        if data.len() > self.config.max_packet_size {
            warn!(
                sink = %self.name,
                size = data.len(),
                max = self.config.max_packet_size,
                "event exceeds datagram limit, skipped"
            );
            return Ok(());
        }

        self.transmit(socket, &data).await;
        Ok(())
    }

    async fn flush(&mut self) -> Result<(), HubError> {
        // UDP doesn't buffer
        Ok(())
    }

    #[instrument(name = "udp_sink_close", skip(self))]
    async fn close(&mut self) -> Result<(), HubError> {
        self.socket = None;
        debug!(sink = %self.name, "udp sink closed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use contracts::{DataEvent, DataEventKind};

    fn tagged() -> TaggedEvent {
        TaggedEvent {
            event: DataEvent::new(DataEventKind::SyncMarker, "dev_a".into(), 1),
            global_nanos: 2,
            uncertainty_nanos: 1,
            low_confidence: false,
        }
    }

    #[tokio::test]
    async fn test_udp_sink_config_parsing() {
        let mut params = HashMap::new();
        params.insert("addr".to_string(), "127.0.0.1:9999".to_string());
        params.insert("format".to_string(), "bincode".to_string());

        let config = UdpSinkConfig::from_params(&params).unwrap();
        assert_eq!(config.addr.port(), 9999);
        assert_eq!(config.format, UdpFormat::Bincode);
    }

    #[tokio::test]
    async fn test_missing_addr_rejected() {
        let params = HashMap::new();
        assert!(UdpSinkConfig::from_params(&params).is_err());
    }

    #[tokio::test]
    async fn test_udp_sink_write_without_receiver() {
        let config = UdpSinkConfig {
            addr: "127.0.0.1:19998".parse().unwrap(),
            format: UdpFormat::Json,
            max_packet_size: 65_000,
        };

        // UDP is connectionless; writes succeed with nobody listening
        let mut sink = UdpSink::new("test_udp", config).await.unwrap();
        assert!(sink.write(&tagged()).await.is_ok());
    }

    #[tokio::test]
    async fn test_datagram_reaches_listener() {
        let listener = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let config = UdpSinkConfig {
            addr,
            format: UdpFormat::Json,
            max_packet_size: 65_000,
        };
        let mut sink = UdpSink::new("test_udp", config).await.unwrap();
        sink.write(&tagged()).await.unwrap();

        let mut buf = vec![0u8; 65_000];
        let n = tokio::time::timeout(std::time::Duration::from_secs(1), listener.recv(&mut buf))
            .await
            .unwrap()
            .unwrap();
        let parsed: TaggedEvent = serde_json::from_slice(&buf[..n]).unwrap();
        assert_eq!(parsed.global_nanos, 2);
    }
}
