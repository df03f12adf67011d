//! Hub configuration structures.
//!
//! Parsed by `config_loader` from TOML/JSON; field-level rules are expressed
//! with `validator` derives, cross-field rules live in the loader's validator.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use validator::Validate;

use crate::SessionMode;

/// Top-level hub configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct HubConfig {
    #[validate(nested)]
    pub server: ServerConfig,

    #[validate(nested)]
    pub clock_sync: ClockSyncConfig,

    #[validate(nested)]
    pub heartbeat: HeartbeatConfig,

    #[validate(nested)]
    pub session: SessionConfig,

    #[validate(nested)]
    pub tagger: TaggerConfig,

    /// Downstream sinks for tagged events
    pub sinks: Vec<SinkConfig>,
}

/// Listener configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct ServerConfig {
    /// Controller identity on the wire
    #[validate(length(min = 1))]
    pub controller_id: String,

    /// Bind address for the TCP listener
    #[validate(length(min = 1))]
    pub bind_addr: String,

    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            controller_id: "controller".to_string(),
            bind_addr: "0.0.0.0".to_string(),
            port: 8080,
        }
    }
}

/// Clock synchronization engine configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct ClockSyncConfig {
    /// Probes sent per sync round; the minimum-delay sample wins
    #[validate(range(min = 1, max = 64))]
    pub probes_per_round: usize,

    /// Per-probe pong timeout
    #[validate(range(min = 1))]
    pub probe_timeout_ms: u64,

    /// Period between re-synchronization rounds
    #[validate(range(min = 1))]
    pub resync_interval_s: u64,

    /// Minimum round trips above this are flagged high-jitter
    #[validate(range(min = 1))]
    pub rtt_ceiling_ms: u64,
}

impl Default for ClockSyncConfig {
    fn default() -> Self {
        Self {
            probes_per_round: 8,
            probe_timeout_ms: 500,
            resync_interval_s: 30,
            rtt_ceiling_ms: 50,
        }
    }
}

/// Heartbeat monitor configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct HeartbeatConfig {
    #[validate(range(min = 1))]
    pub interval_ms: u64,

    /// Consecutive missed probes before a device is declared unreachable
    #[validate(range(min = 1))]
    pub max_missed: u32,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            interval_ms: 5_000,
            max_missed: 3,
        }
    }
}

/// Session orchestrator configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct SessionConfig {
    /// Bound on the Arming state; quorum must arrive within this window
    #[validate(range(min = 1))]
    pub arming_timeout_ms: u64,

    /// Scheduled start = now + this delay, absorbing broadcast jitter
    pub start_delay_ms: u64,

    /// Best-effort wait for stop acknowledgments
    pub stop_timeout_ms: u64,

    /// Required acknowledgment count; `None` means all armed members
    pub quorum: Option<usize>,

    pub mode: SessionMode,

    /// Whether a reconnecting member may rejoin an in-progress session
    pub allow_late_join: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            arming_timeout_ms: 5_000,
            start_delay_ms: 200,
            stop_timeout_ms: 2_000,
            quorum: None,
            mode: SessionMode::Strict,
            allow_late_join: false,
        }
    }
}

impl SessionConfig {
    /// Acknowledgments required for a member set of the given size.
    pub fn required_acks(&self, member_count: usize) -> usize {
        match self.quorum {
            Some(n) => n.min(member_count),
            None => member_count,
        }
    }
}

/// Event tagger configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct TaggerConfig {
    /// Per-device capacity for events arriving before the first sync round
    #[validate(range(min = 1))]
    pub presync_buffer: usize,
}

impl Default for TaggerConfig {
    fn default() -> Self {
        Self {
            presync_buffer: 256,
        }
    }
}

/// Sink kind for the dispatcher factory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SinkType {
    Log,
    Jsonl,
    Udp,
}

/// One sink instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SinkConfig {
    pub name: String,
    pub sink_type: SinkType,

    /// Bounded queue depth in front of the sink worker
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,

    /// Sink-specific parameters (path, addr, format, ...)
    #[serde(default)]
    pub params: HashMap<String, String>,
}

fn default_queue_capacity() -> usize {
    256
}
