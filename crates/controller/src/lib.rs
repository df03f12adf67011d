//! # Controller
//!
//! The hub's brain: owns the device registry, drives per-device clock sync,
//! supervises liveness through heartbeats, orchestrates capture sessions and
//! normalizes inbound sensor events onto the reference timeline.
//!
//! All transport side effects arrive as [`contracts::TransportEvent`]s on a
//! single channel; [`Controller::run`] is the only consumer and routes each
//! event to the owning component. Components never read from the transport
//! themselves, which keeps their state machines testable in isolation.

mod controller;
mod error;
mod heartbeat;
mod registry;
mod session;
mod tagger;

pub use controller::{Controller, ControllerHandle};
pub use error::ControllerError;
pub use heartbeat::HeartbeatMonitor;
pub use registry::{DeviceRecord, Registry};
pub use session::SessionOrchestrator;
pub use tagger::EventTagger;
