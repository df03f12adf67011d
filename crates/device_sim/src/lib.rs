//! # Device Sim
//!
//! Simulated capture device: a TCP client that speaks the hub's wire
//! protocol with a deliberately skewed clock.
//!
//! Used by the `simulate` CLI command and the end-to-end tests to exercise
//! the full controller stack - introduction, clock sync, heartbeats, session
//! lifecycle and sensor event streaming - without physical hardware.

mod device;
mod sensors;

pub use device::{DeviceSimConfig, SimulatedDevice, SkewedClock};
pub use sensors::SensorSpec;
