//! # Clock Sync
//!
//! Per-device clock-offset estimation against the controller's reference
//! clock, using NTP-style four-timestamp round trips.
//!
//! A sync round sends several probes and keeps the estimate from the probe
//! with the *minimum* observed round-trip delay - the lowest-delay sample is
//! the one least distorted by queueing jitter, which beats averaging across
//! all samples on a lossy wireless link.

mod engine;
mod error;
mod estimate;

pub use engine::ClockSyncEngine;
pub use error::SyncError;
pub use estimate::{estimate_sample, ProbeSample};
