//! Hub orchestration module.

mod runner;
mod stats;

pub use runner::{AutoSessionConfig, HubRunner, RunnerConfig};
pub use stats::HubStats;
