//! Hub run statistics.

use std::time::Duration;

use observability::HubMetricsAggregator;

/// Statistics from a hub run
#[derive(Debug, Clone, Default)]
pub struct HubStats {
    /// Sessions cycled by the automatic orchestration
    pub sessions_run: u64,

    /// Most devices tracked by the registry at any one time
    pub devices_peak: usize,

    /// Number of configured sinks
    pub active_sinks: usize,

    /// Total duration of the run
    pub duration: Duration,

    /// Sync quality aggregation
    pub sync: HubMetricsAggregator,
}

impl HubStats {
    /// Print detailed summary
    pub fn print_summary(&self) {
        println!("\n=== Hub Run Statistics ===\n");
        println!("Duration: {:.2}s", self.duration.as_secs_f64());
        println!("Peak devices: {}", self.devices_peak);
        println!("Sessions run: {}", self.sessions_run);
        println!("Active sinks: {}", self.active_sinks);
        println!();
        print!("{}", self.sync.summary());
        println!();
    }
}
