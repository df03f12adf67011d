//! Hub metric aggregation
//!
//! The hot paths emit Prometheus metrics directly via the `metrics` macros;
//! this module aggregates sync quality in memory so the CLI can print a
//! human-readable summary when a run ends.

use std::collections::HashMap;

use contracts::{DeviceSnapshot, SessionOutcome};
use metrics::gauge;

/// In-memory aggregator over registry and session observations.
///
/// Feed it device snapshots as they are published and session outcomes as
/// they resolve, then render `summary()` at shutdown.
#[derive(Debug, Clone, Default)]
pub struct HubMetricsAggregator {
    /// Per-device absolute clock offset statistics (ms)
    pub offset_stats: HashMap<String, RunningStats>,

    /// Selected-probe round-trip statistics across all devices (ms)
    pub rtt_stats: RunningStats,

    /// Per-device count of high-jitter sync rounds observed
    pub high_jitter_counts: HashMap<String, u64>,

    /// Session outcome tallies
    pub sessions_complete: u64,
    pub sessions_degraded: u64,
    pub sessions_aborted: u64,

    /// Devices excluded from degraded sessions, by id
    pub exclusion_counts: HashMap<String, u64>,
}

impl HubMetricsAggregator {
    /// Create a new aggregator
    pub fn new() -> Self {
        Self::default()
    }

    /// Fold one registry snapshot into the running statistics.
    pub fn observe_devices(&mut self, devices: &[DeviceSnapshot]) {
        gauge!("capture_hub_devices_tracked").set(devices.len() as f64);

        for device in devices {
            let Some(offset) = &device.offset else {
                continue;
            };

            let offset_ms = offset.offset_nanos.abs() as f64 / 1e6;
            self.offset_stats
                .entry(device.device_id.to_string())
                .or_default()
                .push(offset_ms);

            self.rtt_stats.push(offset.round_trip_nanos as f64 / 1e6);

            if offset.high_jitter {
                *self
                    .high_jitter_counts
                    .entry(device.device_id.to_string())
                    .or_insert(0) += 1;
            }
        }
    }

    /// Record a resolved session outcome.
    pub fn observe_session(&mut self, outcome: &SessionOutcome) {
        match outcome {
            SessionOutcome::Complete { .. } => self.sessions_complete += 1,
            SessionOutcome::Degraded { excluded, .. } => {
                self.sessions_degraded += 1;
                for device_id in excluded {
                    *self.exclusion_counts.entry(device_id.clone()).or_insert(0) += 1;
                }
            }
            SessionOutcome::Aborted { .. } => self.sessions_aborted += 1,
        }
    }

    /// Generate a summary report
    pub fn summary(&self) -> MetricsSummary {
        MetricsSummary {
            sessions_complete: self.sessions_complete,
            sessions_degraded: self.sessions_degraded,
            sessions_aborted: self.sessions_aborted,
            rtt_ms: StatsSummary::from(&self.rtt_stats),
            device_offset_ms: self
                .offset_stats
                .iter()
                .map(|(id, stats)| (id.clone(), StatsSummary::from(stats)))
                .collect(),
            high_jitter_counts: self.high_jitter_counts.clone(),
            exclusion_counts: self.exclusion_counts.clone(),
        }
    }

    /// Reset all statistics
    pub fn reset(&mut self) {
        *self = Self::default();
    }
}

/// Rendered summary of a hub run
#[derive(Debug, Clone, Default)]
pub struct MetricsSummary {
    pub sessions_complete: u64,
    pub sessions_degraded: u64,
    pub sessions_aborted: u64,
    pub rtt_ms: StatsSummary,
    pub device_offset_ms: HashMap<String, StatsSummary>,
    pub high_jitter_counts: HashMap<String, u64>,
    pub exclusion_counts: HashMap<String, u64>,
}

impl std::fmt::Display for MetricsSummary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "=== Capture Hub Summary ===")?;
        writeln!(
            f,
            "Sessions: {} complete, {} degraded, {} aborted",
            self.sessions_complete, self.sessions_degraded, self.sessions_aborted
        )?;
        writeln!(f, "Sync round trip (ms): {}", self.rtt_ms)?;

        if !self.device_offset_ms.is_empty() {
            writeln!(f, "Clock offset |ms| per device:")?;
            let mut devices: Vec<_> = self.device_offset_ms.iter().collect();
            devices.sort_by(|a, b| a.0.cmp(b.0));
            for (device_id, stats) in devices {
                writeln!(f, "  {}: {}", device_id, stats)?;
            }
        }

        if !self.high_jitter_counts.is_empty() {
            writeln!(f, "High-jitter sync rounds:")?;
            for (device_id, count) in &self.high_jitter_counts {
                writeln!(f, "  {}: {}", device_id, count)?;
            }
        }

        if !self.exclusion_counts.is_empty() {
            writeln!(f, "Degraded-session exclusions:")?;
            for (device_id, count) in &self.exclusion_counts {
                writeln!(f, "  {}: {}", device_id, count)?;
            }
        }

        Ok(())
    }
}

/// Statistics summary
#[derive(Debug, Clone, Default)]
pub struct StatsSummary {
    pub count: u64,
    pub min: f64,
    pub max: f64,
    pub mean: f64,
    pub std_dev: f64,
}

impl From<&RunningStats> for StatsSummary {
    fn from(stats: &RunningStats) -> Self {
        Self {
            count: stats.count(),
            min: stats.min(),
            max: stats.max(),
            mean: stats.mean(),
            std_dev: stats.std_dev(),
        }
    }
}

impl std::fmt::Display for StatsSummary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.count == 0 {
            write!(f, "N/A")
        } else {
            write!(
                f,
                "min={:.3}, max={:.3}, mean={:.3}, std={:.3} (n={})",
                self.min, self.max, self.mean, self.std_dev, self.count
            )
        }
    }
}

/// Online statistics calculator (Welford's algorithm)
#[derive(Debug, Clone, Default)]
pub struct RunningStats {
    count: u64,
    mean: f64,
    m2: f64,
    min: f64,
    max: f64,
}

impl RunningStats {
    /// Add a new value
    pub fn push(&mut self, value: f64) {
        self.count += 1;

        if self.count == 1 {
            self.min = value;
            self.max = value;
            self.mean = value;
            self.m2 = 0.0;
        } else {
            self.min = self.min.min(value);
            self.max = self.max.max(value);

            let delta = value - self.mean;
            self.mean += delta / self.count as f64;
            let delta2 = value - self.mean;
            self.m2 += delta * delta2;
        }
    }

    /// Sample count
    pub fn count(&self) -> u64 {
        self.count
    }

    /// Mean
    pub fn mean(&self) -> f64 {
        if self.count == 0 {
            0.0
        } else {
            self.mean
        }
    }

    /// Variance
    pub fn variance(&self) -> f64 {
        if self.count < 2 {
            0.0
        } else {
            self.m2 / (self.count - 1) as f64
        }
    }

    /// Standard deviation
    pub fn std_dev(&self) -> f64 {
        self.variance().sqrt()
    }

    /// Minimum
    pub fn min(&self) -> f64 {
        self.min
    }

    /// Maximum
    pub fn max(&self) -> f64 {
        self.max
    }
}
