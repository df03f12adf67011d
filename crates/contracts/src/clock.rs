//! Reference clock abstraction.
//!
//! The controller's clock is ground truth for the global timeline. Putting it
//! behind a trait lets clock-sync and tagger tests run on a manually advanced
//! clock instead of wall time.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

/// Source of reference-clock timestamps (nanoseconds since UNIX epoch).
pub trait Clock: Send + Sync {
    /// Current reference time in nanoseconds.
    fn now_nanos(&self) -> i64;
}

/// Wall-clock implementation used in production.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_nanos(&self) -> i64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos() as i64)
            .unwrap_or(0)
    }
}

/// Manually driven clock for deterministic tests.
#[derive(Debug, Clone, Default)]
pub struct ManualClock {
    nanos: Arc<AtomicI64>,
}

impl ManualClock {
    /// Create a manual clock starting at the given timestamp.
    pub fn starting_at(nanos: i64) -> Self {
        Self {
            nanos: Arc::new(AtomicI64::new(nanos)),
        }
    }

    /// Advance the clock by the given number of nanoseconds.
    pub fn advance(&self, delta_nanos: i64) {
        self.nanos.fetch_add(delta_nanos, Ordering::SeqCst);
    }

    /// Set the clock to an absolute timestamp.
    pub fn set(&self, nanos: i64) {
        self.nanos.store(nanos, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_nanos(&self) -> i64 {
        self.nanos.load(Ordering::SeqCst)
    }
}

/// Shared clock handle.
pub type SharedClock = Arc<dyn Clock>;
