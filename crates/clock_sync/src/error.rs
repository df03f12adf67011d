//! Clock-sync error types

use contracts::HubError;
use thiserror::Error;

/// Engine-specific errors
#[derive(Debug, Error)]
pub enum SyncError {
    /// Every probe in the round timed out
    #[error("no usable sample for '{device_id}' after {attempts} probes")]
    NoSamples { device_id: String, attempts: usize },

    /// Probe could not be sent
    #[error(transparent)]
    Transport(#[from] HubError),
}
