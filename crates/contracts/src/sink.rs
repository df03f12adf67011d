//! EventSink trait - downstream consumer interface
//!
//! Defines the abstract interface for tagged-event consumers.

use crate::{HubError, TaggedEvent};

/// Tagged-event output trait
///
/// All sink implementations must implement this trait.
#[trait_variant::make(EventSink: Send)]
pub trait LocalEventSink {
    /// Sink name (used for logging/metrics)
    fn name(&self) -> &str;

    /// Write one tagged event
    ///
    /// # Errors
    /// Returns write error (should include context)
    async fn write(&mut self, event: &TaggedEvent) -> Result<(), HubError>;

    /// Flush buffer (if any)
    async fn flush(&mut self) -> Result<(), HubError>;

    /// Close sink
    async fn close(&mut self) -> Result<(), HubError>;
}
