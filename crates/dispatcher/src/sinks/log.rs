//! LogSink - logs event summaries via tracing

use contracts::{EventSink, HubError, TaggedEvent};
use tracing::{info, instrument};

/// Sink that logs one line per tagged event, for debugging and demos
pub struct LogSink {
    name: String,
}

impl LogSink {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }

    fn log_event_summary(&self, event: &TaggedEvent) {
        info!(
            sink = %self.name,
            device = %event.event.device_id,
            kind = ?event.event.kind,
            global_us = event.global_nanos / 1_000,
            uncertainty_us = event.uncertainty_nanos / 1_000,
            low_confidence = event.low_confidence,
            "tagged event"
        );
    }
}

impl EventSink for LogSink {
    fn name(&self) -> &str {
        &self.name
    }

    #[instrument(
        name = "log_sink_write",
        skip(self, event),
        fields(sink = %self.name, device = %event.event.device_id)
    )]
    async fn write(&mut self, event: &TaggedEvent) -> Result<(), HubError> {
        self.log_event_summary(event);
        Ok(())
    }

    async fn flush(&mut self) -> Result<(), HubError> {
        // Nothing buffered
        Ok(())
    }

    #[instrument(name = "log_sink_close", skip(self))]
    async fn close(&mut self) -> Result<(), HubError> {
        info!(sink = %self.name, "log sink closed");
        Ok(())
    }
}
