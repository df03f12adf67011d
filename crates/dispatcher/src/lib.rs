//! # Dispatcher
//!
//! Fan-out of tagged events to configured sinks.
//!
//! Each sink runs behind its own bounded queue and worker task, so a slow or
//! failing sink drops its own events instead of stalling the tagging
//! pipeline or its sibling sinks.

pub mod dispatcher;
pub mod error;
pub mod handle;
pub mod metrics;
pub mod sinks;

pub use contracts::{EventSink, TaggedEvent};
pub use dispatcher::{create_dispatcher, Dispatcher, DispatcherBuilder, DispatcherConfig};
pub use error::DispatcherError;
pub use handle::SinkHandle;
pub use metrics::{MetricsSnapshot, SinkMetrics};
pub use sinks::{JsonlSink, LogSink, UdpSink};
