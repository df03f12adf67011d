//! Sink implementations
//!
//! Contains LogSink, JsonlSink, and UdpSink.

mod jsonl;
mod log;
mod udp;

pub use self::jsonl::JsonlSink;
pub use self::log::LogSink;
pub use self::udp::UdpSink;
