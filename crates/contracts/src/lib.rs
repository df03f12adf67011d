//! # Contracts
//!
//! Frozen interface contracts (ICD), defining inter-module data structures and traits.
//! All business crates can only depend on this crate, reverse dependencies are prohibited.
//!
//! ## Time Model
//! - The controller's local clock is the reference clock for the global timeline
//! - All timestamps are nanoseconds since the UNIX epoch (`i64`)
//! - A device-local timestamp plus that device's `ClockOffset` yields reference time

mod clock;
mod config;
mod device;
mod device_id;
mod error;
mod event;
mod message;
mod outbox;
mod session;
mod sink;
mod transport_event;

pub use clock::*;
pub use config::*;
pub use device::*;
pub use device_id::DeviceId;
pub use error::*;
pub use event::*;
pub use message::*;
pub use outbox::Outbox;
pub use session::*;
pub use sink::*;
pub use transport_event::*;
