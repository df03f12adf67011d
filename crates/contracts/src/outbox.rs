//! Outbound message construction.
//!
//! One `Outbox` per sending identity keeps the per-sender sequence numbers
//! monotonic no matter which module (orchestrator, clock engine, heartbeat
//! monitor) builds the message.

use std::sync::atomic::{AtomicU64, Ordering};

use crate::{DeviceId, Message, Payload, SharedClock};

/// Envelope factory with a shared monotonic sequence counter.
pub struct Outbox {
    sender_id: DeviceId,
    clock: SharedClock,
    next_sequence: AtomicU64,
}

impl Outbox {
    pub fn new(sender_id: DeviceId, clock: SharedClock) -> Self {
        Self {
            sender_id,
            clock,
            next_sequence: AtomicU64::new(1),
        }
    }

    /// Sender identity stamped on every message.
    pub fn sender_id(&self) -> &DeviceId {
        &self.sender_id
    }

    /// Build the next envelope for the given payload.
    pub fn message(&self, payload: Payload) -> Message {
        Message::new(
            self.sender_id.clone(),
            self.next_sequence.fetch_add(1, Ordering::Relaxed),
            self.clock.now_nanos(),
            payload,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ManualClock;
    use std::sync::Arc;

    #[test]
    fn test_sequences_are_monotonic() {
        let outbox = Outbox::new("controller".into(), Arc::new(ManualClock::starting_at(5)));
        let a = outbox.message(Payload::StatusRequest);
        let b = outbox.message(Payload::StatusRequest);
        assert_eq!(a.sequence, 1);
        assert_eq!(b.sequence, 2);
        assert_eq!(a.sent_at_nanos, 5);
        assert_eq!(a.sender_id, "controller");
    }
}
