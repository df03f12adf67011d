//! Four-timestamp offset arithmetic.

use serde::{Deserialize, Serialize};

/// One completed probe measurement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProbeSample {
    /// Device-local -> reference translation: local + offset = reference
    pub offset_nanos: i64,

    /// Network round-trip delay with device processing time removed
    pub round_trip_nanos: i64,
}

/// NTP-style estimate from one round trip.
///
/// `t0`: controller sends SYNC_PING, `t1`: device receives it, `t2`: device
/// sends SYNC_PONG, `t3`: controller receives it. `t0`/`t3` are reference
/// time, `t1`/`t2` are device-local.
///
/// `((t1 - t0) + (t2 - t3)) / 2` is how far the device clock runs *ahead* of
/// the reference; the stored offset is its negation so that adding it to a
/// device-local timestamp lands on the reference timeline.
pub fn estimate_sample(t0: i64, t1: i64, t2: i64, t3: i64) -> ProbeSample {
    let device_lead_nanos = ((t1 - t0) + (t2 - t3)) / 2;
    let round_trip_nanos = (t3 - t0) - (t2 - t1);
    ProbeSample {
        offset_nanos: -device_lead_nanos,
        round_trip_nanos,
    }
}
