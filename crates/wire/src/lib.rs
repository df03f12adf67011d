//! # Wire
//!
//! Protocol codec: length-prefixed JSON framing for `contracts::Message`.
//!
//! Frame layout: 4-byte big-endian body length, then a JSON-encoded message.
//! JSON keeps the body self-describing, which is what lets unknown payload
//! tags decode into `Payload::Unrecognized` instead of failing the stream.
//!
//! The codec is sans-IO: `decode` consumes from a `BytesMut` the transport
//! fills however it likes. A malformed body consumes exactly its frame and
//! returns an error, so one bad frame never desynchronizes the stream.

mod codec;
mod error;

pub use codec::{FrameCodec, LEN_PREFIX_BYTES};
pub use error::WireError;
