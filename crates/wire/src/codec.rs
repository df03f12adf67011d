//! Length-prefixed JSON frame codec.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use contracts::Message;
use tracing::trace;

use crate::WireError;

/// Size of the length prefix.
pub const LEN_PREFIX_BYTES: usize = 4;

const DEFAULT_MAX_FRAME_BYTES: usize = 1024 * 1024;

/// Stateless frame encoder/decoder.
#[derive(Debug, Clone, Copy)]
pub struct FrameCodec {
    max_frame_bytes: usize,
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self {
            max_frame_bytes: DEFAULT_MAX_FRAME_BYTES,
        }
    }
}

impl FrameCodec {
    /// Create a codec with a custom frame size limit.
    pub fn with_max_frame_bytes(max_frame_bytes: usize) -> Self {
        Self { max_frame_bytes }
    }

    /// Encode a message into a ready-to-send frame.
    pub fn encode(&self, message: &Message) -> Result<Bytes, WireError> {
        let body = serde_json::to_vec(message)?;
        if body.len() > self.max_frame_bytes {
            return Err(WireError::Oversize {
                declared: body.len(),
                limit: self.max_frame_bytes,
            });
        }

        let mut frame = BytesMut::with_capacity(LEN_PREFIX_BYTES + body.len());
        frame.put_u32(body.len() as u32);
        frame.put_slice(&body);
        Ok(frame.freeze())
    }

    /// Try to decode one message from the front of `buf`.
    ///
    /// Returns `Ok(None)` when the buffer does not yet hold a complete frame.
    /// A malformed body consumes its frame and returns `WireError::Malformed`;
    /// the caller may keep decoding from the same buffer. `Oversize` means the
    /// stream cannot be trusted past this point and the connection should be
    /// dropped.
    pub fn decode(&self, buf: &mut BytesMut) -> Result<Option<Message>, WireError> {
        if buf.len() < LEN_PREFIX_BYTES {
            return Ok(None);
        }

        let declared = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;
        if declared > self.max_frame_bytes {
            return Err(WireError::Oversize {
                declared,
                limit: self.max_frame_bytes,
            });
        }

        if buf.len() < LEN_PREFIX_BYTES + declared {
            return Ok(None);
        }

        buf.advance(LEN_PREFIX_BYTES);
        let body = buf.split_to(declared);

        match serde_json::from_slice::<Message>(&body) {
            Ok(message) => {
                trace!(kind = ?message.kind(), len = declared, "frame decoded");
                Ok(Some(message))
            }
            Err(e) => Err(WireError::Malformed {
                len: declared,
                message: e.to_string(),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use contracts::{DeviceHealth, Payload};

    fn message(payload: Payload) -> Message {
        Message::new("dev_a".into(), 1, 100, payload)
    }

    #[test]
    fn test_round_trip() {
        let codec = FrameCodec::default();
        let msg = message(Payload::StatusReport {
            health: DeviceHealth {
                battery_percent: Some(88.0),
                free_storage_bytes: Some(1 << 30),
                recording: false,
            },
        });

        let frame = codec.encode(&msg).unwrap();
        let mut buf = BytesMut::from(&frame[..]);
        let decoded = codec.decode(&mut buf).unwrap().unwrap();

        assert_eq!(decoded, msg);
        assert!(buf.is_empty());
    }

    #[test]
    fn test_partial_frame_returns_none() {
        let codec = FrameCodec::default();
        let frame = codec
            .encode(&message(Payload::Heartbeat { probe: 1 }))
            .unwrap();

        // Feed the frame one byte short
        let mut buf = BytesMut::from(&frame[..frame.len() - 1]);
        assert!(codec.decode(&mut buf).unwrap().is_none());

        // Completing the frame decodes it
        buf.extend_from_slice(&frame[frame.len() - 1..]);
        assert!(codec.decode(&mut buf).unwrap().is_some());
    }

    #[test]
    fn test_two_frames_in_one_buffer() {
        let codec = FrameCodec::default();
        let a = codec
            .encode(&message(Payload::Heartbeat { probe: 1 }))
            .unwrap();
        let b = codec
            .encode(&message(Payload::HeartbeatAck { probe: 1 }))
            .unwrap();

        let mut buf = BytesMut::new();
        buf.extend_from_slice(&a);
        buf.extend_from_slice(&b);

        let first = codec.decode(&mut buf).unwrap().unwrap();
        let second = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(first.payload, Payload::Heartbeat { probe: 1 });
        assert_eq!(second.payload, Payload::HeartbeatAck { probe: 1 });
    }

    #[test]
    fn test_malformed_body_consumes_frame_only() {
        let codec = FrameCodec::default();
        let garbage = b"not json at all";

        let mut buf = BytesMut::new();
        buf.put_u32(garbage.len() as u32);
        buf.put_slice(garbage);

        // Append a valid frame after the bad one
        let good = codec
            .encode(&message(Payload::Heartbeat { probe: 9 }))
            .unwrap();
        buf.extend_from_slice(&good);

        assert!(matches!(
            codec.decode(&mut buf),
            Err(WireError::Malformed { .. })
        ));
        // Stream stays aligned: the next frame still decodes
        let next = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(next.payload, Payload::Heartbeat { probe: 9 });
    }

    #[test]
    fn test_oversize_rejected() {
        let codec = FrameCodec::with_max_frame_bytes(16);
        let mut buf = BytesMut::new();
        buf.put_u32(1024);
        buf.put_slice(&[0u8; 32]);

        assert!(matches!(
            codec.decode(&mut buf),
            Err(WireError::Oversize { declared: 1024, .. })
        ));
    }

    #[test]
    fn test_unknown_payload_decodes_as_unrecognized() {
        let codec = FrameCodec::default();
        let body = br#"{"sender_id":"x","sequence":3,"sent_at_nanos":0,"type":"hologram"}"#;

        let mut buf = BytesMut::new();
        buf.put_u32(body.len() as u32);
        buf.put_slice(body);

        let decoded = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(decoded.payload, Payload::Unrecognized);
    }
}
