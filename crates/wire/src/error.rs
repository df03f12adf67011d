//! Wire codec error types

use thiserror::Error;

/// Codec-specific errors
#[derive(Debug, Error)]
pub enum WireError {
    /// Frame body failed to decode; the frame has been consumed
    #[error("malformed frame ({len} bytes): {message}")]
    Malformed { len: usize, message: String },

    /// Declared frame length exceeds the configured maximum
    #[error("oversize frame: {declared} bytes exceeds limit {limit}")]
    Oversize { declared: usize, limit: usize },

    /// Message could not be serialized
    #[error("encode error: {0}")]
    Encode(#[from] serde_json::Error),
}
