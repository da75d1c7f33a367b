//! Error types for the wire codec layer.

use thiserror::Error;

/// Errors raised while encoding or decoding wire structures.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum CodecError {
    /// Buffer ended before the expected structure was complete.
    #[error("buffer too short: need {needed} bytes, have {available}")]
    UnexpectedEnd {
        /// Number of bytes required to continue.
        needed: usize,
        /// Number of bytes actually available.
        available: usize,
    },

    /// Value does not fit in a variable-length integer.
    #[error("value {value} exceeds the 62-bit varint range")]
    VarintOverflow {
        /// Offending value.
        value: u64,
    },

    /// Frame type byte is not recognized.
    #[error("unknown frame type {frame_type:#x}")]
    UnknownFrameType {
        /// Raw frame type as decoded.
        frame_type: u64,
    },

    /// Frame body violates its documented layout.
    #[error("malformed frame {frame_type:#x}")]
    MalformedFrame {
        /// Raw frame type as decoded.
        frame_type: u64,
    },
}

/// Convenience alias for codec results.
pub type Result<T> = std::result::Result<T, CodecError>;
