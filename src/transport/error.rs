//! Transport error codes and the unified engine error type.

use thiserror::Error;

use crate::wire::CodecError;

use super::crypto::CryptoError;
use super::socket::SocketError;
use super::stream::StreamError;

/// Transport error codes carried in CONNECTION_CLOSE frames
/// (RFC 9000 section 20).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportErrorCode {
    /// Graceful shutdown with no error.
    NoError,
    /// Implementation fault unrelated to the peer.
    InternalError,
    /// Server refused the connection.
    ConnectionRefused,
    /// Peer exceeded an advertised flow-control limit.
    FlowControlError,
    /// Peer opened more streams than permitted.
    StreamLimitError,
    /// Frame received for a stream in an incompatible state.
    StreamStateError,
    /// Final stream size changed or was exceeded.
    FinalSizeError,
    /// Frame violated its documented encoding.
    FrameEncodingError,
    /// Transport parameters were malformed or out of range.
    TransportParameterError,
    /// Generic protocol rule violation.
    ProtocolViolation,
    /// Address-validation token was unusable.
    InvalidToken,
    /// Application-level close without a transport cause.
    ApplicationError,
    /// Crypto stream reassembly exceeded its buffer budget.
    CryptoBufferExceeded,
    /// TLS alert, carried as `0x100 | alert`.
    Crypto(u8),
}

impl TransportErrorCode {
    /// Wire value for CONNECTION_CLOSE encoding.
    #[must_use]
    pub const fn to_u64(self) -> u64 {
        match self {
            Self::NoError => 0x00,
            Self::InternalError => 0x01,
            Self::ConnectionRefused => 0x02,
            Self::FlowControlError => 0x03,
            Self::StreamLimitError => 0x04,
            Self::StreamStateError => 0x05,
            Self::FinalSizeError => 0x06,
            Self::FrameEncodingError => 0x07,
            Self::TransportParameterError => 0x08,
            Self::ProtocolViolation => 0x0a,
            Self::InvalidToken => 0x0b,
            Self::ApplicationError => 0x0c,
            Self::CryptoBufferExceeded => 0x0d,
            Self::Crypto(alert) => 0x100 | alert as u64,
        }
    }
}

/// Unified error type for transport engine operations.
///
/// Two taxonomies live here: local operational failures that are
/// recovered in place (short buffers, closed handles, socket faults)
/// and peer misbehavior that escalates to a single Closing transition
/// with the mapped wire code.
#[derive(Debug, Error)]
pub enum TransportError {
    /// Wire codec failure while parsing peer input.
    #[error("codec failure: {0}")]
    Codec(#[from] CodecError),

    /// Cryptographic failure (derivation or sealing).
    #[error("crypto failure: {0}")]
    Crypto(#[from] CryptoError),

    /// Stream buffer rule violation.
    #[error("stream failure: {0}")]
    Stream(#[from] StreamError),

    /// Underlying socket failure.
    #[error("socket failure: {0}")]
    Socket(#[from] SocketError),

    /// Peer violated a protocol rule; close with the given code.
    #[error("peer violation ({reason})")]
    Peer {
        /// Code to carry in the CONNECTION_CLOSE frame.
        code: TransportErrorCode,
        /// Frame type that triggered the violation, if known.
        frame_type: u64,
        /// Static description for the reason phrase.
        reason: &'static str,
    },

    /// Operation attempted on a connection that is already closed.
    #[error("connection is closed")]
    ConnectionClosed,

    /// Local stream creation is blocked on peer MAX_STREAMS credit.
    #[error("stream creation blocked on peer credit")]
    StreamsBlocked,

    /// Stream handle does not exist on this connection.
    #[error("unknown stream {0}")]
    UnknownStream(u64),
}

impl TransportError {
    /// Shorthand for a peer violation.
    #[must_use]
    pub const fn peer(code: TransportErrorCode, reason: &'static str) -> Self {
        Self::Peer {
            code,
            frame_type: 0,
            reason,
        }
    }

    /// The wire code a close triggered by this error should carry, or
    /// `None` when the error is local-only and must not close the
    /// connection.
    #[must_use]
    pub fn close_code(&self) -> Option<TransportErrorCode> {
        match self {
            Self::Codec(_) => Some(TransportErrorCode::FrameEncodingError),
            Self::Stream(err) => err.close_code(),
            Self::Peer { code, .. } => Some(*code),
            Self::Crypto(_)
            | Self::Socket(_)
            | Self::ConnectionClosed
            | Self::StreamsBlocked
            | Self::UnknownStream(_) => None,
        }
    }

    /// Reason phrase carried in the CONNECTION_CLOSE frame.
    #[must_use]
    pub fn reason(&self) -> &'static str {
        match self {
            Self::Codec(_) => "frame encoding error",
            Self::Stream(_) => "stream error",
            Self::Peer { reason, .. } => reason,
            _ => "",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_values_match_rfc_table() {
        assert_eq!(TransportErrorCode::NoError.to_u64(), 0x00);
        assert_eq!(TransportErrorCode::FlowControlError.to_u64(), 0x03);
        assert_eq!(TransportErrorCode::ProtocolViolation.to_u64(), 0x0a);
        assert_eq!(TransportErrorCode::CryptoBufferExceeded.to_u64(), 0x0d);
        assert_eq!(TransportErrorCode::Crypto(0x28).to_u64(), 0x128);
    }

    #[test]
    fn local_errors_never_close() {
        assert!(TransportError::ConnectionClosed.close_code().is_none());
        assert!(TransportError::StreamsBlocked.close_code().is_none());
        assert_eq!(
            TransportError::peer(TransportErrorCode::ProtocolViolation, "x").close_code(),
            Some(TransportErrorCode::ProtocolViolation)
        );
    }
}
