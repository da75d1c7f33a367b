//! Frame codec for all RFC 9000 section 19 frame types.

use super::cursor::{Reader, Writer};
use super::error::{CodecError, Result};
use super::varint;

/// Frame type identifiers as they appear on the wire.
mod ty {
    pub const PADDING: u64 = 0x00;
    pub const PING: u64 = 0x01;
    pub const ACK: u64 = 0x02;
    pub const ACK_ECN: u64 = 0x03;
    pub const RESET_STREAM: u64 = 0x04;
    pub const STOP_SENDING: u64 = 0x05;
    pub const CRYPTO: u64 = 0x06;
    pub const NEW_TOKEN: u64 = 0x07;
    pub const STREAM_BASE: u64 = 0x08;
    pub const STREAM_MAX: u64 = 0x0f;
    pub const MAX_DATA: u64 = 0x10;
    pub const MAX_STREAM_DATA: u64 = 0x11;
    pub const MAX_STREAMS_BIDI: u64 = 0x12;
    pub const MAX_STREAMS_UNI: u64 = 0x13;
    pub const DATA_BLOCKED: u64 = 0x14;
    pub const STREAM_DATA_BLOCKED: u64 = 0x15;
    pub const STREAMS_BLOCKED_BIDI: u64 = 0x16;
    pub const STREAMS_BLOCKED_UNI: u64 = 0x17;
    pub const NEW_CONNECTION_ID: u64 = 0x18;
    pub const RETIRE_CONNECTION_ID: u64 = 0x19;
    pub const PATH_CHALLENGE: u64 = 0x1a;
    pub const PATH_RESPONSE: u64 = 0x1b;
    pub const CONNECTION_CLOSE_TRANSPORT: u64 = 0x1c;
    pub const CONNECTION_CLOSE_APP: u64 = 0x1d;
    pub const HANDSHAKE_DONE: u64 = 0x1e;

    pub const STREAM_FIN_BIT: u64 = 0x01;
    pub const STREAM_LEN_BIT: u64 = 0x02;
    pub const STREAM_OFF_BIT: u64 = 0x04;
}

/// Packet classes imposing frame-type restrictions (RFC 9000 section 12.4).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketClass {
    /// Initial packets.
    Initial,
    /// 0-RTT packets.
    ZeroRtt,
    /// Handshake packets.
    Handshake,
    /// 1-RTT (short header) packets.
    OneRtt,
}

/// Explicit congestion notification counters attached to an ACK frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct EcnCounts {
    /// ECT(0) marked packets observed.
    pub ect0: u64,
    /// ECT(1) marked packets observed.
    pub ect1: u64,
    /// Congestion-experienced marked packets observed.
    pub ce: u64,
}

/// Decoded ACK frame: largest, raw delay, and descending inclusive ranges.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AckFrame {
    /// Largest acknowledged packet number.
    pub largest: u64,
    /// Raw ack delay field; scaling by the ack-delay exponent is the
    /// connection's business.
    pub delay: u64,
    /// Inclusive `(lo, hi)` ranges sorted descending by `hi`;
    /// `ranges[0].1 == largest`.
    pub ranges: Vec<(u64, u64)>,
    /// ECN counters when the ACK_ECN variant was used.
    pub ecn: Option<EcnCounts>,
}

impl AckFrame {
    /// Whether `pn` falls inside any acknowledged range.
    #[must_use]
    pub fn contains(&self, pn: u64) -> bool {
        self.ranges.iter().any(|&(lo, hi)| pn >= lo && pn <= hi)
    }
}

/// A single decoded frame holding borrowed views into the packet payload.
///
/// Frames never outlive the datagram-processing call; bytes needed for
/// longer are copied into owning buffers by the dispatch handlers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame<'a> {
    /// Run of padding bytes.
    Padding {
        /// Number of contiguous padding bytes.
        len: usize,
    },
    /// Liveness probe.
    Ping,
    /// Acknowledgement with optional ECN counters.
    Ack(AckFrame),
    /// Abrupt termination of the sending side of a stream.
    ResetStream {
        /// Stream being reset.
        stream_id: u64,
        /// Application error code.
        error_code: u64,
        /// Final size of the stream in bytes.
        final_size: u64,
    },
    /// Request that the peer stop sending on a stream.
    StopSending {
        /// Stream the request applies to.
        stream_id: u64,
        /// Application error code.
        error_code: u64,
    },
    /// Handshake bytes for the TLS layer.
    Crypto {
        /// Byte offset within the crypto stream.
        offset: u64,
        /// Handshake payload.
        data: &'a [u8],
    },
    /// Address-validation token for future connections.
    NewToken {
        /// Opaque token bytes.
        token: &'a [u8],
    },
    /// Application stream data.
    Stream {
        /// Stream carrying the data.
        stream_id: u64,
        /// Byte offset of `data` within the stream.
        offset: u64,
        /// Payload bytes.
        data: &'a [u8],
        /// Whether this frame ends the stream.
        fin: bool,
    },
    /// Connection-level flow control credit.
    MaxData {
        /// New connection data limit.
        max: u64,
    },
    /// Stream-level flow control credit.
    MaxStreamData {
        /// Stream the credit applies to.
        stream_id: u64,
        /// New stream data limit.
        max: u64,
    },
    /// Stream-count credit.
    MaxStreams {
        /// True for bidirectional streams, false for unidirectional.
        bidi: bool,
        /// New cumulative stream count limit.
        max: u64,
    },
    /// Sender is blocked on connection flow control.
    DataBlocked {
        /// Limit at which blocking occurred.
        limit: u64,
    },
    /// Sender is blocked on stream flow control.
    StreamDataBlocked {
        /// Blocked stream.
        stream_id: u64,
        /// Limit at which blocking occurred.
        limit: u64,
    },
    /// Sender is blocked on the stream-count limit.
    StreamsBlocked {
        /// True for bidirectional streams, false for unidirectional.
        bidi: bool,
        /// Limit at which blocking occurred.
        limit: u64,
    },
    /// A new connection ID issued by the peer.
    NewConnectionId {
        /// Sequence number of the connection ID.
        sequence: u64,
        /// Sequence numbers below this must be retired.
        retire_prior_to: u64,
        /// The connection ID itself (1..=20 bytes).
        id: &'a [u8],
        /// Stateless reset token paired with the ID.
        reset_token: [u8; 16],
    },
    /// Retirement of a previously issued connection ID.
    RetireConnectionId {
        /// Sequence number being retired.
        sequence: u64,
    },
    /// Path validation probe.
    PathChallenge {
        /// Opaque probe payload to echo back.
        data: [u8; 8],
    },
    /// Path validation answer.
    PathResponse {
        /// Echoed probe payload.
        data: [u8; 8],
    },
    /// Connection termination notice.
    ConnectionClose {
        /// Transport or application error code.
        error_code: u64,
        /// Offending frame type for the transport variant; `None` marks
        /// the application variant.
        frame_type: Option<u64>,
        /// UTF-8 reason phrase (not validated).
        reason: &'a [u8],
    },
    /// Server signal that the handshake is confirmed.
    HandshakeDone,
}

impl<'a> Frame<'a> {
    /// Decode the next frame from the reader.
    pub fn decode(reader: &mut Reader<'a>) -> Result<Self> {
        let frame_type = reader.read_varint()?;
        let malformed = || CodecError::MalformedFrame { frame_type };
        let frame = match frame_type {
            ty::PADDING => {
                let mut len = 1;
                while reader.peek_u8() == Ok(0x00) {
                    reader.skip(1)?;
                    len += 1;
                }
                Frame::Padding { len }
            }
            ty::PING => Frame::Ping,
            ty::ACK | ty::ACK_ECN => Frame::Ack(decode_ack(reader, frame_type)?),
            ty::RESET_STREAM => Frame::ResetStream {
                stream_id: reader.read_varint()?,
                error_code: reader.read_varint()?,
                final_size: reader.read_varint()?,
            },
            ty::STOP_SENDING => Frame::StopSending {
                stream_id: reader.read_varint()?,
                error_code: reader.read_varint()?,
            },
            ty::CRYPTO => {
                let offset = reader.read_varint()?;
                let data = reader.read_varint_span()?;
                if offset.saturating_add(data.len() as u64) > varint::MAX {
                    return Err(malformed());
                }
                Frame::Crypto { offset, data }
            }
            ty::NEW_TOKEN => {
                let token = reader.read_varint_span()?;
                if token.is_empty() {
                    return Err(malformed());
                }
                Frame::NewToken { token }
            }
            ty::STREAM_BASE..=ty::STREAM_MAX => {
                let stream_id = reader.read_varint()?;
                let offset = if frame_type & ty::STREAM_OFF_BIT != 0 {
                    reader.read_varint()?
                } else {
                    0
                };
                let data = if frame_type & ty::STREAM_LEN_BIT != 0 {
                    reader.read_varint_span()?
                } else {
                    reader.rest()
                };
                if offset.saturating_add(data.len() as u64) > varint::MAX {
                    return Err(malformed());
                }
                Frame::Stream {
                    stream_id,
                    offset,
                    data,
                    fin: frame_type & ty::STREAM_FIN_BIT != 0,
                }
            }
            ty::MAX_DATA => Frame::MaxData {
                max: reader.read_varint()?,
            },
            ty::MAX_STREAM_DATA => Frame::MaxStreamData {
                stream_id: reader.read_varint()?,
                max: reader.read_varint()?,
            },
            ty::MAX_STREAMS_BIDI | ty::MAX_STREAMS_UNI => {
                let max = reader.read_varint()?;
                if max > 1 << 60 {
                    return Err(malformed());
                }
                Frame::MaxStreams {
                    bidi: frame_type == ty::MAX_STREAMS_BIDI,
                    max,
                }
            }
            ty::DATA_BLOCKED => Frame::DataBlocked {
                limit: reader.read_varint()?,
            },
            ty::STREAM_DATA_BLOCKED => Frame::StreamDataBlocked {
                stream_id: reader.read_varint()?,
                limit: reader.read_varint()?,
            },
            ty::STREAMS_BLOCKED_BIDI | ty::STREAMS_BLOCKED_UNI => Frame::StreamsBlocked {
                bidi: frame_type == ty::STREAMS_BLOCKED_BIDI,
                limit: reader.read_varint()?,
            },
            ty::NEW_CONNECTION_ID => {
                let sequence = reader.read_varint()?;
                let retire_prior_to = reader.read_varint()?;
                let id_len = usize::from(reader.read_u8()?);
                if retire_prior_to > sequence || id_len == 0 || id_len > 20 {
                    return Err(malformed());
                }
                let id = reader.read_span(id_len)?;
                let token = reader.read_span(16)?;
                Frame::NewConnectionId {
                    sequence,
                    retire_prior_to,
                    id,
                    reset_token: token.try_into().expect("length checked"),
                }
            }
            ty::RETIRE_CONNECTION_ID => Frame::RetireConnectionId {
                sequence: reader.read_varint()?,
            },
            ty::PATH_CHALLENGE => Frame::PathChallenge {
                data: reader.read_span(8)?.try_into().expect("length checked"),
            },
            ty::PATH_RESPONSE => Frame::PathResponse {
                data: reader.read_span(8)?.try_into().expect("length checked"),
            },
            ty::CONNECTION_CLOSE_TRANSPORT => Frame::ConnectionClose {
                error_code: reader.read_varint()?,
                frame_type: Some(reader.read_varint()?),
                reason: reader.read_varint_span()?,
            },
            ty::CONNECTION_CLOSE_APP => Frame::ConnectionClose {
                error_code: reader.read_varint()?,
                frame_type: None,
                reason: reader.read_varint_span()?,
            },
            ty::HANDSHAKE_DONE => Frame::HandshakeDone,
            _ => return Err(CodecError::UnknownFrameType { frame_type }),
        };
        Ok(frame)
    }

    /// Encode the frame into the writer.
    pub fn encode(&self, writer: &mut Writer<'_>) -> Result<()> {
        match self {
            Frame::Padding { len } => {
                for _ in 0..*len {
                    writer.write_u8(0x00)?;
                }
            }
            Frame::Ping => writer.write_varint(ty::PING)?,
            Frame::Ack(ack) => encode_ack(ack, writer)?,
            Frame::ResetStream {
                stream_id,
                error_code,
                final_size,
            } => {
                writer.write_varint(ty::RESET_STREAM)?;
                writer.write_varint(*stream_id)?;
                writer.write_varint(*error_code)?;
                writer.write_varint(*final_size)?;
            }
            Frame::StopSending {
                stream_id,
                error_code,
            } => {
                writer.write_varint(ty::STOP_SENDING)?;
                writer.write_varint(*stream_id)?;
                writer.write_varint(*error_code)?;
            }
            Frame::Crypto { offset, data } => {
                writer.write_varint(ty::CRYPTO)?;
                writer.write_varint(*offset)?;
                writer.write_varint_span(data)?;
            }
            Frame::NewToken { token } => {
                writer.write_varint(ty::NEW_TOKEN)?;
                writer.write_varint_span(token)?;
            }
            Frame::Stream {
                stream_id,
                offset,
                data,
                fin,
            } => {
                let mut frame_type = ty::STREAM_BASE | ty::STREAM_LEN_BIT;
                if *offset > 0 {
                    frame_type |= ty::STREAM_OFF_BIT;
                }
                if *fin {
                    frame_type |= ty::STREAM_FIN_BIT;
                }
                writer.write_varint(frame_type)?;
                writer.write_varint(*stream_id)?;
                if *offset > 0 {
                    writer.write_varint(*offset)?;
                }
                writer.write_varint_span(data)?;
            }
            Frame::MaxData { max } => {
                writer.write_varint(ty::MAX_DATA)?;
                writer.write_varint(*max)?;
            }
            Frame::MaxStreamData { stream_id, max } => {
                writer.write_varint(ty::MAX_STREAM_DATA)?;
                writer.write_varint(*stream_id)?;
                writer.write_varint(*max)?;
            }
            Frame::MaxStreams { bidi, max } => {
                writer.write_varint(if *bidi {
                    ty::MAX_STREAMS_BIDI
                } else {
                    ty::MAX_STREAMS_UNI
                })?;
                writer.write_varint(*max)?;
            }
            Frame::DataBlocked { limit } => {
                writer.write_varint(ty::DATA_BLOCKED)?;
                writer.write_varint(*limit)?;
            }
            Frame::StreamDataBlocked { stream_id, limit } => {
                writer.write_varint(ty::STREAM_DATA_BLOCKED)?;
                writer.write_varint(*stream_id)?;
                writer.write_varint(*limit)?;
            }
            Frame::StreamsBlocked { bidi, limit } => {
                writer.write_varint(if *bidi {
                    ty::STREAMS_BLOCKED_BIDI
                } else {
                    ty::STREAMS_BLOCKED_UNI
                })?;
                writer.write_varint(*limit)?;
            }
            Frame::NewConnectionId {
                sequence,
                retire_prior_to,
                id,
                reset_token,
            } => {
                writer.write_varint(ty::NEW_CONNECTION_ID)?;
                writer.write_varint(*sequence)?;
                writer.write_varint(*retire_prior_to)?;
                writer.write_u8(id.len() as u8)?;
                writer.write_span(id)?;
                writer.write_span(reset_token)?;
            }
            Frame::RetireConnectionId { sequence } => {
                writer.write_varint(ty::RETIRE_CONNECTION_ID)?;
                writer.write_varint(*sequence)?;
            }
            Frame::PathChallenge { data } => {
                writer.write_varint(ty::PATH_CHALLENGE)?;
                writer.write_span(data)?;
            }
            Frame::PathResponse { data } => {
                writer.write_varint(ty::PATH_RESPONSE)?;
                writer.write_span(data)?;
            }
            Frame::ConnectionClose {
                error_code,
                frame_type,
                reason,
            } => {
                match frame_type {
                    Some(offending) => {
                        writer.write_varint(ty::CONNECTION_CLOSE_TRANSPORT)?;
                        writer.write_varint(*error_code)?;
                        writer.write_varint(*offending)?;
                    }
                    None => {
                        writer.write_varint(ty::CONNECTION_CLOSE_APP)?;
                        writer.write_varint(*error_code)?;
                    }
                }
                writer.write_varint_span(reason)?;
            }
            Frame::HandshakeDone => writer.write_varint(ty::HANDSHAKE_DONE)?,
        }
        Ok(())
    }

    /// Exact encoded length, letting the packet gatherer stop before
    /// overflowing the datagram budget.
    #[must_use]
    pub fn encoded_len(&self) -> usize {
        match self {
            Frame::Padding { len } => *len,
            Frame::Ping | Frame::HandshakeDone => 1,
            Frame::Ack(ack) => ack_encoded_len(ack),
            Frame::ResetStream {
                stream_id,
                error_code,
                final_size,
            } => 1 + varint::len(*stream_id) + varint::len(*error_code) + varint::len(*final_size),
            Frame::StopSending {
                stream_id,
                error_code,
            } => 1 + varint::len(*stream_id) + varint::len(*error_code),
            Frame::Crypto { offset, data } => {
                1 + varint::len(*offset) + varint::len(data.len() as u64) + data.len()
            }
            Frame::NewToken { token } => 1 + varint::len(token.len() as u64) + token.len(),
            Frame::Stream {
                stream_id,
                offset,
                data,
                ..
            } => {
                let offset_len = if *offset > 0 { varint::len(*offset) } else { 0 };
                1 + varint::len(*stream_id)
                    + offset_len
                    + varint::len(data.len() as u64)
                    + data.len()
            }
            Frame::MaxData { max } => 1 + varint::len(*max),
            Frame::MaxStreamData { stream_id, max } => {
                1 + varint::len(*stream_id) + varint::len(*max)
            }
            Frame::MaxStreams { max, .. } => 1 + varint::len(*max),
            Frame::DataBlocked { limit } => 1 + varint::len(*limit),
            Frame::StreamDataBlocked { stream_id, limit } => {
                1 + varint::len(*stream_id) + varint::len(*limit)
            }
            Frame::StreamsBlocked { limit, .. } => 1 + varint::len(*limit),
            Frame::NewConnectionId {
                sequence,
                retire_prior_to,
                id,
                ..
            } => 1 + varint::len(*sequence) + varint::len(*retire_prior_to) + 1 + id.len() + 16,
            Frame::RetireConnectionId { sequence } => 1 + varint::len(*sequence),
            Frame::PathChallenge { .. } | Frame::PathResponse { .. } => 1 + 8,
            Frame::ConnectionClose {
                error_code,
                frame_type,
                reason,
            } => {
                let offending = frame_type.map_or(0, varint::len);
                1 + varint::len(*error_code)
                    + offending
                    + varint::len(reason.len() as u64)
                    + reason.len()
            }
        }
    }

    /// Whether the frame obligates the peer to acknowledge the packet.
    #[must_use]
    pub fn is_ack_eliciting(&self) -> bool {
        !matches!(
            self,
            Frame::Ack(_) | Frame::Padding { .. } | Frame::ConnectionClose { .. }
        )
    }

    /// Whether the frame may appear in the given packet class
    /// (RFC 9000 section 12.4). Violations are a PROTOCOL_VIOLATION at
    /// the dispatch site.
    #[must_use]
    pub fn permitted_in(&self, class: PacketClass) -> bool {
        match class {
            PacketClass::Initial | PacketClass::Handshake => matches!(
                self,
                Frame::Padding { .. }
                    | Frame::Ping
                    | Frame::Ack(_)
                    | Frame::Crypto { .. }
                    | Frame::ConnectionClose {
                        frame_type: Some(_),
                        ..
                    }
            ),
            PacketClass::ZeroRtt => !matches!(
                self,
                Frame::Ack(_)
                    | Frame::Crypto { .. }
                    | Frame::NewToken { .. }
                    | Frame::PathResponse { .. }
                    | Frame::HandshakeDone
            ),
            PacketClass::OneRtt => true,
        }
    }
}

fn decode_ack<'a>(reader: &mut Reader<'a>, frame_type: u64) -> Result<AckFrame> {
    let malformed = || CodecError::MalformedFrame { frame_type };
    let largest = reader.read_varint()?;
    let delay = reader.read_varint()?;
    let range_count = reader.read_varint()?;
    let first_range = reader.read_varint()?;

    let mut lo = largest.checked_sub(first_range).ok_or_else(malformed)?;
    let mut ranges = Vec::with_capacity(1 + range_count.min(64) as usize);
    ranges.push((lo, largest));

    for _ in 0..range_count {
        let gap = reader.read_varint()?;
        let len = reader.read_varint()?;
        let hi = lo.checked_sub(gap.checked_add(2).ok_or_else(malformed)?).ok_or_else(malformed)?;
        lo = hi.checked_sub(len).ok_or_else(malformed)?;
        ranges.push((lo, hi));
    }

    let ecn = if frame_type == ty::ACK_ECN {
        Some(EcnCounts {
            ect0: reader.read_varint()?,
            ect1: reader.read_varint()?,
            ce: reader.read_varint()?,
        })
    } else {
        None
    };

    Ok(AckFrame {
        largest,
        delay,
        ranges,
        ecn,
    })
}

fn encode_ack(ack: &AckFrame, writer: &mut Writer<'_>) -> Result<()> {
    let first = ack.ranges.first().copied().unwrap_or((ack.largest, ack.largest));
    writer.write_varint(if ack.ecn.is_some() { ty::ACK_ECN } else { ty::ACK })?;
    writer.write_varint(ack.largest)?;
    writer.write_varint(ack.delay)?;
    writer.write_varint(ack.ranges.len().saturating_sub(1) as u64)?;
    writer.write_varint(first.1 - first.0)?;

    let mut prev_lo = first.0;
    for &(lo, hi) in ack.ranges.iter().skip(1) {
        writer.write_varint(prev_lo - hi - 2)?;
        writer.write_varint(hi - lo)?;
        prev_lo = lo;
    }

    if let Some(ecn) = ack.ecn {
        writer.write_varint(ecn.ect0)?;
        writer.write_varint(ecn.ect1)?;
        writer.write_varint(ecn.ce)?;
    }
    Ok(())
}

fn ack_encoded_len(ack: &AckFrame) -> usize {
    let first = ack.ranges.first().copied().unwrap_or((ack.largest, ack.largest));
    let mut len = 1
        + varint::len(ack.largest)
        + varint::len(ack.delay)
        + varint::len(ack.ranges.len().saturating_sub(1) as u64)
        + varint::len(first.1 - first.0);
    let mut prev_lo = first.0;
    for &(lo, hi) in ack.ranges.iter().skip(1) {
        len += varint::len(prev_lo - hi - 2) + varint::len(hi - lo);
        prev_lo = lo;
    }
    if let Some(ecn) = ack.ecn {
        len += varint::len(ecn.ect0) + varint::len(ecn.ect1) + varint::len(ecn.ce);
    }
    len
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(frame: &Frame<'_>) -> Vec<u8> {
        let mut buf = vec![0u8; 2048];
        let mut writer = Writer::new(&mut buf);
        frame.encode(&mut writer).expect("encode");
        let written = writer.written();
        assert_eq!(written, frame.encoded_len(), "encoded_len mismatch for {frame:?}");
        buf.truncate(written);
        buf
    }

    #[test]
    fn stream_frame_variants_roundtrip() {
        for (offset, fin) in [(0u64, false), (0, true), (77, false), (77, true)] {
            let frame = Frame::Stream {
                stream_id: 4,
                offset,
                data: b"payload",
                fin,
            };
            let bytes = roundtrip(&frame);
            let mut reader = Reader::new(&bytes);
            assert_eq!(Frame::decode(&mut reader).unwrap(), frame);
            assert!(reader.is_empty());
        }
    }

    #[test]
    fn stream_frame_without_length_takes_rest() {
        // Type 0x08: no OFF, no LEN, no FIN; data extends to packet end.
        let bytes = [0x08, 0x04, 0xaa, 0xbb, 0xcc];
        let mut reader = Reader::new(&bytes);
        let frame = Frame::decode(&mut reader).unwrap();
        assert_eq!(
            frame,
            Frame::Stream {
                stream_id: 4,
                offset: 0,
                data: &[0xaa, 0xbb, 0xcc],
                fin: false,
            }
        );
    }

    #[test]
    fn ack_frame_gaps_roundtrip() {
        let frame = Frame::Ack(AckFrame {
            largest: 100,
            delay: 13,
            ranges: vec![(90, 100), (50, 60), (7, 7)],
            ecn: None,
        });
        let bytes = roundtrip(&frame);
        let mut reader = Reader::new(&bytes);
        let decoded = Frame::decode(&mut reader).unwrap();
        assert_eq!(decoded, frame);
        if let Frame::Ack(ack) = decoded {
            assert!(ack.contains(95));
            assert!(ack.contains(7));
            assert!(!ack.contains(70));
        }
    }

    #[test]
    fn ack_frame_with_ecn_roundtrips() {
        let frame = Frame::Ack(AckFrame {
            largest: 9,
            delay: 0,
            ranges: vec![(0, 9)],
            ecn: Some(EcnCounts { ect0: 1, ect1: 2, ce: 3 }),
        });
        let bytes = roundtrip(&frame);
        let mut reader = Reader::new(&bytes);
        assert_eq!(Frame::decode(&mut reader).unwrap(), frame);
    }

    #[test]
    fn malformed_ack_underflow_is_rejected() {
        // largest=1, delay=0, count=0, first_range=5 underflows.
        let bytes = [0x02, 0x01, 0x00, 0x00, 0x05];
        let mut reader = Reader::new(&bytes);
        assert!(matches!(
            Frame::decode(&mut reader),
            Err(CodecError::MalformedFrame { frame_type: 0x02 })
        ));
    }

    #[test]
    fn padding_run_is_collapsed() {
        let bytes = [0x00, 0x00, 0x00, 0x01];
        let mut reader = Reader::new(&bytes);
        assert_eq!(Frame::decode(&mut reader).unwrap(), Frame::Padding { len: 3 });
        assert_eq!(Frame::decode(&mut reader).unwrap(), Frame::Ping);
    }

    #[test]
    fn connection_close_variants_roundtrip() {
        let transport = Frame::ConnectionClose {
            error_code: 0x0a,
            frame_type: Some(0x06),
            reason: b"tls says no",
        };
        let app = Frame::ConnectionClose {
            error_code: 7,
            frame_type: None,
            reason: b"",
        };
        for frame in [transport, app] {
            let bytes = roundtrip(&frame);
            let mut reader = Reader::new(&bytes);
            assert_eq!(Frame::decode(&mut reader).unwrap(), frame);
        }
    }

    #[test]
    fn new_connection_id_validates_fields() {
        // retire_prior_to > sequence.
        let bytes = [0x18, 0x01, 0x02, 0x04, 1, 2, 3, 4];
        let mut reader = Reader::new(&bytes);
        assert!(Frame::decode(&mut reader).is_err());

        let frame = Frame::NewConnectionId {
            sequence: 3,
            retire_prior_to: 1,
            id: &[9, 8, 7, 6],
            reset_token: [0x5a; 16],
        };
        let bytes = roundtrip(&frame);
        let mut reader = Reader::new(&bytes);
        assert_eq!(Frame::decode(&mut reader).unwrap(), frame);
    }

    #[test]
    fn unknown_frame_type_is_reported() {
        let bytes = [0x40, 0x7f];
        let mut reader = Reader::new(&bytes);
        assert!(matches!(
            Frame::decode(&mut reader),
            Err(CodecError::UnknownFrameType { frame_type: 0x7f })
        ));
    }

    #[test]
    fn packet_class_restrictions() {
        let crypto = Frame::Crypto { offset: 0, data: b"ch" };
        let stream = Frame::Stream {
            stream_id: 0,
            offset: 0,
            data: b"x",
            fin: false,
        };
        let done = Frame::HandshakeDone;

        assert!(crypto.permitted_in(PacketClass::Initial));
        assert!(!stream.permitted_in(PacketClass::Initial));
        assert!(!crypto.permitted_in(PacketClass::ZeroRtt));
        assert!(stream.permitted_in(PacketClass::ZeroRtt));
        assert!(!done.permitted_in(PacketClass::Handshake));
        assert!(done.permitted_in(PacketClass::OneRtt));

        let app_close = Frame::ConnectionClose {
            error_code: 0,
            frame_type: None,
            reason: b"",
        };
        assert!(!app_close.permitted_in(PacketClass::Initial));
        assert!(app_close.permitted_in(PacketClass::OneRtt));
    }

    #[test]
    fn ack_eliciting_classification() {
        assert!(Frame::Ping.is_ack_eliciting());
        assert!(!Frame::Padding { len: 4 }.is_ack_eliciting());
        assert!(
            !Frame::Ack(AckFrame {
                largest: 0,
                delay: 0,
                ranges: vec![(0, 0)],
                ecn: None
            })
            .is_ack_eliciting()
        );
        assert!(
            !Frame::ConnectionClose {
                error_code: 0,
                frame_type: Some(0),
                reason: b""
            }
            .is_ack_eliciting()
        );
        assert!(Frame::Stream { stream_id: 0, offset: 0, data: b"", fin: true }.is_ack_eliciting());
    }
}
