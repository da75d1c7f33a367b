//! Packet headers and the protect/unprotect transform (RFC 9000
//! section 17, RFC 9001 section 5.4).

use std::ops::Range;

use tracing::trace;

use crate::wire::{self, PacketClass, Reader, packet_number};

use super::cid::{ConnectionId, MAX_CID_LEN};
use super::crypto::{CryptoError, SAMPLE_LEN, Seal, TAG_LEN};

/// The only supported wire version.
pub const QUIC_VERSION: u32 = 0x0000_0001;

/// Encryption levels as a closed sum type; per-space arrays avoid any
/// dynamic dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EncryptionLevel {
    /// Initial keys derived from the client's first DCID.
    Initial,
    /// 0-RTT keys (no application data is accepted at this level).
    EarlyData,
    /// Handshake keys.
    Handshake,
    /// 1-RTT application keys.
    Application,
}

impl EncryptionLevel {
    /// Packet number space the level feeds.
    #[must_use]
    pub const fn space(self) -> SpaceId {
        match self {
            Self::Initial => SpaceId::Initial,
            Self::Handshake => SpaceId::Handshake,
            Self::EarlyData | Self::Application => SpaceId::Application,
        }
    }

    /// Frame-restriction class for the level.
    #[must_use]
    pub const fn class(self) -> PacketClass {
        match self {
            Self::Initial => PacketClass::Initial,
            Self::EarlyData => PacketClass::ZeroRtt,
            Self::Handshake => PacketClass::Handshake,
            Self::Application => PacketClass::OneRtt,
        }
    }
}

/// The three packet number spaces.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpaceId {
    /// Initial packets.
    Initial,
    /// Handshake packets.
    Handshake,
    /// 0-RTT and 1-RTT packets.
    Application,
}

impl SpaceId {
    /// All spaces in ascending encryption order.
    pub const ALL: [Self; 3] = [Self::Initial, Self::Handshake, Self::Application];

    /// Index into per-space arrays.
    #[must_use]
    pub const fn index(self) -> usize {
        match self {
            Self::Initial => 0,
            Self::Handshake => 1,
            Self::Application => 2,
        }
    }

    /// The encryption level packets of this space are sent at.
    #[must_use]
    pub const fn send_level(self) -> EncryptionLevel {
        match self {
            Self::Initial => EncryptionLevel::Initial,
            Self::Handshake => EncryptionLevel::Handshake,
            Self::Application => EncryptionLevel::Application,
        }
    }
}

/// Outcome of parsing one packet out of a datagram.
#[derive(Debug)]
pub enum ParsedPacket {
    /// A protected packet awaiting header unprotection.
    Protected(PacketHeader),
    /// A Retry packet; the token format is recognized but retry
    /// validation is out of scope, so callers log and drop it.
    Retry {
        /// Server-chosen connection ID.
        scid: ConnectionId,
        /// Opaque retry token.
        token: Vec<u8>,
    },
}

/// Invariant fields of a parsed packet header, with the packet number
/// still protected.
#[derive(Debug)]
pub struct PacketHeader {
    /// Level implied by the header form and long-header type bits.
    pub level: EncryptionLevel,
    /// Destination connection ID.
    pub dcid: ConnectionId,
    /// Source connection ID (long headers only).
    pub scid: Option<ConnectionId>,
    /// Initial token bytes (empty elsewhere).
    pub token: Vec<u8>,
    /// Offset of the packet number field within the packet.
    pub pn_offset: usize,
    /// Total packet length within the datagram, tag included.
    pub len: usize,
}

/// Reasons a packet is dropped during parsing; none of them are
/// connection errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketDrop {
    /// Header was truncated or structurally invalid.
    Malformed,
    /// Long header carried a version we do not speak.
    UnknownVersion(u32),
    /// The fixed bit was cleared.
    FixedBitZero,
}

/// Parse the next packet from `datagram` (which starts at a packet
/// boundary). Short headers consume the remainder of the datagram.
pub fn parse_packet(datagram: &[u8], local_cid_len: usize) -> Result<ParsedPacket, PacketDrop> {
    let mut reader = Reader::new(datagram);
    let first = reader.read_u8().map_err(|_| PacketDrop::Malformed)?;

    if first & 0x80 == 0 {
        // Short header.
        if first & 0x40 == 0 {
            return Err(PacketDrop::FixedBitZero);
        }
        let dcid = reader
            .read_span(local_cid_len)
            .ok()
            .and_then(ConnectionId::from_slice)
            .ok_or(PacketDrop::Malformed)?;
        return Ok(ParsedPacket::Protected(PacketHeader {
            level: EncryptionLevel::Application,
            dcid,
            scid: None,
            token: Vec::new(),
            pn_offset: 1 + local_cid_len,
            len: datagram.len(),
        }));
    }

    let version = reader.read_u32().map_err(|_| PacketDrop::Malformed)?;
    if version != QUIC_VERSION {
        // Unknown versions (version negotiation included) are rejected.
        return Err(PacketDrop::UnknownVersion(version));
    }
    if first & 0x40 == 0 {
        return Err(PacketDrop::FixedBitZero);
    }

    let dcid = read_cid(&mut reader)?;
    let scid = read_cid(&mut reader)?;

    let packet_type = (first >> 4) & 0x03;
    let level = match packet_type {
        0x00 => EncryptionLevel::Initial,
        0x01 => EncryptionLevel::EarlyData,
        0x02 => EncryptionLevel::Handshake,
        _ => {
            let token = reader.rest().to_vec();
            return Ok(ParsedPacket::Retry { scid, token });
        }
    };

    let token = if level == EncryptionLevel::Initial {
        reader
            .read_varint_span()
            .map_err(|_| PacketDrop::Malformed)?
            .to_vec()
    } else {
        Vec::new()
    };

    let length = reader.read_varint().map_err(|_| PacketDrop::Malformed)? as usize;
    let pn_offset = reader.position();
    let len = pn_offset.checked_add(length).ok_or(PacketDrop::Malformed)?;
    if len > datagram.len() {
        return Err(PacketDrop::Malformed);
    }

    Ok(ParsedPacket::Protected(PacketHeader {
        level,
        dcid,
        scid: Some(scid),
        token,
        pn_offset,
        len,
    }))
}

fn read_cid(reader: &mut Reader<'_>) -> Result<ConnectionId, PacketDrop> {
    let len = usize::from(reader.read_u8().map_err(|_| PacketDrop::Malformed)?);
    if len > MAX_CID_LEN {
        return Err(PacketDrop::Malformed);
    }
    reader
        .read_span(len)
        .ok()
        .and_then(ConnectionId::from_slice)
        .ok_or(PacketDrop::Malformed)
}

/// Remove header protection and decrypt `packet` in place, returning the
/// full packet number and the plaintext payload range.
///
/// Failure means the caller silently drops the packet; the buffer
/// contents are unspecified afterwards.
pub fn unprotect(
    seal: &Seal,
    packet: &mut [u8],
    pn_offset: usize,
    largest_received: Option<u64>,
) -> Result<(u64, Range<usize>), CryptoError> {
    if packet.len() < pn_offset + 4 + SAMPLE_LEN {
        return Err(CryptoError::OpenFailed);
    }
    let mut sample = [0u8; SAMPLE_LEN];
    sample.copy_from_slice(&packet[pn_offset + 4..pn_offset + 4 + SAMPLE_LEN]);
    let mask = seal.header_mask(&sample)?;

    let is_long = packet[0] & 0x80 != 0;
    packet[0] ^= mask[0] & if is_long { 0x0f } else { 0x1f };
    let pn_len = usize::from(packet[0] & 0x03) + 1;

    let mut truncated: u64 = 0;
    for idx in 0..pn_len {
        packet[pn_offset + idx] ^= mask[1 + idx];
        truncated = (truncated << 8) | u64::from(packet[pn_offset + idx]);
    }
    let expected = largest_received.map_or(0, |largest| largest + 1);
    let pn = packet_number::decode(expected, truncated, pn_len);

    let header_len = pn_offset + pn_len;
    let (header, body) = packet.split_at_mut(header_len);
    let plain_len = seal.open_in_place(pn, header, body)?;
    trace!(pn, plain_len, "packet unprotected");
    Ok((pn, header_len..header_len + plain_len))
}

/// Assemble and protect one packet into `out`, returning the bytes
/// written. `payload` is the plaintext frame section; the caller has
/// already bounded it so that header + payload + tag fit.
#[allow(clippy::too_many_arguments)]
pub fn assemble(
    out: &mut [u8],
    seal: &Seal,
    level: EncryptionLevel,
    dcid: &ConnectionId,
    scid: &ConnectionId,
    token: &[u8],
    pn: u64,
    largest_acked: Option<u64>,
    payload: &[u8],
) -> Result<usize, CryptoError> {
    let (truncated, pn_len) = packet_number::truncate(pn, largest_acked);

    let mut cursor = 0usize;
    let pn_offset;
    match level {
        EncryptionLevel::Application => {
            out[cursor] = 0x40 | (pn_len as u8 - 1);
            cursor += 1;
            out[cursor..cursor + dcid.len()].copy_from_slice(dcid.as_slice());
            cursor += dcid.len();
            pn_offset = cursor;
        }
        _ => {
            let type_bits: u8 = match level {
                EncryptionLevel::Initial => 0x00,
                EncryptionLevel::EarlyData => 0x01,
                _ => 0x02,
            };
            out[cursor] = 0xc0 | (type_bits << 4) | (pn_len as u8 - 1);
            cursor += 1;
            out[cursor..cursor + 4].copy_from_slice(&QUIC_VERSION.to_be_bytes());
            cursor += 4;
            out[cursor] = dcid.len() as u8;
            cursor += 1;
            out[cursor..cursor + dcid.len()].copy_from_slice(dcid.as_slice());
            cursor += dcid.len();
            out[cursor] = scid.len() as u8;
            cursor += 1;
            out[cursor..cursor + scid.len()].copy_from_slice(scid.as_slice());
            cursor += scid.len();
            if level == EncryptionLevel::Initial {
                // Token length as a minimal varint, then the token.
                let consumed = wire::varint::encode_into(token.len() as u64, &mut out[cursor..])
                    .map_err(|_| CryptoError::SealFailed)?;
                cursor += consumed;
                out[cursor..cursor + token.len()].copy_from_slice(token);
                cursor += token.len();
            }
            // Length field: two-byte varint covering pn + payload + tag.
            let length = (pn_len + payload.len() + TAG_LEN) as u16;
            out[cursor..cursor + 2].copy_from_slice(&(length | 0x4000).to_be_bytes());
            cursor += 2;
            pn_offset = cursor;
        }
    }

    for idx in (0..pn_len).rev() {
        out[cursor] = (truncated >> (8 * idx)) as u8;
        cursor += 1;
    }
    let header_len = cursor;

    out[cursor..cursor + payload.len()].copy_from_slice(payload);
    let (header, rest) = out.split_at_mut(header_len);
    let (body, tag_region) = rest[..payload.len() + TAG_LEN].split_at_mut(payload.len());
    seal.seal_in_place(pn, header, body, tag_region)?;
    let total = header_len + payload.len() + TAG_LEN;

    // Header protection over the finished ciphertext.
    let mut sample = [0u8; SAMPLE_LEN];
    sample.copy_from_slice(&out[pn_offset + 4..pn_offset + 4 + SAMPLE_LEN]);
    let mask = seal.header_mask(&sample)?;
    let is_long = out[0] & 0x80 != 0;
    out[0] ^= mask[0] & if is_long { 0x0f } else { 0x1f };
    for idx in 0..pn_len {
        out[pn_offset + idx] ^= mask[1 + idx];
    }

    trace!(?level, pn, total, "packet assembled");
    Ok(total)
}

/// Smallest frame section that keeps the header-protection sample
/// inside the ciphertext for every packet number length.
pub const MIN_FRAME_SECTION: usize = 4;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::crypto::{CipherSuite, InitialSecrets};

    fn seal_pair() -> (Seal, Seal) {
        let dcid = ConnectionId::from_slice(&[0x83, 0x94, 0xc8, 0xf0]).unwrap();
        let secrets = InitialSecrets::derive(&dcid).unwrap();
        secrets.seals(true).unwrap()
    }

    #[test]
    fn initial_packet_roundtrip() {
        let (client_write, _) = seal_pair();
        let dcid = ConnectionId::from_slice(&[0x83, 0x94, 0xc8, 0xf0]).unwrap();
        let secrets = InitialSecrets::derive(&dcid).unwrap();
        let (_, server_read) = secrets.seals(false).unwrap();

        let scid = ConnectionId::from_slice(&[9, 9]).unwrap();
        let payload = [0x01u8, 0x00, 0x00, 0x00, 0x00, 0x00];
        let mut out = vec![0u8; 1500];
        let written = assemble(
            &mut out,
            &client_write,
            EncryptionLevel::Initial,
            &dcid,
            &scid,
            b"tok",
            0,
            None,
            &payload,
        )
        .unwrap();

        let parsed = match parse_packet(&out[..written], 8).unwrap() {
            ParsedPacket::Protected(header) => header,
            ParsedPacket::Retry { .. } => panic!("not a retry"),
        };
        assert_eq!(parsed.level, EncryptionLevel::Initial);
        assert_eq!(parsed.dcid, dcid);
        assert_eq!(parsed.scid, Some(scid));
        assert_eq!(parsed.token, b"tok");
        assert_eq!(parsed.len, written);

        let (pn, range) =
            unprotect(&server_read, &mut out[..written], parsed.pn_offset, None).unwrap();
        assert_eq!(pn, 0);
        assert_eq!(&out[range], &payload);
    }

    #[test]
    fn short_packet_roundtrip_with_pn_reconstruction() {
        let (write, read) = {
            let secret = [0x7a; 32];
            (
                Seal::from_secret(CipherSuite::Aes128Gcm, &secret).unwrap(),
                Seal::from_secret(CipherSuite::Aes128Gcm, &secret).unwrap(),
            )
        };
        let dcid = ConnectionId::from_slice(&[1, 2, 3, 4, 5, 6, 7, 8]).unwrap();
        let payload = [0x01u8, 0x00, 0x00, 0x00];

        // Simulate a later packet: largest acked 0x1233, pn 0x1234.
        let mut out = vec![0u8; 256];
        let written = assemble(
            &mut out,
            &write,
            EncryptionLevel::Application,
            &dcid,
            &ConnectionId::empty(),
            &[],
            0x1234,
            Some(0x1233),
            &payload,
        )
        .unwrap();

        let parsed = match parse_packet(&out[..written], 8).unwrap() {
            ParsedPacket::Protected(header) => header,
            ParsedPacket::Retry { .. } => panic!("not a retry"),
        };
        assert_eq!(parsed.level, EncryptionLevel::Application);
        assert_eq!(parsed.pn_offset, 9);

        let (pn, range) =
            unprotect(&read, &mut out[..written], parsed.pn_offset, Some(0x1233)).unwrap();
        assert_eq!(pn, 0x1234);
        assert_eq!(&out[range], &payload);
    }

    #[test]
    fn unknown_version_is_rejected() {
        let mut datagram = vec![0xc0, 0xde, 0xad, 0xbe, 0xef, 0x00, 0x00];
        datagram.resize(64, 0);
        assert_eq!(
            parse_packet(&datagram, 8).unwrap_err(),
            PacketDrop::UnknownVersion(0xdead_beef)
        );
    }

    #[test]
    fn cleared_fixed_bit_is_dropped() {
        // Short header with fixed bit zero.
        let datagram = [0x00u8; 32];
        assert_eq!(parse_packet(&datagram, 8).unwrap_err(), PacketDrop::FixedBitZero);
    }

    #[test]
    fn tampered_packet_fails_to_open() {
        let (write, read) = {
            let secret = [0x55; 32];
            (
                Seal::from_secret(CipherSuite::Aes128Gcm, &secret).unwrap(),
                Seal::from_secret(CipherSuite::Aes128Gcm, &secret).unwrap(),
            )
        };
        let dcid = ConnectionId::from_slice(&[4; 8]).unwrap();
        let payload = [0x01u8, 0x00, 0x00, 0x00, 0x00];
        let mut out = vec![0u8; 256];
        let written = assemble(
            &mut out,
            &write,
            EncryptionLevel::Application,
            &dcid,
            &ConnectionId::empty(),
            &[],
            5,
            None,
            &payload,
        )
        .unwrap();

        out[written - 1] ^= 0x40;
        let parsed = match parse_packet(&out[..written], 8).unwrap() {
            ParsedPacket::Protected(header) => header,
            ParsedPacket::Retry { .. } => unreachable!(),
        };
        assert!(unprotect(&read, &mut out[..written], parsed.pn_offset, None).is_err());
    }

    #[test]
    fn truncated_sample_region_is_rejected() {
        let (_, read) = seal_pair();
        let mut tiny = [0x40u8, 1, 2, 3, 4, 5, 6, 7, 8, 0xff];
        assert_eq!(
            unprotect(&read, &mut tiny, 9, None).unwrap_err(),
            CryptoError::OpenFailed
        );
    }

    #[test]
    fn retry_packets_are_surfaced_but_opaque() {
        let mut datagram = vec![0xf0u8];
        datagram.extend_from_slice(&QUIC_VERSION.to_be_bytes());
        datagram.push(0); // dcid len
        datagram.push(2); // scid len
        datagram.extend_from_slice(&[7, 7]);
        datagram.extend_from_slice(b"retry-token");
        match parse_packet(&datagram, 8).unwrap() {
            ParsedPacket::Retry { scid, token } => {
                assert_eq!(scid.as_slice(), &[7, 7]);
                assert_eq!(token, b"retry-token");
            }
            ParsedPacket::Protected(_) => panic!("expected retry"),
        }
    }
}
