//! Transport parameter encoding, decoding, and validation (RFC 9000
//! section 18).

use crate::wire::{Reader, Writer};

use super::cid::ConnectionId;
use super::error::{TransportError, TransportErrorCode};
use super::streams::StreamLimits;

mod id {
    pub const ORIGINAL_DESTINATION_CONNECTION_ID: u64 = 0x00;
    pub const MAX_IDLE_TIMEOUT: u64 = 0x01;
    pub const STATELESS_RESET_TOKEN: u64 = 0x02;
    pub const MAX_UDP_PAYLOAD_SIZE: u64 = 0x03;
    pub const INITIAL_MAX_DATA: u64 = 0x04;
    pub const INITIAL_MAX_STREAM_DATA_BIDI_LOCAL: u64 = 0x05;
    pub const INITIAL_MAX_STREAM_DATA_BIDI_REMOTE: u64 = 0x06;
    pub const INITIAL_MAX_STREAM_DATA_UNI: u64 = 0x07;
    pub const INITIAL_MAX_STREAMS_BIDI: u64 = 0x08;
    pub const INITIAL_MAX_STREAMS_UNI: u64 = 0x09;
    pub const ACK_DELAY_EXPONENT: u64 = 0x0a;
    pub const MAX_ACK_DELAY: u64 = 0x0b;
    pub const DISABLE_ACTIVE_MIGRATION: u64 = 0x0c;
    pub const PREFERRED_ADDRESS: u64 = 0x0d;
    pub const ACTIVE_CONNECTION_ID_LIMIT: u64 = 0x0e;
}

/// The recognized transport parameters with their RFC defaults.
///
/// Unknown identifiers are skipped on decode; server-only parameters
/// appearing in client parameters fail validation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportParams {
    /// Echo of the client's first destination CID (server only).
    pub original_destination_connection_id: Option<ConnectionId>,
    /// Idle timeout in milliseconds; zero disables.
    pub max_idle_timeout: u64,
    /// Token for stateless resets of this connection (server only).
    pub stateless_reset_token: Option<[u8; 16]>,
    /// Largest UDP payload the endpoint accepts.
    pub max_udp_payload_size: u64,
    /// Connection-level flow credit.
    pub initial_max_data: u64,
    /// Stream credit for bidi streams the param sender opens.
    pub initial_max_stream_data_bidi_local: u64,
    /// Stream credit for bidi streams the param receiver opens.
    pub initial_max_stream_data_bidi_remote: u64,
    /// Stream credit for unidirectional streams.
    pub initial_max_stream_data_uni: u64,
    /// Cumulative bidi stream count the peer may open.
    pub initial_max_streams_bidi: u64,
    /// Cumulative uni stream count the peer may open.
    pub initial_max_streams_uni: u64,
    /// Exponent scaling ACK delay fields.
    pub ack_delay_exponent: u64,
    /// Largest intentional ACK delay in milliseconds.
    pub max_ack_delay: u64,
    /// Peer refuses connection migration.
    pub disable_active_migration: bool,
    /// Opaque preferred-address blob (server only; migration is out of
    /// scope so it is retained, not acted on).
    pub preferred_address: Option<Vec<u8>>,
    /// Connection IDs the sender is willing to store.
    pub active_connection_id_limit: u64,
}

impl Default for TransportParams {
    fn default() -> Self {
        Self {
            original_destination_connection_id: None,
            max_idle_timeout: 0,
            stateless_reset_token: None,
            max_udp_payload_size: 65527,
            initial_max_data: 0,
            initial_max_stream_data_bidi_local: 0,
            initial_max_stream_data_bidi_remote: 0,
            initial_max_stream_data_uni: 0,
            initial_max_streams_bidi: 0,
            initial_max_streams_uni: 0,
            ack_delay_exponent: 3,
            max_ack_delay: 25,
            disable_active_migration: false,
            preferred_address: None,
            active_connection_id_limit: 2,
        }
    }
}

impl TransportParams {
    /// Encode as the varint id / varint length / value sequence carried
    /// inside the TLS handshake.
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = vec![0u8; 512];
        let mut writer = Writer::new(&mut buf);
        let defaults = Self::default();

        if let Some(cid) = &self.original_destination_connection_id {
            write_bytes(&mut writer, id::ORIGINAL_DESTINATION_CONNECTION_ID, cid.as_slice());
        }
        if self.max_idle_timeout != defaults.max_idle_timeout {
            write_varint(&mut writer, id::MAX_IDLE_TIMEOUT, self.max_idle_timeout);
        }
        if let Some(token) = &self.stateless_reset_token {
            write_bytes(&mut writer, id::STATELESS_RESET_TOKEN, token);
        }
        if self.max_udp_payload_size != defaults.max_udp_payload_size {
            write_varint(&mut writer, id::MAX_UDP_PAYLOAD_SIZE, self.max_udp_payload_size);
        }
        write_varint(&mut writer, id::INITIAL_MAX_DATA, self.initial_max_data);
        write_varint(
            &mut writer,
            id::INITIAL_MAX_STREAM_DATA_BIDI_LOCAL,
            self.initial_max_stream_data_bidi_local,
        );
        write_varint(
            &mut writer,
            id::INITIAL_MAX_STREAM_DATA_BIDI_REMOTE,
            self.initial_max_stream_data_bidi_remote,
        );
        write_varint(
            &mut writer,
            id::INITIAL_MAX_STREAM_DATA_UNI,
            self.initial_max_stream_data_uni,
        );
        write_varint(&mut writer, id::INITIAL_MAX_STREAMS_BIDI, self.initial_max_streams_bidi);
        write_varint(&mut writer, id::INITIAL_MAX_STREAMS_UNI, self.initial_max_streams_uni);
        if self.ack_delay_exponent != defaults.ack_delay_exponent {
            write_varint(&mut writer, id::ACK_DELAY_EXPONENT, self.ack_delay_exponent);
        }
        if self.max_ack_delay != defaults.max_ack_delay {
            write_varint(&mut writer, id::MAX_ACK_DELAY, self.max_ack_delay);
        }
        if self.disable_active_migration {
            write_bytes(&mut writer, id::DISABLE_ACTIVE_MIGRATION, &[]);
        }
        if let Some(address) = &self.preferred_address {
            write_bytes(&mut writer, id::PREFERRED_ADDRESS, address);
        }
        if self.active_connection_id_limit != defaults.active_connection_id_limit {
            write_varint(
                &mut writer,
                id::ACTIVE_CONNECTION_ID_LIMIT,
                self.active_connection_id_limit,
            );
        }

        let written = writer.written();
        buf.truncate(written);
        buf
    }

    /// Decode and validate parameters received from the peer.
    ///
    /// `from_client` enables the server-only checks.
    pub fn decode(bytes: &[u8], from_client: bool) -> Result<Self, TransportError> {
        let invalid = |reason| TransportError::Peer {
            code: TransportErrorCode::TransportParameterError,
            frame_type: 0,
            reason,
        };

        let mut params = Self::default();
        let mut reader = Reader::new(bytes);
        while !reader.is_empty() {
            let param_id = reader.read_varint().map_err(|_| invalid("truncated id"))?;
            let value = reader
                .read_varint_span()
                .map_err(|_| invalid("truncated value"))?;

            if from_client
                && matches!(
                    param_id,
                    id::ORIGINAL_DESTINATION_CONNECTION_ID
                        | id::STATELESS_RESET_TOKEN
                        | id::PREFERRED_ADDRESS
                )
            {
                return Err(invalid("server-only parameter from client"));
            }

            match param_id {
                id::ORIGINAL_DESTINATION_CONNECTION_ID => {
                    params.original_destination_connection_id = Some(
                        ConnectionId::from_slice(value).ok_or_else(|| invalid("oversized cid"))?,
                    );
                }
                id::MAX_IDLE_TIMEOUT => params.max_idle_timeout = read_varint_value(value, invalid)?,
                id::STATELESS_RESET_TOKEN => {
                    params.stateless_reset_token =
                        Some(value.try_into().map_err(|_| invalid("bad reset token length"))?);
                }
                id::MAX_UDP_PAYLOAD_SIZE => {
                    let size = read_varint_value(value, invalid)?;
                    if size < 1200 {
                        return Err(invalid("max_udp_payload_size below 1200"));
                    }
                    params.max_udp_payload_size = size;
                }
                id::INITIAL_MAX_DATA => params.initial_max_data = read_varint_value(value, invalid)?,
                id::INITIAL_MAX_STREAM_DATA_BIDI_LOCAL => {
                    params.initial_max_stream_data_bidi_local = read_varint_value(value, invalid)?;
                }
                id::INITIAL_MAX_STREAM_DATA_BIDI_REMOTE => {
                    params.initial_max_stream_data_bidi_remote = read_varint_value(value, invalid)?;
                }
                id::INITIAL_MAX_STREAM_DATA_UNI => {
                    params.initial_max_stream_data_uni = read_varint_value(value, invalid)?;
                }
                id::INITIAL_MAX_STREAMS_BIDI => {
                    params.initial_max_streams_bidi = read_varint_value(value, invalid)?;
                }
                id::INITIAL_MAX_STREAMS_UNI => {
                    params.initial_max_streams_uni = read_varint_value(value, invalid)?;
                }
                id::ACK_DELAY_EXPONENT => {
                    let exponent = read_varint_value(value, invalid)?;
                    if exponent > 20 {
                        return Err(invalid("ack_delay_exponent above 20"));
                    }
                    params.ack_delay_exponent = exponent;
                }
                id::MAX_ACK_DELAY => {
                    let delay = read_varint_value(value, invalid)?;
                    if delay >= 1 << 14 {
                        return Err(invalid("max_ack_delay out of range"));
                    }
                    params.max_ack_delay = delay;
                }
                id::DISABLE_ACTIVE_MIGRATION => {
                    if !value.is_empty() {
                        return Err(invalid("disable_active_migration carries a value"));
                    }
                    params.disable_active_migration = true;
                }
                id::PREFERRED_ADDRESS => params.preferred_address = Some(value.to_vec()),
                id::ACTIVE_CONNECTION_ID_LIMIT => {
                    let limit = read_varint_value(value, invalid)?;
                    if limit < 2 {
                        return Err(invalid("active_connection_id_limit below 2"));
                    }
                    params.active_connection_id_limit = limit;
                }
                _ => {} // Unknown parameters are ignored.
            }
        }
        Ok(params)
    }

    /// The stream limits these parameters grant to the peer.
    #[must_use]
    pub fn stream_limits(&self) -> StreamLimits {
        StreamLimits {
            max_stream_data_bidi_local: self.initial_max_stream_data_bidi_local,
            max_stream_data_bidi_remote: self.initial_max_stream_data_bidi_remote,
            max_stream_data_uni: self.initial_max_stream_data_uni,
            max_streams_bidi: self.initial_max_streams_bidi,
            max_streams_uni: self.initial_max_streams_uni,
        }
    }
}

fn write_varint(writer: &mut Writer<'_>, param_id: u64, value: u64) {
    writer.write_varint(param_id).expect("encode buffer sized");
    writer
        .write_varint(crate::wire::varint::len(value) as u64)
        .expect("encode buffer sized");
    writer.write_varint(value).expect("encode buffer sized");
}

fn write_bytes(writer: &mut Writer<'_>, param_id: u64, value: &[u8]) {
    writer.write_varint(param_id).expect("encode buffer sized");
    writer.write_varint_span(value).expect("encode buffer sized");
}

fn read_varint_value(
    value: &[u8],
    invalid: impl Fn(&'static str) -> TransportError,
) -> Result<u64, TransportError> {
    let mut reader = Reader::new(value);
    let decoded = reader.read_varint().map_err(|_| invalid("truncated varint value"))?;
    if !reader.is_empty() {
        return Err(invalid("trailing bytes in varint value"));
    }
    Ok(decoded)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrip_preserves_every_field() {
        let params = TransportParams {
            original_destination_connection_id: ConnectionId::from_slice(&[1, 2, 3, 4]),
            max_idle_timeout: 30_000,
            stateless_reset_token: Some([0xab; 16]),
            max_udp_payload_size: 1472,
            initial_max_data: 1 << 20,
            initial_max_stream_data_bidi_local: 65536,
            initial_max_stream_data_bidi_remote: 32768,
            initial_max_stream_data_uni: 16384,
            initial_max_streams_bidi: 16,
            initial_max_streams_uni: 4,
            ack_delay_exponent: 4,
            max_ack_delay: 40,
            disable_active_migration: true,
            preferred_address: None,
            active_connection_id_limit: 4,
        };
        let encoded = params.encode();
        let decoded = TransportParams::decode(&encoded, false).unwrap();
        assert_eq!(decoded, params);
    }

    #[test]
    fn defaults_fill_missing_parameters() {
        let decoded = TransportParams::decode(&[], false).unwrap();
        assert_eq!(decoded, TransportParams::default());
        assert_eq!(decoded.ack_delay_exponent, 3);
        assert_eq!(decoded.max_ack_delay, 25);
        assert_eq!(decoded.active_connection_id_limit, 2);
    }

    #[test]
    fn server_only_parameter_from_client_is_rejected() {
        let params = TransportParams {
            stateless_reset_token: Some([0; 16]),
            ..TransportParams::default()
        };
        let encoded = params.encode();
        assert!(TransportParams::decode(&encoded, false).is_ok());
        let err = TransportParams::decode(&encoded, true).unwrap_err();
        assert_eq!(
            err.close_code(),
            Some(TransportErrorCode::TransportParameterError)
        );
    }

    #[test]
    fn range_checks_reject_bad_values() {
        // max_udp_payload_size below 1200.
        let mut buf = vec![0u8; 16];
        let mut writer = Writer::new(&mut buf);
        write_varint(&mut writer, id::MAX_UDP_PAYLOAD_SIZE, 1199);
        let written = writer.written();
        assert!(TransportParams::decode(&buf[..written], false).is_err());

        // ack_delay_exponent above 20.
        let mut buf = vec![0u8; 16];
        let mut writer = Writer::new(&mut buf);
        write_varint(&mut writer, id::ACK_DELAY_EXPONENT, 21);
        let written = writer.written();
        assert!(TransportParams::decode(&buf[..written], false).is_err());

        // active_connection_id_limit below 2.
        let mut buf = vec![0u8; 16];
        let mut writer = Writer::new(&mut buf);
        write_varint(&mut writer, id::ACTIVE_CONNECTION_ID_LIMIT, 1);
        let written = writer.written();
        assert!(TransportParams::decode(&buf[..written], false).is_err());
    }

    #[test]
    fn unknown_parameters_are_skipped() {
        let mut buf = vec![0u8; 32];
        let mut writer = Writer::new(&mut buf);
        write_bytes(&mut writer, 0x1f42, &[1, 2, 3]);
        write_varint(&mut writer, id::INITIAL_MAX_DATA, 777);
        let written = writer.written();
        let decoded = TransportParams::decode(&buf[..written], true).unwrap();
        assert_eq!(decoded.initial_max_data, 777);
    }
}
