//! The connection engine: packet protection, recovery, streams, and
//! the endpoint loop.

mod ack;
mod anti_amplification;
mod buffer;
mod cid;
mod connection;
mod crypto;
mod endpoint;
mod error;
mod flow;
mod packet;
mod params;
mod recovery;
mod socket;
mod space;
mod stream;
mod streams;
mod tls;

pub use ack::{AckRangeSet, AckTracker, MAX_ACK_RANGES};
pub use anti_amplification::{AMPLIFICATION_FACTOR, AmplificationLimiter};
pub use buffer::{Buffer, BufferPool};
pub use cid::{CidEntry, ConnectionId, LOCAL_CID_LEN, LocalCids, MAX_CID_LEN, RemoteCids};
pub use connection::{
    Connection, ConnectionConfig, ConnectionEvent, ConnectionState, MAX_DATAGRAM_SIZE,
};
pub use crypto::{
    CipherSuite, CryptoError, InitialSecrets, SAMPLE_LEN, Seal, TAG_LEN, hkdf_expand_label,
};
pub use endpoint::{
    Command, ConnectionHandle, Endpoint, EndpointConfig, EndpointEvent, EndpointHandle,
};
pub use error::{TransportError, TransportErrorCode};
pub use flow::{FlowController, FlowError};
pub use packet::{EncryptionLevel, QUIC_VERSION, SpaceId};
pub use params::TransportParams;
pub use recovery::{
    GRANULARITY, INITIAL_RTT, PACKET_REORDERING_THRESHOLD, RttEstimator, SentFrame, SentPacket,
};
pub use socket::{SocketBinding, SocketError};
pub use space::{AckOutcome, CRYPTO_BUFFER_CAP, PacketNumberSpace};
pub use stream::{
    ChunkState, OutgoingData, RecvBuffer, Role, SendBuffer, StreamError, StreamId, StreamKind,
};
pub use streams::{Stream, StreamLimits, StreamManager};
pub use tls::{
    HandshakeStatus, KeyInstall, TlsBridge, TlsConfig, TlsEvent, TlsProgress, TlsSession,
};
