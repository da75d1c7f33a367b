//! The per-connection state machine: receive path, send path, timers,
//! and close handling.

use std::collections::VecDeque;
use std::time::{Duration, SystemTime};

use tracing::{debug, trace, warn};

use crate::wire::{Frame, Reader, Writer, packet_number};

use super::anti_amplification::AmplificationLimiter;
use super::cid::{ConnectionId, LOCAL_CID_LEN, LocalCids, RemoteCids};
use super::crypto::{InitialSecrets, TAG_LEN};
use super::error::{TransportError, TransportErrorCode};
use super::flow::FlowController;
use super::packet::{
    self, EncryptionLevel, MIN_FRAME_SECTION, PacketHeader, ParsedPacket, SpaceId,
};
use super::params::TransportParams;
use super::recovery::{RttEstimator, SentFrame, SentPacket};
use super::space::{AckOutcome, PacketNumberSpace};
use super::stream::{ChunkState, Role, StreamError, StreamId, StreamKind};
use super::streams::{ControlSignal, StreamManager};
use super::tls::{TlsBridge, TlsSession};

/// Conservative datagram budget; also the required minimum for
/// datagrams carrying ack-eliciting Initial packets.
pub const MAX_DATAGRAM_SIZE: usize = 1200;

/// Undecryptable packets buffered per connection while keys are pending.
const MAX_BUFFERED_PACKETS: usize = 4;

/// Worst-case frame overhead ahead of CRYPTO/STREAM payload bytes.
const FRAME_OVERHEAD: usize = 24;

/// Connection lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ConnectionState {
    /// Created, nothing sent or received.
    Start,
    /// First Initial sent or received; handshake in progress.
    WaitingHandshake,
    /// TLS reported completion; HANDSHAKE_DONE pending.
    HandshakeConfirmed,
    /// Fully established.
    Connected,
    /// Local close sent; answering peer datagrams with the close frame.
    Closing,
    /// Peer close received; waiting out the drain period silently.
    Draining,
    /// Terminal.
    Closed,
}

/// Events surfaced to the application layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionEvent {
    /// Handshake completed; streams may be opened.
    HandshakeComplete,
    /// The peer opened a stream.
    StreamOpened(StreamId),
    /// Contiguous bytes became readable on a stream.
    StreamReadable(StreamId),
    /// The peer reset a stream.
    StreamReset(StreamId, u64),
    /// The connection reached a terminal state.
    Closed {
        /// Error code from the close, zero for idle timeout.
        error_code: u64,
        /// Whether the peer initiated it.
        remote: bool,
    },
}

#[derive(Debug, Clone)]
struct CloseState {
    error_code: u64,
    frame_type: Option<u64>,
    reason: Vec<u8>,
}

/// Tunables for one connection.
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// Local transport parameters advertised to the peer.
    pub params: TransportParams,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            params: TransportParams {
                max_idle_timeout: 30_000,
                initial_max_data: 1 << 20,
                initial_max_stream_data_bidi_local: 1 << 18,
                initial_max_stream_data_bidi_remote: 1 << 18,
                initial_max_stream_data_uni: 1 << 18,
                initial_max_streams_bidi: 16,
                initial_max_streams_uni: 16,
                active_connection_id_limit: 4,
                ..TransportParams::default()
            },
        }
    }
}

/// One QUIC connection, exclusively owned and driven by its endpoint
/// loop.
pub struct Connection {
    role: Role,
    state: ConnectionState,
    config: ConnectionConfig,
    tls: TlsBridge,
    spaces: [PacketNumberSpace; 3],
    rtt: RttEstimator,
    pto_count: u32,
    flow: FlowController,
    streams: StreamManager,
    local_cids: LocalCids,
    remote_cids: RemoteCids,
    original_dcid: ConnectionId,
    peer_params: Option<TransportParams>,
    handshake_confirmed: bool,
    /// Server-side HANDSHAKE_DONE transmission lifecycle.
    handshake_done: Option<ChunkState>,
    amp: AmplificationLimiter,
    idle_timeout: Option<Duration>,
    idle_deadline: Option<SystemTime>,
    close: Option<CloseState>,
    close_deadline: Option<SystemTime>,
    close_frame_owed: bool,
    server_cid_learned: bool,
    initial_keys_ready: bool,
    undecryptable: VecDeque<(EncryptionLevel, Vec<u8>)>,
    path_responses: VecDeque<[u8; 8]>,
    new_tokens: Vec<Vec<u8>>,
    /// MAX_DATA retransmission owed after loss.
    max_data_owed: bool,
    /// MAX_STREAM_DATA retransmissions owed after loss.
    stream_credit_owed: Vec<StreamId>,
    /// MAX_STREAMS retransmissions owed after loss, per kind.
    max_streams_owed: [bool; 2],
    events: VecDeque<ConnectionEvent>,
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("role", &self.role)
            .field("state", &self.state)
            .finish()
    }
}

impl Connection {
    fn new(
        role: Role,
        config: ConnectionConfig,
        session: Box<dyn TlsSession>,
        initial_remote: ConnectionId,
    ) -> Self {
        let max_ack_delay = Duration::from_millis(config.params.max_ack_delay);
        let idle_timeout = match config.params.max_idle_timeout {
            0 => None,
            millis => Some(Duration::from_millis(millis)),
        };
        let flow = FlowController::new(0, config.params.initial_max_data);
        let streams = StreamManager::new(role, config.params.stream_limits());
        let local_cids = LocalCids::new(ConnectionId::random(LOCAL_CID_LEN));
        Self {
            role,
            state: ConnectionState::Start,
            tls: TlsBridge::new(session),
            spaces: [
                PacketNumberSpace::new(max_ack_delay),
                PacketNumberSpace::new(max_ack_delay),
                PacketNumberSpace::new(max_ack_delay),
            ],
            rtt: RttEstimator::new(),
            pto_count: 0,
            flow,
            streams,
            local_cids,
            remote_cids: RemoteCids::new(initial_remote, config.params.active_connection_id_limit),
            original_dcid: initial_remote,
            peer_params: None,
            handshake_confirmed: false,
            handshake_done: None,
            amp: match role {
                Role::Client => AmplificationLimiter::unlimited(),
                Role::Server => AmplificationLimiter::new(),
            },
            idle_timeout,
            idle_deadline: None,
            close: None,
            close_deadline: None,
            close_frame_owed: false,
            server_cid_learned: false,
            initial_keys_ready: false,
            undecryptable: VecDeque::new(),
            path_responses: VecDeque::new(),
            new_tokens: Vec::new(),
            max_data_owed: false,
            stream_credit_owed: Vec::new(),
            max_streams_owed: [false, false],
            events: VecDeque::new(),
            config,
        }
    }

    /// Client connection. The caller's TLS session already carries the
    /// intended server name.
    pub fn client(
        config: ConnectionConfig,
        session: Box<dyn TlsSession>,
    ) -> Result<Self, TransportError> {
        let original_dcid = ConnectionId::random(8);
        let mut conn = Self::new(Role::Client, config, session, original_dcid);

        let secrets = InitialSecrets::derive(&original_dcid)?;
        let (write, read) = secrets.seals(true)?;
        conn.spaces[SpaceId::Initial.index()].write_seal = Some(write);
        conn.spaces[SpaceId::Initial.index()].read_seal = Some(read);
        conn.initial_keys_ready = true;

        let encoded = conn.config.params.encode();
        conn.tls.set_transport_params(&encoded);
        Ok(conn)
    }

    /// Server connection; Initial keys are derived from the first client
    /// Initial packet.
    #[must_use]
    pub fn server(config: ConnectionConfig, session: Box<dyn TlsSession>) -> Self {
        Self::new(Role::Server, config, session, ConnectionId::empty())
    }

    /// Current lifecycle state.
    #[must_use]
    pub const fn state(&self) -> ConnectionState {
        self.state
    }

    /// Local role.
    #[must_use]
    pub const fn role(&self) -> Role {
        self.role
    }

    /// Whether the handshake has completed.
    #[must_use]
    pub fn is_established(&self) -> bool {
        matches!(
            self.state,
            ConnectionState::HandshakeConfirmed | ConnectionState::Connected
        )
    }

    /// Whether the connection reached its terminal state.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.state == ConnectionState::Closed
    }

    /// Whether a datagram addressed to `cid` belongs to this connection.
    #[must_use]
    pub fn owns_cid(&self, cid: &ConnectionId) -> bool {
        self.local_cids.active_ids().any(|local| local == cid)
    }

    /// Whether a packet number space has been discarded.
    #[must_use]
    pub fn is_space_discarded(&self, space: SpaceId) -> bool {
        self.spaces[space.index()].is_discarded()
    }

    /// Next application event, if any.
    pub fn poll_event(&mut self) -> Option<ConnectionEvent> {
        self.events.pop_front()
    }

    /// Address-validation tokens the server handed out for future
    /// connections (client side).
    #[must_use]
    pub fn tokens(&self) -> &[Vec<u8>] {
        &self.new_tokens
    }

    // ------------------------------------------------------------------
    // Receive path
    // ------------------------------------------------------------------

    /// Process one received datagram in place.
    pub fn handle_datagram(&mut self, now: SystemTime, datagram: &mut [u8]) {
        match self.state {
            ConnectionState::Closed | ConnectionState::Draining => return,
            ConnectionState::Closing => {
                // One close frame owed per received datagram; packets are
                // still scanned so a peer CONNECTION_CLOSE moves us to
                // Draining.
                self.close_frame_owed = true;
            }
            _ => {}
        }
        self.amp.on_receive(datagram.len());

        let mut offset = 0;
        while offset < datagram.len() {
            let parsed = packet::parse_packet(&datagram[offset..], LOCAL_CID_LEN);
            match parsed {
                Ok(ParsedPacket::Protected(header)) => {
                    let end = offset + header.len;
                    self.handle_packet(now, &mut datagram[offset..end], header);
                    offset = end;
                }
                Ok(ParsedPacket::Retry { .. }) => {
                    // Retry token validation is out of scope; the packet
                    // format is recognized and the datagram dropped.
                    debug!("retry packet ignored");
                    return;
                }
                Err(drop) => {
                    trace!(?drop, "datagram remainder dropped");
                    return;
                }
            }
            if self.state == ConnectionState::Closed {
                return;
            }
        }
    }

    fn handle_packet(&mut self, now: SystemTime, packet_buf: &mut [u8], header: PacketHeader) {
        if self.role == Role::Server && !self.initial_keys_ready {
            if header.level != EncryptionLevel::Initial {
                return;
            }
            if self.install_server_initial(&header).is_err() {
                return;
            }
        }
        if self.state == ConnectionState::Start {
            self.state = ConnectionState::WaitingHandshake;
        }

        let space_idx = header.level.space().index();
        if self.spaces[space_idx].is_discarded() {
            trace!(level = ?header.level, "packet for discarded space dropped");
            return;
        }
        if header.level == EncryptionLevel::EarlyData {
            // 0-RTT data is not accepted; keys are never installed.
            return;
        }
        if self.spaces[space_idx].read_seal.is_none() {
            if self.undecryptable.len() < MAX_BUFFERED_PACKETS {
                trace!(level = ?header.level, "buffering packet until keys install");
                self.undecryptable
                    .push_back((header.level, packet_buf.to_vec()));
            }
            return;
        }

        let largest = self.spaces[space_idx].ack.largest_received();
        let seal = self.spaces[space_idx].read_seal.as_ref().expect("checked");
        let Ok((pn, payload_range)) =
            packet::unprotect(seal, packet_buf, header.pn_offset, largest)
        else {
            // Authentication failure is a silent drop, never an error.
            trace!(level = ?header.level, "undecryptable packet dropped");
            return;
        };
        if self.spaces[space_idx].ack.is_duplicate(pn) {
            trace!(pn, "duplicate packet ignored");
            return;
        }

        // The server's handshake SCID becomes our authoritative DCID.
        if self.role == Role::Client && !self.server_cid_learned {
            if let Some(scid) = header.scid {
                self.remote_cids.update_initial(scid);
                self.server_cid_learned = true;
            }
        }
        // A Handshake packet proves the peer owns the address, and on
        // the server side retires the Initial space.
        if header.level == EncryptionLevel::Handshake {
            self.amp.validate();
            if self.role == Role::Server {
                self.spaces[SpaceId::Initial.index()].discard();
            }
        }

        let payload = &packet_buf[payload_range];
        let mut reader = Reader::new(payload);
        let mut ack_eliciting = false;
        while !reader.is_empty() {
            let frame = match Frame::decode(&mut reader) {
                Ok(frame) => frame,
                Err(err) => {
                    warn!(%err, "frame decode failed");
                    self.abort(now, TransportError::Codec(err));
                    return;
                }
            };
            if !frame.permitted_in(header.level.class()) {
                self.abort(
                    now,
                    TransportError::peer(
                        TransportErrorCode::ProtocolViolation,
                        "frame type not permitted in this packet type",
                    ),
                );
                return;
            }
            ack_eliciting |= frame.is_ack_eliciting();
            if let Err(err) = self.on_frame(now, header.level, &header, frame) {
                if err.close_code().is_some() {
                    self.abort(now, err);
                } else {
                    trace!(%err, "frame dropped on local error");
                }
                return;
            }
        }

        // Frame handling may have discarded the space (key install,
        // handshake confirmation); its ack state dies with it.
        if !self.spaces[space_idx].is_discarded() {
            self.spaces[space_idx]
                .ack
                .on_packet_received(pn, ack_eliciting, now);
        }
        if ack_eliciting {
            self.reset_idle(now);
        }
    }

    fn install_server_initial(&mut self, header: &PacketHeader) -> Result<(), TransportError> {
        let secrets = InitialSecrets::derive(&header.dcid)?;
        let (write, read) = secrets.seals(false)?;
        let initial = SpaceId::Initial.index();
        self.spaces[initial].write_seal = Some(write);
        self.spaces[initial].read_seal = Some(read);
        self.initial_keys_ready = true;
        self.original_dcid = header.dcid;
        if let Some(scid) = header.scid {
            self.remote_cids.update_initial(scid);
        }

        let params = TransportParams {
            original_destination_connection_id: Some(header.dcid),
            ..self.config.params.clone()
        };
        self.tls.set_transport_params(&params.encode());
        debug!(dcid = ?header.dcid, "server initial keys installed");
        Ok(())
    }

    #[allow(clippy::too_many_lines)]
    fn on_frame(
        &mut self,
        now: SystemTime,
        level: EncryptionLevel,
        header: &PacketHeader,
        frame: Frame<'_>,
    ) -> Result<(), TransportError> {
        let space_idx = level.space().index();
        match frame {
            Frame::Padding { .. } | Frame::Ping => {}

            Frame::Ack(ack) => {
                if self.state == ConnectionState::Closing {
                    return Ok(());
                }
                let (exponent, max_delay) = self.peer_ack_settings();
                let outcome = self.spaces[space_idx].on_ack_frame(
                    &ack,
                    now,
                    &mut self.rtt,
                    self.handshake_confirmed,
                    max_delay,
                    exponent,
                )?;
                if !outcome.newly_acked.is_empty() {
                    self.pto_count = 0;
                }
                self.apply_ack_outcome(space_idx, outcome);
            }

            Frame::Crypto { offset, data } => {
                if self.state == ConnectionState::Closing {
                    return Ok(());
                }
                self.spaces[space_idx]
                    .crypto_in
                    .insert(offset, data)
                    .map_err(|err| match err {
                        StreamError::FlowControlExceeded => TransportError::peer(
                            TransportErrorCode::CryptoBufferExceeded,
                            "crypto reassembly buffer exceeded",
                        ),
                        other => TransportError::Stream(other),
                    })?;
                loop {
                    let chunk = self.spaces[space_idx].crypto_in.read(4096);
                    if chunk.is_empty() {
                        break;
                    }
                    self.tls.provide(level, &chunk);
                }
                self.drive_tls(now)?;
            }

            Frame::NewToken { token } => {
                if self.role == Role::Server {
                    return Err(TransportError::peer(
                        TransportErrorCode::ProtocolViolation,
                        "NEW_TOKEN from a client",
                    ));
                }
                self.new_tokens.push(token.to_vec());
            }

            Frame::Stream {
                stream_id,
                offset,
                data,
                fin,
            } => {
                if self.state == ConnectionState::Closing {
                    return Ok(());
                }
                let Some(stream) = self.streams.ensure_recv(stream_id)? else {
                    return Ok(()); // Late frame for a collected stream.
                };
                if stream.reset_in.is_some() {
                    return Ok(());
                }
                let id = stream.id();
                let recv = stream.recv.as_mut().expect("direction checked");
                let advanced = recv.insert(offset, data)?;
                if fin {
                    recv.set_final_size(offset + data.len() as u64)?;
                }
                let readable = recv.deliverable() > 0 || (fin && recv.finished());
                self.flow.on_data_received(advanced)?;
                for opened in self.streams.take_opened() {
                    self.events.push_back(ConnectionEvent::StreamOpened(opened));
                }
                if readable {
                    self.events.push_back(ConnectionEvent::StreamReadable(id));
                }
            }

            Frame::MaxData { max } => self.flow.on_max_data(max),

            Frame::MaxStreamData { stream_id, max } => {
                if let Some(stream) = self.streams.ensure_send(stream_id)? {
                    if let Some(send) = stream.send.as_mut() {
                        send.update_max_data(max);
                    }
                }
                for opened in self.streams.take_opened() {
                    self.events.push_back(ConnectionEvent::StreamOpened(opened));
                }
            }

            Frame::MaxStreams { bidi, max } => {
                let kind = if bidi { StreamKind::Bidi } else { StreamKind::Uni };
                self.streams.on_max_streams(kind, max);
            }

            Frame::DataBlocked { limit } => trace!(limit, "peer reports DATA_BLOCKED"),
            Frame::StreamDataBlocked { stream_id, limit } => {
                trace!(stream_id, limit, "peer reports STREAM_DATA_BLOCKED");
            }
            Frame::StreamsBlocked { bidi, limit } => {
                trace!(bidi, limit, "peer reports STREAMS_BLOCKED");
            }

            Frame::ResetStream {
                stream_id,
                error_code,
                final_size,
            } => {
                let Some(stream) = self.streams.ensure_recv(stream_id)? else {
                    return Ok(());
                };
                let id = stream.id();
                let recv = stream.recv.as_mut().expect("direction checked");
                if final_size < recv.highest() {
                    return Err(TransportError::Stream(StreamError::FinalSizeChanged));
                }
                let advanced = final_size.saturating_sub(recv.highest());
                if stream.reset_in.is_none() {
                    stream.reset_in = Some(error_code);
                    self.flow.on_data_received(advanced)?;
                    self.events
                        .push_back(ConnectionEvent::StreamReset(id, error_code));
                }
                for opened in self.streams.take_opened() {
                    self.events.push_back(ConnectionEvent::StreamOpened(opened));
                }
            }

            Frame::StopSending {
                stream_id,
                error_code,
            } => {
                if let Some(stream) = self.streams.ensure_send(stream_id)? {
                    // Honor the request by resetting our sending side.
                    if stream.reset_out.is_none() {
                        let final_size =
                            stream.send.as_ref().map_or(0, |send| send.sent_head());
                        stream.reset_out = Some((
                            ControlSignal {
                                code: error_code,
                                state: ChunkState::Pending,
                            },
                            final_size,
                        ));
                    }
                }
            }

            Frame::NewConnectionId {
                sequence,
                retire_prior_to,
                id,
                reset_token,
            } => {
                let cid = ConnectionId::from_slice(id).ok_or(TransportError::peer(
                    TransportErrorCode::FrameEncodingError,
                    "oversized connection id",
                ))?;
                self.remote_cids
                    .on_new_cid(sequence, retire_prior_to, cid, reset_token)?;
            }

            Frame::RetireConnectionId { sequence } => {
                self.local_cids.retire(sequence, &header.dcid)?;
            }

            Frame::PathChallenge { data } => {
                if self.path_responses.len() < 8 {
                    self.path_responses.push_back(data);
                }
            }

            Frame::PathResponse { .. } => {
                // We never issue challenges (no migration); tolerate.
                trace!("unsolicited PATH_RESPONSE ignored");
            }

            Frame::ConnectionClose { error_code, .. } => {
                self.on_peer_close(now, error_code);
            }

            Frame::HandshakeDone => {
                if self.role == Role::Server {
                    return Err(TransportError::peer(
                        TransportErrorCode::ProtocolViolation,
                        "HANDSHAKE_DONE from a client",
                    ));
                }
                if !self.handshake_confirmed {
                    self.handshake_confirmed = true;
                    self.spaces[SpaceId::Handshake.index()].discard();
                    if self.state == ConnectionState::HandshakeConfirmed {
                        self.state = ConnectionState::Connected;
                    }
                    debug!("handshake confirmed by HANDSHAKE_DONE");
                }
            }
        }
        Ok(())
    }

    fn on_peer_close(&mut self, now: SystemTime, error_code: u64) {
        match self.state {
            ConnectionState::Closed => {}
            ConnectionState::Draining => {
                // Duplicate close extends nothing.
            }
            _ => {
                debug!(error_code, "peer closed the connection");
                self.state = ConnectionState::Draining;
                if self.close_deadline.is_none() {
                    self.close_deadline = Some(now + 3 * self.pto_duration(SpaceId::Application));
                }
                self.events.push_back(ConnectionEvent::Closed {
                    error_code,
                    remote: true,
                });
            }
        }
    }

    fn apply_ack_outcome(&mut self, space_idx: usize, outcome: AckOutcome) {
        for packet in &outcome.newly_acked {
            for frame in &packet.frames {
                self.on_frame_acked(space_idx, frame);
            }
        }
        for packet in &outcome.lost {
            debug!(pn = packet.pn, "retransmitting lost packet state");
            for frame in &packet.frames {
                self.on_frame_lost(space_idx, frame);
            }
        }
        self.streams.collect_drained();
    }

    fn on_frame_acked(&mut self, space_idx: usize, frame: &SentFrame) {
        match frame {
            SentFrame::Ack { largest } => {
                self.spaces[space_idx].ack.on_ack_frame_acked(*largest);
            }
            SentFrame::Crypto { offset, len } => {
                self.spaces[space_idx].crypto_out.on_ack(*offset, *len, false);
            }
            SentFrame::Stream {
                id,
                offset,
                len,
                fin,
            } => {
                if let Some(stream) = self.streams.get_mut(StreamId::from_raw(*id)) {
                    if let Some(send) = stream.send.as_mut() {
                        send.on_ack(*offset, *len, *fin);
                    }
                }
            }
            SentFrame::ResetStream { id } => {
                if let Some(stream) = self.streams.get_mut(StreamId::from_raw(*id)) {
                    if let Some((signal, _)) = stream.reset_out.as_mut() {
                        signal.state = ChunkState::Acked;
                    }
                }
            }
            SentFrame::StopSending { id } => {
                if let Some(stream) = self.streams.get_mut(StreamId::from_raw(*id)) {
                    if let Some(signal) = stream.stop_sending_out.as_mut() {
                        signal.state = ChunkState::Acked;
                    }
                }
            }
            SentFrame::HandshakeDone => {
                self.handshake_done = Some(ChunkState::Acked);
            }
            SentFrame::MaxData
            | SentFrame::MaxStreamData { .. }
            | SentFrame::MaxStreams { .. }
            | SentFrame::NewConnectionId { .. }
            | SentFrame::RetireConnectionId { .. }
            | SentFrame::Ping
            | SentFrame::PathResponse { .. } => {}
        }
    }

    fn on_frame_lost(&mut self, space_idx: usize, frame: &SentFrame) {
        match frame {
            SentFrame::Ack { .. } | SentFrame::Ping => {}
            SentFrame::Crypto { offset, len } => {
                self.spaces[space_idx].crypto_out.on_lost(*offset, *len, false);
            }
            SentFrame::Stream {
                id,
                offset,
                len,
                fin,
            } => {
                if let Some(stream) = self.streams.get_mut(StreamId::from_raw(*id)) {
                    if let Some(send) = stream.send.as_mut() {
                        send.on_lost(*offset, *len, *fin);
                    }
                }
            }
            SentFrame::MaxData => self.max_data_owed = true,
            SentFrame::MaxStreamData { id } => {
                let id = StreamId::from_raw(*id);
                if !self.stream_credit_owed.contains(&id) {
                    self.stream_credit_owed.push(id);
                }
            }
            SentFrame::MaxStreams { bidi } => {
                self.max_streams_owed[usize::from(!bidi)] = true;
            }
            SentFrame::ResetStream { id } => {
                if let Some(stream) = self.streams.get_mut(StreamId::from_raw(*id)) {
                    if let Some((signal, _)) = stream.reset_out.as_mut() {
                        if signal.state == ChunkState::InFlight {
                            signal.state = ChunkState::Lost;
                        }
                    }
                }
            }
            SentFrame::StopSending { id } => {
                if let Some(stream) = self.streams.get_mut(StreamId::from_raw(*id)) {
                    if let Some(signal) = stream.stop_sending_out.as_mut() {
                        if signal.state == ChunkState::InFlight {
                            signal.state = ChunkState::Lost;
                        }
                    }
                }
            }
            SentFrame::HandshakeDone => {
                if self.handshake_done == Some(ChunkState::InFlight) {
                    self.handshake_done = Some(ChunkState::Lost);
                }
            }
            SentFrame::NewConnectionId { sequence } => {
                self.local_cids.announcement_lost(*sequence);
            }
            SentFrame::RetireConnectionId { sequence } => {
                self.remote_cids.retirement_lost(*sequence);
            }
            SentFrame::PathResponse { data } => {
                if self.path_responses.len() < 8 {
                    self.path_responses.push_back(*data);
                }
            }
        }
    }

    // ------------------------------------------------------------------
    // TLS plumbing
    // ------------------------------------------------------------------

    fn drive_tls(&mut self, now: SystemTime) -> Result<(), TransportError> {
        let progress = self.tls.drive()?;

        let mut installed_levels = Vec::new();
        for install in progress.installs {
            if install.level == EncryptionLevel::EarlyData {
                continue; // 0-RTT is out of scope.
            }
            let idx = install.level.space().index();
            if let Some(read) = install.read {
                self.spaces[idx].read_seal = Some(read);
                installed_levels.push(install.level);
            }
            if let Some(write) = install.write {
                self.spaces[idx].write_seal = Some(write);
                if install.level == EncryptionLevel::Handshake && self.role == Role::Client {
                    // Handshake keys retire the client's Initial space;
                    // the server waits until it processes a Handshake
                    // packet, proving the client received its flight.
                    self.spaces[SpaceId::Initial.index()].discard();
                }
            }
        }

        for (level, bytes) in progress.outputs {
            self.spaces[level.space().index()]
                .crypto_out
                .enqueue(&bytes)?;
        }

        if progress.completed {
            self.on_handshake_complete(now)?;
        }

        if !installed_levels.is_empty() {
            self.replay_buffered(now, &installed_levels);
        }
        Ok(())
    }

    fn replay_buffered(&mut self, now: SystemTime, levels: &[EncryptionLevel]) {
        let mut pending = std::mem::take(&mut self.undecryptable);
        while let Some((level, mut bytes)) = pending.pop_front() {
            if levels.contains(&level) {
                if let Ok(ParsedPacket::Protected(header)) =
                    packet::parse_packet(&bytes, LOCAL_CID_LEN)
                {
                    trace!(?level, "replaying buffered packet");
                    self.handle_packet(now, &mut bytes, header);
                }
            } else {
                self.undecryptable.push_back((level, bytes));
            }
        }
    }

    fn on_handshake_complete(&mut self, now: SystemTime) -> Result<(), TransportError> {
        let raw = self.tls.peer_params().ok_or(TransportError::peer(
            TransportErrorCode::TransportParameterError,
            "peer omitted transport parameters",
        ))?;
        let params = TransportParams::decode(&raw, self.role == Role::Server)?;

        if self.role == Role::Client
            && params.original_destination_connection_id != Some(self.original_dcid)
        {
            return Err(TransportError::peer(
                TransportErrorCode::TransportParameterError,
                "original destination connection id mismatch",
            ));
        }

        self.flow.on_max_data(params.initial_max_data);
        self.streams.set_peer_limits(params.stream_limits());
        self.local_cids
            .set_peer_limit(params.active_connection_id_limit);
        self.idle_timeout = negotiated_idle(
            self.config.params.max_idle_timeout,
            params.max_idle_timeout,
        );
        self.peer_params = Some(params);
        self.reset_idle(now);

        debug!(role = ?self.role, "handshake complete");
        self.events.push_back(ConnectionEvent::HandshakeComplete);
        self.state = ConnectionState::HandshakeConfirmed;
        if self.role == Role::Server {
            // The server confirms on completion and owes HANDSHAKE_DONE.
            self.handshake_confirmed = true;
            self.handshake_done = Some(ChunkState::Pending);
            self.spaces[SpaceId::Handshake.index()].discard();
            self.amp.validate();
        }
        Ok(())
    }

    fn peer_ack_settings(&self) -> (u64, Duration) {
        self.peer_params.as_ref().map_or((3, Duration::from_millis(25)), |params| {
            (
                params.ack_delay_exponent,
                Duration::from_millis(params.max_ack_delay),
            )
        })
    }

    // ------------------------------------------------------------------
    // Send path
    // ------------------------------------------------------------------

    /// Build the next outgoing datagram into `out`. `None` means nothing
    /// to send right now. The gather loop has no artificial packet cap;
    /// callers invoke this until it returns `None`.
    pub fn poll_transmit(&mut self, now: SystemTime, out: &mut [u8]) -> Option<usize> {
        match self.state {
            ConnectionState::Closed | ConnectionState::Draining => return None,
            ConnectionState::Closing => {
                if !self.close_frame_owed {
                    return None;
                }
                self.close_frame_owed = false;
                return self.build_close_datagram(out);
            }
            ConnectionState::Start if self.role == Role::Client => {
                // First flight: let TLS produce the ClientHello.
                if let Err(err) = self.drive_tls(now) {
                    self.abort(now, err);
                    return None;
                }
                self.state = ConnectionState::WaitingHandshake;
            }
            _ => {}
        }
        if self.close.is_some() {
            return None;
        }

        let budget = out.len().min(MAX_DATAGRAM_SIZE).min(self.amp.budget());
        if budget < 64 {
            return None;
        }

        let mut total = 0;
        let mut sent_ack_eliciting = false;
        for space_id in SpaceId::ALL {
            let idx = space_id.index();
            if self.spaces[idx].is_discarded() || self.spaces[idx].write_seal.is_none() {
                continue;
            }
            let level = space_id.send_level();
            let dcid = self.remote_cids.current();
            let scid = self
                .local_cids
                .active_ids()
                .next()
                .copied()
                .unwrap_or_else(ConnectionId::empty);
            let pn = self.spaces[idx].peek_pn();
            let largest_acked = self.spaces[idx].largest_acked();
            let (_, pn_len) = packet_number::truncate(pn, largest_acked);
            let overhead = header_overhead(level, &dcid, &scid, pn_len) + TAG_LEN;
            if budget <= total + overhead + MIN_FRAME_SECTION {
                break;
            }

            let frame_budget = budget - total - overhead;
            let Some(mut gathered) = self.gather_frames(now, space_id, frame_budget) else {
                continue;
            };

            // Datagrams with ack-eliciting Initial packets are expanded
            // to the full 1200-byte budget (anti-amplification).
            if level == EncryptionLevel::Initial && gathered.ack_eliciting {
                gathered.payload.resize(frame_budget, 0);
            }
            while gathered.payload.len() < MIN_FRAME_SECTION {
                gathered.payload.push(0);
            }

            let allocated = self.spaces[idx].next_pn();
            debug_assert_eq!(allocated, pn);
            let seal = self.spaces[idx].write_seal.as_ref().expect("checked");
            let written = match packet::assemble(
                &mut out[total..],
                seal,
                level,
                &dcid,
                &scid,
                &[],
                pn,
                largest_acked,
                &gathered.payload,
            ) {
                Ok(written) => written,
                Err(err) => {
                    warn!(%err, "packet assembly failed");
                    return None;
                }
            };

            self.spaces[idx].on_packet_sent(SentPacket {
                pn,
                time_sent: now,
                size: written,
                ack_eliciting: gathered.ack_eliciting,
                in_flight: true,
                largest_acked_at_send: largest_acked,
                frames: gathered.frames,
            });
            sent_ack_eliciting |= gathered.ack_eliciting;
            total += written;
        }

        if total == 0 {
            return None;
        }
        if !self.amp.on_send(total) {
            return None;
        }
        if sent_ack_eliciting {
            self.reset_idle(now);
        }
        trace!(total, "datagram built");
        Some(total)
    }

    #[allow(clippy::too_many_lines)]
    fn gather_frames(
        &mut self,
        now: SystemTime,
        space_id: SpaceId,
        budget: usize,
    ) -> Option<Gathered> {
        let idx = space_id.index();
        let mut payload = vec![0u8; budget];
        let mut writer = Writer::new(&mut payload);
        let mut frames = Vec::new();
        let mut ack_eliciting = false;

        // ACK first: owed when ack-eliciting packets are unacknowledged.
        if self.spaces[idx].ack.has_ranges()
            && (self.spaces[idx].ack.ack_required(now) || self.spaces[idx].ack.ack_pending())
        {
            if let Some(ack) = self
                .spaces[idx]
                .ack
                .frame(now, self.config.params.ack_delay_exponent)
            {
                let largest = ack.largest;
                let frame = Frame::Ack(ack);
                if frame.encoded_len() <= writer.remaining() && frame.encode(&mut writer).is_ok() {
                    frames.push(SentFrame::Ack { largest });
                    self.spaces[idx].ack.on_ack_sent();
                }
            }
        }

        // CRYPTO bytes for this level.
        loop {
            let remaining = writer.remaining();
            if remaining <= FRAME_OVERHEAD {
                break;
            }
            let Some(out) = self.spaces[idx].crypto_out.check_out(remaining - FRAME_OVERHEAD)
            else {
                break;
            };
            let frame = Frame::Crypto {
                offset: out.offset,
                data: &out.data,
            };
            frame.encode(&mut writer).expect("budgeted");
            frames.push(SentFrame::Crypto {
                offset: out.offset,
                len: out.data.len() as u64,
            });
            ack_eliciting = true;
        }

        if space_id == SpaceId::Application {
            self.gather_application_frames(&mut writer, &mut frames, &mut ack_eliciting);
        }

        // PTO probe: ensure something ack-eliciting leaves.
        if self.spaces[idx].probe_pending {
            if !ack_eliciting && writer.remaining() >= 1 {
                Frame::Ping.encode(&mut writer).expect("budgeted");
                frames.push(SentFrame::Ping);
                ack_eliciting = true;
            }
            self.spaces[idx].probe_pending = false;
        }

        let written = writer.written();
        if written == 0 {
            return None;
        }
        payload.truncate(written);
        Some(Gathered {
            payload,
            frames,
            ack_eliciting,
        })
    }

    fn gather_application_frames(
        &mut self,
        writer: &mut Writer<'_>,
        frames: &mut Vec<SentFrame>,
        ack_eliciting: &mut bool,
    ) {
        // HANDSHAKE_DONE before anything else the server owes.
        if matches!(self.handshake_done, Some(ChunkState::Pending | ChunkState::Lost))
            && writer.remaining() >= 1
        {
            Frame::HandshakeDone.encode(writer).expect("budgeted");
            frames.push(SentFrame::HandshakeDone);
            self.handshake_done = Some(ChunkState::InFlight);
            *ack_eliciting = true;
            if self.state == ConnectionState::HandshakeConfirmed {
                self.state = ConnectionState::Connected;
            }
        }

        // Connection-level credit.
        let max_data_update = self.flow.take_window_update();
        if (max_data_update.is_some() || self.max_data_owed) && writer.remaining() >= 9 {
            let frame = Frame::MaxData {
                max: self.flow.recv_limit(),
            };
            if frame.encoded_len() <= writer.remaining() && frame.encode(writer).is_ok() {
                frames.push(SentFrame::MaxData);
                self.max_data_owed = false;
                *ack_eliciting = true;
            }
        }

        // Per-stream credit, fresh updates and loss retransmissions.
        let mut credit_updates = self.streams.window_updates();
        for id in std::mem::take(&mut self.stream_credit_owed) {
            if credit_updates.iter().all(|(existing, _)| *existing != id) {
                if let Some(stream) = self.streams.get_mut(id) {
                    if let Some(recv) = stream.recv.as_ref() {
                        credit_updates.push((id, recv.limit()));
                    }
                }
            }
        }
        for (id, limit) in credit_updates {
            let frame = Frame::MaxStreamData {
                stream_id: id.as_u64(),
                max: limit,
            };
            if frame.encoded_len() > writer.remaining() {
                self.stream_credit_owed.push(id);
                continue;
            }
            frame.encode(writer).expect("budgeted");
            frames.push(SentFrame::MaxStreamData { id: id.as_u64() });
            *ack_eliciting = true;
        }

        // Stream-count credit.
        for kind in [StreamKind::Bidi, StreamKind::Uni] {
            let owed = &mut self.max_streams_owed[usize::from(kind == StreamKind::Uni)];
            let update = self.streams.take_max_streams_update(kind);
            if update.is_some() || *owed {
                let frame = Frame::MaxStreams {
                    bidi: kind == StreamKind::Bidi,
                    max: self.streams.advertised(kind),
                };
                if frame.encoded_len() <= writer.remaining() && frame.encode(writer).is_ok() {
                    frames.push(SentFrame::MaxStreams {
                        bidi: kind == StreamKind::Bidi,
                    });
                    *owed = false;
                    *ack_eliciting = true;
                }
            }
        }

        // Connection ID maintenance.
        while let Some(entry) = self.local_cids.next_announcement() {
            let frame = Frame::NewConnectionId {
                sequence: entry.sequence,
                retire_prior_to: 0,
                id: entry.id.as_slice(),
                reset_token: entry.reset_token.unwrap_or_default(),
            };
            if frame.encoded_len() > writer.remaining() {
                break;
            }
            let sequence = entry.sequence;
            frame.encode(writer).expect("budgeted");
            frames.push(SentFrame::NewConnectionId { sequence });
            self.local_cids.announcement_sent();
            *ack_eliciting = true;
        }
        while let Some(sequence) = self.remote_cids.next_retirement() {
            let frame = Frame::RetireConnectionId { sequence };
            if frame.encoded_len() > writer.remaining() {
                break;
            }
            frame.encode(writer).expect("budgeted");
            frames.push(SentFrame::RetireConnectionId { sequence });
            self.remote_cids.retirement_sent();
            *ack_eliciting = true;
        }

        // Path validation answers.
        while let Some(data) = self.path_responses.pop_front() {
            let frame = Frame::PathResponse { data };
            if frame.encoded_len() > writer.remaining() {
                self.path_responses.push_front(data);
                break;
            }
            frame.encode(writer).expect("budgeted");
            frames.push(SentFrame::PathResponse { data });
            *ack_eliciting = true;
        }

        // Blocked signals.
        if let Some(limit) = self.flow.take_blocked() {
            let frame = Frame::DataBlocked { limit };
            if frame.encoded_len() <= writer.remaining() && frame.encode(writer).is_ok() {
                *ack_eliciting = true;
            }
        }
        for kind in [StreamKind::Bidi, StreamKind::Uni] {
            if let Some(limit) = self.streams.take_blocked(kind) {
                let frame = Frame::StreamsBlocked {
                    bidi: kind == StreamKind::Bidi,
                    limit,
                };
                if frame.encoded_len() <= writer.remaining() && frame.encode(writer).is_ok() {
                    *ack_eliciting = true;
                }
            }
        }

        // RESET_STREAM / STOP_SENDING, retransmitted until acked.
        for id in self.streams.pending_control_ids() {
            let Some(stream) = self.streams.get_mut(id) else {
                continue;
            };
            if let Some((signal, final_size)) = stream.reset_out.as_mut() {
                if matches!(signal.state, ChunkState::Pending | ChunkState::Lost) {
                    let frame = Frame::ResetStream {
                        stream_id: id.as_u64(),
                        error_code: signal.code,
                        final_size: *final_size,
                    };
                    if frame.encoded_len() <= writer.remaining() {
                        frame.encode(writer).expect("budgeted");
                        signal.state = ChunkState::InFlight;
                        frames.push(SentFrame::ResetStream { id: id.as_u64() });
                        *ack_eliciting = true;
                    }
                }
            }
            let Some(stream) = self.streams.get_mut(id) else {
                continue;
            };
            if let Some(signal) = stream.stop_sending_out.as_mut() {
                if matches!(signal.state, ChunkState::Pending | ChunkState::Lost) {
                    let frame = Frame::StopSending {
                        stream_id: id.as_u64(),
                        error_code: signal.code,
                    };
                    if frame.encoded_len() <= writer.remaining() {
                        frame.encode(writer).expect("budgeted");
                        signal.state = ChunkState::InFlight;
                        frames.push(SentFrame::StopSending { id: id.as_u64() });
                        *ack_eliciting = true;
                    }
                }
            }
        }

        // Stream data: lost bytes first across all streams, then new.
        for retransmit_pass in [true, false] {
            for id in self.streams.sendable_ids() {
                self.gather_stream_data(writer, frames, ack_eliciting, id, retransmit_pass);
            }
        }

        // Per-stream blocked signals surface after the send pass stalls.
        for (id, limit) in self.streams.blocked_streams() {
            let frame = Frame::StreamDataBlocked {
                stream_id: id.as_u64(),
                limit,
            };
            if frame.encoded_len() <= writer.remaining() && frame.encode(writer).is_ok() {
                *ack_eliciting = true;
            }
        }
    }

    fn gather_stream_data(
        &mut self,
        writer: &mut Writer<'_>,
        frames: &mut Vec<SentFrame>,
        ack_eliciting: &mut bool,
        id: StreamId,
        retransmit_pass: bool,
    ) {
        loop {
            let remaining = writer.remaining();
            if remaining <= FRAME_OVERHEAD {
                return;
            }
            let conn_available = self.flow.send_available();
            let Some(stream) = self.streams.get_mut(id) else {
                return;
            };
            let Some(send) = stream.send_mut() else {
                return;
            };
            let Some((offset, run)) = send.next_sendable_range() else {
                return;
            };

            let sent_head = send.sent_head();
            let cap = if run == 0 {
                // Bare FIN marker; costs no flow credit.
                if retransmit_pass {
                    return;
                }
                0
            } else if retransmit_pass {
                // Only previously transmitted bytes in this pass.
                if offset >= sent_head {
                    return;
                }
                run.min(sent_head - offset)
            } else {
                // New bytes are limited by connection flow control.
                let max_end = sent_head.saturating_add(conn_available);
                if offset >= max_end && offset >= sent_head {
                    return;
                }
                run.min(max_end.saturating_sub(offset))
            };
            if cap == 0 && run > 0 {
                return;
            }

            let Some(out) = send.check_out(cap.min((remaining - FRAME_OVERHEAD) as u64) as usize)
            else {
                return;
            };
            if out.new_bytes > 0 && self.flow.on_data_sent(out.new_bytes).is_err() {
                warn!("connection flow accounting refused checked-out bytes");
                return;
            }
            let frame = Frame::Stream {
                stream_id: id.as_u64(),
                offset: out.offset,
                data: &out.data,
                fin: out.fin,
            };
            frame.encode(writer).expect("budgeted");
            frames.push(SentFrame::Stream {
                id: id.as_u64(),
                offset: out.offset,
                len: out.data.len() as u64,
                fin: out.fin,
            });
            *ack_eliciting = true;
            if out.data.is_empty() {
                return; // Bare FIN; nothing further on this stream.
            }
        }
    }

    fn build_close_datagram(&mut self, out: &mut [u8]) -> Option<usize> {
        let close = self.close.clone()?;
        let budget = out.len().min(MAX_DATAGRAM_SIZE).min(self.amp.budget());
        let mut total = 0;

        for space_id in SpaceId::ALL {
            let idx = space_id.index();
            if self.spaces[idx].is_discarded() || self.spaces[idx].write_seal.is_none() {
                continue;
            }
            let level = space_id.send_level();
            // Application-code closes are only expressible in 1-RTT;
            // earlier levels carry a transport APPLICATION_ERROR.
            let (error_code, frame_type) = if close.frame_type.is_none()
                && level != EncryptionLevel::Application
            {
                (TransportErrorCode::ApplicationError.to_u64(), Some(0))
            } else {
                (close.error_code, close.frame_type)
            };
            let frame = Frame::ConnectionClose {
                error_code,
                frame_type,
                reason: &close.reason,
            };

            let dcid = self.remote_cids.current();
            let scid = self
                .local_cids
                .active_ids()
                .next()
                .copied()
                .unwrap_or_else(ConnectionId::empty);
            let pn = self.spaces[idx].peek_pn();
            let largest_acked = self.spaces[idx].largest_acked();
            let (_, pn_len) = packet_number::truncate(pn, largest_acked);
            let overhead = header_overhead(level, &dcid, &scid, pn_len) + TAG_LEN;
            let payload_len = frame.encoded_len().max(MIN_FRAME_SECTION);
            if budget <= total + overhead + payload_len {
                continue;
            }

            let mut payload = vec![0u8; payload_len];
            let mut writer = Writer::new(&mut payload);
            if frame.encode(&mut writer).is_err() {
                continue;
            }

            let allocated = self.spaces[idx].next_pn();
            debug_assert_eq!(allocated, pn);
            let seal = self.spaces[idx].write_seal.as_ref().expect("checked");
            if let Ok(written) = packet::assemble(
                &mut out[total..],
                seal,
                level,
                &dcid,
                &scid,
                &[],
                pn,
                largest_acked,
                &payload,
            ) {
                total += written;
            }
        }

        if total == 0 {
            return None;
        }
        if !self.amp.on_send(total) {
            return None;
        }
        Some(total)
    }

    // ------------------------------------------------------------------
    // Timers
    // ------------------------------------------------------------------

    /// The earliest instant at which [`Self::on_timeout`] must run.
    #[must_use]
    pub fn next_timeout(&self) -> Option<SystemTime> {
        match self.state {
            ConnectionState::Closed => None,
            ConnectionState::Closing | ConnectionState::Draining => self.close_deadline,
            _ => {
                let mut earliest: Option<SystemTime> = None;
                let mut consider = |candidate: Option<SystemTime>| {
                    if let Some(time) = candidate {
                        earliest = Some(earliest.map_or(time, |current| current.min(time)));
                    }
                };
                for space in &self.spaces {
                    consider(space.loss_time());
                    consider(space.ack.next_timeout());
                }
                consider(self.pto_deadline());
                consider(self.idle_deadline);
                earliest
            }
        }
    }

    /// Service expired timers: loss detection, PTO, idle, close.
    pub fn on_timeout(&mut self, now: SystemTime) {
        match self.state {
            ConnectionState::Closed => return,
            ConnectionState::Closing | ConnectionState::Draining => {
                if self.close_deadline.is_some_and(|deadline| deadline <= now) {
                    debug!("close timer elapsed");
                    self.state = ConnectionState::Closed;
                }
                return;
            }
            _ => {}
        }

        if self.idle_deadline.is_some_and(|deadline| deadline <= now) {
            // Idle timeout closes silently, no CONNECTION_CLOSE.
            debug!("idle timeout");
            self.state = ConnectionState::Closed;
            self.events.push_back(ConnectionEvent::Closed {
                error_code: 0,
                remote: false,
            });
            return;
        }

        for idx in 0..self.spaces.len() {
            if self.spaces[idx]
                .loss_time()
                .is_some_and(|deadline| deadline <= now)
            {
                let lost = self.spaces[idx].detect_lost(now, &self.rtt);
                for packet in &lost {
                    for frame in &packet.frames {
                        self.on_frame_lost(idx, frame);
                    }
                }
            }
        }

        if self.pto_deadline().is_some_and(|deadline| deadline <= now) {
            self.pto_count += 1;
            if let Some(space_id) = self.earliest_outstanding_space() {
                debug!(?space_id, pto_count = self.pto_count, "probe timeout");
                self.spaces[space_id.index()].probe_pending = true;
            }
        }
    }

    fn pto_deadline(&self) -> Option<SystemTime> {
        let mut any_in_flight = false;
        let mut earliest: Option<SystemTime> = None;
        for space_id in SpaceId::ALL {
            let space = &self.spaces[space_id.index()];
            if space.is_discarded() {
                continue;
            }
            let eligible = space.has_ack_eliciting_in_flight()
                || (!self.handshake_confirmed && space.time_of_last_ack_eliciting().is_some());
            if !eligible {
                continue;
            }
            any_in_flight = true;
            if let Some(base) = space.time_of_last_ack_eliciting() {
                let deadline = base + self.pto_duration(space_id);
                earliest = Some(earliest.map_or(deadline, |current| current.min(deadline)));
            }
        }
        if !any_in_flight {
            // No PTO once everything is acked and the handshake done.
            return None;
        }
        earliest
    }

    fn pto_duration(&self, space_id: SpaceId) -> Duration {
        let mut pto = self.rtt.pto_base();
        if space_id == SpaceId::Application {
            let (_, max_ack_delay) = self.peer_ack_settings();
            pto += max_ack_delay;
        }
        pto * 2u32.saturating_pow(self.pto_count).min(1 << 16)
    }

    fn earliest_outstanding_space(&self) -> Option<SpaceId> {
        let mut best: Option<(SystemTime, SpaceId)> = None;
        for space_id in SpaceId::ALL {
            let space = &self.spaces[space_id.index()];
            if space.is_discarded() || space.write_seal.is_none() {
                continue;
            }
            if !space.has_ack_eliciting_in_flight() && self.handshake_confirmed {
                continue;
            }
            if let Some(time) = space.time_of_last_ack_eliciting() {
                if best.is_none_or(|(current, _)| time < current) {
                    best = Some((time, space_id));
                }
            }
        }
        best.map(|(_, space_id)| space_id)
    }

    fn reset_idle(&mut self, now: SystemTime) {
        if let Some(timeout) = self.idle_timeout {
            self.idle_deadline = Some(now + timeout);
        }
    }

    // ------------------------------------------------------------------
    // Close
    // ------------------------------------------------------------------

    /// Close locally with an application error code.
    pub fn close(&mut self, now: SystemTime, error_code: u64, reason: &[u8]) {
        if matches!(
            self.state,
            ConnectionState::Closing | ConnectionState::Draining | ConnectionState::Closed
        ) {
            return;
        }
        debug!(error_code, "application close");
        self.enter_closing(
            now,
            CloseState {
                error_code,
                frame_type: None,
                reason: reason.to_vec(),
            },
        );
    }

    fn abort(&mut self, now: SystemTime, err: TransportError) {
        let Some(code) = err.close_code() else {
            return;
        };
        if matches!(
            self.state,
            ConnectionState::Closing | ConnectionState::Draining | ConnectionState::Closed
        ) {
            return;
        }
        warn!(%err, "closing on protocol error");
        self.enter_closing(
            now,
            CloseState {
                error_code: code.to_u64(),
                frame_type: Some(0),
                reason: err.reason().as_bytes().to_vec(),
            },
        );
        self.events.push_back(ConnectionEvent::Closed {
            error_code: code.to_u64(),
            remote: false,
        });
    }

    fn enter_closing(&mut self, now: SystemTime, close: CloseState) {
        self.close = Some(close);
        self.state = ConnectionState::Closing;
        self.close_frame_owed = true;
        self.close_deadline = Some(now + 3 * self.pto_duration(SpaceId::Application));
    }

    // ------------------------------------------------------------------
    // Application stream surface
    // ------------------------------------------------------------------

    fn check_open(&self) -> Result<(), TransportError> {
        if matches!(
            self.state,
            ConnectionState::Closing | ConnectionState::Draining | ConnectionState::Closed
        ) {
            return Err(TransportError::ConnectionClosed);
        }
        Ok(())
    }

    /// Open a locally initiated stream.
    pub fn open_stream(&mut self, kind: StreamKind) -> Result<StreamId, TransportError> {
        self.check_open()?;
        self.streams.open(kind)
    }

    /// Queue application bytes on a stream.
    pub fn stream_send(&mut self, id: StreamId, data: &[u8]) -> Result<(), TransportError> {
        self.check_open()?;
        let stream = self
            .streams
            .get_mut(id)
            .ok_or(TransportError::UnknownStream(id.as_u64()))?;
        let send = stream
            .send_mut()
            .ok_or(TransportError::UnknownStream(id.as_u64()))?;
        send.enqueue(data)?;
        Ok(())
    }

    /// Signal end-of-stream on a stream's send side.
    pub fn finish_stream(&mut self, id: StreamId) -> Result<(), TransportError> {
        self.check_open()?;
        let stream = self
            .streams
            .get_mut(id)
            .ok_or(TransportError::UnknownStream(id.as_u64()))?;
        let send = stream
            .send_mut()
            .ok_or(TransportError::UnknownStream(id.as_u64()))?;
        send.mark_end_of_data()?;
        Ok(())
    }

    /// Abruptly reset a stream's send side.
    pub fn reset_stream(&mut self, id: StreamId, error_code: u64) -> Result<(), TransportError> {
        self.check_open()?;
        let stream = self
            .streams
            .get_mut(id)
            .ok_or(TransportError::UnknownStream(id.as_u64()))?;
        if stream.reset_out.is_none() {
            let final_size = stream.send.as_ref().map_or(0, |send| send.sent_head());
            stream.reset_out = Some((
                ControlSignal {
                    code: error_code,
                    state: ChunkState::Pending,
                },
                final_size,
            ));
        }
        Ok(())
    }

    /// Ask the peer to stop sending on a stream.
    pub fn stop_sending(&mut self, id: StreamId, error_code: u64) -> Result<(), TransportError> {
        self.check_open()?;
        let stream = self
            .streams
            .get_mut(id)
            .ok_or(TransportError::UnknownStream(id.as_u64()))?;
        if stream.stop_sending_out.is_none() {
            stream.stop_sending_out = Some(ControlSignal {
                code: error_code,
                state: ChunkState::Pending,
            });
        }
        Ok(())
    }

    /// Read contiguous received bytes from a stream.
    pub fn stream_recv(&mut self, id: StreamId, max_len: usize) -> Result<Vec<u8>, TransportError> {
        let stream = self
            .streams
            .get_mut(id)
            .ok_or(TransportError::UnknownStream(id.as_u64()))?;
        if let Some(code) = stream.reset_in {
            return Err(TransportError::Stream(StreamError::Reset { code }));
        }
        let recv = stream
            .recv
            .as_mut()
            .ok_or(TransportError::UnknownStream(id.as_u64()))?;
        let data = recv.read(max_len);
        if !data.is_empty() {
            self.flow.on_data_delivered(data.len() as u64);
        }
        self.streams.collect_drained();
        Ok(data)
    }
}

/// One gathered frame section for a packet.
struct Gathered {
    payload: Vec<u8>,
    frames: Vec<SentFrame>,
    ack_eliciting: bool,
}

fn header_overhead(
    level: EncryptionLevel,
    dcid: &ConnectionId,
    scid: &ConnectionId,
    pn_len: usize,
) -> usize {
    match level {
        EncryptionLevel::Application => 1 + dcid.len() + pn_len,
        // first + version + dcid len/bytes + scid len/bytes + empty
        // token length + 2-byte length field + pn.
        EncryptionLevel::Initial => 1 + 4 + 1 + dcid.len() + 1 + scid.len() + 1 + 2 + pn_len,
        _ => 1 + 4 + 1 + dcid.len() + 1 + scid.len() + 2 + pn_len,
    }
}

fn negotiated_idle(local_millis: u64, peer_millis: u64) -> Option<Duration> {
    let negotiated = match (local_millis, peer_millis) {
        (0, 0) => return None,
        (0, peer) => peer,
        (local, 0) => local,
        (local, peer) => local.min(peer),
    };
    Some(Duration::from_millis(negotiated))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::tls::{HandshakeStatus, TlsEvent};
    use std::time::UNIX_EPOCH;

    /// A TLS stub that emits one ClientHello-sized flight and then idles.
    struct StubTls {
        hello_sent: bool,
    }

    impl StubTls {
        fn new() -> Box<Self> {
            Box::new(Self { hello_sent: false })
        }
    }

    impl TlsSession for StubTls {
        fn provide_data(&mut self, _level: EncryptionLevel, _data: &[u8]) {}

        fn do_handshake(&mut self) -> HandshakeStatus {
            HandshakeStatus::InProgress
        }

        fn write_level(&self) -> EncryptionLevel {
            EncryptionLevel::Initial
        }

        fn read_level(&self) -> EncryptionLevel {
            EncryptionLevel::Initial
        }

        fn peer_transport_params(&mut self) -> Option<Vec<u8>> {
            None
        }

        fn set_transport_params(&mut self, _params: &[u8]) {}

        fn poll_event(&mut self) -> Option<TlsEvent> {
            if self.hello_sent {
                return None;
            }
            self.hello_sent = true;
            Some(TlsEvent::HandshakeBytes {
                level: EncryptionLevel::Initial,
                bytes: vec![0xc1; 300],
            })
        }
    }

    fn test_config(idle_millis: u64) -> ConnectionConfig {
        let mut config = ConnectionConfig::default();
        config.params.max_idle_timeout = idle_millis;
        config
    }

    #[test]
    fn client_first_flight_is_padded_to_1200() {
        let mut conn = Connection::client(test_config(0), StubTls::new()).unwrap();
        let now = UNIX_EPOCH + Duration::from_secs(100);
        let mut out = [0u8; 1500];
        let len = conn.poll_transmit(now, &mut out).expect("first flight");
        assert!(len >= 1200, "initial datagram must be padded, got {len}");
        // Long header, Initial type.
        assert_eq!(out[0] & 0xf0, 0xc0);
        assert_eq!(conn.state(), ConnectionState::WaitingHandshake);
    }

    #[test]
    fn idle_timeout_closes_without_close_frame() {
        let mut conn = Connection::client(test_config(100), StubTls::new()).unwrap();
        let now = UNIX_EPOCH + Duration::from_secs(100);
        let mut out = [0u8; 1500];
        conn.poll_transmit(now, &mut out).expect("first flight");

        // 101ms of silence.
        let later = now + Duration::from_millis(101);
        assert!(conn.next_timeout().is_some_and(|t| t <= later));
        conn.on_timeout(later);
        assert_eq!(conn.state(), ConnectionState::Closed);
        assert_eq!(
            conn.poll_event(),
            Some(ConnectionEvent::Closed {
                error_code: 0,
                remote: false
            })
        );
        // Closed silently: nothing further to transmit.
        assert!(conn.poll_transmit(later, &mut out).is_none());
    }

    #[test]
    fn local_close_emits_one_frame_per_received_datagram() {
        let mut conn = Connection::client(test_config(0), StubTls::new()).unwrap();
        let now = UNIX_EPOCH + Duration::from_secs(100);
        let mut out = [0u8; 1500];
        conn.poll_transmit(now, &mut out).expect("first flight");

        conn.close(now, 7, b"done");
        assert_eq!(conn.state(), ConnectionState::Closing);
        assert!(conn.poll_transmit(now, &mut out).is_some());
        // No further close frames until another datagram arrives.
        assert!(conn.poll_transmit(now, &mut out).is_none());

        let mut junk = vec![0x40u8; 64];
        conn.handle_datagram(now, &mut junk);
        assert!(conn.poll_transmit(now, &mut out).is_some());
        assert!(conn.poll_transmit(now, &mut out).is_none());

        // Close timer elapses into Closed.
        let deadline = conn.next_timeout().expect("close timer");
        conn.on_timeout(deadline);
        assert_eq!(conn.state(), ConnectionState::Closed);
    }

    #[test]
    fn pto_fires_and_queues_probe() {
        let mut conn = Connection::client(test_config(0), StubTls::new()).unwrap();
        let now = UNIX_EPOCH + Duration::from_secs(100);
        let mut out = [0u8; 1500];
        conn.poll_transmit(now, &mut out).expect("first flight");

        let pto = conn.next_timeout().expect("pto armed");
        assert!(pto > now);
        conn.on_timeout(pto);
        // A probe datagram goes out even with nothing new to say.
        let probe = conn.poll_transmit(pto, &mut out);
        assert!(probe.is_some());
    }

    #[test]
    fn app_api_rejects_use_after_close() {
        let mut conn = Connection::client(test_config(0), StubTls::new()).unwrap();
        let now = UNIX_EPOCH + Duration::from_secs(100);
        conn.close(now, 0, b"");
        assert!(matches!(
            conn.open_stream(StreamKind::Bidi),
            Err(TransportError::ConnectionClosed)
        ));
    }

    #[test]
    fn negotiated_idle_prefers_smaller_nonzero() {
        assert_eq!(negotiated_idle(0, 0), None);
        assert_eq!(negotiated_idle(100, 0), Some(Duration::from_millis(100)));
        assert_eq!(negotiated_idle(0, 50), Some(Duration::from_millis(50)));
        assert_eq!(negotiated_idle(100, 50), Some(Duration::from_millis(50)));
    }
}
