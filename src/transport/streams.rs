//! Stream lifecycle: allocation, remote auto-creation, limits, and GC.

use std::collections::BTreeMap;

use tracing::{debug, trace};

use super::error::{TransportError, TransportErrorCode};
use super::stream::{ChunkState, RecvBuffer, Role, SendBuffer, StreamId, StreamKind};

/// Per-direction stream limits from transport parameters.
#[derive(Debug, Clone, Copy, Default)]
pub struct StreamLimits {
    /// Data limit for bidi streams opened by the param sender.
    pub max_stream_data_bidi_local: u64,
    /// Data limit for bidi streams opened by the param receiver.
    pub max_stream_data_bidi_remote: u64,
    /// Data limit for unidirectional streams.
    pub max_stream_data_uni: u64,
    /// Cumulative count of bidi streams the peer may open.
    pub max_streams_bidi: u64,
    /// Cumulative count of uni streams the peer may open.
    pub max_streams_uni: u64,
}

/// Outstanding RESET_STREAM or STOP_SENDING transmission state.
#[derive(Debug, Clone, Copy)]
pub(crate) struct ControlSignal {
    /// Application error code carried by the frame.
    pub code: u64,
    /// Transmission lifecycle of the frame itself.
    pub state: ChunkState,
}

/// One application stream: optional send and receive halves plus the
/// terminal reset/stop flags.
#[derive(Debug)]
pub struct Stream {
    id: StreamId,
    pub(crate) send: Option<SendBuffer>,
    pub(crate) recv: Option<RecvBuffer>,
    /// Final size announced with our RESET_STREAM, once sent.
    pub(crate) reset_out: Option<(ControlSignal, u64)>,
    /// Error code from the peer's RESET_STREAM.
    pub(crate) reset_in: Option<u64>,
    pub(crate) stop_sending_out: Option<ControlSignal>,
}

impl Stream {
    fn new(id: StreamId, send_max: Option<u64>, recv_max: Option<u64>) -> Self {
        Self {
            id,
            send: send_max.map(SendBuffer::new),
            recv: recv_max.map(RecvBuffer::new),
            reset_out: None,
            reset_in: None,
            stop_sending_out: None,
        }
    }

    /// Stream identifier.
    #[must_use]
    pub const fn id(&self) -> StreamId {
        self.id
    }

    /// Send half, unless the stream was reset or is receive-only.
    pub(crate) fn send_mut(&mut self) -> Option<&mut SendBuffer> {
        if self.reset_out.is_some() {
            return None;
        }
        self.send.as_mut()
    }

    /// Whether both directions have completed and the stream can be
    /// dropped.
    pub(crate) fn is_drained(&self) -> bool {
        let send_done = match (&self.send, &self.reset_out) {
            (None, _) => true,
            (Some(_), Some((signal, _))) => signal.state == ChunkState::Acked,
            (Some(buffer), None) => buffer.finished(),
        };
        let recv_done = match &self.recv {
            None => true,
            Some(_) if self.reset_in.is_some() => true,
            Some(buffer) => buffer.finished(),
        };
        send_done && recv_done
    }
}

/// Manager for every stream on one connection.
#[derive(Debug)]
pub struct StreamManager {
    role: Role,
    streams: BTreeMap<StreamId, Stream>,
    local_limits: StreamLimits,
    peer_limits: StreamLimits,
    /// Next index to open locally, per kind `[bidi, uni]`.
    next_local: [u64; 2],
    /// Count of remote streams opened, per kind.
    remote_opened: [u64; 2],
    /// Cumulative MAX_STREAMS we advertised, per kind.
    advertised: [u64; 2],
    /// Re-advertisement window, per kind.
    window: [u64; 2],
    /// STREAMS_BLOCKED owed to the peer, per kind.
    blocked: [Option<u64>; 2],
    /// Remote streams created since the application last looked.
    opened_pending: Vec<StreamId>,
}

const fn kind_index(kind: StreamKind) -> usize {
    match kind {
        StreamKind::Bidi => 0,
        StreamKind::Uni => 1,
    }
}

impl StreamManager {
    /// Manager advertising the given local limits.
    #[must_use]
    pub fn new(role: Role, local_limits: StreamLimits) -> Self {
        Self {
            role,
            streams: BTreeMap::new(),
            local_limits,
            peer_limits: StreamLimits::default(),
            next_local: [0, 0],
            remote_opened: [0, 0],
            advertised: [local_limits.max_streams_bidi, local_limits.max_streams_uni],
            window: [local_limits.max_streams_bidi, local_limits.max_streams_uni],
            blocked: [None, None],
            opened_pending: Vec::new(),
        }
    }

    /// Install the peer's transport parameters, raising credit on any
    /// streams that already exist.
    pub fn set_peer_limits(&mut self, limits: StreamLimits) {
        self.peer_limits = limits;
        let ids: Vec<StreamId> = self.streams.keys().copied().collect();
        for id in ids {
            let limit = self.send_limit_for(id);
            if let Some(stream) = self.streams.get_mut(&id) {
                if let Some(send) = stream.send.as_mut() {
                    send.update_max_data(limit);
                }
            }
        }
    }

    fn send_limit_for(&self, id: StreamId) -> u64 {
        match (id.kind(), id.initiator() == self.role) {
            (StreamKind::Bidi, true) => self.peer_limits.max_stream_data_bidi_remote,
            (StreamKind::Bidi, false) => self.peer_limits.max_stream_data_bidi_local,
            (StreamKind::Uni, _) => self.peer_limits.max_stream_data_uni,
        }
    }

    fn recv_limit_for(&self, id: StreamId) -> u64 {
        match (id.kind(), id.initiator() == self.role) {
            (StreamKind::Bidi, true) => self.local_limits.max_stream_data_bidi_local,
            (StreamKind::Bidi, false) => self.local_limits.max_stream_data_bidi_remote,
            (StreamKind::Uni, _) => self.local_limits.max_stream_data_uni,
        }
    }

    /// Open a locally initiated stream, or report that creation is
    /// blocked on peer MAX_STREAMS credit.
    pub fn open(&mut self, kind: StreamKind) -> Result<StreamId, TransportError> {
        let slot = kind_index(kind);
        let limit = match kind {
            StreamKind::Bidi => self.peer_limits.max_streams_bidi,
            StreamKind::Uni => self.peer_limits.max_streams_uni,
        };
        let index = self.next_local[slot];
        if index >= limit {
            self.blocked[slot] = Some(limit);
            return Err(TransportError::StreamsBlocked);
        }
        self.next_local[slot] = index + 1;

        let id = StreamId::new(self.role, kind, index);
        let send_max = Some(self.send_limit_for(id));
        let recv_max = (kind == StreamKind::Bidi).then(|| self.recv_limit_for(id));
        debug!(id = id.as_u64(), ?kind, "opened local stream");
        self.streams.insert(id, Stream::new(id, send_max, recv_max));
        Ok(id)
    }

    /// Look up a stream referenced by received data or a reset,
    /// auto-creating remote streams up to the local limit. `None` means
    /// the stream was already drained and collected; late frames for it
    /// are ignored.
    pub fn ensure_recv(&mut self, raw_id: u64) -> Result<Option<&mut Stream>, TransportError> {
        let id = StreamId::from_raw(raw_id);
        if !id.receivable_by(self.role) {
            return Err(TransportError::peer(
                TransportErrorCode::StreamStateError,
                "data received on a send-only stream",
            ));
        }
        self.ensure_known(id)
    }

    /// Look up a stream for a credit/stop frame referencing our sending
    /// side.
    pub fn ensure_send(&mut self, raw_id: u64) -> Result<Option<&mut Stream>, TransportError> {
        let id = StreamId::from_raw(raw_id);
        if !id.sendable_by(self.role) {
            return Err(TransportError::peer(
                TransportErrorCode::StreamStateError,
                "credit received for a receive-only stream",
            ));
        }
        self.ensure_known(id)
    }

    fn ensure_known(&mut self, id: StreamId) -> Result<Option<&mut Stream>, TransportError> {
        if id.initiator() == self.role {
            if id.index() >= self.next_local[kind_index(id.kind())] {
                return Err(TransportError::peer(
                    TransportErrorCode::StreamStateError,
                    "peer referenced a stream we never opened",
                ));
            }
            // A drained-and-collected stream; late frames are ignored.
            return Ok(self.streams.get_mut(&id));
        }

        let slot = kind_index(id.kind());
        let limit = match id.kind() {
            StreamKind::Bidi => self.local_limits.max_streams_bidi,
            StreamKind::Uni => self.local_limits.max_streams_uni,
        };
        if id.index() >= limit {
            return Err(TransportError::peer(
                TransportErrorCode::StreamLimitError,
                "peer exceeded the stream limit",
            ));
        }
        // Referencing stream N implicitly opens every lower-numbered
        // stream of the same kind.
        while self.remote_opened[slot] <= id.index() {
            let index = self.remote_opened[slot];
            self.remote_opened[slot] = index + 1;
            let new_id = StreamId::new(self.role.peer(), id.kind(), index);
            let send_max = (id.kind() == StreamKind::Bidi).then(|| self.send_limit_for(new_id));
            let recv_max = Some(self.recv_limit_for(new_id));
            trace!(id = new_id.as_u64(), "remote stream auto-created");
            self.opened_pending.push(new_id);
            self.streams
                .insert(new_id, Stream::new(new_id, send_max, recv_max));
        }
        Ok(self.streams.get_mut(&id))
    }

    /// Direct lookup without creation.
    pub fn get_mut(&mut self, id: StreamId) -> Option<&mut Stream> {
        self.streams.get_mut(&id)
    }

    /// Apply MAX_STREAMS credit from the peer; never shrinks.
    pub fn on_max_streams(&mut self, kind: StreamKind, count: u64) {
        let limit = match kind {
            StreamKind::Bidi => &mut self.peer_limits.max_streams_bidi,
            StreamKind::Uni => &mut self.peer_limits.max_streams_uni,
        };
        if count > *limit {
            *limit = count;
            self.blocked[kind_index(kind)] = None;
        }
    }

    /// A fresh MAX_STREAMS count once the peer consumed half the window.
    pub fn take_max_streams_update(&mut self, kind: StreamKind) -> Option<u64> {
        let slot = kind_index(kind);
        if self.window[slot] == 0 {
            return None;
        }
        if self.advertised[slot] - self.remote_opened[slot] < self.window[slot] / 2 {
            self.advertised[slot] = self.remote_opened[slot] + self.window[slot];
            return Some(self.advertised[slot]);
        }
        None
    }

    /// STREAMS_BLOCKED limit owed to the peer, at most once per stall.
    pub fn take_blocked(&mut self, kind: StreamKind) -> Option<u64> {
        self.blocked[kind_index(kind)].take()
    }

    /// Remote streams opened since the last call.
    pub fn take_opened(&mut self) -> Vec<StreamId> {
        std::mem::take(&mut self.opened_pending)
    }

    /// Current cumulative MAX_STREAMS we advertised for a kind.
    #[must_use]
    pub const fn advertised(&self, kind: StreamKind) -> u64 {
        self.advertised[kind_index(kind)]
    }

    /// Streams stalled on stream flow control since the last call.
    pub fn blocked_streams(&mut self) -> Vec<(StreamId, u64)> {
        let mut blocked = Vec::new();
        for (&id, stream) in &mut self.streams {
            if stream.reset_out.is_some() {
                continue;
            }
            if let Some(send) = stream.send.as_mut() {
                if let Some(limit) = send.take_blocked() {
                    blocked.push((id, limit));
                }
            }
        }
        blocked
    }

    /// Streams whose receive windows want a MAX_STREAM_DATA update.
    pub fn window_updates(&mut self) -> Vec<(StreamId, u64)> {
        let mut updates = Vec::new();
        for (&id, stream) in &mut self.streams {
            if stream.reset_in.is_some() {
                continue;
            }
            if let Some(recv) = stream.recv.as_mut() {
                if let Some(limit) = recv.take_window_update() {
                    updates.push((id, limit));
                }
            }
        }
        updates
    }

    /// Identifiers of streams with sendable data, the earliest first.
    #[must_use]
    pub fn sendable_ids(&self) -> Vec<StreamId> {
        self.streams
            .iter()
            .filter(|(_, stream)| {
                stream.reset_out.is_none()
                    && stream
                        .send
                        .as_ref()
                        .is_some_and(|send| send.next_sendable_range().is_some())
            })
            .map(|(&id, _)| id)
            .collect()
    }

    /// Streams with an outstanding RESET_STREAM or STOP_SENDING frame to
    /// (re)transmit.
    #[must_use]
    pub fn pending_control_ids(&self) -> Vec<StreamId> {
        self.streams
            .iter()
            .filter(|(_, stream)| {
                stream
                    .reset_out
                    .as_ref()
                    .is_some_and(|(signal, _)| {
                        matches!(signal.state, ChunkState::Pending | ChunkState::Lost)
                    })
                    || stream.stop_sending_out.is_some_and(|signal| {
                        matches!(signal.state, ChunkState::Pending | ChunkState::Lost)
                    })
            })
            .map(|(&id, _)| id)
            .collect()
    }

    /// Drop fully drained streams, returning how many were collected.
    pub fn collect_drained(&mut self) -> usize {
        let drained: Vec<StreamId> = self
            .streams
            .iter()
            .filter(|(_, stream)| stream.is_drained())
            .map(|(&id, _)| id)
            .collect();
        for id in &drained {
            trace!(id = id.as_u64(), "stream drained and collected");
            self.streams.remove(id);
        }
        drained.len()
    }

    /// Number of live streams.
    #[must_use]
    pub fn len(&self) -> usize {
        self.streams.len()
    }

    /// Whether no streams are live.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.streams.is_empty()
    }
}
