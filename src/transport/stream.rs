//! Stream identifiers and the send/receive buffers behind them.

use std::collections::BTreeMap;

use bytes::Bytes;
use thiserror::Error;
use tracing::trace;

use super::error::TransportErrorCode;

/// Role of an endpoint relative to connection establishment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// The endpoint that initiated the connection.
    Client,
    /// The endpoint that accepted the connection.
    Server,
}

impl Role {
    const fn bit(self) -> u64 {
        match self {
            Self::Client => 0,
            Self::Server => 1,
        }
    }

    /// The opposite role.
    #[must_use]
    pub const fn peer(self) -> Self {
        match self {
            Self::Client => Self::Server,
            Self::Server => Self::Client,
        }
    }
}

/// Stream directionality.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StreamKind {
    /// Both endpoints may send.
    Bidi,
    /// Only the initiator sends.
    Uni,
}

impl StreamKind {
    const fn bit(self) -> u64 {
        match self {
            Self::Bidi => 0,
            Self::Uni => 1,
        }
    }
}

/// Stream identifier encoding initiator and direction in its low two
/// bits (RFC 9000 section 2.1).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StreamId(u64);

impl StreamId {
    /// Compose an identifier from initiator role, kind, and index.
    #[must_use]
    pub const fn new(initiator: Role, kind: StreamKind, index: u64) -> Self {
        Self((index << 2) | (kind.bit() << 1) | initiator.bit())
    }

    /// Wrap a raw wire value.
    #[must_use]
    pub const fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    /// Raw wire value.
    #[must_use]
    pub const fn as_u64(self) -> u64 {
        self.0
    }

    /// Sequence index within its (initiator, kind) class.
    #[must_use]
    pub const fn index(self) -> u64 {
        self.0 >> 2
    }

    /// Role that initiated the stream.
    #[must_use]
    pub const fn initiator(self) -> Role {
        if self.0 & 0x1 == 0 { Role::Client } else { Role::Server }
    }

    /// Bidirectional or unidirectional.
    #[must_use]
    pub const fn kind(self) -> StreamKind {
        if self.0 & 0x2 == 0 { StreamKind::Bidi } else { StreamKind::Uni }
    }

    /// Whether `local` may send data on this stream.
    #[must_use]
    pub fn sendable_by(self, local: Role) -> bool {
        match self.kind() {
            StreamKind::Bidi => true,
            StreamKind::Uni => self.initiator() == local,
        }
    }

    /// Whether `local` may receive data on this stream.
    #[must_use]
    pub fn receivable_by(self, local: Role) -> bool {
        match self.kind() {
            StreamKind::Bidi => true,
            StreamKind::Uni => self.initiator() != local,
        }
    }
}

/// Error conditions for stream buffer operations.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum StreamError {
    /// Local write after the end of data was declared.
    #[error("stream already finished locally")]
    AlreadyFinished,
    /// Peer data extends beyond the declared final size.
    #[error("data beyond the declared final size")]
    BeyondFinalSize,
    /// Peer declared two different final sizes.
    #[error("final size conflicts with an earlier value")]
    FinalSizeChanged,
    /// Peer exceeded the advertised stream data limit.
    #[error("stream flow-control limit exceeded")]
    FlowControlExceeded,
    /// Overlapping retransmission carried different bytes.
    #[error("conflicting data at offset {offset}")]
    DataMismatch {
        /// Offset of the first mismatched byte region.
        offset: u64,
    },
    /// Receive side was reset by the peer.
    #[error("stream reset by peer with code {code}")]
    Reset {
        /// Application error code from RESET_STREAM.
        code: u64,
    },
}

impl StreamError {
    /// Wire code when the error indicates peer misbehavior; `None` for
    /// purely local conditions.
    #[must_use]
    pub const fn close_code(&self) -> Option<TransportErrorCode> {
        match self {
            Self::BeyondFinalSize | Self::FinalSizeChanged => {
                Some(TransportErrorCode::FinalSizeError)
            }
            Self::FlowControlExceeded => Some(TransportErrorCode::FlowControlError),
            Self::DataMismatch { .. } => Some(TransportErrorCode::ProtocolViolation),
            Self::AlreadyFinished | Self::Reset { .. } => None,
        }
    }
}

/// Lifecycle of one retransmittable unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkState {
    /// Never sent, or re-queued after loss recovery consumed it.
    Pending,
    /// On the wire awaiting acknowledgement.
    InFlight,
    /// Acknowledged by the peer.
    Acked,
    /// Declared lost; preferred for retransmission.
    Lost,
}

#[derive(Debug)]
struct SendChunk {
    data: Bytes,
    state: ChunkState,
}

/// Data checked out of a send buffer for one STREAM or CRYPTO frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutgoingData {
    /// Byte offset within the stream.
    pub offset: u64,
    /// Payload bytes.
    pub data: Bytes,
    /// Whether the frame carries FIN.
    pub fin: bool,
    /// Bytes beyond the previous high-water mark; only these count
    /// against connection flow control (retransmits do not).
    pub new_bytes: u64,
}

/// Outbound buffer: ordered chunks keyed by starting offset, each in
/// one of the four [`ChunkState`]s, bounded by the peer's flow credit.
#[derive(Debug)]
pub struct SendBuffer {
    chunks: BTreeMap<u64, SendChunk>,
    written: u64,
    acked_head: u64,
    /// Highest offset ever checked out.
    sent_head: u64,
    max_data: u64,
    final_size: Option<u64>,
    fin_state: Option<ChunkState>,
    blocked_signaled: bool,
}

impl SendBuffer {
    /// Buffer with the peer's initial flow credit.
    #[must_use]
    pub fn new(max_data: u64) -> Self {
        Self {
            chunks: BTreeMap::new(),
            written: 0,
            acked_head: 0,
            sent_head: 0,
            max_data,
            final_size: None,
            fin_state: None,
            blocked_signaled: false,
        }
    }

    /// Append application bytes at the write head.
    pub fn enqueue(&mut self, data: &[u8]) -> Result<u64, StreamError> {
        if self.final_size.is_some() {
            return Err(StreamError::AlreadyFinished);
        }
        let offset = self.written;
        if !data.is_empty() {
            self.chunks.insert(
                offset,
                SendChunk {
                    data: Bytes::copy_from_slice(data),
                    state: ChunkState::Pending,
                },
            );
            self.written += data.len() as u64;
        }
        Ok(offset)
    }

    /// Raise the peer flow credit; never lowers it.
    pub fn update_max_data(&mut self, limit: u64) {
        if limit > self.max_data {
            self.max_data = limit;
            self.blocked_signaled = false;
        }
    }

    /// Declare the current write head as the final size.
    pub fn mark_end_of_data(&mut self) -> Result<(), StreamError> {
        if self.final_size.is_some() {
            return Err(StreamError::AlreadyFinished);
        }
        self.final_size = Some(self.written);
        self.fin_state = Some(ChunkState::Pending);
        Ok(())
    }

    /// Earliest contiguous run of Pending or Lost bytes within the flow
    /// credit. A `(offset, 0)` result means only the FIN marker remains.
    #[must_use]
    pub fn next_sendable_range(&self) -> Option<(u64, u64)> {
        let mut start = None;
        let mut end = 0;
        for (&offset, chunk) in &self.chunks {
            let sendable = matches!(chunk.state, ChunkState::Pending | ChunkState::Lost);
            match start {
                None if sendable => {
                    if offset >= self.max_data {
                        break;
                    }
                    start = Some(offset);
                    end = offset + chunk.data.len() as u64;
                }
                Some(_) if sendable && offset == end => {
                    end = offset + chunk.data.len() as u64;
                }
                Some(_) => break,
                None => {}
            }
        }
        if let Some(start) = start {
            return Some((start, end.min(self.max_data) - start));
        }
        let any_waiting = self
            .chunks
            .values()
            .any(|chunk| matches!(chunk.state, ChunkState::Pending | ChunkState::Lost));
        if !any_waiting && matches!(self.fin_state, Some(ChunkState::Pending | ChunkState::Lost)) {
            // Everything is out; only the FIN marker needs (re)sending.
            return Some((self.final_size.unwrap_or(self.written), 0));
        }
        None
    }

    /// Take up to `max_len` bytes from the next sendable range, marking
    /// them in flight.
    pub fn check_out(&mut self, max_len: usize) -> Option<OutgoingData> {
        let (offset, run_len) = self.next_sendable_range()?;
        let len = run_len.min(max_len as u64);
        if len == 0 && run_len > 0 {
            return None;
        }

        let mut collected = Vec::new();
        let mut cursor = offset;
        let target = offset + len;
        while cursor < target {
            let chunk = self.chunks.get_mut(&cursor).expect("runs are chunk aligned");
            let chunk_len = chunk.data.len() as u64;
            if cursor + chunk_len <= target {
                chunk.state = ChunkState::InFlight;
                collected.push(chunk.data.clone());
                cursor += chunk_len;
            } else {
                // Split the chunk at the budget boundary.
                let take = (target - cursor) as usize;
                let state = chunk.state;
                let head = chunk.data.split_to(take);
                let tail = SendChunk {
                    data: std::mem::replace(&mut chunk.data, head.clone()),
                    state,
                };
                chunk.state = ChunkState::InFlight;
                collected.push(head);
                self.chunks.insert(target, tail);
                cursor = target;
            }
        }

        let data = match collected.len() {
            0 => Bytes::new(),
            1 => collected.pop().expect("length checked"),
            _ => {
                let mut joined = Vec::with_capacity(len as usize);
                for part in &collected {
                    joined.extend_from_slice(part);
                }
                Bytes::from(joined)
            }
        };

        let fin = self.final_size == Some(target)
            && matches!(self.fin_state, Some(ChunkState::Pending | ChunkState::Lost));
        if fin {
            self.fin_state = Some(ChunkState::InFlight);
        }
        let new_bytes = target.saturating_sub(self.sent_head);
        self.sent_head = self.sent_head.max(target);
        trace!(offset, len, fin, "checked out send bytes");
        Some(OutgoingData {
            offset,
            data,
            fin,
            new_bytes,
        })
    }

    /// Acknowledge a previously sent range. Each byte transitions to
    /// Acked at most once; the contiguous acked head is dropped.
    pub fn on_ack(&mut self, offset: u64, len: u64, fin: bool) {
        let end = offset + len;
        let keys: Vec<u64> = self
            .chunks
            .range(offset..end)
            .map(|(&key, _)| key)
            .collect();
        for key in keys {
            let chunk = self.chunks.get_mut(&key).expect("key just listed");
            if key + chunk.data.len() as u64 <= end && chunk.state != ChunkState::Acked {
                chunk.state = ChunkState::Acked;
            }
        }
        if fin && self.final_size == Some(end) {
            self.fin_state = Some(ChunkState::Acked);
        }

        while let Some((&key, chunk)) = self.chunks.first_key_value() {
            if key == self.acked_head && chunk.state == ChunkState::Acked {
                self.acked_head += chunk.data.len() as u64;
                self.chunks.remove(&key);
            } else {
                break;
            }
        }
    }

    /// Transition an in-flight range to Lost so retransmission picks it
    /// up first.
    pub fn on_lost(&mut self, offset: u64, len: u64, fin: bool) {
        let end = offset + len;
        for (&key, chunk) in self.chunks.range_mut(offset..end) {
            if key + chunk.data.len() as u64 <= end && chunk.state == ChunkState::InFlight {
                chunk.state = ChunkState::Lost;
            }
        }
        if fin
            && self.final_size == Some(end)
            && self.fin_state == Some(ChunkState::InFlight)
        {
            self.fin_state = Some(ChunkState::Lost);
        }
    }

    /// All bytes through the final size acknowledged, FIN included.
    #[must_use]
    pub fn finished(&self) -> bool {
        self.final_size.is_some()
            && self.chunks.is_empty()
            && self.final_size == Some(self.acked_head)
            && self.fin_state == Some(ChunkState::Acked)
    }

    /// Whether any bytes or the FIN marker still await acknowledgement.
    #[must_use]
    pub fn has_unacked_data(&self) -> bool {
        !self.chunks.is_empty()
            || matches!(
                self.fin_state,
                Some(ChunkState::Pending | ChunkState::InFlight | ChunkState::Lost)
            )
    }

    /// Offset at which flow control currently stalls new data, when it
    /// does.
    #[must_use]
    pub fn blocked_at(&self) -> Option<u64> {
        let blocked = self
            .chunks
            .iter()
            .any(|(&offset, chunk)| chunk.state == ChunkState::Pending && offset >= self.max_data);
        blocked.then_some(self.max_data)
    }

    /// The STREAM_DATA_BLOCKED limit to report, at most once per stall.
    pub fn take_blocked(&mut self) -> Option<u64> {
        if self.blocked_signaled {
            return None;
        }
        let limit = self.blocked_at()?;
        self.blocked_signaled = true;
        Some(limit)
    }

    /// Highest offset ever handed out for transmission.
    #[must_use]
    pub const fn sent_head(&self) -> u64 {
        self.sent_head
    }

    /// Total bytes accepted from the application.
    #[must_use]
    pub const fn written(&self) -> u64 {
        self.written
    }

    /// Declared final size, if any.
    #[must_use]
    pub const fn final_size(&self) -> Option<u64> {
        self.final_size
    }

    /// Bytes currently in the given state (acked includes the dropped
    /// head).
    #[must_use]
    pub fn bytes_in_state(&self, state: ChunkState) -> u64 {
        let mut total = self
            .chunks
            .values()
            .filter(|chunk| chunk.state == state)
            .map(|chunk| chunk.data.len() as u64)
            .sum();
        if state == ChunkState::Acked {
            total += self.acked_head;
        }
        total
    }
}

/// Inbound reassembly buffer with gap tracking and at-most-once final
/// size.
#[derive(Debug)]
pub struct RecvBuffer {
    chunks: BTreeMap<u64, Vec<u8>>,
    delivered: u64,
    highest: u64,
    final_size: Option<u64>,
    max_data: u64,
    window: u64,
}

impl RecvBuffer {
    /// Buffer advertising `max_data` of credit, re-armed in windows of
    /// the same size.
    #[must_use]
    pub fn new(max_data: u64) -> Self {
        Self {
            chunks: BTreeMap::new(),
            delivered: 0,
            highest: 0,
            final_size: None,
            max_data,
            window: max_data,
        }
    }

    /// Merge received bytes at `offset`, returning how far the highest
    /// received offset advanced (for connection-level accounting).
    ///
    /// Exact duplicates are dropped; overlapping bytes that differ are a
    /// protocol violation.
    pub fn insert(&mut self, offset: u64, data: &[u8]) -> Result<u64, StreamError> {
        let end = offset + data.len() as u64;
        if end > self.max_data {
            return Err(StreamError::FlowControlExceeded);
        }
        if let Some(final_size) = self.final_size {
            if end > final_size {
                return Err(StreamError::BeyondFinalSize);
            }
        }

        let advanced = end.saturating_sub(self.highest);
        if end > self.highest {
            self.highest = end;
        }

        // Clip everything already delivered to the application.
        let mut offset = offset;
        let mut data = data;
        if offset < self.delivered {
            let skip = (self.delivered - offset).min(data.len() as u64) as usize;
            data = &data[skip..];
            offset = self.delivered;
        }
        if data.is_empty() {
            return Ok(advanced);
        }
        let end = offset + data.len() as u64;

        // Compare overlaps against buffered chunks and collect the
        // segments that are genuinely new.
        let overlapping: Vec<(u64, u64)> = self
            .chunks
            .range(..end)
            .filter(|&(&key, chunk)| key + chunk.len() as u64 > offset)
            .map(|(&key, chunk)| (key, chunk.len() as u64))
            .collect();

        let mut new_segments: Vec<(u64, Vec<u8>)> = Vec::new();
        let mut cursor = offset;
        for (chunk_start, chunk_len) in overlapping {
            let chunk_end = chunk_start + chunk_len;
            if chunk_start > cursor {
                let lo = (cursor - offset) as usize;
                let hi = (chunk_start - offset) as usize;
                new_segments.push((cursor, data[lo..hi].to_vec()));
            }
            let overlap_start = chunk_start.max(cursor);
            let overlap_end = chunk_end.min(end);
            if overlap_start < overlap_end {
                let incoming =
                    &data[(overlap_start - offset) as usize..(overlap_end - offset) as usize];
                let existing = &self.chunks[&chunk_start]
                    [(overlap_start - chunk_start) as usize..(overlap_end - chunk_start) as usize];
                if incoming != existing {
                    return Err(StreamError::DataMismatch {
                        offset: overlap_start,
                    });
                }
            }
            cursor = cursor.max(chunk_end.min(end));
        }
        if cursor < end {
            new_segments.push((cursor, data[(cursor - offset) as usize..].to_vec()));
        }
        for (seg_offset, seg) in new_segments {
            trace!(offset = seg_offset, len = seg.len(), "buffered stream bytes");
            self.chunks.insert(seg_offset, seg);
        }
        Ok(advanced)
    }

    /// Record the stream's final size (the FIN offset). Fails when it
    /// contradicts what has already been seen.
    pub fn set_final_size(&mut self, size: u64) -> Result<(), StreamError> {
        if let Some(existing) = self.final_size {
            if existing != size {
                return Err(StreamError::FinalSizeChanged);
            }
            return Ok(());
        }
        if size < self.highest {
            return Err(StreamError::FinalSizeChanged);
        }
        if size > self.max_data {
            return Err(StreamError::FlowControlExceeded);
        }
        self.final_size = Some(size);
        if size > self.highest {
            self.highest = size;
        }
        Ok(())
    }

    /// Length of the contiguous prefix ready for the application.
    #[must_use]
    pub fn deliverable(&self) -> u64 {
        let mut cursor = self.delivered;
        for (&offset, chunk) in &self.chunks {
            if offset != cursor {
                break;
            }
            cursor += chunk.len() as u64;
        }
        cursor - self.delivered
    }

    /// Hand up to `max_len` contiguous bytes to the application,
    /// advancing the delivered cursor.
    pub fn read(&mut self, max_len: usize) -> Vec<u8> {
        let mut out = Vec::new();
        while out.len() < max_len {
            let Some(entry) = self.chunks.first_entry() else {
                break;
            };
            if *entry.key() != self.delivered {
                break;
            }
            let room = max_len - out.len();
            if entry.get().len() <= room {
                let chunk = entry.remove();
                self.delivered += chunk.len() as u64;
                out.extend_from_slice(&chunk);
            } else {
                let (key, mut chunk) = entry.remove_entry();
                let rest = chunk.split_off(room);
                self.delivered += chunk.len() as u64;
                out.extend_from_slice(&chunk);
                self.chunks.insert(key + room as u64, rest);
            }
        }
        out
    }

    /// A fresh MAX_STREAM_DATA limit once the application consumed half
    /// the window; `None` while no update is due.
    pub fn take_window_update(&mut self) -> Option<u64> {
        if self.final_size.is_some() {
            return None;
        }
        if self.max_data - self.delivered < self.window / 2 {
            self.max_data = self.delivered + self.window;
            return Some(self.max_data);
        }
        None
    }

    /// Whether every byte through the final size has been delivered.
    #[must_use]
    pub fn finished(&self) -> bool {
        self.final_size == Some(self.delivered)
    }

    /// Highest received offset.
    #[must_use]
    pub const fn highest(&self) -> u64 {
        self.highest
    }

    /// Bytes handed to the application so far.
    #[must_use]
    pub const fn delivered(&self) -> u64 {
        self.delivered
    }

    /// Declared final size, if known.
    #[must_use]
    pub const fn final_size(&self) -> Option<u64> {
        self.final_size
    }

    /// Currently advertised data limit.
    #[must_use]
    pub const fn limit(&self) -> u64 {
        self.max_data
    }
}
