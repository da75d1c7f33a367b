//! Connection identifiers and the local/remote registries tracking them.

use core::fmt;
use std::collections::VecDeque;

use ring::rand::{SecureRandom, SystemRandom};
use tracing::{debug, trace};

use super::error::{TransportError, TransportErrorCode};

/// Maximum connection ID length permitted by RFC 9000.
pub const MAX_CID_LEN: usize = 20;

/// Length used for locally generated connection IDs.
pub const LOCAL_CID_LEN: usize = 8;

/// An opaque connection identifier of up to twenty bytes, stored inline.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId {
    bytes: [u8; MAX_CID_LEN],
    len: u8,
}

impl ConnectionId {
    /// Wrap a byte slice; `None` when longer than [`MAX_CID_LEN`].
    #[must_use]
    pub fn from_slice(bytes: &[u8]) -> Option<Self> {
        if bytes.len() > MAX_CID_LEN {
            return None;
        }
        let mut inner = [0u8; MAX_CID_LEN];
        inner[..bytes.len()].copy_from_slice(bytes);
        Some(Self {
            bytes: inner,
            len: bytes.len() as u8,
        })
    }

    /// The zero-length connection ID.
    #[must_use]
    pub const fn empty() -> Self {
        Self {
            bytes: [0u8; MAX_CID_LEN],
            len: 0,
        }
    }

    /// Generate a random ID of `len` bytes.
    #[must_use]
    pub fn random(len: usize) -> Self {
        let len = len.min(MAX_CID_LEN);
        let mut bytes = [0u8; MAX_CID_LEN];
        // SystemRandom failure is unrecoverable for key material anyway.
        SystemRandom::new()
            .fill(&mut bytes[..len])
            .expect("system randomness unavailable");
        Self {
            bytes,
            len: len as u8,
        }
    }

    /// Borrow the identifier bytes.
    #[must_use]
    pub fn as_slice(&self) -> &[u8] {
        &self.bytes[..self.len as usize]
    }

    /// Length in bytes.
    #[must_use]
    pub const fn len(&self) -> usize {
        self.len as usize
    }

    /// Whether this is the zero-length ID.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.len == 0
    }
}

impl fmt::Debug for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in self.as_slice() {
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}

/// One issued or learned connection ID with its sequence number.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CidEntry {
    /// Issuer-assigned sequence number.
    pub sequence: u64,
    /// The identifier itself.
    pub id: ConnectionId,
    /// Stateless reset token paired with the ID, when known.
    pub reset_token: Option<[u8; 16]>,
}

/// Registry of connection IDs we issued to the peer.
#[derive(Debug)]
pub struct LocalCids {
    entries: Vec<CidEntry>,
    next_sequence: u64,
    /// Peer-advertised active_connection_id_limit.
    peer_limit: u64,
    /// Sequence numbers whose NEW_CONNECTION_ID frame still needs to go out.
    pending_announce: VecDeque<u64>,
}

impl LocalCids {
    /// Start with the handshake-issued ID at sequence zero.
    #[must_use]
    pub fn new(initial: ConnectionId) -> Self {
        Self {
            entries: vec![CidEntry {
                sequence: 0,
                id: initial,
                reset_token: None,
            }],
            next_sequence: 1,
            peer_limit: 2,
            pending_announce: VecDeque::new(),
        }
    }

    /// Record the peer's active_connection_id_limit and mint IDs up to it.
    pub fn set_peer_limit(&mut self, limit: u64) {
        self.peer_limit = limit.max(2);
        while (self.entries.len() as u64) < self.peer_limit {
            let entry = CidEntry {
                sequence: self.next_sequence,
                id: ConnectionId::random(LOCAL_CID_LEN),
                reset_token: Some(random_reset_token()),
            };
            trace!(sequence = entry.sequence, id = ?entry.id, "issuing connection id");
            self.pending_announce.push_back(entry.sequence);
            self.entries.push(entry);
            self.next_sequence += 1;
        }
    }

    /// All identifiers the endpoint currently answers to.
    pub fn active_ids(&self) -> impl Iterator<Item = &ConnectionId> {
        self.entries.iter().map(|entry| &entry.id)
    }

    /// Next NEW_CONNECTION_ID announcement to transmit, if any.
    #[must_use]
    pub fn next_announcement(&self) -> Option<&CidEntry> {
        let sequence = *self.pending_announce.front()?;
        self.entries.iter().find(|entry| entry.sequence == sequence)
    }

    /// Mark the front announcement as in flight.
    pub fn announcement_sent(&mut self) {
        self.pending_announce.pop_front();
    }

    /// Re-queue an announcement whose frame was declared lost.
    pub fn announcement_lost(&mut self, sequence: u64) {
        if self.entries.iter().any(|entry| entry.sequence == sequence)
            && !self.pending_announce.contains(&sequence)
        {
            self.pending_announce.push_back(sequence);
        }
    }

    /// Apply a RETIRE_CONNECTION_ID frame from the peer.
    ///
    /// Retiring an unissued sequence, or the ID the frame itself
    /// arrived on, is a protocol violation.
    pub fn retire(&mut self, sequence: u64, arrived_on: &ConnectionId) -> Result<(), TransportError> {
        if sequence >= self.next_sequence {
            return Err(TransportError::peer(
                TransportErrorCode::ProtocolViolation,
                "retirement of an unissued connection id",
            ));
        }
        let Some(pos) = self.entries.iter().position(|entry| entry.sequence == sequence) else {
            // Already retired; duplicates are harmless.
            return Ok(());
        };
        if self.entries[pos].id == *arrived_on {
            return Err(TransportError::peer(
                TransportErrorCode::ProtocolViolation,
                "peer retired the connection id it sent on",
            ));
        }
        debug!(sequence, "retiring local connection id");
        self.entries.remove(pos);
        // Keep the active set topped up to the peer's limit.
        self.set_peer_limit(self.peer_limit);
        Ok(())
    }
}

/// Registry of connection IDs the peer issued to us.
#[derive(Debug)]
pub struct RemoteCids {
    entries: Vec<CidEntry>,
    /// Our active_connection_id_limit.
    local_limit: u64,
    retire_prior_to: u64,
    /// RETIRE_CONNECTION_ID frames owed to the peer.
    pending_retire: VecDeque<u64>,
}

impl RemoteCids {
    /// Start with the handshake-learned ID at sequence zero.
    #[must_use]
    pub fn new(initial: ConnectionId, local_limit: u64) -> Self {
        Self {
            entries: vec![CidEntry {
                sequence: 0,
                id: initial,
                reset_token: None,
            }],
            local_limit: local_limit.max(2),
            retire_prior_to: 0,
            pending_retire: VecDeque::new(),
        }
    }

    /// Replace the sequence-zero ID once the server's handshake SCID is
    /// authoritative.
    pub fn update_initial(&mut self, id: ConnectionId) {
        if let Some(entry) = self.entries.iter_mut().find(|entry| entry.sequence == 0) {
            entry.id = id;
        }
    }

    /// The identifier to place in outgoing packet headers.
    #[must_use]
    pub fn current(&self) -> ConnectionId {
        self.entries
            .iter()
            .min_by_key(|entry| entry.sequence)
            .map_or_else(ConnectionId::empty, |entry| entry.id)
    }

    /// Apply a NEW_CONNECTION_ID frame.
    pub fn on_new_cid(
        &mut self,
        sequence: u64,
        retire_prior_to: u64,
        id: ConnectionId,
        reset_token: [u8; 16],
    ) -> Result<(), TransportError> {
        if let Some(existing) = self.entries.iter().find(|entry| entry.sequence == sequence) {
            if existing.id != id {
                return Err(TransportError::peer(
                    TransportErrorCode::ProtocolViolation,
                    "connection id sequence reused with different id",
                ));
            }
            return Ok(());
        }
        if sequence < self.retire_prior_to {
            // Already told to retire this range; acknowledge and move on.
            self.pending_retire.push_back(sequence);
            return Ok(());
        }

        self.entries.push(CidEntry {
            sequence,
            id,
            reset_token: Some(reset_token),
        });

        if retire_prior_to > self.retire_prior_to {
            self.retire_prior_to = retire_prior_to;
            let mut retained = Vec::with_capacity(self.entries.len());
            for entry in self.entries.drain(..) {
                if entry.sequence < retire_prior_to {
                    self.pending_retire.push_back(entry.sequence);
                } else {
                    retained.push(entry);
                }
            }
            self.entries = retained;
        }

        if self.entries.len() as u64 > self.local_limit {
            return Err(TransportError::peer(
                TransportErrorCode::ProtocolViolation,
                "peer exceeded the active connection id limit",
            ));
        }
        Ok(())
    }

    /// Next RETIRE_CONNECTION_ID owed to the peer.
    #[must_use]
    pub fn next_retirement(&self) -> Option<u64> {
        self.pending_retire.front().copied()
    }

    /// Mark the front retirement as in flight.
    pub fn retirement_sent(&mut self) {
        self.pending_retire.pop_front();
    }

    /// Re-queue a retirement whose frame was declared lost.
    pub fn retirement_lost(&mut self, sequence: u64) {
        if !self.pending_retire.contains(&sequence) {
            self.pending_retire.push_back(sequence);
        }
    }
}

fn random_reset_token() -> [u8; 16] {
    let mut token = [0u8; 16];
    SystemRandom::new()
        .fill(&mut token)
        .expect("system randomness unavailable");
    token
}
