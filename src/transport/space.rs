//! Per-space send/receive bookkeeping: ack state, in-flight packets,
//! loss detection, and the crypto stream at each encryption level.

use std::collections::BTreeMap;
use std::time::{Duration, SystemTime};

use tracing::{debug, trace};

use crate::wire::AckFrame;

use super::ack::AckTracker;
use super::crypto::Seal;
use super::error::{TransportError, TransportErrorCode};
use super::recovery::{PACKET_REORDERING_THRESHOLD, RttEstimator, SentPacket};
use super::stream::{RecvBuffer, SendBuffer};

/// Reassembly budget for one level's crypto stream before
/// CRYPTO_BUFFER_EXCEEDED.
pub const CRYPTO_BUFFER_CAP: u64 = 64 * 1024;

/// Packets newly acknowledged and newly declared lost by one ACK frame.
#[derive(Debug, Default)]
pub struct AckOutcome {
    /// Packets the ACK newly covered.
    pub newly_acked: Vec<SentPacket>,
    /// Packets the reordering thresholds declared lost.
    pub lost: Vec<SentPacket>,
}

/// One packet number space: Initial, Handshake, or Application.
#[derive(Debug)]
pub struct PacketNumberSpace {
    /// Receive-side acknowledgement state.
    pub ack: AckTracker,
    /// Reassembly of peer CRYPTO frames at this level.
    pub crypto_in: RecvBuffer,
    /// Outbound CRYPTO bytes for this level (no flow control).
    pub crypto_out: SendBuffer,
    /// Read seal, once the level's keys are installed.
    pub read_seal: Option<Seal>,
    /// Write seal, once the level's keys are installed.
    pub write_seal: Option<Seal>,
    next_pn: u64,
    in_flight: BTreeMap<u64, SentPacket>,
    largest_acked: Option<u64>,
    loss_time: Option<SystemTime>,
    time_of_last_ack_eliciting: Option<SystemTime>,
    /// A PTO probe is owed in this space.
    pub probe_pending: bool,
    discarded: bool,
}

impl PacketNumberSpace {
    /// Fresh space honoring the local max_ack_delay.
    #[must_use]
    pub fn new(max_ack_delay: Duration) -> Self {
        Self {
            ack: AckTracker::new(max_ack_delay),
            crypto_in: RecvBuffer::new(CRYPTO_BUFFER_CAP),
            crypto_out: SendBuffer::new(u64::MAX),
            read_seal: None,
            write_seal: None,
            next_pn: 0,
            in_flight: BTreeMap::new(),
            largest_acked: None,
            loss_time: None,
            time_of_last_ack_eliciting: None,
            probe_pending: false,
            discarded: false,
        }
    }

    /// Allocate the next packet number; strictly monotonic.
    pub fn next_pn(&mut self) -> u64 {
        let pn = self.next_pn;
        self.next_pn += 1;
        pn
    }

    /// The packet number the next allocation will return.
    #[must_use]
    pub const fn peek_pn(&self) -> u64 {
        self.next_pn
    }

    /// Largest packet number acknowledged by the peer.
    #[must_use]
    pub const fn largest_acked(&self) -> Option<u64> {
        self.largest_acked
    }

    /// Record a transmitted packet for loss detection.
    pub fn on_packet_sent(&mut self, packet: SentPacket) {
        trace!(pn = packet.pn, size = packet.size, "tracking sent packet");
        if packet.ack_eliciting {
            self.time_of_last_ack_eliciting = Some(packet.time_sent);
        }
        self.in_flight.insert(packet.pn, packet);
    }

    /// Apply an ACK frame, updating RTT and running loss detection.
    pub fn on_ack_frame(
        &mut self,
        frame: &AckFrame,
        now: SystemTime,
        rtt: &mut RttEstimator,
        handshake_confirmed: bool,
        peer_max_ack_delay: Duration,
        peer_ack_delay_exponent: u64,
    ) -> Result<AckOutcome, TransportError> {
        if frame.largest >= self.next_pn {
            return Err(TransportError::peer(
                TransportErrorCode::ProtocolViolation,
                "ack for a packet number never sent",
            ));
        }

        let mut outcome = AckOutcome::default();
        for &(lo, hi) in &frame.ranges {
            let acked: Vec<u64> = self
                .in_flight
                .range(lo..=hi)
                .map(|(&pn, _)| pn)
                .collect();
            for pn in acked {
                let packet = self.in_flight.remove(&pn).expect("key just listed");
                outcome.newly_acked.push(packet);
            }
        }

        if self.largest_acked.is_none_or(|largest| frame.largest > largest) {
            self.largest_acked = Some(frame.largest);
        }

        // RTT sample only when the largest acked packet is newly acked
        // and was ack-eliciting.
        if let Some(largest_packet) = outcome
            .newly_acked
            .iter()
            .find(|packet| packet.pn == frame.largest)
        {
            if largest_packet.ack_eliciting {
                if let Ok(latest) = now.duration_since(largest_packet.time_sent) {
                    let micros = frame
                        .delay
                        .checked_shl(peer_ack_delay_exponent as u32)
                        .unwrap_or(u64::MAX);
                    let ack_delay = Duration::from_micros(micros);
                    rtt.on_sample(latest, ack_delay, handshake_confirmed, peer_max_ack_delay);
                }
            }
        }

        outcome.lost = self.detect_lost(now, rtt);
        if !outcome.newly_acked.is_empty() {
            self.probe_pending = false;
        }
        Ok(outcome)
    }

    /// Run packet- and time-threshold loss detection, rescheduling the
    /// loss timer for packets not yet past the threshold.
    pub fn detect_lost(&mut self, now: SystemTime, rtt: &RttEstimator) -> Vec<SentPacket> {
        let Some(largest_acked) = self.largest_acked else {
            self.loss_time = None;
            return Vec::new();
        };
        let loss_delay = rtt.loss_delay();
        let mut lost_pns = Vec::new();
        let mut next_loss_time: Option<SystemTime> = None;

        for (&pn, packet) in self.in_flight.range(..=largest_acked) {
            if largest_acked - pn >= PACKET_REORDERING_THRESHOLD {
                lost_pns.push(pn);
                continue;
            }
            let deadline = packet.time_sent + loss_delay;
            if deadline <= now {
                lost_pns.push(pn);
            } else {
                next_loss_time = Some(next_loss_time.map_or(deadline, |t| t.min(deadline)));
            }
        }

        self.loss_time = next_loss_time;
        let mut lost = Vec::with_capacity(lost_pns.len());
        for pn in lost_pns {
            debug!(pn, "packet declared lost");
            lost.push(self.in_flight.remove(&pn).expect("key just listed"));
        }
        lost
    }

    /// When the loss timer should fire.
    #[must_use]
    pub const fn loss_time(&self) -> Option<SystemTime> {
        self.loss_time
    }

    /// Send time of the most recent ack-eliciting packet (PTO base).
    #[must_use]
    pub const fn time_of_last_ack_eliciting(&self) -> Option<SystemTime> {
        self.time_of_last_ack_eliciting
    }

    /// Whether any ack-eliciting packet awaits acknowledgement.
    #[must_use]
    pub fn has_ack_eliciting_in_flight(&self) -> bool {
        self.in_flight.values().any(|packet| packet.ack_eliciting)
    }

    /// Count of packets awaiting acknowledgement.
    #[must_use]
    pub fn in_flight_count(&self) -> usize {
        self.in_flight.len()
    }

    /// Discard the space (RFC 9001 section 4.9): in-flight records are
    /// dropped without counting as lost, keys and buffers released.
    pub fn discard(&mut self) {
        debug!("packet number space discarded");
        self.in_flight.clear();
        self.loss_time = None;
        self.time_of_last_ack_eliciting = None;
        self.read_seal = None;
        self.write_seal = None;
        self.probe_pending = false;
        self.discarded = true;
    }

    /// Whether the space has been discarded.
    #[must_use]
    pub const fn is_discarded(&self) -> bool {
        self.discarded
    }
}
