//! Received packet tracking and acknowledgement generation.

use std::time::{Duration, SystemTime};

use tracing::trace;

use crate::wire::AckFrame;

/// Maximum number of ranges retained and reported per space.
pub const MAX_ACK_RANGES: usize = 32;

/// Ack-eliciting packets tolerated before an immediate ACK is owed.
const ACK_ELICITING_THRESHOLD: u32 = 2;

/// Ordered, non-overlapping set of received packet numbers.
///
/// Ranges are inclusive `(lo, hi)` pairs sorted descending by `hi`;
/// insertion merges adjacent and overlapping ranges, and the set is
/// trimmed from the low end once it exceeds its capacity.
#[derive(Debug, Default)]
pub struct AckRangeSet {
    ranges: Vec<(u64, u64)>,
}

impl AckRangeSet {
    /// Empty set.
    #[must_use]
    pub const fn new() -> Self {
        Self { ranges: Vec::new() }
    }

    /// Record a packet number; returns false when it was already present.
    pub fn insert(&mut self, pn: u64) -> bool {
        for idx in 0..self.ranges.len() {
            let (lo, hi) = self.ranges[idx];
            if pn >= lo && pn <= hi {
                return false;
            }
            if pn.checked_add(1) == Some(lo) {
                self.ranges[idx].0 = pn;
                self.merge_around(idx);
                self.trim();
                return true;
            }
            if hi.checked_add(1) == Some(pn) {
                self.ranges[idx].1 = pn;
                self.merge_around(idx);
                self.trim();
                return true;
            }
            if pn > hi {
                self.ranges.insert(idx, (pn, pn));
                self.trim();
                return true;
            }
        }
        self.ranges.push((pn, pn));
        self.trim();
        true
    }

    /// Whether `pn` has been recorded.
    #[must_use]
    pub fn contains(&self, pn: u64) -> bool {
        self.ranges.iter().any(|&(lo, hi)| pn >= lo && pn <= hi)
    }

    /// Highest recorded packet number.
    #[must_use]
    pub fn largest(&self) -> Option<u64> {
        self.ranges.first().map(|&(_, hi)| hi)
    }

    /// Ranges in descending order.
    #[must_use]
    pub fn ranges(&self) -> &[(u64, u64)] {
        &self.ranges
    }

    /// Whether nothing has been recorded.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }

    /// Forget ranges entirely at or below `pn`; the peer has seen an ACK
    /// covering them, so reporting them again is wasted bytes.
    pub fn forget_below(&mut self, pn: u64) {
        self.ranges.retain(|&(_, hi)| hi > pn);
    }

    fn merge_around(&mut self, idx: usize) {
        if idx > 0 {
            let (lo, hi) = self.ranges[idx];
            let (prev_lo, _) = self.ranges[idx - 1];
            if hi.saturating_add(1) >= prev_lo {
                self.ranges[idx - 1] = (lo.min(prev_lo), self.ranges[idx - 1].1.max(hi));
                self.ranges.remove(idx);
                self.merge_around(idx - 1);
                return;
            }
        }
        if idx + 1 < self.ranges.len() {
            let (lo, hi) = self.ranges[idx];
            let (_, next_hi) = self.ranges[idx + 1];
            if next_hi.saturating_add(1) >= lo {
                self.ranges[idx] = (self.ranges[idx + 1].0.min(lo), hi);
                self.ranges.remove(idx + 1);
                self.merge_around(idx);
            }
        }
    }

    fn trim(&mut self) {
        self.ranges.truncate(MAX_ACK_RANGES);
    }
}

/// Per-space acknowledgement bookkeeping: what to report, and when an
/// ACK frame is owed.
#[derive(Debug)]
pub struct AckTracker {
    set: AckRangeSet,
    largest_received_time: Option<SystemTime>,
    /// Ack-eliciting packets received since the last ACK went out.
    unacked_eliciting: u32,
    /// Deadline for the delayed ACK once one ack-eliciting packet is owed.
    delay_deadline: Option<SystemTime>,
    max_ack_delay: Duration,
}

impl AckTracker {
    /// New tracker honoring the local max_ack_delay budget.
    #[must_use]
    pub fn new(max_ack_delay: Duration) -> Self {
        Self {
            set: AckRangeSet::new(),
            largest_received_time: None,
            unacked_eliciting: 0,
            delay_deadline: None,
            max_ack_delay,
        }
    }

    /// Record a received packet. Returns false for duplicates.
    pub fn on_packet_received(&mut self, pn: u64, ack_eliciting: bool, now: SystemTime) -> bool {
        let newly = self.set.insert(pn);
        if !newly {
            return false;
        }
        if self.set.largest() == Some(pn) {
            self.largest_received_time = Some(now);
        }
        if ack_eliciting {
            self.unacked_eliciting += 1;
            if self.delay_deadline.is_none() {
                self.delay_deadline = Some(now + self.max_ack_delay);
            }
        }
        trace!(pn, ack_eliciting, "recorded received packet");
        true
    }

    /// Whether `pn` was seen before (duplicate suppression).
    #[must_use]
    pub fn is_duplicate(&self, pn: u64) -> bool {
        self.set.contains(pn)
    }

    /// Whether an ACK frame must be sent now: the eliciting threshold is
    /// reached or the delay budget has expired.
    #[must_use]
    pub fn ack_required(&self, now: SystemTime) -> bool {
        if self.unacked_eliciting >= ACK_ELICITING_THRESHOLD {
            return true;
        }
        self.delay_deadline.is_some_and(|deadline| deadline <= now)
    }

    /// Whether any ack-eliciting packet is awaiting acknowledgement.
    #[must_use]
    pub const fn ack_pending(&self) -> bool {
        self.unacked_eliciting > 0
    }

    /// When the delayed-ACK timer should fire.
    #[must_use]
    pub fn next_timeout(&self) -> Option<SystemTime> {
        self.delay_deadline
    }

    /// Build the ACK frame to transmit, scaling the delay field by the
    /// local ack_delay_exponent.
    #[must_use]
    pub fn frame(&self, now: SystemTime, ack_delay_exponent: u64) -> Option<AckFrame> {
        let largest = self.set.largest()?;
        let delay_micros = self
            .largest_received_time
            .and_then(|received| now.duration_since(received).ok())
            .unwrap_or_default()
            .as_micros() as u64;
        Some(AckFrame {
            largest,
            delay: delay_micros >> ack_delay_exponent,
            ranges: self.set.ranges().to_vec(),
            ecn: None,
        })
    }

    /// Note that an ACK frame reporting the current state went out.
    pub fn on_ack_sent(&mut self) {
        self.unacked_eliciting = 0;
        self.delay_deadline = None;
    }

    /// The peer acknowledged one of our ACK frames reporting up to
    /// `largest`; stop reporting fully covered ranges.
    pub fn on_ack_frame_acked(&mut self, largest: u64) {
        self.set.forget_below(largest);
    }

    /// Whether anything is available to report.
    #[must_use]
    pub fn has_ranges(&self) -> bool {
        !self.set.is_empty()
    }

    /// Largest packet number received so far.
    #[must_use]
    pub fn largest_received(&self) -> Option<u64> {
        self.set.largest()
    }
}
