//! RTT estimation and sent-packet records for RFC 9002 loss recovery.

use std::time::{Duration, SystemTime};

use tracing::trace;

/// Timer granularity floor (RFC 9002 kGranularity).
pub const GRANULARITY: Duration = Duration::from_millis(1);

/// Packet reordering threshold before a gap declares loss.
pub const PACKET_REORDERING_THRESHOLD: u64 = 3;

/// Time reordering threshold numerator / denominator (9/8).
pub const TIME_REORDERING_NUMERATOR: u32 = 9;
/// See [`TIME_REORDERING_NUMERATOR`].
pub const TIME_REORDERING_DENOMINATOR: u32 = 8;

/// RTT assumed before the first sample (RFC 9002 kInitialRtt).
pub const INITIAL_RTT: Duration = Duration::from_millis(333);

/// Round-trip estimator maintaining the RFC 9002 section 5 state.
#[derive(Debug)]
pub struct RttEstimator {
    latest: Duration,
    min: Duration,
    smoothed: Option<Duration>,
    var: Duration,
}

impl Default for RttEstimator {
    fn default() -> Self {
        Self::new()
    }
}

impl RttEstimator {
    /// Estimator with no samples yet.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            latest: INITIAL_RTT,
            min: INITIAL_RTT,
            smoothed: None,
            var: Duration::from_millis(INITIAL_RTT.as_millis() as u64 / 2),
        }
    }

    /// Feed a sample taken from the largest newly acknowledged,
    /// ack-eliciting packet. The peer-advertised ACK delay is only
    /// subtracted after handshake confirmation and never below min_rtt.
    pub fn on_sample(
        &mut self,
        mut latest: Duration,
        ack_delay: Duration,
        handshake_confirmed: bool,
        max_ack_delay: Duration,
    ) {
        match self.smoothed {
            None => {
                self.latest = latest;
                self.min = latest;
                self.smoothed = Some(latest);
                self.var = latest / 2;
            }
            Some(smoothed) => {
                self.min = self.min.min(latest);
                if handshake_confirmed {
                    let delay = ack_delay.min(max_ack_delay);
                    if latest >= self.min + delay {
                        latest -= delay;
                    }
                }
                self.latest = latest;
                let sample_var = if smoothed > latest {
                    smoothed - latest
                } else {
                    latest - smoothed
                };
                self.var = (3 * self.var + sample_var) / 4;
                self.smoothed = Some((7 * smoothed + latest) / 8);
            }
        }
        trace!(latest_ms = self.latest.as_millis() as u64, "rtt sample applied");
    }

    /// Latest sample.
    #[must_use]
    pub const fn latest(&self) -> Duration {
        self.latest
    }

    /// Minimum observed RTT.
    #[must_use]
    pub const fn min(&self) -> Duration {
        self.min
    }

    /// Smoothed RTT, falling back to the initial constant before any
    /// sample arrives.
    #[must_use]
    pub fn smoothed(&self) -> Duration {
        self.smoothed.unwrap_or(INITIAL_RTT)
    }

    /// RTT variation.
    #[must_use]
    pub const fn var(&self) -> Duration {
        self.var
    }

    /// Delay after which an unacknowledged packet is presumed lost:
    /// `9/8 · max(smoothed, latest)` with the granularity floor.
    #[must_use]
    pub fn loss_delay(&self) -> Duration {
        let base = self.smoothed().max(self.latest);
        let scaled = base.as_nanos() * u128::from(TIME_REORDERING_NUMERATOR)
            / u128::from(TIME_REORDERING_DENOMINATOR);
        Duration::from_nanos(scaled.min(u128::from(u64::MAX)) as u64).max(GRANULARITY)
    }

    /// Base probe timeout before exponential backoff and max_ack_delay:
    /// `smoothed + max(4·rttvar, granularity)`.
    #[must_use]
    pub fn pto_base(&self) -> Duration {
        self.smoothed() + (4 * self.var).max(GRANULARITY)
    }
}

/// Descriptor of a retransmittable frame carried by a sent packet.
///
/// On acknowledgement the descriptor releases its source state; on loss
/// it re-arms that state for retransmission.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SentFrame {
    /// ACK frame reporting ranges up to `largest`.
    Ack {
        /// Largest packet number the ACK reported.
        largest: u64,
    },
    /// CRYPTO frame bytes.
    Crypto {
        /// Starting offset within the crypto stream.
        offset: u64,
        /// Length of the carried span.
        len: u64,
    },
    /// STREAM frame bytes.
    Stream {
        /// Stream the bytes belong to.
        id: u64,
        /// Starting offset within the stream.
        offset: u64,
        /// Length of the carried span.
        len: u64,
        /// Whether the frame carried FIN.
        fin: bool,
    },
    /// MAX_DATA frame.
    MaxData,
    /// MAX_STREAM_DATA frame.
    MaxStreamData {
        /// Stream the credit applied to.
        id: u64,
    },
    /// MAX_STREAMS frame.
    MaxStreams {
        /// Bidirectional or unidirectional credit.
        bidi: bool,
    },
    /// RESET_STREAM frame.
    ResetStream {
        /// Stream being reset.
        id: u64,
    },
    /// STOP_SENDING frame.
    StopSending {
        /// Stream the request applied to.
        id: u64,
    },
    /// HANDSHAKE_DONE frame.
    HandshakeDone,
    /// NEW_CONNECTION_ID frame.
    NewConnectionId {
        /// Announced sequence number.
        sequence: u64,
    },
    /// RETIRE_CONNECTION_ID frame.
    RetireConnectionId {
        /// Retired sequence number.
        sequence: u64,
    },
    /// PING probe.
    Ping,
    /// PATH_RESPONSE frame.
    PathResponse {
        /// Echoed challenge payload.
        data: [u8; 8],
    },
}

/// Record of one sent packet, immutable from transmission until it is
/// acknowledged, declared lost, or its space is discarded.
#[derive(Debug, Clone)]
pub struct SentPacket {
    /// Packet number within its space.
    pub pn: u64,
    /// Transmission timestamp.
    pub time_sent: SystemTime,
    /// Bytes on the wire, headers and tag included.
    pub size: usize,
    /// Whether the packet elicits acknowledgement.
    pub ack_eliciting: bool,
    /// Whether the packet counts toward bytes in flight.
    pub in_flight: bool,
    /// Largest acknowledged packet number at send time.
    pub largest_acked_at_send: Option<u64>,
    /// Retransmittable frame descriptors.
    pub frames: Vec<SentFrame>,
}
