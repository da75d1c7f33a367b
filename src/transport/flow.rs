//! Connection-level flow control: paired send and receive windows.

use thiserror::Error;

use super::error::{TransportError, TransportErrorCode};

/// Errors from connection flow-control bookkeeping.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum FlowError {
    /// Local send accounting tried to pass the peer's limit.
    #[error("connection send window exceeded: attempted {attempted} with {available} available")]
    SendWindowExceeded {
        /// Bytes left in the window.
        available: u64,
        /// Bytes the caller tried to consume.
        attempted: u64,
    },
}

/// Tracks connection-wide data budgets in both directions and decides
/// when a MAX_DATA update is owed to the peer.
#[derive(Debug)]
pub struct FlowController {
    /// Peer-advertised MAX_DATA.
    send_max: u64,
    /// Stream bytes sent against `send_max`.
    sent: u64,
    /// MAX_DATA we advertised.
    recv_max: u64,
    /// Sum of highest received offsets across all streams.
    received: u64,
    /// Bytes the application consumed across all streams.
    delivered: u64,
    /// Re-advertisement window size.
    window: u64,
    /// Limit at which a DATA_BLOCKED frame is owed, if any.
    blocked_at: Option<u64>,
}

impl FlowController {
    /// Controller with the peer's initial credit and our receive window.
    #[must_use]
    pub fn new(peer_initial_max_data: u64, local_initial_max_data: u64) -> Self {
        Self {
            send_max: peer_initial_max_data,
            sent: 0,
            recv_max: local_initial_max_data,
            received: 0,
            delivered: 0,
            window: local_initial_max_data,
            blocked_at: None,
        }
    }

    /// Bytes we may still send before stalling.
    #[must_use]
    pub fn send_available(&self) -> u64 {
        self.send_max.saturating_sub(self.sent)
    }

    /// Account stream bytes just sent.
    pub fn on_data_sent(&mut self, bytes: u64) -> Result<(), FlowError> {
        let available = self.send_available();
        if bytes > available {
            return Err(FlowError::SendWindowExceeded {
                available,
                attempted: bytes,
            });
        }
        self.sent += bytes;
        if self.send_available() == 0 {
            self.blocked_at = Some(self.send_max);
        }
        Ok(())
    }

    /// Apply a MAX_DATA frame; the limit never shrinks.
    pub fn on_max_data(&mut self, limit: u64) {
        if limit > self.send_max {
            self.send_max = limit;
            self.blocked_at = None;
        }
    }

    /// DATA_BLOCKED limit to report, at most once per stall.
    pub fn take_blocked(&mut self) -> Option<u64> {
        self.blocked_at.take()
    }

    /// Account newly received stream bytes (the advance of a stream's
    /// highest offset). Exceeding our advertised limit is a peer
    /// violation.
    pub fn on_data_received(&mut self, bytes: u64) -> Result<(), TransportError> {
        self.received += bytes;
        if self.received > self.recv_max {
            return Err(TransportError::peer(
                TransportErrorCode::FlowControlError,
                "connection flow-control limit exceeded",
            ));
        }
        Ok(())
    }

    /// Account bytes the application consumed.
    pub fn on_data_delivered(&mut self, bytes: u64) {
        self.delivered += bytes;
    }

    /// A fresh MAX_DATA limit once consumption crosses half the window;
    /// `None` while no update is due.
    pub fn take_window_update(&mut self) -> Option<u64> {
        if self.recv_max - self.delivered < self.window / 2 {
            self.recv_max = self.delivered + self.window;
            return Some(self.recv_max);
        }
        None
    }

    /// Current advertised receive limit.
    #[must_use]
    pub const fn recv_limit(&self) -> u64 {
        self.recv_max
    }

    /// Current peer-advertised send limit.
    #[must_use]
    pub const fn send_limit(&self) -> u64 {
        self.send_max
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn send_window_stalls_and_reopens() {
        let mut flow = FlowController::new(10, 100);
        flow.on_data_sent(10).unwrap();
        assert_eq!(flow.send_available(), 0);
        assert_eq!(flow.take_blocked(), Some(10));
        assert_eq!(flow.take_blocked(), None);
        assert!(matches!(
            flow.on_data_sent(1),
            Err(FlowError::SendWindowExceeded { available: 0, attempted: 1 })
        ));
        flow.on_max_data(25);
        assert_eq!(flow.send_available(), 15);
        // A stale MAX_DATA never lowers the limit.
        flow.on_max_data(5);
        assert_eq!(flow.send_available(), 15);
    }

    #[test]
    fn receive_accounting_detects_violation() {
        let mut flow = FlowController::new(100, 10);
        flow.on_data_received(10).unwrap();
        let err = flow.on_data_received(1).unwrap_err();
        assert_eq!(err.close_code(), Some(TransportErrorCode::FlowControlError));
    }

    #[test]
    fn window_update_after_half_consumed() {
        let mut flow = FlowController::new(100, 10);
        flow.on_data_received(6).unwrap();
        assert!(flow.take_window_update().is_none());
        flow.on_data_delivered(6);
        assert_eq!(flow.take_window_update(), Some(16));
        assert!(flow.take_window_update().is_none());
        assert_eq!(flow.recv_limit(), 16);
    }
}
