//! Blocking UDP socket wrapper for the endpoint loop.

use std::io;
use std::net::{SocketAddr, UdpSocket};
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;

/// Socket operation failures.
#[derive(Debug, Error)]
pub enum SocketError {
    /// Underlying I/O error.
    #[error("socket i/o error: {0}")]
    Io(#[from] io::Error),
}

impl SocketError {
    /// Whether a receive simply timed out (the loop's idle tick).
    #[must_use]
    pub fn is_timeout(&self) -> bool {
        let Self::Io(err) = self;
        matches!(err.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut)
    }
}

/// A bound UDP socket shared with application handles.
#[derive(Debug, Clone)]
pub struct SocketBinding {
    socket: Arc<UdpSocket>,
}

impl SocketBinding {
    /// Bind to the provided address.
    pub fn bind(addr: SocketAddr) -> Result<Self, SocketError> {
        let socket = UdpSocket::bind(addr)?;
        Ok(Self {
            socket: Arc::new(socket),
        })
    }

    /// Set the blocking-read timeout used as the loop's timer wait.
    pub fn set_read_timeout(&self, timeout: Option<Duration>) -> Result<(), SocketError> {
        self.socket.set_read_timeout(timeout)?;
        Ok(())
    }

    /// Send one datagram.
    pub fn send_to(&self, buf: &[u8], addr: SocketAddr) -> Result<usize, SocketError> {
        Ok(self.socket.send_to(buf, addr)?)
    }

    /// Receive one datagram.
    pub fn recv_from(&self, buf: &mut [u8]) -> Result<(usize, SocketAddr), SocketError> {
        Ok(self.socket.recv_from(buf)?)
    }

    /// Local address of the binding.
    pub fn local_addr(&self) -> Result<SocketAddr, SocketError> {
        Ok(self.socket.local_addr()?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timeout_errors_are_recognized() {
        let err = SocketError::Io(io::Error::from(io::ErrorKind::WouldBlock));
        assert!(err.is_timeout());
        let err = SocketError::Io(io::Error::from(io::ErrorKind::ConnectionRefused));
        assert!(!err.is_timeout());
    }
}
