//! Bridge to the opaque TLS provider driving the handshake.
//!
//! The provider contract mirrors the classic C callback interface
//! (set_encryption_secrets / add_handshake_data / flush / send_alert)
//! but rendered as a drained event queue, so no raw context pointers
//! ever cross the boundary.

use tracing::{debug, trace};

use super::crypto::{CipherSuite, Seal};
use super::error::{TransportError, TransportErrorCode};
use super::packet::EncryptionLevel;

/// Result of driving the handshake forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeStatus {
    /// More crypto bytes are needed from the peer.
    InProgress,
    /// The handshake has completed.
    Complete,
}

/// Callback events surfaced by the provider.
#[derive(Debug)]
pub enum TlsEvent {
    /// New encryption secrets for a level; either direction may be
    /// absent (0-RTT installs only one side).
    Secrets {
        /// Level the secrets protect.
        level: EncryptionLevel,
        /// Negotiated AEAD suite.
        suite: CipherSuite,
        /// Read-direction secret.
        read: Option<Vec<u8>>,
        /// Write-direction secret.
        write: Option<Vec<u8>>,
    },
    /// Handshake bytes to transmit at a level.
    HandshakeBytes {
        /// Level the bytes must be sent at.
        level: EncryptionLevel,
        /// The raw handshake bytes.
        bytes: Vec<u8>,
    },
    /// Fatal TLS alert; closes the connection with `0x100 | alert`.
    Alert(u8),
}

/// The opaque TLS provider for one connection.
///
/// `flush` from the C contract is intentionally absent: handshake bytes
/// are already byte-stream buffered when they surface as events.
pub trait TlsSession: Send {
    /// Deliver crypto bytes received from the peer at a level.
    fn provide_data(&mut self, level: EncryptionLevel, data: &[u8]);

    /// Drive the handshake state machine.
    fn do_handshake(&mut self) -> HandshakeStatus;

    /// Level new outbound handshake bytes will be written at.
    fn write_level(&self) -> EncryptionLevel;

    /// Level expected for the next inbound crypto bytes.
    fn read_level(&self) -> EncryptionLevel;

    /// The peer's transport parameters, once the handshake has carried
    /// them.
    fn peer_transport_params(&mut self) -> Option<Vec<u8>>;

    /// Install our transport parameters for the handshake to carry.
    fn set_transport_params(&mut self, params: &[u8]);

    /// Drain the next pending callback event.
    fn poll_event(&mut self) -> Option<TlsEvent>;
}

/// Session factory configured by the application; the client's intended
/// server name is threaded through from the connect call.
pub trait TlsConfig: Send {
    /// Session for an outgoing connection to `server_name`.
    fn new_client_session(&self, server_name: &str) -> Box<dyn TlsSession>;

    /// Session for an accepted connection.
    fn new_server_session(&self) -> Box<dyn TlsSession>;
}

/// Freshly derived seals for one level.
#[derive(Debug)]
pub struct KeyInstall {
    /// Level the seals protect.
    pub level: EncryptionLevel,
    /// Read seal, when a read secret was provided.
    pub read: Option<Seal>,
    /// Write seal, when a write secret was provided.
    pub write: Option<Seal>,
}

/// Everything one `drive` pass produced.
#[derive(Debug, Default)]
pub struct TlsProgress {
    /// Seals to install on the matching spaces.
    pub installs: Vec<KeyInstall>,
    /// Handshake bytes to queue on the per-level crypto streams.
    pub outputs: Vec<(EncryptionLevel, Vec<u8>)>,
    /// The handshake completed during this pass.
    pub completed: bool,
}

/// Owns the provider session and translates its events into engine
/// actions.
pub struct TlsBridge {
    session: Box<dyn TlsSession>,
    complete: bool,
}

impl std::fmt::Debug for TlsBridge {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TlsBridge").field("complete", &self.complete).finish()
    }
}

impl TlsBridge {
    /// Wrap a provider session.
    #[must_use]
    pub fn new(session: Box<dyn TlsSession>) -> Self {
        Self {
            session,
            complete: false,
        }
    }

    /// Install our transport parameters before the first flight.
    pub fn set_transport_params(&mut self, params: &[u8]) {
        self.session.set_transport_params(params);
    }

    /// Feed reassembled CRYPTO bytes received at a level.
    pub fn provide(&mut self, level: EncryptionLevel, data: &[u8]) {
        trace!(?level, len = data.len(), "crypto bytes to tls");
        self.session.provide_data(level, data);
    }

    /// Drive the handshake and drain provider callbacks.
    pub fn drive(&mut self) -> Result<TlsProgress, TransportError> {
        let status = self.session.do_handshake();
        let mut progress = TlsProgress::default();

        while let Some(event) = self.session.poll_event() {
            match event {
                TlsEvent::Secrets {
                    level,
                    suite,
                    read,
                    write,
                } => {
                    debug!(?level, ?suite, "installing encryption secrets");
                    let read = read
                        .map(|secret| Seal::from_secret(suite, &secret))
                        .transpose()?;
                    let write = write
                        .map(|secret| Seal::from_secret(suite, &secret))
                        .transpose()?;
                    progress.installs.push(KeyInstall { level, read, write });
                }
                TlsEvent::HandshakeBytes { level, bytes } => {
                    trace!(?level, len = bytes.len(), "handshake bytes from tls");
                    progress.outputs.push((level, bytes));
                }
                TlsEvent::Alert(alert) => {
                    return Err(TransportError::Peer {
                        code: TransportErrorCode::Crypto(alert),
                        frame_type: 0,
                        reason: "tls alert",
                    });
                }
            }
        }

        if status == HandshakeStatus::Complete && !self.complete {
            self.complete = true;
            progress.completed = true;
            debug!("tls handshake complete");
        }
        Ok(progress)
    }

    /// Whether the handshake has completed.
    #[must_use]
    pub const fn is_complete(&self) -> bool {
        self.complete
    }

    /// The peer's transport parameters, once available.
    pub fn peer_params(&mut self) -> Option<Vec<u8>> {
        self.session.peer_transport_params()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;

    /// Minimal scripted provider: hands out queued events and completes
    /// after a fixed number of drive calls.
    struct Scripted {
        events: VecDeque<TlsEvent>,
        handshakes_until_done: usize,
        params: Option<Vec<u8>>,
    }

    impl TlsSession for Scripted {
        fn provide_data(&mut self, _level: EncryptionLevel, _data: &[u8]) {}

        fn do_handshake(&mut self) -> HandshakeStatus {
            if self.handshakes_until_done == 0 {
                HandshakeStatus::Complete
            } else {
                self.handshakes_until_done -= 1;
                HandshakeStatus::InProgress
            }
        }

        fn write_level(&self) -> EncryptionLevel {
            EncryptionLevel::Initial
        }

        fn read_level(&self) -> EncryptionLevel {
            EncryptionLevel::Initial
        }

        fn peer_transport_params(&mut self) -> Option<Vec<u8>> {
            self.params.clone()
        }

        fn set_transport_params(&mut self, params: &[u8]) {
            self.params = Some(params.to_vec());
        }

        fn poll_event(&mut self) -> Option<TlsEvent> {
            self.events.pop_front()
        }
    }

    #[test]
    fn drive_installs_seals_and_reports_completion_once() {
        let mut events = VecDeque::new();
        events.push_back(TlsEvent::Secrets {
            level: EncryptionLevel::Handshake,
            suite: CipherSuite::Aes128Gcm,
            read: Some(vec![0x11; 32]),
            write: Some(vec![0x22; 32]),
        });
        events.push_back(TlsEvent::HandshakeBytes {
            level: EncryptionLevel::Initial,
            bytes: b"server hello".to_vec(),
        });

        let mut bridge = TlsBridge::new(Box::new(Scripted {
            events,
            handshakes_until_done: 1,
            params: None,
        }));

        let progress = bridge.drive().unwrap();
        assert_eq!(progress.installs.len(), 1);
        assert!(progress.installs[0].read.is_some());
        assert!(progress.installs[0].write.is_some());
        assert_eq!(progress.outputs.len(), 1);
        assert!(!progress.completed);
        assert!(!bridge.is_complete());

        let progress = bridge.drive().unwrap();
        assert!(progress.completed);
        assert!(bridge.is_complete());

        // Completion is reported exactly once.
        let progress = bridge.drive().unwrap();
        assert!(!progress.completed);
    }

    #[test]
    fn alert_becomes_crypto_error_close() {
        let mut events = VecDeque::new();
        events.push_back(TlsEvent::Alert(0x28));
        let mut bridge = TlsBridge::new(Box::new(Scripted {
            events,
            handshakes_until_done: 10,
            params: None,
        }));
        let err = bridge.drive().unwrap_err();
        assert_eq!(err.close_code(), Some(TransportErrorCode::Crypto(0x28)));
        assert_eq!(err.close_code().unwrap().to_u64(), 0x128);
    }
}
