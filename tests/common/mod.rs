//! Shared scripted TLS provider for integration tests.
//!
//! Implements just enough handshake shape over the CRYPTO streams to
//! exercise the engine: ClientHello and ServerHello at the Initial
//! level (carrying transport parameters), a server flight and client
//! finished at the Handshake level, with deterministic secrets
//! installed at each step.

use quiclet::transport::{
    CipherSuite, EncryptionLevel, HandshakeStatus, TlsConfig, TlsEvent, TlsSession,
};
use std::collections::VecDeque;

const MSG_CLIENT_HELLO: u8 = 0x01;
const MSG_SERVER_HELLO: u8 = 0x02;
const MSG_SERVER_FLIGHT: u8 = 0x03;
const MSG_CLIENT_FINISHED: u8 = 0x04;

const HS_CLIENT_WRITE: [u8; 32] = [0xa1; 32];
const HS_SERVER_WRITE: [u8; 32] = [0xa2; 32];
const APP_CLIENT_WRITE: [u8; 32] = [0xb1; 32];
const APP_SERVER_WRITE: [u8; 32] = [0xb2; 32];

fn message(tag: u8, body: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(3 + body.len());
    out.push(tag);
    out.extend_from_slice(&(body.len() as u16).to_be_bytes());
    out.extend_from_slice(body);
    out
}

#[derive(Default)]
struct Inbox {
    bytes: Vec<u8>,
}

impl Inbox {
    fn next_message(&mut self) -> Option<(u8, Vec<u8>)> {
        if self.bytes.len() < 3 {
            return None;
        }
        let len = usize::from(u16::from_be_bytes([self.bytes[1], self.bytes[2]]));
        if self.bytes.len() < 3 + len {
            return None;
        }
        let tag = self.bytes[0];
        let body = self.bytes[3..3 + len].to_vec();
        self.bytes.drain(..3 + len);
        Some((tag, body))
    }
}

/// One scripted session; client or server depending on construction.
pub struct ScriptedSession {
    is_client: bool,
    hello_sent: bool,
    complete: bool,
    events: VecDeque<TlsEvent>,
    initial_inbox: Inbox,
    handshake_inbox: Inbox,
    local_params: Vec<u8>,
    peer_params: Option<Vec<u8>>,
    write_level: EncryptionLevel,
}

impl ScriptedSession {
    fn new(is_client: bool) -> Self {
        Self {
            is_client,
            hello_sent: false,
            complete: false,
            events: VecDeque::new(),
            initial_inbox: Inbox::default(),
            handshake_inbox: Inbox::default(),
            local_params: Vec::new(),
            peer_params: None,
            write_level: EncryptionLevel::Initial,
        }
    }

    fn secrets(level: EncryptionLevel, is_client: bool) -> TlsEvent {
        let (client_write, server_write) = match level {
            EncryptionLevel::Handshake => (HS_CLIENT_WRITE, HS_SERVER_WRITE),
            _ => (APP_CLIENT_WRITE, APP_SERVER_WRITE),
        };
        let (write, read) = if is_client {
            (client_write, server_write)
        } else {
            (server_write, client_write)
        };
        TlsEvent::Secrets {
            level,
            suite: CipherSuite::Aes128Gcm,
            read: Some(read.to_vec()),
            write: Some(write.to_vec()),
        }
    }

    fn client_step(&mut self) {
        if !self.hello_sent {
            self.hello_sent = true;
            self.events.push_back(TlsEvent::HandshakeBytes {
                level: EncryptionLevel::Initial,
                bytes: message(MSG_CLIENT_HELLO, &self.local_params.clone()),
            });
        }
        while let Some((tag, body)) = self.initial_inbox.next_message() {
            if tag == MSG_SERVER_HELLO {
                self.peer_params = Some(body);
                self.events
                    .push_back(Self::secrets(EncryptionLevel::Handshake, true));
                self.write_level = EncryptionLevel::Handshake;
            }
        }
        while let Some((tag, _)) = self.handshake_inbox.next_message() {
            if tag == MSG_SERVER_FLIGHT && !self.complete {
                self.events
                    .push_back(Self::secrets(EncryptionLevel::Application, true));
                self.events.push_back(TlsEvent::HandshakeBytes {
                    level: EncryptionLevel::Handshake,
                    bytes: message(MSG_CLIENT_FINISHED, &[]),
                });
                self.complete = true;
            }
        }
    }

    fn server_step(&mut self) {
        while let Some((tag, body)) = self.initial_inbox.next_message() {
            if tag == MSG_CLIENT_HELLO && !self.hello_sent {
                self.hello_sent = true;
                self.peer_params = Some(body);
                self.events.push_back(TlsEvent::HandshakeBytes {
                    level: EncryptionLevel::Initial,
                    bytes: message(MSG_SERVER_HELLO, &self.local_params.clone()),
                });
                self.events
                    .push_back(Self::secrets(EncryptionLevel::Handshake, false));
                self.events.push_back(TlsEvent::HandshakeBytes {
                    level: EncryptionLevel::Handshake,
                    bytes: message(MSG_SERVER_FLIGHT, &[]),
                });
                self.events
                    .push_back(Self::secrets(EncryptionLevel::Application, false));
                self.write_level = EncryptionLevel::Handshake;
            }
        }
        while let Some((tag, _)) = self.handshake_inbox.next_message() {
            if tag == MSG_CLIENT_FINISHED {
                self.complete = true;
            }
        }
    }
}

impl TlsSession for ScriptedSession {
    fn provide_data(&mut self, level: EncryptionLevel, data: &[u8]) {
        match level {
            EncryptionLevel::Initial => self.initial_inbox.bytes.extend_from_slice(data),
            EncryptionLevel::Handshake => self.handshake_inbox.bytes.extend_from_slice(data),
            _ => {}
        }
    }

    fn do_handshake(&mut self) -> HandshakeStatus {
        if self.is_client {
            self.client_step();
        } else {
            self.server_step();
        }
        if self.complete {
            HandshakeStatus::Complete
        } else {
            HandshakeStatus::InProgress
        }
    }

    fn write_level(&self) -> EncryptionLevel {
        self.write_level
    }

    fn read_level(&self) -> EncryptionLevel {
        self.write_level
    }

    fn peer_transport_params(&mut self) -> Option<Vec<u8>> {
        self.peer_params.clone()
    }

    fn set_transport_params(&mut self, params: &[u8]) {
        self.local_params = params.to_vec();
    }

    fn poll_event(&mut self) -> Option<TlsEvent> {
        self.events.pop_front()
    }
}

/// Factory handing out scripted sessions.
pub struct ScriptedTls;

impl TlsConfig for ScriptedTls {
    fn new_client_session(&self, _server_name: &str) -> Box<dyn TlsSession> {
        Box::new(ScriptedSession::new(true))
    }

    fn new_server_session(&self) -> Box<dyn TlsSession> {
        Box::new(ScriptedSession::new(false))
    }
}

/// Convenience constructors for direct connection-level tests.
#[must_use]
pub fn client_session() -> Box<dyn TlsSession> {
    ScriptedTls.new_client_session("test.example")
}

/// See [`client_session`].
#[must_use]
pub fn server_session() -> Box<dyn TlsSession> {
    ScriptedTls.new_server_session()
}
