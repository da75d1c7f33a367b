//! Socket context: connection demultiplexing and the single-threaded
//! tick loop.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{Receiver, Sender, channel};
use std::time::{Duration, SystemTime};

use tracing::{debug, info, trace, warn};

use super::buffer::BufferPool;
use super::cid::{ConnectionId, LOCAL_CID_LEN, MAX_CID_LEN};
use super::connection::{Connection, ConnectionConfig, ConnectionEvent, MAX_DATAGRAM_SIZE};
use super::error::TransportError;
use super::socket::SocketBinding;
use super::stream::{StreamId, StreamKind};
use super::tls::TlsConfig;

/// Handle value identifying one connection on its endpoint.
pub type ConnectionHandle = u64;

/// Longest the loop sleeps when no timer is due sooner; bounds command
/// latency from application threads.
const MAX_TICK: Duration = Duration::from_millis(25);

/// Commands posted by application threads.
///
/// The loop is the single writer of connection state; these are the
/// only way in.
#[derive(Debug)]
pub enum Command {
    /// Open a locally initiated stream.
    OpenStream {
        /// Target connection.
        conn: ConnectionHandle,
        /// Stream kind to open.
        kind: StreamKind,
    },
    /// Queue stream data.
    StreamSend {
        /// Target connection.
        conn: ConnectionHandle,
        /// Target stream.
        stream: StreamId,
        /// Bytes to queue.
        data: Vec<u8>,
    },
    /// Finish the send side of a stream.
    FinishStream {
        /// Target connection.
        conn: ConnectionHandle,
        /// Target stream.
        stream: StreamId,
    },
    /// Reset the send side of a stream.
    ResetStream {
        /// Target connection.
        conn: ConnectionHandle,
        /// Target stream.
        stream: StreamId,
        /// Application error code.
        code: u64,
    },
    /// Ask the peer to stop sending.
    StopSending {
        /// Target connection.
        conn: ConnectionHandle,
        /// Target stream.
        stream: StreamId,
        /// Application error code.
        code: u64,
    },
    /// Close the connection.
    Close {
        /// Target connection.
        conn: ConnectionHandle,
        /// Application error code.
        code: u64,
        /// Reason phrase.
        reason: Vec<u8>,
    },
}

/// Events the loop surfaces to the application.
#[derive(Debug)]
pub enum EndpointEvent {
    /// A server endpoint accepted a new connection.
    Accepted {
        /// Handle of the new connection.
        conn: ConnectionHandle,
    },
    /// A connection-level event.
    Connection {
        /// Source connection.
        conn: ConnectionHandle,
        /// The event itself.
        event: ConnectionEvent,
    },
    /// Answer to [`Command::OpenStream`].
    StreamReady {
        /// Source connection.
        conn: ConnectionHandle,
        /// The freshly opened stream.
        stream: StreamId,
    },
    /// Bytes delivered on a stream.
    StreamData {
        /// Source connection.
        conn: ConnectionHandle,
        /// Source stream.
        stream: StreamId,
        /// Contiguous delivered bytes.
        data: Vec<u8>,
    },
}

/// Cloneable handle for application threads.
#[derive(Debug, Clone)]
pub struct EndpointHandle {
    commands: Sender<Command>,
    shutdown: Arc<AtomicBool>,
}

impl EndpointHandle {
    /// Post a command to the loop.
    pub fn send(&self, command: Command) {
        let _ = self.commands.send(command);
    }

    /// Ask the loop to drain and exit at its next wake-up.
    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::Release);
    }
}

/// Endpoint configuration.
pub struct EndpointConfig {
    /// Per-connection tunables.
    pub connection: ConnectionConfig,
    /// TLS session factory.
    pub tls: Box<dyn TlsConfig>,
    /// Whether unknown Initial packets create server connections.
    pub accept_connections: bool,
}

/// Owns the UDP socket and every connection multiplexed over it.
pub struct Endpoint {
    socket: SocketBinding,
    pool: BufferPool,
    config: EndpointConfig,
    connections: HashMap<ConnectionHandle, Connection>,
    peers: HashMap<ConnectionHandle, SocketAddr>,
    by_addr: HashMap<SocketAddr, ConnectionHandle>,
    next_handle: ConnectionHandle,
    commands_tx: Sender<Command>,
    commands_rx: Receiver<Command>,
    events_tx: Sender<EndpointEvent>,
    events_rx: Option<Receiver<EndpointEvent>>,
    shutdown: Arc<AtomicBool>,
}

impl Endpoint {
    /// Bind a datagram socket and set up the context.
    pub fn bind(addr: SocketAddr, config: EndpointConfig) -> Result<Self, TransportError> {
        let socket = SocketBinding::bind(addr)?;
        let (commands_tx, commands_rx) = channel();
        let (events_tx, events_rx) = channel();
        info!(%addr, "endpoint bound");
        Ok(Self {
            socket,
            pool: BufferPool::new(2048, 64),
            config,
            connections: HashMap::new(),
            peers: HashMap::new(),
            by_addr: HashMap::new(),
            next_handle: 0,
            commands_tx,
            commands_rx,
            events_tx,
            events_rx: Some(events_rx),
            shutdown: Arc::new(AtomicBool::new(false)),
        })
    }

    /// Handle for application threads.
    #[must_use]
    pub fn handle(&self) -> EndpointHandle {
        EndpointHandle {
            commands: self.commands_tx.clone(),
            shutdown: Arc::clone(&self.shutdown),
        }
    }

    /// Take the event receiver; callable once.
    pub fn take_events(&mut self) -> Option<Receiver<EndpointEvent>> {
        self.events_rx.take()
    }

    /// Local socket address.
    pub fn local_addr(&self) -> Result<SocketAddr, TransportError> {
        Ok(self.socket.local_addr()?)
    }

    /// Open a client connection toward `addr`. The application's
    /// intended server name is threaded into the TLS session here.
    pub fn connect(
        &mut self,
        addr: SocketAddr,
        server_name: &str,
    ) -> Result<ConnectionHandle, TransportError> {
        let session = self.config.tls.new_client_session(server_name);
        let conn = Connection::client(self.config.connection.clone(), session)?;
        let handle = self.register(conn, addr);
        debug!(%addr, server_name, handle, "client connection created");
        Ok(handle)
    }

    fn register(&mut self, conn: Connection, addr: SocketAddr) -> ConnectionHandle {
        let handle = self.next_handle;
        self.next_handle += 1;
        self.connections.insert(handle, conn);
        self.peers.insert(handle, addr);
        self.by_addr.insert(addr, handle);
        handle
    }

    /// Run the cooperative loop until shutdown. The loop is the single
    /// writer of all connection state.
    pub fn run(&mut self) -> Result<(), TransportError> {
        let mut recv_buf = self.pool.acquire();
        loop {
            if self.shutdown.load(Ordering::Acquire) {
                debug!("shutdown token observed; draining loop");
                break;
            }

            let now = SystemTime::now();
            let wait = self.next_wakeup(now);
            self.socket.set_read_timeout(Some(wait))?;

            match self.socket.recv_from(recv_buf.as_mut_slice()) {
                Ok((len, peer)) => {
                    recv_buf.set_len(len);
                    let now = SystemTime::now();
                    self.dispatch_datagram(now, len, recv_buf.as_mut_slice(), peer);
                }
                Err(err) if err.is_timeout() => {}
                Err(err) => {
                    warn!(%err, "socket receive failed");
                }
            }

            let now = SystemTime::now();
            self.drain_commands(now);
            self.fire_timeouts(now);
            self.transmit_all(now);
            self.pump_events();
            self.collect_closed();
        }

        // Cancellation: pending receives are dropped, connections close.
        for conn in self.connections.values_mut() {
            let now = SystemTime::now();
            conn.close(now, 0, b"endpoint shutdown");
        }
        self.transmit_all(SystemTime::now());
        Ok(())
    }

    /// Earliest wakeup across every attached connection, bounded by the
    /// command-latency tick.
    fn next_wakeup(&self, now: SystemTime) -> Duration {
        let mut wait = MAX_TICK;
        for conn in self.connections.values() {
            if let Some(deadline) = conn.next_timeout() {
                let delta = deadline
                    .duration_since(now)
                    .unwrap_or(Duration::from_millis(1));
                wait = wait.min(delta.max(Duration::from_millis(1)));
            }
        }
        wait
    }

    fn dispatch_datagram(
        &mut self,
        now: SystemTime,
        len: usize,
        buf: &mut [u8],
        peer: SocketAddr,
    ) {
        let datagram = &mut buf[..len];
        let Some(handle) = self.route(datagram, peer) else {
            trace!(%peer, "datagram with no matching connection dropped");
            return;
        };
        if let Some(conn) = self.connections.get_mut(&handle) {
            conn.handle_datagram(now, datagram);
            // The peer's first datagram pins its address for replies.
            self.peers.entry(handle).or_insert(peer);
        }
    }

    fn route(&mut self, datagram: &[u8], peer: SocketAddr) -> Option<ConnectionHandle> {
        if let Some(dcid) = datagram_dcid(datagram) {
            for (&handle, conn) in &self.connections {
                if conn.owns_cid(&dcid) {
                    return Some(handle);
                }
            }
        }
        if let Some(&handle) = self.by_addr.get(&peer) {
            return Some(handle);
        }

        // Unknown long-header Initial packets may start a connection.
        let is_initial = datagram.first().is_some_and(|&b| b & 0xf0 == 0xc0);
        if self.config.accept_connections && is_initial && datagram.len() >= MAX_DATAGRAM_SIZE {
            let session = self.config.tls.new_server_session();
            let conn = Connection::server(self.config.connection.clone(), session);
            let handle = self.register(conn, peer);
            debug!(%peer, handle, "connection accepted");
            let _ = self.events_tx.send(EndpointEvent::Accepted { conn: handle });
            return Some(handle);
        }
        None
    }

    fn drain_commands(&mut self, now: SystemTime) {
        let commands: Vec<Command> = self.commands_rx.try_iter().collect();
        for command in commands {
            self.apply_command(now, command);
        }
    }

    fn apply_command(&mut self, now: SystemTime, command: Command) {
        match command {
            Command::OpenStream { conn, kind } => {
                if let Some(connection) = self.connections.get_mut(&conn) {
                    match connection.open_stream(kind) {
                        Ok(stream) => {
                            let _ = self
                                .events_tx
                                .send(EndpointEvent::StreamReady { conn, stream });
                        }
                        Err(err) => warn!(conn, %err, "open stream failed"),
                    }
                }
            }
            Command::StreamSend { conn, stream, data } => {
                if let Some(connection) = self.connections.get_mut(&conn) {
                    if let Err(err) = connection.stream_send(stream, &data) {
                        warn!(conn, %err, "stream send failed");
                    }
                }
            }
            Command::FinishStream { conn, stream } => {
                if let Some(connection) = self.connections.get_mut(&conn) {
                    if let Err(err) = connection.finish_stream(stream) {
                        warn!(conn, %err, "finish stream failed");
                    }
                }
            }
            Command::ResetStream { conn, stream, code } => {
                if let Some(connection) = self.connections.get_mut(&conn) {
                    let _ = connection.reset_stream(stream, code);
                }
            }
            Command::StopSending { conn, stream, code } => {
                if let Some(connection) = self.connections.get_mut(&conn) {
                    let _ = connection.stop_sending(stream, code);
                }
            }
            Command::Close { conn, code, reason } => {
                if let Some(connection) = self.connections.get_mut(&conn) {
                    connection.close(now, code, &reason);
                }
            }
        }
    }

    fn fire_timeouts(&mut self, now: SystemTime) {
        for conn in self.connections.values_mut() {
            if conn.next_timeout().is_some_and(|deadline| deadline <= now) {
                conn.on_timeout(now);
            }
        }
    }

    fn transmit_all(&mut self, now: SystemTime) {
        let mut send_buf = self.pool.acquire();
        let handles: Vec<ConnectionHandle> = self.connections.keys().copied().collect();
        for handle in handles {
            let Some(peer) = self.peers.get(&handle).copied() else {
                continue;
            };
            while let Some(len) = self
                .connections
                .get_mut(&handle)
                .and_then(|conn| conn.poll_transmit(now, send_buf.as_mut_slice()))
            {
                send_buf.set_len(len);
                if let Err(err) = self.socket.send_to(send_buf.as_slice(), peer) {
                    warn!(%err, "datagram send failed");
                    break;
                }
            }
        }
    }

    fn pump_events(&mut self) {
        let handles: Vec<ConnectionHandle> = self.connections.keys().copied().collect();
        for handle in handles {
            loop {
                let Some(conn) = self.connections.get_mut(&handle) else {
                    break;
                };
                let Some(event) = conn.poll_event() else {
                    break;
                };
                match event {
                    ConnectionEvent::StreamReadable(stream) => {
                        // Deliver the readable bytes directly.
                        if let Ok(data) = conn.stream_recv(stream, usize::MAX) {
                            if !data.is_empty() {
                                let _ = self.events_tx.send(EndpointEvent::StreamData {
                                    conn: handle,
                                    stream,
                                    data,
                                });
                            }
                        }
                    }
                    other => {
                        let _ = self.events_tx.send(EndpointEvent::Connection {
                            conn: handle,
                            event: other,
                        });
                    }
                }
            }
        }
    }

    fn collect_closed(&mut self) {
        let closed: Vec<ConnectionHandle> = self
            .connections
            .iter()
            .filter(|(_, conn)| conn.is_closed())
            .map(|(&handle, _)| handle)
            .collect();
        for handle in closed {
            debug!(handle, "connection detached");
            self.connections.remove(&handle);
            if let Some(addr) = self.peers.remove(&handle) {
                self.by_addr.remove(&addr);
            }
        }
    }
}

/// Extract the destination connection ID from a datagram's first packet.
fn datagram_dcid(datagram: &[u8]) -> Option<ConnectionId> {
    let first = *datagram.first()?;
    if first & 0x80 != 0 {
        let len = usize::from(*datagram.get(5)?);
        if len > MAX_CID_LEN {
            return None;
        }
        ConnectionId::from_slice(datagram.get(6..6 + len)?)
    } else {
        ConnectionId::from_slice(datagram.get(1..1 + LOCAL_CID_LEN)?)
    }
}
