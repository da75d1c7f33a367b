//! End-to-end handshake and stream transfer over in-memory datagrams.

mod common;

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use quiclet::transport::{
    Connection, ConnectionConfig, ConnectionEvent, ConnectionState, SpaceId, StreamId, StreamKind,
    TransportParams,
};

fn config() -> ConnectionConfig {
    ConnectionConfig {
        params: TransportParams {
            max_idle_timeout: 30_000,
            initial_max_data: 1 << 20,
            initial_max_stream_data_bidi_local: 1 << 16,
            initial_max_stream_data_bidi_remote: 1 << 16,
            initial_max_stream_data_uni: 1 << 16,
            initial_max_streams_bidi: 8,
            initial_max_streams_uni: 8,
            active_connection_id_limit: 4,
            ..TransportParams::default()
        },
    }
}

/// Shuttle every pending datagram in both directions once.
fn pump(now: SystemTime, client: &mut Connection, server: &mut Connection) -> bool {
    let mut moved = false;
    let mut buf = [0u8; 1500];
    while let Some(len) = client.poll_transmit(now, &mut buf) {
        let mut datagram = buf[..len].to_vec();
        server.handle_datagram(now, &mut datagram);
        moved = true;
    }
    while let Some(len) = server.poll_transmit(now, &mut buf) {
        let mut datagram = buf[..len].to_vec();
        client.handle_datagram(now, &mut datagram);
        moved = true;
    }
    moved
}

fn establish(now: SystemTime) -> (Connection, Connection) {
    let mut client = Connection::client(config(), common::client_session()).expect("client");
    let mut server = Connection::server(config(), common::server_session());
    for _ in 0..20 {
        if !pump(now, &mut client, &mut server)
            && client.state() == ConnectionState::Connected
            && server.state() == ConnectionState::Connected
        {
            break;
        }
    }
    (client, server)
}

fn drain_events(conn: &mut Connection) -> Vec<ConnectionEvent> {
    let mut events = Vec::new();
    while let Some(event) = conn.poll_event() {
        events.push(event);
    }
    events
}

#[test]
fn handshake_discards_spaces_and_carries_first_stream_byte() {
    let now = UNIX_EPOCH + Duration::from_secs(1_000);
    let (mut client, mut server) = establish(now);

    assert_eq!(client.state(), ConnectionState::Connected);
    assert_eq!(server.state(), ConnectionState::Connected);

    // Initial spaces die with the handshake key installs, Handshake
    // spaces with confirmation.
    assert!(client.is_space_discarded(SpaceId::Initial));
    assert!(server.is_space_discarded(SpaceId::Initial));
    assert!(client.is_space_discarded(SpaceId::Handshake));
    assert!(server.is_space_discarded(SpaceId::Handshake));

    let client_events = drain_events(&mut client);
    assert!(client_events.contains(&ConnectionEvent::HandshakeComplete));

    // First application bytes ride a STREAM frame at offset zero.
    let stream = client.open_stream(StreamKind::Bidi).expect("open stream");
    client.stream_send(stream, b"first byte ever").unwrap();
    for _ in 0..10 {
        if !pump(now, &mut client, &mut server) {
            break;
        }
    }

    let server_events = drain_events(&mut server);
    assert!(server_events.contains(&ConnectionEvent::StreamOpened(stream)));
    assert!(server_events.contains(&ConnectionEvent::StreamReadable(stream)));
    let data = server.stream_recv(stream, 64).unwrap();
    assert_eq!(data, b"first byte ever");
}

#[test]
fn bidirectional_echo_with_fin() {
    let now = UNIX_EPOCH + Duration::from_secs(2_000);
    let (mut client, mut server) = establish(now);

    let stream = client.open_stream(StreamKind::Bidi).expect("open stream");
    client.stream_send(stream, b"ping").unwrap();
    client.finish_stream(stream).unwrap();
    for _ in 0..10 {
        if !pump(now, &mut client, &mut server) {
            break;
        }
    }

    assert_eq!(server.stream_recv(stream, 64).unwrap(), b"ping");
    server.stream_send(stream, b"pong").unwrap();
    server.finish_stream(stream).unwrap();
    for _ in 0..10 {
        if !pump(now, &mut client, &mut server) {
            break;
        }
    }
    assert_eq!(client.stream_recv(stream, 64).unwrap(), b"pong");
}

#[test]
fn bulk_transfer_exercises_flow_credit() {
    let now = UNIX_EPOCH + Duration::from_secs(3_000);
    let (mut client, mut server) = establish(now);

    // Four times the initial stream window forces MAX_STREAM_DATA
    // updates along the way.
    let total: usize = 4 * (1 << 16);
    let payload: Vec<u8> = (0..total).map(|idx| (idx % 251) as u8).collect();

    let stream = client.open_stream(StreamKind::Uni).expect("open stream");
    client.stream_send(stream, &payload).unwrap();
    client.finish_stream(stream).unwrap();

    let mut received = Vec::new();
    let mut clock = now;
    for _ in 0..400 {
        let moved = pump(clock, &mut client, &mut server);
        loop {
            let chunk = server.stream_recv(stream, 16 * 1024).unwrap_or_default();
            if chunk.is_empty() {
                break;
            }
            received.extend_from_slice(&chunk);
        }
        if received.len() == total && !moved {
            break;
        }
        clock += Duration::from_millis(5);
    }
    assert_eq!(received.len(), total);
    assert_eq!(received, payload);
}

#[test]
fn local_close_drains_the_peer() {
    let now = UNIX_EPOCH + Duration::from_secs(4_000);
    let (mut client, mut server) = establish(now);
    drain_events(&mut client);
    drain_events(&mut server);

    client.close(now, 42, b"bye");
    assert_eq!(client.state(), ConnectionState::Closing);
    pump(now, &mut client, &mut server);

    assert_eq!(server.state(), ConnectionState::Draining);
    let events = drain_events(&mut server);
    assert!(events.contains(&ConnectionEvent::Closed {
        error_code: 42,
        remote: true
    }));

    // Draining peers go quiet; the close timer finishes both sides.
    let mut buf = [0u8; 1500];
    assert!(server.poll_transmit(now, &mut buf).is_none());
    let deadline = server.next_timeout().expect("drain timer");
    server.on_timeout(deadline);
    assert_eq!(server.state(), ConnectionState::Closed);

    let deadline = client.next_timeout().expect("close timer");
    client.on_timeout(deadline);
    assert_eq!(client.state(), ConnectionState::Closed);
}

#[test]
fn stream_reset_reaches_the_application() {
    let now = UNIX_EPOCH + Duration::from_secs(5_000);
    let (mut client, mut server) = establish(now);

    let stream = client.open_stream(StreamKind::Uni).expect("open stream");
    client.stream_send(stream, b"partial").unwrap();
    pump(now, &mut client, &mut server);
    drain_events(&mut server);

    client.reset_stream(stream, 99).unwrap();
    for _ in 0..5 {
        if !pump(now, &mut client, &mut server) {
            break;
        }
    }

    let events = drain_events(&mut server);
    assert!(events.contains(&ConnectionEvent::StreamReset(stream, 99)));
    assert!(server.stream_recv(stream, 64).is_err());
}

#[test]
fn duplicate_datagrams_have_no_net_effect() {
    let now = UNIX_EPOCH + Duration::from_secs(6_000);
    let (mut client, mut server) = establish(now);

    let stream = client.open_stream(StreamKind::Uni).expect("open stream");
    client.stream_send(stream, b"once").unwrap();

    let mut buf = [0u8; 1500];
    let len = client.poll_transmit(now, &mut buf).expect("stream datagram");
    let original = buf[..len].to_vec();

    let mut first = original.clone();
    server.handle_datagram(now, &mut first);
    let mut second = original;
    server.handle_datagram(now, &mut second);

    drain_events(&mut server);
    assert_eq!(server.stream_recv(stream, 64).unwrap(), b"once");
    assert_eq!(server.stream_recv(stream, 64).unwrap(), b"");
}

#[test]
fn streams_blocked_until_peer_credit() {
    let now = UNIX_EPOCH + Duration::from_secs(7_000);
    let (mut client, mut server) = establish(now);

    // Exhaust the peer's bidi stream credit.
    let mut opened = Vec::new();
    loop {
        match client.open_stream(StreamKind::Bidi) {
            Ok(id) => opened.push(id),
            Err(_) => break,
        }
    }
    assert_eq!(opened.len(), 8);

    // Touch every stream so the server sees them and replenishes the
    // stream-count window.
    for &id in &opened {
        client.stream_send(id, b"x").unwrap();
        client.finish_stream(id).unwrap();
    }
    let mut clock = now;
    for _ in 0..40 {
        let moved = pump(clock, &mut client, &mut server);
        for &id in &opened {
            let _ = server.stream_recv(id, 16);
        }
        if !moved {
            break;
        }
        clock += Duration::from_millis(5);
    }

    // MAX_STREAMS credit arrived; opening works again.
    assert!(client.open_stream(StreamKind::Bidi).is_ok());
}

#[test]
fn idle_timeout_uses_negotiated_minimum() {
    let now = UNIX_EPOCH + Duration::from_secs(8_000);
    let mut client_config = config();
    client_config.params.max_idle_timeout = 100;
    let mut server_config = config();
    server_config.params.max_idle_timeout = 5_000;

    let mut client = Connection::client(client_config, common::client_session()).unwrap();
    let mut server = Connection::server(server_config, common::server_session());
    for _ in 0..20 {
        if !pump(now, &mut client, &mut server) {
            break;
        }
    }
    assert_eq!(client.state(), ConnectionState::Connected);

    // 101ms of silence trips the 100ms side without a close frame.
    let later = now + Duration::from_millis(101);
    client.on_timeout(later);
    assert_eq!(client.state(), ConnectionState::Closed);
    let mut buf = [0u8; 1500];
    assert!(client.poll_transmit(later, &mut buf).is_none());
}

#[test]
fn stop_sending_triggers_peer_reset() {
    let now = UNIX_EPOCH + Duration::from_secs(9_000);
    let (mut client, mut server) = establish(now);

    let stream = client.open_stream(StreamKind::Bidi).expect("open stream");
    client.stream_send(stream, b"unwanted").unwrap();
    for _ in 0..5 {
        if !pump(now, &mut client, &mut server) {
            break;
        }
    }
    drain_events(&mut server);

    server.stop_sending(stream, 17).unwrap();
    for _ in 0..5 {
        if !pump(now, &mut client, &mut server) {
            break;
        }
    }

    // The client honored STOP_SENDING with a RESET_STREAM.
    let events = drain_events(&mut server);
    assert!(events.contains(&ConnectionEvent::StreamReset(stream, 17)));
}

#[test]
fn unknown_stream_handles_are_rejected() {
    let now = UNIX_EPOCH + Duration::from_secs(10_000);
    let (mut client, _server) = establish(now);
    let bogus = StreamId::new(
        quiclet::transport::Role::Client,
        StreamKind::Bidi,
        999,
    );
    assert!(client.stream_send(bogus, b"x").is_err());
}
