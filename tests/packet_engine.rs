//! Two connections over a lossy, reordering link: everything must still
//! arrive exactly once.

mod common;

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use quiclet::transport::{
    Connection, ConnectionConfig, ConnectionState, StreamKind, TransportParams,
};

#[derive(Default)]
struct Lcg(u64);

impl Lcg {
    fn next(&mut self) -> u64 {
        const A: u64 = 6364136223846793005;
        const C: u64 = 1442695040888963407;
        self.0 = self.0.wrapping_mul(A).wrapping_add(C);
        self.0
    }
}

struct SimPacket {
    to: usize,
    bytes: Vec<u8>,
    deliver_at: SystemTime,
}

struct SimLink {
    in_flight: Vec<SimPacket>,
    rng: Lcg,
    drop_rate: u64,
    delay_steps: u64,
    step_duration: Duration,
}

impl SimLink {
    fn new(seed: u64, drop_rate: u64, delay_steps: u64, step_duration: Duration) -> Self {
        Self {
            in_flight: Vec::new(),
            rng: Lcg(seed),
            drop_rate,
            delay_steps,
            step_duration,
        }
    }

    fn send(&mut self, now: SystemTime, to: usize, bytes: Vec<u8>) {
        if self.rng.next() % 100 < self.drop_rate {
            return;
        }
        let jitter = (self.rng.next() % self.delay_steps.max(1)) + 1;
        self.in_flight.push(SimPacket {
            to,
            bytes,
            deliver_at: now + self.step_duration * (jitter as u32),
        });
    }

    fn deliver<F>(&mut self, now: SystemTime, mut handler: F)
    where
        F: FnMut(usize, Vec<u8>),
    {
        let mut ready = Vec::new();
        let mut remaining = Vec::new();
        for packet in self.in_flight.drain(..) {
            if packet.deliver_at <= now {
                ready.push(packet);
            } else {
                remaining.push(packet);
            }
        }
        self.in_flight = remaining;
        ready.sort_by_key(|_| self.rng.next());
        for packet in ready {
            handler(packet.to, packet.bytes);
        }
    }
}

fn sim_config() -> ConnectionConfig {
    ConnectionConfig {
        params: TransportParams {
            max_idle_timeout: 60_000,
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

fn drain_into_link(now: SystemTime, conn: &mut Connection, link: &mut SimLink, to: usize) {
    let mut buf = [0u8; 1500];
    while let Some(len) = conn.poll_transmit(now, &mut buf) {
        link.send(now, to, buf[..len].to_vec());
    }
}

#[test]
fn transfer_survives_loss_and_reordering() {
    let base = UNIX_EPOCH + Duration::from_secs(10_000);
    let step = Duration::from_millis(5);
    let mut link = SimLink::new(0xfeed_beef, 10, 3, step);

    let mut client = Connection::client(sim_config(), common::client_session()).expect("client");
    let mut server = Connection::server(sim_config(), common::server_session());

    let payload: Vec<u8> = (0..40_000usize).map(|idx| (idx % 239) as u8).collect();
    let mut stream = None;
    let mut received = Vec::new();
    let mut done_step = None;

    let mut now = base;
    for step_idx in 0..6_000 {
        for (conn, label) in [(&mut client, "client"), (&mut server, "server")] {
            if conn.next_timeout().is_some_and(|deadline| deadline <= now) {
                conn.on_timeout(now);
            }
            assert_ne!(
                conn.state(),
                ConnectionState::Closed,
                "{label} died at step {step_idx}"
            );
        }

        // Once established, push the whole payload down one stream.
        if stream.is_none() && client.state() == ConnectionState::Connected {
            let id = client.open_stream(StreamKind::Uni).expect("open stream");
            client.stream_send(id, &payload).expect("queue payload");
            client.finish_stream(id).expect("finish");
            stream = Some(id);
        }

        drain_into_link(now, &mut client, &mut link, 1);
        drain_into_link(now, &mut server, &mut link, 0);

        link.deliver(now, |to, mut bytes| {
            if to == 0 {
                client.handle_datagram(now, &mut bytes);
            } else {
                server.handle_datagram(now, &mut bytes);
            }
        });

        if let Some(id) = stream {
            loop {
                let chunk = server.stream_recv(id, 8 * 1024).unwrap_or_default();
                if chunk.is_empty() {
                    break;
                }
                received.extend_from_slice(&chunk);
            }
            if received.len() == payload.len() && done_step.is_none() {
                done_step = Some(step_idx);
            }
        }

        // A little grace after completion lets the final acks land.
        if done_step.is_some_and(|done| step_idx > done + 100) {
            break;
        }
        now += step;
    }

    assert_eq!(received.len(), payload.len(), "payload incomplete");
    assert_eq!(received, payload);
    assert_eq!(server.state(), ConnectionState::Connected);
}

#[test]
fn handshake_completes_despite_first_flight_loss() {
    let base = UNIX_EPOCH + Duration::from_secs(20_000);
    let step = Duration::from_millis(5);
    // Drop everything for the first few steps, then clear up.
    let mut link = SimLink::new(0x5eed, 0, 2, step);

    let mut client = Connection::client(sim_config(), common::client_session()).expect("client");
    let mut server = Connection::server(sim_config(), common::server_session());

    let mut now = base;
    for step_idx in 0..2_000 {
        for conn in [&mut client, &mut server] {
            if conn.next_timeout().is_some_and(|deadline| deadline <= now) {
                conn.on_timeout(now);
            }
        }

        let mut buf = [0u8; 1500];
        while let Some(len) = client.poll_transmit(now, &mut buf) {
            // The first client flight vanishes entirely.
            if step_idx > 0 {
                link.send(now, 1, buf[..len].to_vec());
            }
        }
        while let Some(len) = server.poll_transmit(now, &mut buf) {
            link.send(now, 0, buf[..len].to_vec());
        }

        link.deliver(now, |to, mut bytes| {
            if to == 0 {
                client.handle_datagram(now, &mut bytes);
            } else {
                server.handle_datagram(now, &mut bytes);
            }
        });

        if client.state() == ConnectionState::Connected
            && server.state() == ConnectionState::Connected
        {
            return;
        }
        now += step;
    }
    panic!("handshake never completed after first-flight loss");
}
