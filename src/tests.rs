//! End-to-end exercises of the protocol core over an in-memory wire with
//! virtual time. The harness shuttles transmit operations between two
//! endpoints, optionally dropping datagrams, so every reliability path runs
//! deterministically without a socket.

use std::io;
use std::net::SocketAddr;

use slog::{Drain, Logger};
use slog_term;

use connection::{ConnectionHandle, State};
use endpoint::{Config, Endpoint, Event, EventError, Io, RmaFlags, SendError, SendFlags};
use rma::{Access, RmaHandle};
use {Attribute, Status};

fn logger() -> Logger {
    let decorator = slog_term::PlainSyncDecorator::new(io::stderr());
    let drain = slog_term::FullFormat::new(decorator)
        .build()
        .filter_level(::slog::Level::Warning)
        .fuse();
    Logger::root(drain, o!())
}

/// Deterministic byte generator for test payloads.
fn pattern(seed: u64, len: usize) -> Vec<u8> {
    let mut state = seed.wrapping_mul(0x9e37_79b9_7f4a_7c15) | 1;
    (0..len)
        .map(|_| {
            state ^= state << 13;
            state ^= state >> 7;
            state ^= state << 17;
            state as u8
        })
        .collect()
}

struct Pair {
    client: Endpoint,
    server: Endpoint,
    client_addr: SocketAddr,
    server_addr: SocketAddr,
    time: u64,
    blackhole: bool,
    /// Called per datagram (towards_server, payload); true drops it.
    loss: Option<Box<dyn FnMut(bool, &[u8]) -> bool>>,
}

impl Pair {
    fn new(client_cfg: Config, server_cfg: Config) -> Self {
        let log = logger();
        Self {
            client: Endpoint::new(log.new(o!("side" => "client")), client_cfg),
            server: Endpoint::new(log.new(o!("side" => "server")), server_cfg),
            client_addr: "10.0.0.1:7001".parse().unwrap(),
            server_addr: "10.0.0.2:7002".parse().unwrap(),
            time: 1_000,
            blackhole: false,
            loss: None,
        }
    }

    fn default() -> Self {
        Self::new(Config::default(), Config::default())
    }

    /// Advance virtual time and run both progress loops, shuttling datagrams
    /// until the wire is quiet.
    fn drive_rounds(&mut self, rounds: usize, step: u64) {
        for _ in 0..rounds {
            self.time += step;
            let now = self.time;
            self.client.progress(now);
            self.server.progress(now);
            self.shuttle();
        }
    }

    fn drive(&mut self) {
        self.drive_rounds(40, 5_000);
    }

    fn shuttle(&mut self) {
        loop {
            let mut moved = false;
            while let Some(Io::Transmit {
                destination,
                packet,
            }) = self.client.poll_io()
            {
                moved = true;
                if self.blackhole {
                    continue;
                }
                let dropped = match self.loss {
                    Some(ref mut f) => f(true, &packet),
                    None => false,
                };
                if !dropped && destination == self.server_addr {
                    self.server.handle(self.time, self.client_addr, &packet);
                }
            }
            while let Some(Io::Transmit {
                destination,
                packet,
            }) = self.server.poll_io()
            {
                moved = true;
                if self.blackhole {
                    continue;
                }
                let dropped = match self.loss {
                    Some(ref mut f) => f(false, &packet),
                    None => false,
                };
                if !dropped && destination == self.client_addr {
                    self.client.handle(self.time, self.server_addr, &packet);
                }
            }
            if !moved {
                break;
            }
        }
    }

    /// Run the whole handshake and return (client conn, server conn).
    fn establish(&mut self, attribute: Attribute) -> (ConnectionHandle, ConnectionHandle) {
        let ch = self
            .client
            .connect(self.time, self.server_addr, b"", attribute, 77, None)
            .unwrap();
        self.drive();
        let request = self.server.get_event().expect("no connection request");
        let sch = match request {
            Event::ConnectRequest { conn, .. } => conn,
            ref e => panic!("expected a connection request, got {:?}", e),
        };
        self.server.accept(self.time, sch, 88).unwrap();
        self.server.return_event(request);
        self.drive();
        let connected = self.client.get_event().expect("no connect event");
        assert_matches!(
            connected,
            Event::Connect {
                context: 77,
                status: Status::Success,
                ..
            }
        );
        self.client.return_event(connected);
        let accepted = self.server.get_event().expect("no accept event");
        assert_matches!(
            accepted,
            Event::Accept {
                context: 88,
                status: Status::Success,
                ..
            }
        );
        self.server.return_event(accepted);
        (ch, sch)
    }
}

fn drain(ep: &mut Endpoint) -> Vec<Event> {
    let mut out = Vec::new();
    loop {
        match ep.get_event() {
            Ok(ev) => out.push(ev),
            Err(_) => {
                return out;
            }
        }
    }
}

//
// Scenario: reliable-ordered ping/pong with handshake payload
//

#[test]
fn ro_ping_pong() {
    let mut pair = Pair::default();
    let ch = pair
        .client
        .connect(pair.time, pair.server_addr, b"hi", Attribute::Ro, 7, None)
        .unwrap();
    pair.drive();

    let request = pair.server.get_event().unwrap();
    assert_matches!(request, Event::ConnectRequest { attribute: Attribute::Ro, .. });
    assert_eq!(pair.server.event_payload(&request), b"hi");
    let sch = match request {
        Event::ConnectRequest { conn, .. } => conn,
        _ => unreachable!(),
    };
    pair.server.accept(pair.time, sch, 9).unwrap();
    pair.server.return_event(request);
    pair.drive();

    let connected = pair.client.get_event().unwrap();
    assert_matches!(connected, Event::Connect { context: 7, status: Status::Success, .. });
    pair.client.return_event(connected);
    let accepted = pair.server.get_event().unwrap();
    assert_matches!(accepted, Event::Accept { context: 9, status: Status::Success, .. });
    pair.server.return_event(accepted);

    pair.client
        .send(pair.time, ch, b"ping", 1, SendFlags::default())
        .unwrap();
    pair.drive();

    let recv = pair.server.get_event().unwrap();
    assert_matches!(recv, Event::Recv { .. });
    assert_eq!(pair.server.event_payload(&recv), b"ping");
    pair.server.return_event(recv);

    pair.server
        .send(pair.time, sch, b"pong", 2, SendFlags::default())
        .unwrap();
    pair.drive();

    let mut got_pong = false;
    let mut got_send = false;
    for ev in drain(&mut pair.client) {
        match ev {
            Event::Recv { .. } => {
                assert_eq!(pair.client.event_payload(&ev), b"pong");
                got_pong = true;
            }
            Event::Send {
                context: 1,
                status: Status::Success,
                ..
            } => {
                got_send = true;
            }
            ref e => panic!("unexpected event {:?}", e),
        }
        pair.client.return_event(ev);
    }
    assert!(got_pong && got_send);
}

//
// Property: reliable-ordered send completions and receives keep call order
//

#[test]
fn ro_orders_completions_and_receives() {
    let mut pair = Pair::default();
    let (ch, _sch) = pair.establish(Attribute::Ro);
    for i in 0..10u64 {
        let payload = pattern(i, 100 + i as usize);
        pair.client
            .send(pair.time, ch, &payload, i, SendFlags::default())
            .unwrap();
    }
    pair.drive();

    let mut send_contexts = Vec::new();
    for ev in drain(&mut pair.client) {
        match ev {
            Event::Send {
                context,
                status: Status::Success,
                ..
            } => send_contexts.push(context),
            ref e => panic!("unexpected event {:?}", e),
        }
        pair.client.return_event(ev);
    }
    assert_eq!(send_contexts, (0..10).collect::<Vec<u64>>());

    let mut i = 0u64;
    for ev in drain(&mut pair.server) {
        match ev {
            Event::Recv { .. } => {
                assert_eq!(
                    pair.server.event_payload(&ev),
                    &pattern(i, 100 + i as usize)[..]
                );
                i += 1;
            }
            ref e => panic!("unexpected event {:?}", e),
        }
        pair.server.return_event(ev);
    }
    assert_eq!(i, 10);
}

//
// Scenario: reliable-unordered echo under loss delivers exactly once
//

#[test]
fn ru_echo_exactly_once_under_loss() {
    let mut client_cfg = Config::default();
    client_cfg.tx_timeout = 60_000_000;
    let mut server_cfg = Config::default();
    server_cfg.tx_timeout = 60_000_000;
    let mut pair = Pair::new(client_cfg, server_cfg);
    let (ch, sch) = pair.establish(Attribute::Ru);

    // drop every 7th datagram in both directions
    let mut n = 0u64;
    pair.loss = Some(Box::new(move |_, _| {
        n += 1;
        n % 7 == 3
    }));

    const COUNT: u64 = 1000;
    let silent = SendFlags {
        silent: true,
        ..SendFlags::default()
    };
    for i in 0..COUNT {
        pair.client
            .send(pair.time, ch, &i.to_be_bytes(), i, silent)
            .unwrap();
    }

    let mut echoed: Vec<u64> = Vec::new();
    for _ in 0..4000 {
        pair.drive_rounds(1, 10_000);
        for ev in drain(&mut pair.server) {
            if let Event::Recv { .. } = ev {
                let payload = pair.server.event_payload(&ev).to_vec();
                pair.server.send(pair.time, sch, &payload, 0, silent).unwrap();
            }
            pair.server.return_event(ev);
        }
        for ev in drain(&mut pair.client) {
            if let Event::Recv { .. } = ev {
                let mut raw = [0u8; 8];
                raw.copy_from_slice(pair.client.event_payload(&ev));
                echoed.push(u64::from_be_bytes(raw));
            }
            pair.client.return_event(ev);
        }
        if echoed.len() as u64 == COUNT {
            break;
        }
    }

    assert_eq!(echoed.len() as u64, COUNT, "lost echoes");
    let mut sorted = echoed.clone();
    sorted.sort();
    sorted.dedup();
    assert_eq!(sorted.len() as u64, COUNT, "duplicate delivery");
    assert_eq!(sorted, (0..COUNT).collect::<Vec<u64>>());
}

//
// Scenario: fragmented RMA write with completion message
//

#[test]
fn rma_write_sizes() {
    for &len in &[1usize, 4096, 65_535, 1 << 20] {
        let mut pair = Pair::default();
        let (ch, sch) = pair.establish(Attribute::Ro);

        let data = pattern(len as u64, len);
        let local = pair.client.rma_register(data.clone(), Access::read_write());
        let remote = pair.server.rma_register(vec![0; len], Access::read_write());

        // the target ships its handle over the wire, as an application would
        pair.server
            .send(pair.time, sch, remote.as_bytes(), 0, SendFlags::default())
            .unwrap();
        pair.drive();
        let ev = pair.client.get_event().unwrap();
        assert_matches!(ev, Event::Recv { .. });
        let remote_at_client =
            RmaHandle::from_slice(pair.client.event_payload(&ev)).expect("handle did not survive");
        pair.client.return_event(ev);
        for ev in drain(&mut pair.server) {
            pair.server.return_event(ev);
        }

        pair.client
            .rma(
                pair.time,
                ch,
                Some(b"rma-done"),
                &local,
                0,
                &remote_at_client,
                0,
                len as u64,
                42,
                RmaFlags {
                    write: true,
                    ..RmaFlags::default()
                },
            )
            .unwrap();
        pair.drive_rounds(200, 10_000);

        // target sees the completion message after all fragments landed
        let mut saw_completion = false;
        for ev in drain(&mut pair.server) {
            if let Event::Recv { .. } = ev {
                assert_eq!(pair.server.event_payload(&ev), b"rma-done");
                assert_eq!(
                    pair.server.region_bytes(&remote).unwrap(),
                    &data[..],
                    "fragments had not landed before the completion message"
                );
                saw_completion = true;
            }
            pair.server.return_event(ev);
        }
        assert!(saw_completion, "no completion message for len {}", len);

        // initiator sees one SEND-type completion with the rma context
        let mut saw_local = false;
        for ev in drain(&mut pair.client) {
            if let Event::Send {
                context: 42,
                status,
                ..
            } = ev
            {
                assert_eq!(status, Status::Success);
                saw_local = true;
            }
            pair.client.return_event(ev);
        }
        assert!(saw_local, "no local completion for len {}", len);

        // identity on deregistration
        assert_eq!(pair.client.rma_deregister(&local).unwrap(), data);
    }
}

//
// RMA read collects the peer's bytes
//

#[test]
fn rma_read() {
    let mut pair = Pair::default();
    let (ch, _sch) = pair.establish(Attribute::Ru);

    let len = 150_000usize;
    let data = pattern(9, len);
    let remote = pair.server.rma_register(data.clone(), Access::read_write());
    let local = pair.client.rma_register(vec![0; len], Access::read_write());
    let remote_at_client = RmaHandle::from_slice(remote.as_bytes()).unwrap();

    pair.client
        .rma(
            pair.time,
            ch,
            None,
            &local,
            0,
            &remote_at_client,
            0,
            len as u64,
            5,
            RmaFlags {
                read: true,
                ..RmaFlags::default()
            },
        )
        .unwrap();
    pair.drive_rounds(100, 10_000);

    let mut done = false;
    for ev in drain(&mut pair.client) {
        if let Event::Send {
            context: 5,
            status,
            ..
        } = ev
        {
            assert_eq!(status, Status::Success);
            done = true;
        }
        pair.client.return_event(ev);
    }
    assert!(done, "read never completed");
    assert_eq!(pair.client.region_bytes(&local).unwrap(), &data[..]);
}

//
// A fenced RMA lands after the unfenced one it follows
//

#[test]
fn rma_fence() {
    let mut pair = Pair::default();
    let (ch, _sch) = pair.establish(Attribute::Ro);

    let len = 200_000usize;
    let first = pattern(1, len);
    let second = pattern(2, 4096);
    let src_a = pair.client.rma_register(first, Access::read_write());
    let src_b = pair.client.rma_register(second.clone(), Access::read_write());
    let dst = pair.server.rma_register(vec![0; len], Access::read_write());
    let dst_at_client = RmaHandle::from_slice(dst.as_bytes()).unwrap();

    let write = RmaFlags {
        write: true,
        ..RmaFlags::default()
    };
    let fenced = RmaFlags {
        write: true,
        fence: true,
        ..RmaFlags::default()
    };
    pair.client
        .rma(pair.time, ch, None, &src_a, 0, &dst_at_client, 0, len as u64, 1, write)
        .unwrap();
    pair.client
        .rma(pair.time, ch, None, &src_b, 0, &dst_at_client, 0, 4096, 2, fenced)
        .unwrap();
    pair.drive_rounds(200, 10_000);

    let mut statuses = Vec::new();
    for ev in drain(&mut pair.client) {
        if let Event::Send { context, status, .. } = ev {
            statuses.push((context, status));
        }
        pair.client.return_event(ev);
    }
    assert_eq!(statuses, vec![(1, Status::Success), (2, Status::Success)]);
    // the fenced write was ordered after the big one
    assert_eq!(
        &pair.server.region_bytes(&dst).unwrap()[..4096],
        &second[..]
    );
}

//
// An RMA against a region that forbids the access fails with a handle error
//

#[test]
fn rma_access_refused() {
    let mut pair = Pair::default();
    let (ch, _sch) = pair.establish(Attribute::Ro);

    let dst = pair.server.rma_register(
        vec![0; 4096],
        Access {
            remote_read: true,
            remote_write: false,
        },
    );
    let src = pair.client.rma_register(pattern(3, 4096), Access::read_write());
    let dst_at_client = RmaHandle::from_slice(dst.as_bytes()).unwrap();

    pair.client
        .rma(
            pair.time,
            ch,
            None,
            &src,
            0,
            &dst_at_client,
            0,
            4096,
            13,
            RmaFlags {
                write: true,
                ..RmaFlags::default()
            },
        )
        .unwrap();
    pair.drive_rounds(100, 10_000);

    let mut seen = false;
    for ev in drain(&mut pair.client) {
        if let Event::Send { context: 13, status, .. } = ev {
            assert_eq!(status, Status::RmaHandle);
            seen = true;
        }
        pair.client.return_event(ev);
    }
    assert!(seen, "refused rma never completed");
}

//
// Scenario: connect to a black hole times out inside the stated window
//

#[test]
fn connect_timeout() {
    let mut pair = Pair::default();
    pair.blackhole = true;
    let start = pair.time;
    pair.client
        .connect(
            pair.time,
            pair.server_addr,
            b"",
            Attribute::Ro,
            3,
            Some(500_000),
        )
        .unwrap();

    let mut fired_at = None;
    for _ in 0..200 {
        pair.drive_rounds(1, 10_000);
        if let Ok(ev) = pair.client.get_event() {
            assert_matches!(ev, Event::Connect { context: 3, status: Status::Timeout, .. });
            fired_at = Some(pair.time - start);
            pair.client.return_event(ev);
            break;
        }
    }
    let fired_at = fired_at.expect("connect never timed out");
    assert!(
        fired_at >= 500_000 && fired_at <= 1_000_000,
        "timeout fired at {}µs",
        fired_at
    );
}

//
// Scenario: backpressure surfaces ENOBUFS instead of losing messages
//

#[test]
fn backpressure_enobufs() {
    let mut server_cfg = Config::default();
    server_cfg.rx_buf_count = 4;
    let mut client_cfg = Config::default();
    client_cfg.tx_timeout = 60_000_000;
    let mut pair = Pair::new(client_cfg, server_cfg);
    let (ch, _sch) = pair.establish(Attribute::Ro);

    const COUNT: u64 = 20;
    for i in 0..COUNT {
        pair.client
            .send(
                pair.time,
                ch,
                &i.to_be_bytes(),
                i,
                SendFlags {
                    silent: true,
                    ..SendFlags::default()
                },
            )
            .unwrap();
    }
    pair.drive();

    // drain without returning: the pool runs dry underneath the events
    let mut held = Vec::new();
    loop {
        match pair.server.get_event() {
            Ok(ev) => held.push(ev),
            Err(EventError::NoBufs) => {
                break;
            }
            Err(EventError::Again) => {
                pair.drive();
            }
        }
    }
    assert_eq!(held.len(), 4);
    assert_eq!(pair.server.rx_available(), 0);

    // returning events lets the stalled messages through, none lost
    let mut received: Vec<u64> = Vec::new();
    let read = |ep: &Endpoint, ev: &Event| {
        let mut raw = [0u8; 8];
        raw.copy_from_slice(ep.event_payload(ev));
        u64::from_be_bytes(raw)
    };
    for ev in held.drain(..) {
        received.push(read(&pair.server, &ev));
        pair.server.return_event(ev);
    }
    for _ in 0..1000 {
        pair.drive_rounds(1, 10_000);
        for ev in drain(&mut pair.server) {
            received.push(read(&pair.server, &ev));
            pair.server.return_event(ev);
        }
        if received.len() as u64 == COUNT {
            break;
        }
    }
    received.sort();
    assert_eq!(received, (0..COUNT).collect::<Vec<u64>>());
}

//
// Scenario: a dead peer cascades timeouts down a reliable-ordered connection
//

#[test]
fn ro_timeout_cascade() {
    let mut client_cfg = Config::default();
    client_cfg.tx_timeout = 1_000_000;
    let mut pair = Pair::new(client_cfg, Config::default());
    let (ch, _sch) = pair.establish(Attribute::Ro);

    pair.blackhole = true;
    const COUNT: u64 = 100;
    for i in 0..COUNT {
        pair.client
            .send(pair.time, ch, b"doomed", i, SendFlags::default())
            .unwrap();
    }
    pair.drive_rounds(300, 10_000);

    let mut contexts = Vec::new();
    for ev in drain(&mut pair.client) {
        match ev {
            Event::Send { context, status, .. } => {
                assert!(
                    status == Status::Timeout || status == Status::Disconnected,
                    "context {} completed with {:?}",
                    context,
                    status
                );
                contexts.push(context);
            }
            ref e => panic!("unexpected event {:?}", e),
        }
        pair.client.return_event(ev);
    }
    assert_eq!(contexts, (0..COUNT).collect::<Vec<u64>>());
    assert_eq!(pair.client.connection_state(ch), Some(State::Failed));
    assert_matches!(
        pair.client
            .send(pair.time, ch, b"late", 999, SendFlags::default()),
        Err(SendError::Disconnected)
    );
}

//
// Receiver-not-ready surfaces as RNR rather than a plain timeout
//

#[test]
fn rnr_completes_send() {
    let mut server_cfg = Config::default();
    server_cfg.rx_buf_count = 1;
    let mut pair = Pair::new(Config::default(), server_cfg);
    let (ch, _sch) = pair.establish(Attribute::Ru);
    pair.client.set_conn_tx_timeout(ch, Some(400_000));

    pair.client
        .send(pair.time, ch, b"first", 1, SendFlags::default())
        .unwrap();
    pair.drive();
    // hold the only rx slot hostage
    let hostage = pair.server.get_event().unwrap();
    assert_matches!(hostage, Event::Recv { .. });

    pair.client
        .send(pair.time, ch, b"second", 2, SendFlags::default())
        .unwrap();
    pair.drive_rounds(100, 10_000);

    let mut statuses = Vec::new();
    for ev in drain(&mut pair.client) {
        if let Event::Send { context, status, .. } = ev {
            statuses.push((context, status));
        }
        pair.client.return_event(ev);
    }
    assert_eq!(
        statuses,
        vec![(1, Status::Success), (2, Status::Rnr)],
        "second send should fail with receiver-not-ready"
    );
    pair.server.return_event(hostage);
}

//
// Handshake corner cases
//

#[test]
fn duplicate_requests_are_suppressed() {
    let mut pair = Pair::default();
    // drop the first reply so the request is retransmitted
    let mut dropped_one = false;
    pair.loss = Some(Box::new(move |towards_server, _| {
        if !towards_server && !dropped_one {
            dropped_one = true;
            return true;
        }
        false
    }));
    let _ch = pair
        .client
        .connect(pair.time, pair.server_addr, b"", Attribute::Ro, 1, None)
        .unwrap();
    pair.drive_rounds(100, 10_000);

    let mut requests = 0;
    for ev in drain(&mut pair.server) {
        if let Event::ConnectRequest { conn, .. } = ev {
            pair.server.accept(pair.time, conn, 2).unwrap();
            requests += 1;
        }
        pair.server.return_event(ev);
    }
    assert_eq!(requests, 1, "duplicate request surfaced");
    pair.drive_rounds(100, 10_000);
    let connected = drain(&mut pair.client);
    assert_eq!(connected.len(), 1);
    assert_matches!(connected[0], Event::Connect { status: Status::Success, .. });
    for ev in connected {
        pair.client.return_event(ev);
    }
}

#[test]
fn reject_refuses_connection() {
    let mut pair = Pair::default();
    let _ch = pair
        .client
        .connect(pair.time, pair.server_addr, b"", Attribute::Ro, 4, None)
        .unwrap();
    pair.drive();
    let request = pair.server.get_event().unwrap();
    let sch = match request {
        Event::ConnectRequest { conn, .. } => conn,
        ref e => panic!("expected request, got {:?}", e),
    };
    pair.server.reject(sch).unwrap();
    pair.server.return_event(request);
    pair.drive();

    let ev = pair.client.get_event().unwrap();
    assert_matches!(ev, Event::Connect { context: 4, status: Status::Refused, .. });
    pair.client.return_event(ev);
    assert_eq!(pair.server.connection_state(sch), None);
}

#[test]
fn simultaneous_connect_yields_two_connections() {
    let mut pair = Pair::default();
    let a = pair
        .client
        .connect(pair.time, pair.server_addr, b"", Attribute::Ro, 1, None)
        .unwrap();
    let b = pair
        .server
        .connect(pair.time, pair.client_addr, b"", Attribute::Ro, 2, None)
        .unwrap();
    pair.drive();

    let mut server_accepted = None;
    for ev in drain(&mut pair.server) {
        if let Event::ConnectRequest { conn, .. } = ev {
            pair.server.accept(pair.time, conn, 0).unwrap();
            server_accepted = Some(conn);
        }
        pair.server.return_event(ev);
    }
    let mut client_accepted = None;
    for ev in drain(&mut pair.client) {
        if let Event::ConnectRequest { conn, .. } = ev {
            pair.client.accept(pair.time, conn, 0).unwrap();
            client_accepted = Some(conn);
        }
        pair.client.return_event(ev);
    }
    let server_accepted = server_accepted.expect("server saw no request");
    let client_accepted = client_accepted.expect("client saw no request");
    pair.drive();
    for ev in drain(&mut pair.client) {
        pair.client.return_event(ev);
    }
    for ev in drain(&mut pair.server) {
        pair.server.return_event(ev);
    }

    // four independent connections, all usable
    assert_eq!(pair.client.connection_state(a), Some(State::Ready));
    assert_eq!(pair.server.connection_state(b), Some(State::Ready));
    assert_eq!(pair.server.connection_state(server_accepted), Some(State::Ready));
    assert_eq!(pair.client.connection_state(client_accepted), Some(State::Ready));
    assert_ne!(a.0, client_accepted.0);
}

//
// Unreliable traffic and keepalive
//

#[test]
fn uu_send_completes_at_transmit() {
    let mut pair = Pair::default();
    let (ch, _sch) = pair.establish(Attribute::Uu);
    pair.client
        .send(pair.time, ch, b"datagram", 6, SendFlags::default())
        .unwrap();
    pair.drive();

    let ev = pair.client.get_event().unwrap();
    assert_matches!(ev, Event::Send { context: 6, status: Status::Success, .. });
    pair.client.return_event(ev);

    let ev = pair.server.get_event().unwrap();
    assert_matches!(ev, Event::Recv { .. });
    assert_eq!(pair.server.event_payload(&ev), b"datagram");
    pair.server.return_event(ev);
}

#[test]
fn keepalive_fires_and_rearms() {
    let mut pair = Pair::default();
    let (ch, sch) = pair.establish(Attribute::Ro);
    pair.client.set_conn_keepalive(ch, Some(300_000));

    pair.drive_rounds(50, 10_000); // half a second of silence
    let mut fired = 0;
    for ev in drain(&mut pair.client) {
        if let Event::KeepaliveTimedOut { conn } = ev {
            assert_eq!(conn.0, ch.0);
            fired += 1;
        }
        pair.client.return_event(ev);
    }
    assert_eq!(fired, 1, "keepalive should fire exactly once until traffic resumes");

    // traffic from the peer re-arms the timer
    pair.server
        .send(pair.time, sch, b"alive", 0, SendFlags::default())
        .unwrap();
    pair.drive();
    for ev in drain(&mut pair.client) {
        pair.client.return_event(ev);
    }
    for ev in drain(&mut pair.server) {
        pair.server.return_event(ev);
    }
    pair.drive_rounds(50, 10_000);
    let mut fired = 0;
    for ev in drain(&mut pair.client) {
        if let Event::KeepaliveTimedOut { .. } = ev {
            fired += 1;
        }
        pair.client.return_event(ev);
    }
    assert_eq!(fired, 1, "keepalive should re-arm after traffic");
}

//
// Boundary behavior
//

#[test]
fn boundary_errors() {
    let mut pair = Pair::default();
    let (ch, _sch) = pair.establish(Attribute::Ro);
    let (uch, _usch) = pair.establish(Attribute::Uu);

    // oversized send
    let max = pair.client.config().max_send_size();
    let too_big = vec![0; max + 1];
    assert_matches!(
        pair.client
            .send(pair.time, ch, &too_big, 0, SendFlags::default()),
        Err(SendError::MessageTooLong)
    );

    // oversized connect payload
    let request_payload = vec![0; ::CONN_REQ_LEN + 1];
    assert_matches!(
        pair.client.connect(
            pair.time,
            pair.server_addr,
            &request_payload,
            Attribute::Ro,
            0,
            None
        ),
        Err(::endpoint::ConnectError::PayloadTooLong(_))
    );

    // rma argument validation
    let local = pair.client.rma_register(vec![0; 64], Access::read_write());
    let remote = RmaHandle::from_slice(local.as_bytes()).unwrap();
    let both = RmaFlags {
        read: true,
        write: true,
        ..RmaFlags::default()
    };
    let neither = RmaFlags::default();
    let write = RmaFlags {
        write: true,
        ..RmaFlags::default()
    };
    use endpoint::RmaError;
    assert_matches!(
        pair.client
            .rma(pair.time, ch, None, &local, 0, &remote, 0, 1, 0, both),
        Err(RmaError::InvalidFlags)
    );
    assert_matches!(
        pair.client
            .rma(pair.time, ch, None, &local, 0, &remote, 0, 1, 0, neither),
        Err(RmaError::InvalidFlags)
    );
    assert_matches!(
        pair.client
            .rma(pair.time, ch, None, &local, 0, &remote, 0, 0, 0, write),
        Err(RmaError::ZeroLength)
    );
    assert_matches!(
        pair.client
            .rma(pair.time, uch, None, &local, 0, &remote, 0, 1, 0, write),
        Err(RmaError::Unreliable)
    );
    assert_matches!(
        pair.client
            .rma(pair.time, ch, None, &local, 60, &remote, 0, 8, 0, write),
        Err(RmaError::BadHandle)
    );

    // empty queue distinguishes EAGAIN from ENOBUFS
    assert_matches!(pair.client.get_event(), Err(EventError::Again));
}

//
// Property: get_event and return_event pair up over a session
//

#[test]
fn events_pair_up() {
    let mut pair = Pair::default();
    let (ch, sch) = pair.establish(Attribute::Ro);
    let rx_before = pair.server.rx_available();
    let tx_before = pair.client.tx_available();

    for i in 0..32u64 {
        pair.client
            .send(pair.time, ch, &i.to_be_bytes(), i, SendFlags::default())
            .unwrap();
    }
    pair.drive();
    let mut gets = 0;
    let mut returns = 0;
    for ev in drain(&mut pair.server) {
        gets += 1;
        pair.server.return_event(ev);
        returns += 1;
    }
    for ev in drain(&mut pair.client) {
        gets += 1;
        pair.client.return_event(ev);
        returns += 1;
    }
    assert_eq!(gets, returns);
    assert_eq!(gets, 64); // 32 receives + 32 send completions

    // every borrowed slot went back to its pool
    assert_eq!(pair.server.rx_available(), rx_before);
    pair.drive();
    assert_eq!(pair.client.tx_available(), tx_before);
    let _ = sch;
}

//
// Disconnect completes whatever is still in flight
//

#[test]
fn disconnect_flushes_outstanding() {
    let mut pair = Pair::default();
    let (ch, _sch) = pair.establish(Attribute::Ro);
    pair.blackhole = true;
    for i in 0..5u64 {
        pair.client
            .send(pair.time, ch, b"stuck", i, SendFlags::default())
            .unwrap();
    }
    pair.drive_rounds(5, 10_000);
    pair.client.disconnect(pair.time, ch);

    let mut contexts = Vec::new();
    for ev in drain(&mut pair.client) {
        match ev {
            Event::Send {
                context,
                status: Status::Disconnected,
                ..
            } => contexts.push(context),
            ref e => panic!("unexpected event {:?}", e),
        }
        pair.client.return_event(ev);
    }
    assert_eq!(contexts, (0..5).collect::<Vec<u64>>());
    assert_eq!(pair.client.connection_state(ch), None);
}

//
// sendv gathers segments into one message
//

#[test]
fn sendv_gathers() {
    let mut pair = Pair::default();
    let (ch, _sch) = pair.establish(Attribute::Ro);
    pair.client
        .sendv(
            pair.time,
            ch,
            &[&b"head-"[..], &b"body-"[..], &b"tail"[..]],
            1,
            SendFlags::default(),
        )
        .unwrap();
    pair.drive();
    let ev = pair.server.get_event().unwrap();
    assert_eq!(pair.server.event_payload(&ev), b"head-body-tail");
    pair.server.return_event(ev);
}
