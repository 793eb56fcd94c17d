//! The endpoint protocol core.
//!
//! This object performs no I/O whatsoever. The driver feeds it inbound
//! datagrams via `handle` and clock readings via `progress`, and drains the
//! transmit operations it generates via `poll_io` and the application events
//! it produces via `get_event`. All buffers an event hands to the application
//! come out of the endpoint's fixed tx/rx pools and go back through
//! `return_event`; an exhausted rx pool is the backpressure signal that stops
//! further datagrams from being received.

use std::collections::VecDeque;
use std::net::SocketAddr;

use bytes::Bytes;
use fnv::FnvHashMap;
use rand::{rngs::OsRng, Rng};
use slab::Slab;
use slog::Logger;

use bitmap::IdBitmap;
use connection::{Connection, ConnectionHandle, RmaKind, RmaOp, State};
use packet::{self, Packet, ReplyStatus, RmaBody, Type};
use pool::Pool;
use rma::{Access, RegionTable, RmaHandle};
use sack::{AckWindow, Classify};
use {Attribute, Status, CONN_REQ_LEN, EP_BUF_LEN, EP_RX_CNT, EP_TX_CNT};

/// Mask applied to the random sequence seed: 48 bits, leaving headroom
/// before the 64-bit space wraps.
const SEQ_SEED_MASK: u64 = 0xffff_ffff_ffff;
/// Outstanding fragments allowed per RMA operation.
const RMA_FRAG_WINDOW: u32 = 16;
/// Ids an endpoint can hand out to connections.
const CONN_ID_CAPACITY: u32 = 64 * 1024;

/// Parameters governing one endpoint.
#[derive(Debug, Clone)]
pub struct Config {
    /// Number of pre-allocated send slots.
    pub tx_buf_count: u16,
    /// Number of pre-allocated receive slots.
    pub rx_buf_count: u16,
    /// Length of one slot; bounds one datagram.
    pub buffer_len: usize,
    /// Default total send timeout (µs) before a reliable tx completes with a
    /// timeout; a per-connection override takes precedence.
    pub tx_timeout: u64,
    /// Keepalive interval (µs); 0 disables. A per-connection override takes
    /// precedence.
    pub keepalive: u64,
    /// Base retransmission interval (µs); backoff is linear in the resend
    /// count.
    pub resend_interval: u64,
    /// How long to wait for piggy-backed acknowledgement traffic before
    /// emitting a bare ack (µs).
    pub ack_delay: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            tx_buf_count: EP_TX_CNT,
            rx_buf_count: EP_RX_CNT,
            buffer_len: EP_BUF_LEN,
            tx_timeout: 2_000_000,
            keepalive: 0,
            resend_interval: 100_000,
            ack_delay: 10_000,
        }
    }
}

impl Config {
    /// Largest payload of one MSG.
    pub fn max_send_size(&self) -> usize {
        self.buffer_len - packet::SEND_OVERHEAD
    }

    /// Largest payload of one RMA fragment.
    pub(crate) fn max_rma_frag(&self) -> usize {
        self.buffer_len - packet::RMA_OVERHEAD
    }
}

/// Send-time flags.
#[derive(Debug, Copy, Clone, Default, Eq, PartialEq)]
pub struct SendFlags {
    /// Complete the call only when the tx completes; the status is returned
    /// from the call instead of an event.
    pub blocking: bool,
    /// The caller promises not to touch the payload until completion. The
    /// slot-pool design copies regardless; accepted for interface
    /// compatibility.
    pub no_copy: bool,
    /// Suppress the completion event on success. Failures still surface.
    pub silent: bool,
}

/// RMA-time flags. Exactly one of `read`/`write` must be set.
#[derive(Debug, Copy, Clone, Default, Eq, PartialEq)]
pub struct RmaFlags {
    pub read: bool,
    pub write: bool,
    /// Order this operation after every earlier RMA on the connection, and
    /// hold later ones until it completes.
    pub fence: bool,
    pub blocking: bool,
    pub silent: bool,
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub(crate) enum TxState {
    Queued,
    Pending,
    Completed,
}

/// Envelope of one send slot. The envelope at index `i` describes the pool
/// buffer at index `i`; a slot not on the free list is on exactly one of the
/// queued list, the pending list, or held by a completed event.
pub(crate) struct Tx {
    pub ty: Type,
    pub conn: ConnectionHandle,
    pub seq: u64,
    pub len: u16,
    pub state: TxState,
    pub reliable: bool,
    /// First transmit attempt (µs); the total-timeout clock.
    pub first_send: u64,
    /// Next retransmit deadline.
    pub deadline: u64,
    pub resends: u32,
    pub context: u64,
    pub flags: SendFlags,
    pub status: Status,
    /// RMA operation this tx is a fragment (or read request) of.
    pub rma_op: Option<u32>,
    /// Fragment payload length, credited to the operation on ack.
    pub frag_len: u32,
    /// Total-timeout override; carries the connect timeout on CONN_REQUEST.
    pub timeout_override: Option<u64>,
}

impl Tx {
    fn idle() -> Self {
        Tx {
            ty: Type::Keepalive,
            conn: ConnectionHandle(0),
            seq: 0,
            len: 0,
            state: TxState::Completed,
            reliable: false,
            first_send: 0,
            deadline: 0,
            resends: 0,
            context: 0,
            flags: SendFlags::default(),
            status: Status::Success,
            rma_op: None,
            frag_len: 0,
            timeout_override: None,
        }
    }
}

/// Opaque reference to a send slot borrowed to the application inside a
/// SEND event. Returning the event recycles the slot.
#[derive(Debug)]
pub struct TxToken(pub(crate) u16);

/// Opaque reference to a receive slot borrowed to the application inside a
/// RECV or CONNECT_REQUEST event.
#[derive(Debug)]
pub struct RxToken(pub(crate) u16);

/// Completion ticket for a BLOCKING send; meaningless for other sends.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct SendId(pub(crate) u16);

/// Completion ticket for a BLOCKING rma operation.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct RmaId(pub(crate) u32);

/// Events of interest to the application.
#[derive(Debug)]
pub enum Event {
    /// A send (or RMA operation) completed.
    Send {
        conn: ConnectionHandle,
        context: u64,
        status: Status,
        tx: Option<TxToken>,
    },
    /// A message arrived; payload via `Endpoint::event_payload`.
    Recv {
        conn: ConnectionHandle,
        rx: RxToken,
        len: u16,
    },
    /// An outgoing connect finished, successfully or not.
    Connect {
        conn: ConnectionHandle,
        context: u64,
        status: Status,
    },
    /// A peer wants to connect; answer with `accept` or `reject`.
    ConnectRequest {
        conn: ConnectionHandle,
        attribute: Attribute,
        rx: Option<RxToken>,
        len: u16,
    },
    /// An accepted connection finished its handshake.
    Accept {
        conn: ConnectionHandle,
        context: u64,
        status: Status,
    },
    /// Nothing heard from the peer within the keepalive interval.
    KeepaliveTimedOut { conn: ConnectionHandle },
    /// The underlying device failed; all connections are dead.
    DeviceFailed,
}

/// I/O operations to be executed by the backend.
#[derive(Debug)]
pub enum Io {
    Transmit {
        destination: SocketAddr,
        packet: Box<[u8]>,
    },
}

#[derive(Debug, Fail, Clone, Copy, Eq, PartialEq)]
pub enum ConnectError {
    #[fail(display = "malformed or unresolvable server uri")]
    InvalidUri,
    #[fail(display = "connection request payload exceeds {} bytes", _0)]
    PayloadTooLong(usize),
    #[fail(display = "attribute not supported by this transport")]
    Unsupported,
    #[fail(display = "connection ids exhausted")]
    IdsExhausted,
    #[fail(display = "send buffers exhausted")]
    NoBufs,
}

#[derive(Debug, Fail, Clone, Copy, Eq, PartialEq)]
pub enum AcceptError {
    #[fail(display = "not a pending connection request")]
    NotPending,
    #[fail(display = "unknown connection")]
    UnknownConnection,
    #[fail(display = "send buffers exhausted")]
    NoBufs,
}

#[derive(Debug, Fail, Clone, Copy, Eq, PartialEq)]
pub enum SendError {
    #[fail(display = "payload exceeds the connection maximum")]
    MessageTooLong,
    #[fail(display = "connection is not ready")]
    NotReady,
    #[fail(display = "connection is disconnected")]
    Disconnected,
    #[fail(display = "unknown connection")]
    UnknownConnection,
    #[fail(display = "send buffers exhausted")]
    NoBufs,
}

#[derive(Debug, Fail, Clone, Copy, Eq, PartialEq)]
pub enum RmaError {
    #[fail(display = "exactly one of read/write must be requested")]
    InvalidFlags,
    #[fail(display = "zero-length rma")]
    ZeroLength,
    #[fail(display = "rma transfer too long")]
    TooLong,
    #[fail(display = "rma requires a reliable connection")]
    Unreliable,
    #[fail(display = "completion message exceeds the connection maximum")]
    MessageTooLong,
    #[fail(display = "unknown or stale rma handle")]
    BadHandle,
    #[fail(display = "region has operations in flight")]
    Busy,
    #[fail(display = "connection is not ready")]
    NotReady,
    #[fail(display = "connection is disconnected")]
    Disconnected,
    #[fail(display = "unknown connection")]
    UnknownConnection,
    #[fail(display = "send buffers exhausted")]
    NoBufs,
}

#[derive(Debug, Fail, Clone, Copy, Eq, PartialEq)]
pub enum EventError {
    #[fail(display = "no event ready")]
    Again,
    #[fail(display = "receive buffers exhausted; return outstanding events")]
    NoBufs,
}

/// State shared between the endpoint and its connections: pools, queues and
/// the outward-facing io/event streams.
pub(crate) struct Context {
    pub config: Config,
    pub rng: OsRng,
    pub io: VecDeque<Io>,
    pub events: VecDeque<Event>,
    pub tx_pool: Pool,
    pub txs: Box<[Tx]>,
    pub rx_pool: Pool,
    /// Send slots packed but not yet transmitted, in enqueue order.
    pub queued: VecDeque<u16>,
    /// Reliable send slots awaiting acknowledgement, in transmit order.
    pub pending: VecDeque<u16>,
    /// Completed BLOCKING rma operations keyed by (connection, op id).
    pub rma_done: FnvHashMap<(usize, u32), Status>,
    /// Datagrams dropped with no user visibility.
    pub dropped: u64,
    scratch: Vec<u8>,
}

/// The main entry point to the library.
pub struct Endpoint {
    log: Logger,
    pub(crate) ctx: Context,
    /// Local connection id → connection.
    conn_ids: FnvHashMap<u32, ConnectionHandle>,
    /// (remote address, initiator's connection id) → connection, for
    /// duplicate-request suppression on the responder side.
    conn_remotes: FnvHashMap<(SocketAddr, u32), ConnectionHandle>,
    pub(crate) connections: Slab<Connection>,
    ids: IdBitmap,
    regions: RegionTable,
    id: u32,
    failed: bool,
}

impl Endpoint {
    pub fn new(log: Logger, config: Config) -> Self {
        let mut rng = OsRng::new().unwrap();
        let id = loop {
            let x = rng.gen();
            if x != 0 {
                break x;
            }
        };
        let tx_count = config.tx_buf_count;
        let rx_count = config.rx_buf_count;
        let buffer_len = config.buffer_len;
        assert!(buffer_len > packet::RMA_OVERHEAD);
        assert!(buffer_len >= packet::CONN_REQUEST_OVERHEAD + CONN_REQ_LEN);
        Self {
            log,
            ctx: Context {
                config,
                rng,
                io: VecDeque::new(),
                events: VecDeque::new(),
                tx_pool: Pool::new(tx_count, buffer_len),
                txs: (0..tx_count).map(|_| Tx::idle()).collect::<Vec<_>>().into_boxed_slice(),
                rx_pool: Pool::new(rx_count, buffer_len),
                queued: VecDeque::new(),
                pending: VecDeque::new(),
                rma_done: FnvHashMap::default(),
                dropped: 0,
                scratch: Vec::with_capacity(buffer_len),
            },
            conn_ids: FnvHashMap::default(),
            conn_remotes: FnvHashMap::default(),
            connections: Slab::new(),
            ids: IdBitmap::new(CONN_ID_CAPACITY),
            regions: RegionTable::new(),
            id,
            failed: false,
        }
    }

    /// The endpoint's wire id, carried by every datagram addressed to it.
    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn config(&self) -> &Config {
        &self.ctx.config
    }

    /// Count of datagrams dropped with no user visibility.
    pub fn dropped(&self) -> u64 {
        self.ctx.dropped
    }

    /// Receive slots currently on the free list.
    pub fn rx_available(&self) -> usize {
        self.ctx.rx_pool.available()
    }

    /// Send slots currently on the free list.
    pub fn tx_available(&self) -> usize {
        self.ctx.tx_pool.available()
    }

    /// Get a pending I/O operation.
    pub fn poll_io(&mut self) -> Option<Io> {
        self.ctx.io.pop_front()
    }

    /// Push an I/O operation back after the backend failed to execute it;
    /// it will be retried first.
    pub fn requeue_io(&mut self, io: Io) {
        self.ctx.io.push_front(io);
    }

    //
    // Event queue
    //

    /// Pop the next application event. Never blocks.
    pub fn get_event(&mut self) -> Result<Event, EventError> {
        if let Some(ev) = self.ctx.events.pop_front() {
            return Ok(ev);
        }
        if self.ctx.rx_pool.is_exhausted() {
            Err(EventError::NoBufs)
        } else {
            Err(EventError::Again)
        }
    }

    /// Return an event, recycling the slot backing it. Events may be
    /// returned out of order.
    pub fn return_event(&mut self, event: Event) {
        match event {
            Event::Send { tx: Some(tx), .. } => {
                self.free_tx(tx.0);
            }
            Event::Recv { rx, .. } => {
                self.ctx.rx_pool.free(rx.0);
            }
            Event::ConnectRequest { rx: Some(rx), .. } => {
                self.ctx.rx_pool.free(rx.0);
            }
            _ => {}
        }
    }

    /// Payload bytes carried by a RECV or CONNECT_REQUEST event.
    pub fn event_payload(&self, event: &Event) -> &[u8] {
        match *event {
            Event::Recv { ref rx, len, .. } => &self.ctx.rx_pool.buf(rx.0)[..len as usize],
            Event::ConnectRequest {
                rx: Some(ref rx),
                len,
                ..
            } => &self.ctx.rx_pool.buf(rx.0)[..len as usize],
            _ => &[],
        }
    }

    /// Whether any event is queued.
    pub fn has_events(&self) -> bool {
        !self.ctx.events.is_empty()
    }

    //
    // Connection lifecycle
    //

    /// Initiate a connection.
    pub fn connect(
        &mut self,
        now: u64,
        remote: SocketAddr,
        payload: &[u8],
        attribute: Attribute,
        context: u64,
        timeout: Option<u64>,
    ) -> Result<ConnectionHandle, ConnectError> {
        if payload.len() > CONN_REQ_LEN {
            return Err(ConnectError::PayloadTooLong(CONN_REQ_LEN));
        }
        match attribute {
            Attribute::UuMcTx | Attribute::UuMcRx => {
                return Err(ConnectError::Unsupported);
            }
            _ => {}
        }
        let local_id = self
            .ids
            .alloc(&mut self.ctx.rng)
            .ok_or(ConnectError::IdsExhausted)?;
        let seed = self.ctx.rng.gen::<u64>() & SEQ_SEED_MASK | 1;
        let ch = {
            let entry = self.connections.vacant_entry();
            let ch = ConnectionHandle(entry.key());
            let mut conn = Connection::new(
                self.log.new(o!("connection" => local_id)),
                ch,
                remote,
                attribute,
                State::Active,
                local_id,
                now,
            );
            conn.context = context;
            conn.seq = seed;
            entry.insert(conn);
            ch
        };
        self.conn_ids.insert(local_id, ch);
        trace!(self.log, "connecting"; "remote" => %remote, "seed" => seed);
        let request = Packet::ConnRequest {
            attribute,
            initiator_conn: local_id,
            initiator_ep: self.id,
            seq: seed,
            payload: Bytes::from(payload),
        };
        let timeout = timeout.unwrap_or(self.ctx.config.tx_timeout);
        match self.pack_tx(ch, (0, 0), &request, seed, true, context, SendFlags::default()) {
            Ok(ti) => {
                self.ctx.txs[ti as usize].timeout_override = Some(timeout);
                self.connections[ch.0].handshake_tx = Some(ti);
                Ok(ch)
            }
            Err(()) => {
                self.forget_conn(ch);
                Err(ConnectError::NoBufs)
            }
        }
    }

    /// Accept a pending connection request.
    pub fn accept(
        &mut self,
        now: u64,
        ch: ConnectionHandle,
        context: u64,
    ) -> Result<(), AcceptError> {
        {
            let conn = self
                .connections
                .get(ch.0)
                .ok_or(AcceptError::UnknownConnection)?;
            if conn.state != State::PendingRequest {
                return Err(AcceptError::NotPending);
            }
        }
        let seed = self.ctx.rng.gen::<u64>() & SEQ_SEED_MASK | 1;
        let ep_id = self.id;
        let (reply, dst) = {
            let conn = &mut self.connections[ch.0];
            conn.context = context;
            conn.seq = seed;
            (
                Packet::ConnReply {
                    status: ReplyStatus::Accept,
                    target_conn: conn.local_id,
                    target_ep: ep_id,
                    seq: seed,
                    ack: conn.cumulative(),
                },
                (conn.peer_ep, conn.peer_id),
            )
        };
        let ti = self
            .pack_tx(ch, dst, &reply, seed, true, context, SendFlags::default())
            .map_err(|()| AcceptError::NoBufs)?;
        let conn = &mut self.connections[ch.0];
        conn.handshake_tx = Some(ti);
        conn.state = State::PendingReply;
        trace!(conn.log, "accepted"; "seed" => seed);
        // unreliable data that raced ahead of the handshake
        while let Some((slot, len)) = conn.deferred.pop_front() {
            self.ctx.events.push_back(Event::Recv {
                conn: ch,
                rx: RxToken(slot),
                len,
            });
        }
        Ok(())
    }

    /// Reject a pending connection request. No state survives the call.
    pub fn reject(&mut self, ch: ConnectionHandle) -> Result<(), AcceptError> {
        let (remote, dst, ack) = {
            let conn = self
                .connections
                .get(ch.0)
                .ok_or(AcceptError::UnknownConnection)?;
            if conn.state != State::PendingRequest {
                return Err(AcceptError::NotPending);
            }
            (conn.remote, (conn.peer_ep, conn.peer_id), conn.cumulative())
        };
        let reject = Packet::ConnReply {
            status: ReplyStatus::Reject,
            target_conn: 0,
            target_ep: self.id,
            seq: 0,
            ack,
        };
        self.emit_packet(remote, dst, &reject);
        debug!(self.log, "rejected connection request"; "remote" => %remote);
        self.forget_conn(ch);
        Ok(())
    }

    /// Tear down a connection, completing everything outstanding on it with
    /// a disconnected status.
    pub fn disconnect(&mut self, now: u64, ch: ConnectionHandle) {
        if self.connections.get(ch.0).is_none() {
            return;
        }
        self.flush_conn(ch, Status::Disconnected, now);
        if let Some(conn) = self.connections.get_mut(ch.0) {
            conn.state = State::Disconnected;
        }
        self.forget_conn(ch);
    }

    /// The underlying device failed: raise the event, fail every connection
    /// and flush everything in flight.
    pub fn device_failed(&mut self, now: u64) {
        if self.failed {
            return;
        }
        self.failed = true;
        warn!(self.log, "device failed");
        self.ctx.events.push_back(Event::DeviceFailed);
        let handles: Vec<ConnectionHandle> = self
            .connections
            .iter()
            .map(|(k, _)| ConnectionHandle(k))
            .collect();
        for ch in handles {
            self.flush_conn(ch, Status::Disconnected, now);
            if let Some(conn) = self.connections.get_mut(ch.0) {
                conn.state = State::Failed;
            }
        }
    }

    pub fn connection_state(&self, ch: ConnectionHandle) -> Option<State> {
        self.connections.get(ch.0).map(|c| c.state)
    }

    pub fn connection_attribute(&self, ch: ConnectionHandle) -> Option<Attribute> {
        self.connections.get(ch.0).map(|c| c.attribute)
    }

    /// Per-connection total send timeout override (µs).
    pub fn set_conn_tx_timeout(&mut self, ch: ConnectionHandle, micros: Option<u64>) {
        if let Some(conn) = self.connections.get_mut(ch.0) {
            conn.tx_timeout_override = micros;
        }
    }

    /// Per-connection keepalive override (µs, 0 disables).
    pub fn set_conn_keepalive(&mut self, ch: ConnectionHandle, micros: Option<u64>) {
        if let Some(conn) = self.connections.get_mut(ch.0) {
            conn.keepalive_override = micros;
        }
    }

    /// Endpoint default send timeout (µs).
    pub fn set_tx_timeout(&mut self, micros: u64) {
        self.ctx.config.tx_timeout = micros;
    }

    /// Endpoint keepalive interval (µs, 0 disables).
    pub fn set_keepalive(&mut self, micros: u64) {
        self.ctx.config.keepalive = micros;
    }

    /// Resize the receive pool. Refused while any slot is out of the pool.
    pub fn set_rx_count(&mut self, count: u16) -> Result<(), ()> {
        if self.ctx.rx_pool.available() != self.ctx.rx_pool.count() as usize {
            return Err(());
        }
        self.ctx.rx_pool = Pool::new(count, self.ctx.config.buffer_len);
        self.ctx.config.rx_buf_count = count;
        Ok(())
    }

    /// Resize the send pool. Refused while any slot is out of the pool.
    pub fn set_tx_count(&mut self, count: u16) -> Result<(), ()> {
        if self.ctx.tx_pool.available() != self.ctx.tx_pool.count() as usize {
            return Err(());
        }
        self.ctx.tx_pool = Pool::new(count, self.ctx.config.buffer_len);
        self.ctx.txs = (0..count)
            .map(|_| Tx::idle())
            .collect::<Vec<_>>()
            .into_boxed_slice();
        self.ctx.config.tx_buf_count = count;
        Ok(())
    }

    //
    // Send path
    //

    pub fn send(
        &mut self,
        now: u64,
        ch: ConnectionHandle,
        data: &[u8],
        context: u64,
        flags: SendFlags,
    ) -> Result<SendId, SendError> {
        self.send_inner(now, ch, Bytes::from(data), context, flags, None)
    }

    /// Gather form of `send`: the segments are contiguous at the peer.
    pub fn sendv(
        &mut self,
        now: u64,
        ch: ConnectionHandle,
        segments: &[&[u8]],
        context: u64,
        flags: SendFlags,
    ) -> Result<SendId, SendError> {
        let total = segments.iter().map(|s| s.len()).sum();
        let mut payload = Vec::with_capacity(total);
        for s in segments {
            payload.extend_from_slice(s);
        }
        self.send_inner(now, ch, payload.into(), context, flags, None)
    }

    fn send_inner(
        &mut self,
        _now: u64,
        ch: ConnectionHandle,
        payload: Bytes,
        context: u64,
        flags: SendFlags,
        rma_op: Option<u32>,
    ) -> Result<SendId, SendError> {
        if payload.len() > self.ctx.config.max_send_size() {
            return Err(SendError::MessageTooLong);
        }
        let (reliable, seq, ack, dst) = {
            let conn = self
                .connections
                .get_mut(ch.0)
                .ok_or(SendError::UnknownConnection)?;
            if conn.state.is_defunct() {
                return Err(SendError::Disconnected);
            }
            if !conn.state.is_usable() {
                return Err(SendError::NotReady);
            }
            let reliable = conn.attribute.is_reliable();
            let seq = if reliable { conn.next_seq() } else { 0 };
            (reliable, seq, conn.cumulative(), (conn.peer_ep, conn.peer_id))
        };
        let msg = Packet::Send { seq, ack, payload };
        let ti = self
            .pack_tx(ch, dst, &msg, seq, reliable, context, flags)
            .map_err(|()| SendError::NoBufs)?;
        self.ctx.txs[ti as usize].rma_op = rma_op;
        Ok(SendId(ti))
    }

    /// Status of a completed BLOCKING send. `Some` recycles the slot.
    pub fn take_blocking_status(&mut self, id: SendId) -> Option<Status> {
        let done = {
            let tx = &self.ctx.txs[id.0 as usize];
            tx.flags.blocking && tx.state == TxState::Completed
        };
        if !done {
            return None;
        }
        let status = self.ctx.txs[id.0 as usize].status;
        self.free_tx(id.0);
        Some(status)
    }

    //
    // RMA
    //

    /// Register a region for remote access; the endpoint owns the memory for
    /// the lifetime of the registration and `rma_deregister` hands it back.
    pub fn rma_register(&mut self, mem: Vec<u8>, access: Access) -> RmaHandle {
        self.regions
            .register(self.id, mem.into_boxed_slice(), access, &mut self.ctx.rng)
    }

    /// Deregister a region. Refused while any operation is in flight on it.
    pub fn rma_deregister(&mut self, handle: &RmaHandle) -> Result<Vec<u8>, RmaError> {
        use rma::DeregError;
        match self.regions.deregister(handle) {
            Ok(mem) => Ok(mem.into_vec()),
            Err(DeregError::Unknown) => Err(RmaError::BadHandle),
            Err(DeregError::Busy) => Err(RmaError::Busy),
        }
    }

    /// Bytes of a locally registered region.
    pub fn region_bytes(&self, handle: &RmaHandle) -> Option<&[u8]> {
        let idx = self.regions.resolve(handle)?;
        Some(&self.regions.get(idx).mem)
    }

    /// Mutable bytes of a locally registered region.
    pub fn region_bytes_mut(&mut self, handle: &RmaHandle) -> Option<&mut [u8]> {
        let idx = self.regions.resolve(handle)?;
        Some(&mut self.regions.get_mut(idx).mem)
    }

    /// Start a one-sided transfer between a local and a remote region.
    pub fn rma(
        &mut self,
        now: u64,
        ch: ConnectionHandle,
        completion: Option<&[u8]>,
        local: &RmaHandle,
        local_offset: u64,
        remote: &RmaHandle,
        remote_offset: u64,
        length: u64,
        context: u64,
        flags: RmaFlags,
    ) -> Result<RmaId, RmaError> {
        if flags.read == flags.write {
            return Err(RmaError::InvalidFlags);
        }
        if length == 0 {
            return Err(RmaError::ZeroLength);
        }
        if length > u64::from(u32::max_value()) {
            return Err(RmaError::TooLong);
        }
        if let Some(msg) = completion {
            if msg.len() > self.ctx.config.max_send_size() {
                return Err(RmaError::MessageTooLong);
            }
        }
        {
            let conn = self
                .connections
                .get(ch.0)
                .ok_or(RmaError::UnknownConnection)?;
            if !conn.attribute.is_reliable() {
                return Err(RmaError::Unreliable);
            }
            if conn.state.is_defunct() {
                return Err(RmaError::Disconnected);
            }
            if !conn.state.is_usable() {
                return Err(RmaError::NotReady);
            }
        }
        let region = self.regions.resolve(local).ok_or(RmaError::BadHandle)?;
        let in_bounds = local_offset
            .checked_add(length)
            .map_or(false, |end| end <= self.regions.get(region).mem.len() as u64);
        if !in_bounds {
            return Err(RmaError::BadHandle);
        }
        self.regions.get_mut(region).in_flight += 1;
        let op_id = {
            let conn = &mut self.connections[ch.0];
            let id = conn.alloc_rma_id();
            trace!(conn.log, "rma";
                   "op" => id,
                   "kind" => if flags.write { "write" } else { "read" },
                   "len" => length);
            conn.rma_ops.push_back(RmaOp {
                id,
                kind: if flags.write {
                    RmaKind::Write
                } else {
                    RmaKind::Read
                },
                local_region: region,
                local_handle: *local,
                remote_handle: *remote,
                local_offset,
                remote_offset,
                length,
                next_offset: 0,
                acked: 0,
                received: 0,
                outstanding: 0,
                fence: flags.fence,
                silent: flags.silent,
                blocking: flags.blocking,
                context,
                completion: completion.map(Bytes::from),
                failed: None,
            });
            id
        };
        self.drive_rma(ch, now);
        Ok(RmaId(op_id))
    }

    /// Status of a completed BLOCKING rma operation.
    pub fn take_rma_blocking_status(&mut self, ch: ConnectionHandle, id: RmaId) -> Option<Status> {
        self.ctx.rma_done.remove(&(ch.0, id.0))
    }

    //
    // Inbound datagrams
    //

    /// Process one inbound datagram.
    pub fn handle(&mut self, now: u64, remote: SocketAddr, datagram: &[u8]) {
        let (header, packet) = match Packet::decode(datagram) {
            Ok(x) => x,
            Err(e) => {
                trace!(self.log, "dropping malformed datagram"; "reason" => %e);
                self.ctx.dropped += 1;
                return;
            }
        };
        if let Packet::ConnRequest { .. } = packet {
            if header.dst_ep != 0 && header.dst_ep != self.id {
                self.ctx.dropped += 1;
                return;
            }
        } else if header.dst_ep != self.id {
            trace!(self.log, "dropping datagram for foreign endpoint"; "dst" => header.dst_ep);
            self.ctx.dropped += 1;
            return;
        }
        match packet {
            Packet::ConnRequest {
                attribute,
                initiator_conn,
                initiator_ep,
                seq,
                payload,
            } => {
                self.handle_conn_request(
                    now,
                    remote,
                    attribute,
                    initiator_conn,
                    initiator_ep,
                    seq,
                    payload,
                );
            }
            packet => {
                let ch = match self.conn_ids.get(&header.dst_conn) {
                    Some(&ch) => ch,
                    None => {
                        trace!(self.log, "dropping datagram for unknown connection";
                               "dst" => header.dst_conn);
                        self.ctx.dropped += 1;
                        return;
                    }
                };
                self.handle_for_conn(now, ch, packet);
            }
        }
    }

    fn handle_for_conn(&mut self, now: u64, ch: ConnectionHandle, packet: Packet) {
        match packet {
            Packet::Send { seq, ack, payload } => {
                self.handle_msg(now, ch, seq, ack, payload);
            }
            Packet::ConnReply {
                status,
                target_conn,
                target_ep,
                seq,
                ack,
            } => {
                self.handle_conn_reply(now, ch, status, target_conn, target_ep, seq, ack);
            }
            Packet::ConnAck { ack, .. } => {
                if let Some(conn) = self.connections.get_mut(ch.0) {
                    conn.note_recv(now);
                }
                self.process_ack(ch, ack, now);
            }
            Packet::Nack { seq, ack } => {
                if let Some(conn) = self.connections.get_mut(ch.0) {
                    conn.last_recv = now;
                    conn.keepalive_fired = false;
                    conn.rnr = true;
                    debug!(conn.log, "peer not ready"; "seq" => seq);
                }
                self.process_ack(ch, ack, now);
            }
            Packet::RmaWrite {
                status,
                body,
                payload,
            } => {
                self.handle_rma_write(now, ch, status, body, payload);
            }
            Packet::RmaRead { status, body } => {
                self.handle_rma_read(now, ch, status, body);
            }
            Packet::Keepalive => {
                if let Some(conn) = self.connections.get_mut(ch.0) {
                    conn.note_recv(now);
                }
            }
            Packet::ConnRequest { .. } => unreachable!(),
        }
    }

    fn handle_conn_request(
        &mut self,
        now: u64,
        remote: SocketAddr,
        attribute: Attribute,
        initiator_conn: u32,
        initiator_ep: u32,
        seq: u64,
        payload: Bytes,
    ) {
        if self.conn_remotes.contains_key(&(remote, initiator_conn)) {
            // retransmitted request; the original is still being answered
            trace!(self.log, "dropping duplicate connection request"; "remote" => %remote);
            self.ctx.dropped += 1;
            return;
        }
        let rx = if payload.is_empty() {
            None
        } else {
            match self.ctx.rx_pool.alloc() {
                Some(slot) => {
                    self.ctx.rx_pool.buf_mut(slot)[..payload.len()].copy_from_slice(&payload);
                    Some((slot, payload.len() as u16))
                }
                None => {
                    debug!(self.log, "no rx buffer for connection request; dropping");
                    self.ctx.dropped += 1;
                    return;
                }
            }
        };
        let local_id = match self.ids.alloc(&mut self.ctx.rng) {
            Some(id) => id,
            None => {
                debug!(self.log, "connection ids exhausted; dropping request");
                if let Some((slot, _)) = rx {
                    self.ctx.rx_pool.free(slot);
                }
                self.ctx.dropped += 1;
                return;
            }
        };
        let ch = {
            let entry = self.connections.vacant_entry();
            let ch = ConnectionHandle(entry.key());
            let mut conn = Connection::new(
                self.log.new(o!("connection" => local_id)),
                ch,
                remote,
                attribute,
                State::PendingRequest,
                local_id,
                now,
            );
            conn.peer_id = initiator_conn;
            conn.peer_ep = initiator_ep;
            conn.acked = Some(AckWindow::new(seq));
            entry.insert(conn);
            ch
        };
        self.conn_ids.insert(local_id, ch);
        self.conn_remotes.insert((remote, initiator_conn), ch);
        trace!(self.log, "connection request"; "remote" => %remote, "attribute" => ?attribute);
        let (rx, len) = match rx {
            Some((slot, len)) => (Some(RxToken(slot)), len),
            None => (None, 0),
        };
        self.ctx.events.push_back(Event::ConnectRequest {
            conn: ch,
            attribute,
            rx,
            len,
        });
    }

    fn handle_conn_reply(
        &mut self,
        now: u64,
        ch: ConnectionHandle,
        status: ReplyStatus,
        target_conn: u32,
        target_ep: u32,
        seq: u64,
        ack: u64,
    ) {
        enum Next {
            Established { handshake: Option<u16>, ack: u64 },
            Refused { handshake: Option<u16> },
            Drop,
        }
        let next = {
            let conn = match self.connections.get_mut(ch.0) {
                Some(c) => c,
                None => {
                    self.ctx.dropped += 1;
                    return;
                }
            };
            match (conn.state, status) {
                (State::Active, ReplyStatus::Accept) => {
                    conn.peer_id = target_conn;
                    conn.peer_ep = target_ep;
                    conn.acked = Some(AckWindow::new(seq));
                    conn.state = State::Ready;
                    conn.note_recv(now);
                    trace!(conn.log, "established"; "peer" => target_conn);
                    self.ctx.events.push_back(Event::Connect {
                        conn: ch,
                        context: conn.context,
                        status: Status::Success,
                    });
                    while let Some((slot, len)) = conn.deferred.pop_front() {
                        self.ctx.events.push_back(Event::Recv {
                            conn: ch,
                            rx: RxToken(slot),
                            len,
                        });
                    }
                    Next::Established {
                        handshake: conn.handshake_tx.take(),
                        ack,
                    }
                }
                (State::Active, ReplyStatus::Reject) => {
                    debug!(conn.log, "connection refused");
                    self.ctx.events.push_back(Event::Connect {
                        conn: ch,
                        context: conn.context,
                        status: Status::Refused,
                    });
                    Next::Refused {
                        handshake: conn.handshake_tx.take(),
                    }
                }
                (State::Ready, ReplyStatus::Accept) => {
                    // our CONN_ACK was lost; repeat it
                    conn.note_recv(now);
                    Next::Established {
                        handshake: None,
                        ack,
                    }
                }
                _ => Next::Drop,
            }
        };
        match next {
            Next::Established { handshake, ack } => {
                if let Some(ti) = handshake {
                    self.drop_pending_tx(ti);
                }
                let (remote, dst, cumulative) = {
                    let conn = &self.connections[ch.0];
                    (conn.remote, (conn.peer_ep, conn.peer_id), conn.cumulative())
                };
                self.emit_packet(
                    remote,
                    dst,
                    &Packet::ConnAck {
                        seq: 0,
                        ack: cumulative,
                    },
                );
                self.process_ack(ch, ack, now);
            }
            Next::Refused { handshake } => {
                if let Some(ti) = handshake {
                    self.drop_pending_tx(ti);
                }
                self.forget_conn(ch);
            }
            Next::Drop => {
                self.ctx.dropped += 1;
            }
        }
    }

    fn handle_msg(&mut self, now: u64, ch: ConnectionHandle, seq: u64, ack: u64, payload: Bytes) {
        let reliable = {
            let ctx = &mut self.ctx;
            if payload.len() > ctx.config.max_send_size() {
                ctx.dropped += 1;
                return;
            }
            let conn = match self.connections.get_mut(ch.0) {
                Some(c) => c,
                None => {
                    ctx.dropped += 1;
                    return;
                }
            };
            if !conn.state.is_usable() {
                if conn.attribute == Attribute::Uu && !conn.state.is_defunct() {
                    // the request-side handshake has not finished; park it
                    match ctx.rx_pool.alloc() {
                        Some(slot) => {
                            ctx.rx_pool.buf_mut(slot)[..payload.len()].copy_from_slice(&payload);
                            conn.deferred.push_back((slot, payload.len() as u16));
                        }
                        None => {
                            ctx.dropped += 1;
                        }
                    }
                } else {
                    ctx.dropped += 1;
                }
                return;
            }
            conn.note_recv(now);
            if !conn.attribute.is_reliable() {
                match ctx.rx_pool.alloc() {
                    Some(slot) => {
                        ctx.rx_pool.buf_mut(slot)[..payload.len()].copy_from_slice(&payload);
                        ctx.events.push_back(Event::Recv {
                            conn: ch,
                            rx: RxToken(slot),
                            len: payload.len() as u16,
                        });
                    }
                    None => {
                        ctx.dropped += 1;
                    }
                }
                false
            } else {
                let ack_delay = ctx.config.ack_delay;
                let classify = conn.acked.as_ref().unwrap().classify(seq);
                match classify {
                    Classify::Duplicate => {
                        // our ack was lost; repeat it soon
                        conn.schedule_ack(now, ack_delay);
                        ctx.dropped += 1;
                    }
                    Classify::TooFar => {
                        ctx.dropped += 1;
                    }
                    Classify::InOrder | Classify::OutOfOrder => match ctx.rx_pool.alloc() {
                        None => {
                            // receiver not ready: refuse without acknowledging
                            debug!(conn.log, "rx pool empty; nacking"; "seq" => seq);
                            let mut buf = Vec::new();
                            Packet::Nack {
                                seq,
                                ack: conn.cumulative(),
                            }.encode(conn.peer_ep, conn.peer_id, &mut buf);
                            ctx.io.push_back(Io::Transmit {
                                destination: conn.remote,
                                packet: buf.into_boxed_slice(),
                            });
                            ctx.dropped += 1;
                        }
                        Some(slot) => {
                            ctx.rx_pool.buf_mut(slot)[..payload.len()].copy_from_slice(&payload);
                            let len = payload.len() as u16;
                            let class = conn.acked.as_mut().unwrap().record(seq);
                            match class {
                                Classify::InOrder => {
                                    ctx.events.push_back(Event::Recv {
                                        conn: ch,
                                        rx: RxToken(slot),
                                        len,
                                    });
                                    // the arrival may have plugged the gap in
                                    // front of buffered ones
                                    let cumulative = conn.cumulative();
                                    loop {
                                        let next = match conn.reorder.iter().next() {
                                            Some((&s, _)) if s <= cumulative => s,
                                            _ => break,
                                        };
                                        let (slot, len) = conn.reorder.remove(&next).unwrap();
                                        ctx.events.push_back(Event::Recv {
                                            conn: ch,
                                            rx: RxToken(slot),
                                            len,
                                        });
                                    }
                                }
                                Classify::OutOfOrder => {
                                    if conn.attribute.is_ordered() {
                                        conn.reorder.insert(seq, (slot, len));
                                    } else {
                                        ctx.events.push_back(Event::Recv {
                                            conn: ch,
                                            rx: RxToken(slot),
                                            len,
                                        });
                                    }
                                }
                                _ => unreachable!(),
                            }
                            conn.schedule_ack(now, ack_delay);
                        }
                    },
                }
                true
            }
        };
        if reliable {
            self.process_ack(ch, ack, now);
        }
    }

    //
    // RMA inbound
    //

    fn handle_rma_write(
        &mut self,
        now: u64,
        ch: ConnectionHandle,
        status: u8,
        body: RmaBody,
        payload: Bytes,
    ) {
        if !self.rma_classify(now, ch, body.seq) {
            return;
        }
        if status != 0 {
            self.rma_error_echo(ch, RmaKind::Write, &body, status);
        } else {
            // apply the write, or refuse it
            let verdict = {
                let region = self.regions.resolve(&body.remote);
                match region {
                    None => Some(Status::RmaHandle),
                    Some(idx) => {
                        let region = self.regions.get_mut(idx);
                        let end = body
                            .remote_offset
                            .checked_add(body.frag_offset)
                            .and_then(|s| s.checked_add(u64::from(body.frag_len)));
                        match end {
                            Some(end) if region.access.remote_write
                                && end <= region.mem.len() as u64 =>
                            {
                                let start = (body.remote_offset + body.frag_offset) as usize;
                                region.mem[start..start + payload.len()]
                                    .copy_from_slice(&payload);
                                None
                            }
                            _ => Some(Status::RmaHandle),
                        }
                    }
                }
            };
            match verdict {
                None => {
                    // credit a read collecting into this region
                    let conn = &mut self.connections[ch.0];
                    for op in conn.rma_ops.iter_mut() {
                        if op.kind == RmaKind::Read
                            && op.local_handle == body.remote
                            && op.local_offset == body.remote_offset
                        {
                            op.received += u64::from(body.frag_len);
                            break;
                        }
                    }
                }
                Some(err) => {
                    debug!(self.log, "refusing rma write"; "status" => err);
                    self.rma_refuse(now, ch, Type::RmaWrite, &body, err);
                }
            }
        }
        self.finish_rma_packet(now, ch, &body);
    }

    fn handle_rma_read(&mut self, now: u64, ch: ConnectionHandle, status: u8, body: RmaBody) {
        if !self.rma_classify(now, ch, body.seq) {
            return;
        }
        if status != 0 {
            self.rma_error_echo(ch, RmaKind::Read, &body, status);
        } else {
            let verdict = {
                match self.regions.resolve(&body.remote) {
                    None => Some(Status::RmaHandle),
                    Some(idx) => {
                        let region = self.regions.get(idx);
                        let end = body.remote_offset.checked_add(u64::from(body.frag_len));
                        match end {
                            Some(end) if region.access.remote_read
                                && end <= region.mem.len() as u64 => None,
                            _ => Some(Status::RmaHandle),
                        }
                    }
                }
            };
            match verdict {
                None => {
                    let idx = self.regions.resolve(&body.remote).unwrap();
                    self.regions.get_mut(idx).in_flight += 1;
                    let conn = &mut self.connections[ch.0];
                    let id = conn.alloc_rma_id();
                    trace!(conn.log, "serving rma read"; "len" => body.frag_len);
                    conn.rma_ops.push_back(RmaOp {
                        id,
                        kind: RmaKind::ReadResponse,
                        local_region: idx,
                        local_handle: body.remote,
                        remote_handle: body.local,
                        local_offset: body.remote_offset,
                        remote_offset: body.local_offset,
                        length: u64::from(body.frag_len),
                        next_offset: 0,
                        acked: 0,
                        received: 0,
                        outstanding: 0,
                        fence: false,
                        silent: true,
                        blocking: false,
                        context: 0,
                        completion: None,
                        failed: None,
                    });
                }
                Some(err) => {
                    debug!(self.log, "refusing rma read"; "status" => err);
                    self.rma_refuse(now, ch, Type::RmaRead, &body, err);
                }
            }
        }
        self.finish_rma_packet(now, ch, &body);
    }

    /// Sequence bookkeeping shared by the RMA message handlers. Returns
    /// false when the message must not be processed (duplicate or
    /// untrackable).
    fn rma_classify(&mut self, now: u64, ch: ConnectionHandle, seq: u64) -> bool {
        let ctx = &mut self.ctx;
        let conn = match self.connections.get_mut(ch.0) {
            Some(c) => c,
            None => {
                ctx.dropped += 1;
                return false;
            }
        };
        if !conn.state.is_usable() || !conn.attribute.is_reliable() {
            ctx.dropped += 1;
            return false;
        }
        conn.note_recv(now);
        let ack_delay = ctx.config.ack_delay;
        match conn.acked.as_mut().unwrap().record(seq) {
            Classify::Duplicate => {
                conn.schedule_ack(now, ack_delay);
                ctx.dropped += 1;
                false
            }
            Classify::TooFar => {
                ctx.dropped += 1;
                false
            }
            class @ Classify::InOrder | class @ Classify::OutOfOrder => {
                if class == Classify::InOrder {
                    // the fragment may have plugged the gap in front of
                    // buffered ordered receives
                    let cumulative = conn.cumulative();
                    loop {
                        let next = match conn.reorder.iter().next() {
                            Some((&s, _)) if s <= cumulative => s,
                            _ => break,
                        };
                        let (slot, len) = conn.reorder.remove(&next).unwrap();
                        ctx.events.push_back(Event::Recv {
                            conn: ch,
                            rx: RxToken(slot),
                            len,
                        });
                    }
                }
                conn.schedule_ack(now, ack_delay);
                true
            }
        }
    }

    /// Common tail of the RMA message handlers: piggy-backed ack, then see
    /// whether anything can move.
    fn finish_rma_packet(&mut self, now: u64, ch: ConnectionHandle, body: &RmaBody) {
        self.process_ack(ch, body.ack, now);
        self.maybe_complete_rma(ch, now);
        self.drive_rma(ch, now);
    }

    /// An error echo arrived: fail the matching local operation.
    fn rma_error_echo(&mut self, ch: ConnectionHandle, kind: RmaKind, body: &RmaBody, status: u8) {
        let status = Status::from_byte(status).unwrap_or(Status::RmaHandle);
        let conn = match self.connections.get_mut(ch.0) {
            Some(c) => c,
            None => return,
        };
        for op in conn.rma_ops.iter_mut() {
            if op.kind == kind
                && op.local_handle == body.local
                && op.remote_handle == body.remote
                && op.failed.is_none()
            {
                debug!(conn.log, "rma refused by peer"; "op" => op.id, "status" => status);
                op.failed = Some(status);
                break;
            }
        }
    }

    /// Send a reliable error echo for a refused inbound RMA message.
    fn rma_refuse(&mut self, _now: u64, ch: ConnectionHandle, ty: Type, body: &RmaBody, err: Status) {
        let (seq, ack, dst) = {
            let conn = &mut self.connections[ch.0];
            (conn.next_seq(), conn.cumulative(), (conn.peer_ep, conn.peer_id))
        };
        let echo = RmaBody {
            seq,
            ack,
            local: body.local,
            remote: body.remote,
            local_offset: body.local_offset,
            remote_offset: body.remote_offset,
            frag_offset: body.frag_offset,
            frag_len: 0,
            fence: false,
            completion_len: 0,
        };
        let packet = match ty {
            Type::RmaWrite => Packet::RmaWrite {
                status: err.to_byte(),
                body: echo,
                payload: Bytes::new(),
            },
            _ => Packet::RmaRead {
                status: err.to_byte(),
                body: echo,
            },
        };
        // best effort: if no slot is free the requester times out instead
        let _ = self.pack_tx(ch, dst, &packet, seq, true, 0, SendFlags::default());
    }

    /// Issue as many RMA fragments as windows and slots allow.
    fn drive_rma(&mut self, ch: ConnectionHandle, now: u64) {
        let _ = now;
        loop {
            struct Plan {
                op_id: u32,
                kind: RmaKind,
                region: usize,
                read_at: u64,
                frag_offset: u64,
                frag_len: u32,
                local: RmaHandle,
                remote: RmaHandle,
                local_offset: u64,
                remote_offset: u64,
                fence: bool,
            }
            let max_frag = self.ctx.config.max_rma_frag() as u64;
            let plan = {
                let conn = match self.connections.get_mut(ch.0) {
                    Some(c) => c,
                    None => return,
                };
                if !conn.state.is_usable() {
                    return;
                }
                let mut any_incomplete = false;
                let mut plan = None;
                for op in conn.rma_ops.iter() {
                    if op.is_complete() {
                        continue;
                    }
                    if op.fence && any_incomplete {
                        // fenced op waits for everything before it, and
                        // holds everything after it
                        break;
                    }
                    if op.failed.is_none() {
                        match op.kind {
                            RmaKind::Write | RmaKind::ReadResponse => {
                                if op.next_offset < op.length && op.outstanding < RMA_FRAG_WINDOW {
                                    let frag_len =
                                        ::std::cmp::min(max_frag, op.length - op.next_offset);
                                    plan = Some(Plan {
                                        op_id: op.id,
                                        kind: op.kind,
                                        region: op.local_region,
                                        read_at: op.local_offset + op.next_offset,
                                        frag_offset: op.next_offset,
                                        frag_len: frag_len as u32,
                                        local: op.local_handle,
                                        remote: op.remote_handle,
                                        local_offset: op.local_offset,
                                        remote_offset: op.remote_offset,
                                        fence: op.fence,
                                    });
                                    break;
                                }
                            }
                            RmaKind::Read => {
                                if op.next_offset == 0 {
                                    plan = Some(Plan {
                                        op_id: op.id,
                                        kind: RmaKind::Read,
                                        region: op.local_region,
                                        read_at: 0,
                                        frag_offset: 0,
                                        frag_len: op.length as u32,
                                        local: op.local_handle,
                                        remote: op.remote_handle,
                                        local_offset: op.local_offset,
                                        remote_offset: op.remote_offset,
                                        fence: op.fence,
                                    });
                                    break;
                                }
                            }
                        }
                    }
                    any_incomplete = true;
                    if op.fence {
                        break;
                    }
                }
                plan
            };
            let plan = match plan {
                Some(p) => p,
                None => return,
            };
            if self.ctx.tx_pool.is_exhausted() {
                return;
            }
            let (seq, ack, dst) = {
                let conn = &mut self.connections[ch.0];
                (conn.next_seq(), conn.cumulative(), (conn.peer_ep, conn.peer_id))
            };
            let body = RmaBody {
                seq,
                ack,
                local: plan.local,
                remote: plan.remote,
                local_offset: plan.local_offset,
                remote_offset: plan.remote_offset,
                frag_offset: plan.frag_offset,
                frag_len: plan.frag_len,
                fence: plan.fence,
                completion_len: 0,
            };
            let packet = match plan.kind {
                RmaKind::Write | RmaKind::ReadResponse => {
                    let payload = {
                        let mem = &self.regions.get(plan.region).mem;
                        Bytes::from(
                            &mem[plan.read_at as usize
                                     ..plan.read_at as usize + plan.frag_len as usize],
                        )
                    };
                    Packet::RmaWrite {
                        status: 0,
                        body,
                        payload,
                    }
                }
                RmaKind::Read => Packet::RmaRead { status: 0, body },
            };
            let ti = match self.pack_tx(ch, dst, &packet, seq, true, 0, SendFlags::default()) {
                Ok(ti) => ti,
                Err(()) => return,
            };
            {
                let tx = &mut self.ctx.txs[ti as usize];
                tx.rma_op = Some(plan.op_id);
                tx.frag_len = if plan.kind == RmaKind::Read {
                    0
                } else {
                    plan.frag_len
                };
            }
            let conn = &mut self.connections[ch.0];
            for op in conn.rma_ops.iter_mut() {
                if op.id == plan.op_id {
                    op.outstanding += 1;
                    op.next_offset = if plan.kind == RmaKind::Read {
                        op.length
                    } else {
                        op.next_offset + u64::from(plan.frag_len)
                    };
                    break;
                }
            }
        }
    }

    /// Retire completed RMA operations: release the region, send the
    /// completion message, surface the local completion.
    fn maybe_complete_rma(&mut self, ch: ConnectionHandle, now: u64) {
        loop {
            enum Done {
                Finalize(usize),
                SendCompletion(usize),
            }
            let action = {
                let conn = match self.connections.get(ch.0) {
                    Some(c) => c,
                    None => return,
                };
                let mut action = None;
                for (i, op) in conn.rma_ops.iter().enumerate() {
                    if !op.is_complete() {
                        continue;
                    }
                    if op.failed.is_none() && op.completion.is_some() {
                        action = Some(Done::SendCompletion(i));
                    } else {
                        action = Some(Done::Finalize(i));
                    }
                    break;
                }
                action
            };
            match action {
                None => return,
                Some(Done::SendCompletion(i)) => {
                    let (payload, context) = {
                        let op = &self.connections[ch.0].rma_ops[i];
                        (op.completion.clone().unwrap(), op.context)
                    };
                    let flags = SendFlags {
                        silent: true,
                        ..SendFlags::default()
                    };
                    if self
                        .send_inner(now, ch, payload, context, flags, None)
                        .is_err()
                    {
                        // no slot free; retried on the next tick
                        return;
                    }
                    self.connections[ch.0].rma_ops[i].completion = None;
                    // falls through to Finalize on the next loop pass
                }
                Some(Done::Finalize(i)) => {
                    let op = self.connections[ch.0].rma_ops.remove(i).unwrap();
                    let region = self.regions.get_mut(op.local_region);
                    debug_assert!(region.in_flight > 0);
                    region.in_flight -= 1;
                    let status = op.status();
                    match op.kind {
                        RmaKind::ReadResponse => {}
                        RmaKind::Write | RmaKind::Read => {
                            if op.blocking {
                                self.ctx.rma_done.insert((ch.0, op.id), status);
                            } else if !op.silent || status != Status::Success {
                                self.ctx.events.push_back(Event::Send {
                                    conn: ch,
                                    context: op.context,
                                    status,
                                    tx: None,
                                });
                            }
                        }
                    }
                }
            }
        }
    }

    //
    // Reliability engine
    //

    /// The peer's cumulative ack advanced: complete everything it covers, in
    /// transmit order.
    fn process_ack(&mut self, ch: ConnectionHandle, ack: u64, now: u64) {
        {
            let conn = match self.connections.get_mut(ch.0) {
                Some(c) => c,
                None => return,
            };
            if ack <= conn.peer_acked {
                return;
            }
            conn.peer_acked = ack;
        }
        let mut done = Vec::new();
        {
            let Context {
                ref mut pending,
                ref txs,
                ..
            } = self.ctx;
            let mut i = 0;
            while i < pending.len() {
                let ti = pending[i];
                let tx = &txs[ti as usize];
                // connection requests complete on the reply, not on an ack
                if tx.conn == ch && tx.ty != Type::ConnRequest && tx.seq <= ack {
                    pending.remove(i);
                    done.push(ti);
                } else {
                    i += 1;
                }
            }
        }
        for ti in done {
            self.complete_tx(ti, Status::Success, now);
        }
        self.maybe_complete_rma(ch, now);
        self.drive_rma(ch, now);
    }

    /// Route a finished tx to its completion: blocking status, silent
    /// recycle, RMA credit, or an event.
    fn complete_tx(&mut self, ti: u16, status: Status, now: u64) {
        let (ty, ch, context, flags, rma_op, frag_len) = {
            let tx = &mut self.ctx.txs[ti as usize];
            tx.state = TxState::Completed;
            tx.status = status;
            (tx.ty, tx.conn, tx.context, tx.flags, tx.rma_op, tx.frag_len)
        };
        match ty {
            Type::ConnRequest => {
                // only failure paths land here; success is driven by the reply
                self.ctx.events.push_back(Event::Connect {
                    conn: ch,
                    context,
                    status,
                });
                self.free_tx(ti);
                self.forget_conn(ch);
            }
            Type::ConnReply => {
                self.ctx.events.push_back(Event::Accept {
                    conn: ch,
                    context,
                    status,
                });
                self.free_tx(ti);
                if let Some(conn) = self.connections.get_mut(ch.0) {
                    conn.handshake_tx = None;
                    conn.state = if status.is_success() {
                        State::Ready
                    } else {
                        State::Failed
                    };
                }
            }
            Type::Send => {
                if flags.blocking {
                    // held until take_blocking_status collects it
                } else if flags.silent && status.is_success() {
                    self.free_tx(ti);
                } else {
                    self.ctx.events.push_back(Event::Send {
                        conn: ch,
                        context,
                        status,
                        tx: Some(TxToken(ti)),
                    });
                }
            }
            Type::RmaWrite | Type::RmaRead => {
                self.free_tx(ti);
                if let Some(op_id) = rma_op {
                    self.rma_frag_done(ch, op_id, status, frag_len, now);
                }
            }
            Type::ConnAck | Type::Nack | Type::Keepalive => {
                self.free_tx(ti);
            }
        }
    }

    fn rma_frag_done(&mut self, ch: ConnectionHandle, op_id: u32, status: Status, frag_len: u32, now: u64) {
        {
            let conn = match self.connections.get_mut(ch.0) {
                Some(c) => c,
                None => return,
            };
            for op in conn.rma_ops.iter_mut() {
                if op.id == op_id {
                    debug_assert!(op.outstanding > 0);
                    op.outstanding -= 1;
                    if status.is_success() {
                        op.acked += u64::from(frag_len);
                    } else if op.failed.is_none() {
                        op.failed = Some(status);
                    }
                    break;
                }
            }
        }
        self.maybe_complete_rma(ch, now);
    }

    /// A reliable tx ran out its timeout budget: complete it, and on an
    /// ordered connection cascade the failure over everything behind it.
    fn fail_tx_chain(&mut self, ti: u16, now: u64) {
        let (ch, ty) = {
            let tx = &self.ctx.txs[ti as usize];
            (tx.conn, tx.ty)
        };
        let (status, cascade) = {
            match self.connections.get(ch.0) {
                Some(conn) => {
                    let status = if conn.rnr {
                        Status::Rnr
                    } else {
                        Status::Timeout
                    };
                    let cascade = conn.attribute == Attribute::Ro
                        && match ty {
                            Type::Send | Type::RmaWrite | Type::RmaRead => true,
                            _ => false,
                        };
                    (status, cascade)
                }
                None => (Status::Timeout, false),
            }
        };
        if let Some(conn) = self.connections.get(ch.0) {
            debug!(conn.log, "tx expired"; "type" => %ty, "status" => status);
        }
        self.remove_queued_ref(ti);
        self.remove_pending_ref(ti);
        self.complete_tx(ti, status, now);
        if ty == Type::ConnRequest {
            return; // the connection is gone
        }
        if cascade {
            // later reliable txs on the same connection die in enqueue order
            let mut later = Vec::new();
            {
                let Context {
                    ref mut pending,
                    ref mut queued,
                    ref txs,
                    ..
                } = self.ctx;
                let mut i = 0;
                while i < pending.len() {
                    let t = pending[i];
                    if txs[t as usize].conn == ch {
                        pending.remove(i);
                        later.push(t);
                    } else {
                        i += 1;
                    }
                }
                let mut i = 0;
                while i < queued.len() {
                    let t = queued[i];
                    if txs[t as usize].conn == ch && txs[t as usize].reliable {
                        queued.remove(i);
                        later.push(t);
                    } else {
                        i += 1;
                    }
                }
            }
            for t in later {
                self.complete_tx(t, status, now);
            }
            if let Some(conn) = self.connections.get_mut(ch.0) {
                conn.state = State::Failed;
                for op in conn.rma_ops.iter_mut() {
                    if op.failed.is_none() && !op.is_complete() {
                        op.failed = Some(status);
                    }
                }
            }
            self.maybe_complete_rma(ch, now);
        } else {
            self.maybe_complete_rma(ch, now);
        }
    }

    /// Complete everything in flight on a connection (disconnect, device
    /// failure), in enqueue order.
    fn flush_conn(&mut self, ch: ConnectionHandle, status: Status, now: u64) {
        let mut doomed = Vec::new();
        {
            let Context {
                ref mut pending,
                ref mut queued,
                ref txs,
                ..
            } = self.ctx;
            let mut i = 0;
            while i < pending.len() {
                let t = pending[i];
                if txs[t as usize].conn == ch {
                    pending.remove(i);
                    doomed.push(t);
                } else {
                    i += 1;
                }
            }
            let mut i = 0;
            while i < queued.len() {
                let t = queued[i];
                if txs[t as usize].conn == ch {
                    queued.remove(i);
                    doomed.push(t);
                } else {
                    i += 1;
                }
            }
        }
        for t in doomed {
            self.complete_tx(t, status, now);
        }
        if let Some(conn) = self.connections.get_mut(ch.0) {
            for op in conn.rma_ops.iter_mut() {
                if !op.is_complete() {
                    if op.failed.is_none() {
                        op.failed = Some(status);
                    }
                } else {
                    // already remotely complete; only the completion message
                    // was still owed, and the connection is going away
                    op.completion = None;
                }
            }
        }
        self.maybe_complete_rma(ch, now);
    }

    //
    // Progress
    //

    /// One cooperative progress pass: retransmit and expire pending txs,
    /// transmit queued txs, emit delayed acks, fire keepalives.
    pub fn progress(&mut self, now: u64) {
        // pending walk: expiry first, then due retransmits
        let mut overdue = Vec::new();
        let mut resend = Vec::new();
        {
            let ctx = &self.ctx;
            let connections = &self.connections;
            for &ti in &ctx.pending {
                let tx = &ctx.txs[ti as usize];
                let timeout = tx.timeout_override.unwrap_or_else(|| {
                    connections
                        .get(tx.conn.0)
                        .map_or(ctx.config.tx_timeout, |c| c.tx_timeout(&ctx.config))
                });
                if now.saturating_sub(tx.first_send) >= timeout {
                    overdue.push(ti);
                } else if now >= tx.deadline {
                    resend.push(ti);
                }
            }
        }
        for ti in overdue {
            if self.ctx.txs[ti as usize].state == TxState::Pending {
                self.fail_tx_chain(ti, now);
            }
        }
        let interval = self.ctx.config.resend_interval;
        for ti in resend {
            let due = {
                let tx = &self.ctx.txs[ti as usize];
                tx.state == TxState::Pending && now >= tx.deadline
            };
            if !due {
                continue;
            }
            self.emit_tx(ti);
            let tx = &mut self.ctx.txs[ti as usize];
            tx.resends += 1;
            tx.deadline = now + interval * (u64::from(tx.resends) + 1);
        }

        // queued walk: first transmission
        while let Some(ti) = self.ctx.queued.pop_front() {
            if self.ctx.txs[ti as usize].state != TxState::Queued {
                continue;
            }
            self.emit_tx(ti);
            let reliable = self.ctx.txs[ti as usize].reliable;
            if reliable {
                let tx = &mut self.ctx.txs[ti as usize];
                tx.state = TxState::Pending;
                if tx.first_send == 0 {
                    tx.first_send = now;
                }
                tx.deadline = now + interval;
                self.ctx.pending.push_back(ti);
            } else {
                // unreliable: done the moment it leaves
                self.complete_tx(ti, Status::Success, now);
            }
        }

        // delayed acks and keepalives
        {
            let Context {
                ref config,
                ref mut io,
                ref mut events,
                ..
            } = self.ctx;
            for (_, conn) in self.connections.iter_mut() {
                if let Some(due) = conn.ack_due {
                    if due <= now && conn.acked.is_some() {
                        let mut buf = Vec::new();
                        Packet::ConnAck {
                            seq: 0,
                            ack: conn.cumulative(),
                        }.encode(conn.peer_ep, conn.peer_id, &mut buf);
                        io.push_back(Io::Transmit {
                            destination: conn.remote,
                            packet: buf.into_boxed_slice(),
                        });
                        conn.ack_due = None;
                    }
                }
                let ka = conn.keepalive(config);
                if ka > 0
                    && conn.state.is_usable()
                    && !conn.keepalive_fired
                    && now.saturating_sub(conn.last_recv) >= ka
                {
                    debug!(conn.log, "keepalive timeout");
                    conn.keepalive_fired = true;
                    events.push_back(Event::KeepaliveTimedOut { conn: conn.handle });
                    let mut buf = Vec::new();
                    Packet::Keepalive.encode(conn.peer_ep, conn.peer_id, &mut buf);
                    io.push_back(Io::Transmit {
                        destination: conn.remote,
                        packet: buf.into_boxed_slice(),
                    });
                }
            }
        }

        // let operations blocked on slots or windows move again
        let handles: Vec<ConnectionHandle> = self
            .connections
            .iter()
            .filter(|&(_, ref c)| !c.rma_ops.is_empty())
            .map(|(k, _)| ConnectionHandle(k))
            .collect();
        for ch in handles {
            self.maybe_complete_rma(ch, now);
            self.drive_rma(ch, now);
        }
    }

    /// Earliest instant at which `progress` has work to do, for drivers that
    /// sleep between ticks.
    pub fn next_timeout(&self) -> Option<u64> {
        let mut next: Option<u64> = None;
        let mut fold = |t: u64| {
            next = Some(match next {
                Some(n) if n <= t => n,
                _ => t,
            });
        };
        if !self.ctx.queued.is_empty() {
            fold(0);
        }
        for &ti in &self.ctx.pending {
            let tx = &self.ctx.txs[ti as usize];
            fold(tx.deadline);
            let timeout = tx.timeout_override.unwrap_or_else(|| {
                self.connections
                    .get(tx.conn.0)
                    .map_or(self.ctx.config.tx_timeout, |c| c.tx_timeout(&self.ctx.config))
            });
            fold(tx.first_send + timeout);
        }
        for (_, conn) in self.connections.iter() {
            if let Some(due) = conn.ack_due {
                fold(due);
            }
            let interval = conn.keepalive(&self.ctx.config);
            if interval > 0 && conn.state.is_usable() && !conn.keepalive_fired {
                fold(conn.last_recv + interval);
            }
        }
        next
    }

    //
    // Internals
    //

    /// Allocate a slot, pack `packet` into it and put it on the queued list.
    fn pack_tx(
        &mut self,
        ch: ConnectionHandle,
        dst: (u32, u32),
        packet: &Packet,
        seq: u64,
        reliable: bool,
        context: u64,
        flags: SendFlags,
    ) -> Result<u16, ()> {
        let ti = self.ctx.tx_pool.alloc().ok_or(())?;
        self.ctx.scratch.clear();
        packet.encode(dst.0, dst.1, &mut self.ctx.scratch);
        debug_assert!(self.ctx.scratch.len() <= self.ctx.tx_pool.slot_len());
        let len = self.ctx.scratch.len();
        self.ctx.tx_pool.buf_mut(ti)[..len].copy_from_slice(&self.ctx.scratch);
        let ty = match *packet {
            Packet::Send { .. } => Type::Send,
            Packet::ConnRequest { .. } => Type::ConnRequest,
            Packet::ConnReply { .. } => Type::ConnReply,
            Packet::ConnAck { .. } => Type::ConnAck,
            Packet::Nack { .. } => Type::Nack,
            Packet::RmaWrite { .. } => Type::RmaWrite,
            Packet::RmaRead { .. } => Type::RmaRead,
            Packet::Keepalive => Type::Keepalive,
        };
        self.ctx.txs[ti as usize] = Tx {
            ty,
            conn: ch,
            seq,
            len: len as u16,
            state: TxState::Queued,
            reliable,
            first_send: 0,
            deadline: 0,
            resends: 0,
            context,
            flags,
            status: Status::Success,
            rma_op: None,
            frag_len: 0,
            timeout_override: None,
        };
        self.ctx.queued.push_back(ti);
        if reliable {
            // this datagram piggy-backs the latest cumulative ack
            if let Some(conn) = self.connections.get_mut(ch.0) {
                conn.ack_due = None;
            }
        }
        Ok(ti)
    }

    fn free_tx(&mut self, ti: u16) {
        self.ctx.txs[ti as usize].state = TxState::Completed;
        self.ctx.tx_pool.free(ti);
    }

    /// Drop a pending tx without completing it (handshake txs whose answer
    /// arrived).
    fn drop_pending_tx(&mut self, ti: u16) {
        self.remove_queued_ref(ti);
        self.remove_pending_ref(ti);
        self.free_tx(ti);
    }

    fn remove_pending_ref(&mut self, ti: u16) {
        if let Some(pos) = self.ctx.pending.iter().position(|&t| t == ti) {
            self.ctx.pending.remove(pos);
        }
    }

    fn remove_queued_ref(&mut self, ti: u16) {
        if let Some(pos) = self.ctx.queued.iter().position(|&t| t == ti) {
            self.ctx.queued.remove(pos);
        }
    }

    fn emit_tx(&mut self, ti: u16) {
        let destination = {
            let tx = &self.ctx.txs[ti as usize];
            match self.connections.get(tx.conn.0) {
                Some(c) => c.remote,
                None => return,
            }
        };
        let packet = {
            let len = self.ctx.txs[ti as usize].len as usize;
            self.ctx.tx_pool.buf(ti)[..len].to_vec().into_boxed_slice()
        };
        self.ctx.io.push_back(Io::Transmit {
            destination,
            packet,
        });
    }

    /// Pack and emit a slot-less control datagram (acks, nacks, rejects,
    /// keepalive probes). These are never retransmitted.
    fn emit_packet(&mut self, destination: SocketAddr, dst: (u32, u32), packet: &Packet) {
        let mut buf = Vec::new();
        packet.encode(dst.0, dst.1, &mut buf);
        self.ctx.io.push_back(Io::Transmit {
            destination,
            packet: buf.into_boxed_slice(),
        });
    }

    /// Remove a connection from the tables and release its id and buffers.
    fn forget_conn(&mut self, ch: ConnectionHandle) {
        if self.connections.get(ch.0).is_none() {
            return;
        }
        let conn = self.connections.remove(ch.0);
        self.conn_ids.remove(&conn.local_id);
        if self.conn_remotes.get(&(conn.remote, conn.peer_id)) == Some(&ch) {
            self.conn_remotes.remove(&(conn.remote, conn.peer_id));
        }
        for (_, (slot, _)) in conn.reorder {
            self.ctx.rx_pool.free(slot);
        }
        for (slot, _) in conn.deferred {
            self.ctx.rx_pool.free(slot);
        }
        self.ids.release(conn.local_id);
    }
}
