//! Per-connection protocol state.
//!
//! A connection is a reliability-typed channel between two endpoints,
//! identified on each side by a dense 32-bit local id. The endpoint owns all
//! connections in an arena and drives them; this module holds the state that
//! is strictly per-connection: the handshake state machine, the send
//! sequence, the receive-side ack window and reorder buffer, keepalive
//! bookkeeping and the queue of in-progress RMA operations.

use std::collections::{BTreeMap, VecDeque};
use std::net::SocketAddr;

use bytes::Bytes;
use slog::Logger;

use endpoint::Config;
use rma::RmaHandle;
use sack::AckWindow;
use {Attribute, Status};

#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub struct ConnectionHandle(pub usize);

impl From<ConnectionHandle> for usize {
    fn from(x: ConnectionHandle) -> usize {
        x.0
    }
}

/// Connection status.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum State {
    /// Initiator: CONN_REQUEST in flight, awaiting CONN_REPLY.
    Active,
    /// Responder: request surfaced to the application, awaiting accept or
    /// reject.
    PendingRequest,
    /// Responder: accepted, CONN_REPLY in flight, awaiting CONN_ACK. The
    /// connection already carries data in this state; the ACCEPT event is
    /// what the CONN_ACK unlocks.
    PendingReply,
    Ready,
    Rejected,
    /// Unrecoverable reliability failure; operations return disconnected.
    Failed,
    Disconnected,
}

impl State {
    /// Whether the application may send on and receive data for this
    /// connection.
    pub fn is_usable(self) -> bool {
        match self {
            State::Ready | State::PendingReply => true,
            _ => false,
        }
    }

    pub fn is_defunct(self) -> bool {
        match self {
            State::Rejected | State::Failed | State::Disconnected => true,
            _ => false,
        }
    }
}

pub(crate) struct Connection {
    pub log: Logger,
    pub handle: ConnectionHandle,
    pub remote: SocketAddr,
    pub attribute: Attribute,
    pub state: State,
    pub local_id: u32,
    /// The peer's connection id; zero until the handshake supplies it.
    pub peer_id: u32,
    /// The peer's endpoint id; zero until the handshake supplies it.
    pub peer_ep: u32,
    /// Application context attached by connect or accept, echoed in the
    /// CONNECT or ACCEPT event.
    pub context: u64,

    /// Last assigned send sequence. Seeded with 48 random bits by the
    /// handshake; the seed itself is consumed by CONN_REQUEST or CONN_REPLY.
    pub seq: u64,
    /// Receive-side ack state. Absent on an initiator until the CONN_REPLY
    /// supplies the peer's sequence seed.
    pub acked: Option<AckWindow>,
    /// Highest cumulative ack advertised by the peer. Monotone.
    pub peer_acked: u64,
    /// Set when the last control received from the peer was a NACK; a tx
    /// that expires while this holds completes with RNR instead of a
    /// timeout.
    pub rnr: bool,
    /// The reliable control tx currently driving the handshake
    /// (CONN_REQUEST or CONN_REPLY).
    pub handshake_tx: Option<u16>,

    /// Reliable-ordered receives buffered past a sequence gap:
    /// seq → (rx slot, length).
    pub reorder: BTreeMap<u64, (u16, u16)>,
    /// Unreliable datagrams that arrived before the handshake finished,
    /// drained to events on the transition to Ready.
    pub deferred: VecDeque<(u16, u16)>,

    /// Deadline for a bare acknowledgement if no outgoing traffic
    /// piggy-backs one first.
    pub ack_due: Option<u64>,
    pub last_recv: u64,
    pub keepalive_override: Option<u64>,
    /// The keepalive event fired and will not re-arm until the peer is
    /// heard from again.
    pub keepalive_fired: bool,
    pub tx_timeout_override: Option<u64>,

    pub rma_ops: VecDeque<RmaOp>,
    pub next_rma_id: u32,
}

impl Connection {
    pub fn new(
        log: Logger,
        handle: ConnectionHandle,
        remote: SocketAddr,
        attribute: Attribute,
        state: State,
        local_id: u32,
        now: u64,
    ) -> Self {
        Self {
            log,
            handle,
            remote,
            attribute,
            state,
            local_id,
            peer_id: 0,
            peer_ep: 0,
            context: 0,
            seq: 0,
            acked: None,
            peer_acked: 0,
            rnr: false,
            handshake_tx: None,
            reorder: BTreeMap::new(),
            deferred: VecDeque::new(),
            ack_due: None,
            last_recv: now,
            keepalive_override: None,
            keepalive_fired: false,
            tx_timeout_override: None,
            rma_ops: VecDeque::new(),
            next_rma_id: 0,
        }
    }

    pub fn next_seq(&mut self) -> u64 {
        self.seq += 1;
        self.seq
    }

    /// Cumulative ack to advertise on outgoing traffic.
    pub fn cumulative(&self) -> u64 {
        self.acked.as_ref().map_or(0, |w| w.cumulative())
    }

    /// Effective total send timeout: connection override, else endpoint
    /// default.
    pub fn tx_timeout(&self, config: &Config) -> u64 {
        self.tx_timeout_override.unwrap_or(config.tx_timeout)
    }

    /// Effective keepalive interval; zero disables.
    pub fn keepalive(&self, config: &Config) -> u64 {
        self.keepalive_override.unwrap_or(config.keepalive)
    }

    /// Record traffic from the peer: feeds keepalive and clears
    /// receiver-not-ready status.
    pub fn note_recv(&mut self, now: u64) {
        self.last_recv = now;
        self.keepalive_fired = false;
        self.rnr = false;
    }

    pub fn schedule_ack(&mut self, now: u64, delay: u64) {
        let due = now + delay;
        self.ack_due = Some(match self.ack_due {
            Some(t) if t < due => t,
            _ => due,
        });
    }

    pub fn alloc_rma_id(&mut self) -> u32 {
        self.next_rma_id += 1;
        self.next_rma_id
    }
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub(crate) enum RmaKind {
    /// Locally initiated write: push fragments, complete on last ack.
    Write,
    /// Locally initiated read: one request out, complete when all fragments
    /// have landed in the local region.
    Read,
    /// Remotely requested read: push fragments back at the requester.
    ReadResponse,
}

/// One RMA operation in progress on a connection.
pub(crate) struct RmaOp {
    pub id: u32,
    pub kind: RmaKind,
    /// Region index on this endpoint backing the local side.
    pub local_region: usize,
    pub local_handle: RmaHandle,
    pub remote_handle: RmaHandle,
    pub local_offset: u64,
    pub remote_offset: u64,
    pub length: u64,
    /// Next fragment offset (within the transfer) to put on the wire.
    pub next_offset: u64,
    /// Bytes covered by remotely acknowledged fragments.
    pub acked: u64,
    /// Bytes landed in the local region (Read only).
    pub received: u64,
    /// Fragments (or the read request) in flight.
    pub outstanding: u32,
    pub fence: bool,
    pub silent: bool,
    pub blocking: bool,
    pub context: u64,
    pub completion: Option<Bytes>,
    /// First failure observed; stops further issue and decides the surfaced
    /// status.
    pub failed: Option<Status>,
}

impl RmaOp {
    /// Remote completion: the moment the local SEND-type event is due.
    pub fn is_complete(&self) -> bool {
        if self.failed.is_some() {
            return self.outstanding == 0;
        }
        match self.kind {
            RmaKind::Write | RmaKind::ReadResponse => {
                self.acked >= self.length && self.outstanding == 0
            }
            RmaKind::Read => self.received >= self.length,
        }
    }

    pub fn status(&self) -> Status {
        self.failed.unwrap_or(Status::Success)
    }
}
