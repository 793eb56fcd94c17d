//! A user-space common communications interface: connection-oriented,
//! reliability-selectable messaging and one-sided remote memory access over
//! commodity datagram networks.
//!
//! The protocol core (`endpoint::Endpoint`) performs no I/O whatsoever. It
//! consumes inbound datagrams and clock readings, and produces transmit
//! operations and application events for a backend to execute. `udp` supplies
//! such a backend over a plain UDP socket together with the blocking,
//! thread-safe public surface.

extern crate byteorder;
extern crate bytes;
#[macro_use]
extern crate failure;
extern crate fnv;
#[macro_use]
extern crate lazy_static;
extern crate rand;
extern crate slab;
#[macro_use]
extern crate slog;

#[cfg(test)]
#[macro_use]
extern crate assert_matches;
#[cfg(test)]
#[macro_use]
extern crate hex_literal;
#[cfg(test)]
extern crate slog_term;

mod bitmap;
mod coding;
mod config;
mod connection;
mod endpoint;
mod packet;
mod pool;
mod rma;
mod sack;
#[cfg(test)]
mod tests;
mod udp;

pub use config::{ConfigError, DeviceSpec};
pub use connection::{ConnectionHandle, State};
pub use endpoint::{
    AcceptError, Config, ConnectError, Endpoint, Event, EventError, Io, RmaError, RmaFlags,
    RmaId, RxToken, SendError, SendFlags, SendId, TxToken,
};
pub use rma::{Access, RmaHandle, RMA_HANDLE_SIZE};
pub use udp::{
    create_endpoint, create_endpoint_at, finalize, get_devices, init, null_logger, Caps, Device,
    EndpointError, InitError, Opt, OptError, OptName, OptValue, RmaAlign, UdpEndpoint,
    ABI_VERSION,
};

/// Reliability and ordering class of a connection.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum Attribute {
    /// Reliable ordered: sends complete in order, receives arrive in order.
    Ro,
    /// Reliable unordered: exactly-once delivery, arbitrary order.
    Ru,
    /// Unreliable unordered.
    Uu,
    /// Multicast send side (unreliable).
    UuMcTx,
    /// Multicast receive side (unreliable).
    UuMcRx,
}

impl Attribute {
    pub fn is_reliable(self) -> bool {
        match self {
            Attribute::Ro | Attribute::Ru => true,
            _ => false,
        }
    }

    pub fn is_ordered(self) -> bool {
        self == Attribute::Ro
    }

    pub(crate) fn to_byte(self) -> u8 {
        match self {
            Attribute::Ro => 0,
            Attribute::Ru => 1,
            Attribute::Uu => 2,
            Attribute::UuMcTx => 3,
            Attribute::UuMcRx => 4,
        }
    }

    pub(crate) fn from_byte(x: u8) -> Option<Self> {
        Some(match x {
            0 => Attribute::Ro,
            1 => Attribute::Ru,
            2 => Attribute::Uu,
            3 => Attribute::UuMcTx,
            4 => Attribute::UuMcRx,
            _ => {
                return None;
            }
        })
    }
}

/// Completion status carried by asynchronous events.
///
/// Synchronous failures are reported through the per-operation error enums;
/// a `Status` other than `Success` only ever reaches the application inside
/// an event bound to the originating operation.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum Status {
    Success,
    /// The operation exhausted its reliability budget.
    Timeout,
    /// The peer repeatedly signalled receiver-not-ready.
    Rnr,
    /// The connection failed or was torn down before completion.
    Disconnected,
    /// The peer rejected the connection request.
    Refused,
    /// The named RMA region is unknown to the peer or forbids the access.
    RmaHandle,
    /// The peer cannot perform the requested RMA operation.
    RmaOp,
    /// The underlying device failed.
    DeviceDead,
}

impl Status {
    pub fn is_success(self) -> bool {
        self == Status::Success
    }

    pub(crate) fn to_byte(self) -> u8 {
        match self {
            Status::Success => 0,
            Status::Timeout => 1,
            Status::Rnr => 2,
            Status::Disconnected => 3,
            Status::Refused => 4,
            Status::RmaHandle => 5,
            Status::RmaOp => 6,
            Status::DeviceDead => 7,
        }
    }

    pub(crate) fn from_byte(x: u8) -> Option<Self> {
        Some(match x {
            0 => Status::Success,
            1 => Status::Timeout,
            2 => Status::Rnr,
            3 => Status::Disconnected,
            4 => Status::Refused,
            5 => Status::RmaHandle,
            6 => Status::RmaOp,
            7 => Status::DeviceDead,
            _ => {
                return None;
            }
        })
    }
}

impl ::std::fmt::Display for Status {
    fn fmt(&self, f: &mut ::std::fmt::Formatter) -> ::std::fmt::Result {
        let s = match *self {
            Status::Success => "success",
            Status::Timeout => "timed out",
            Status::Rnr => "receiver not ready",
            Status::Disconnected => "disconnected",
            Status::Refused => "connection refused",
            Status::RmaHandle => "invalid rma handle",
            Status::RmaOp => "rma operation not supported",
            Status::DeviceDead => "device failed",
        };
        f.write_str(s)
    }
}

impl slog::Value for Status {
    fn serialize(
        &self,
        _: &slog::Record,
        key: slog::Key,
        serializer: &mut slog::Serializer,
    ) -> slog::Result {
        serializer.emit_arguments(key, &format_args!("{}", self))
    }
}

/// Largest opaque payload accepted on a connection request.
pub const CONN_REQ_LEN: usize = 1024;

/// Default number of send-side buffer slots per endpoint.
pub const EP_TX_CNT: u16 = 1024;
/// Default number of receive-side buffer slots per endpoint.
pub const EP_RX_CNT: u16 = 1024;
/// Default length of one buffer slot, bounding one datagram.
pub const EP_BUF_LEN: usize = 8 * 1024;
