//! Bit-exact wire framing.
//!
//! Every datagram begins with the 12-byte generic header: message type, a
//! type-specific sub-field, body length, destination endpoint id and
//! destination connection id, all big-endian. Pack and unpack are pure;
//! anything malformed fails decode and the caller drops the datagram without
//! notifying the peer.

use byteorder::{BigEndian, ByteOrder};
use bytes::Bytes;
use std::io::Cursor;

use coding::{self, BufExt, BufMutExt};
use rma::{RmaHandle, RMA_HANDLE_SIZE};
use {Attribute, CONN_REQ_LEN};

/// Generic header length on the wire.
pub const HEADER_SIZE: usize = 12;
/// Sequence + cumulative ack trailer carried by reliable messages.
pub const SEQ_ACK_SIZE: usize = 16;
/// Fixed overhead of a MSG_SEND datagram.
pub const SEND_OVERHEAD: usize = HEADER_SIZE + SEQ_ACK_SIZE;
/// Fixed overhead of an RMA fragment datagram.
pub const RMA_OVERHEAD: usize = SEND_OVERHEAD + 2 * RMA_HANDLE_SIZE + 3 * 8 + 4 + 1 + 2;
/// Fixed overhead of a CONN_REQUEST datagram.
pub const CONN_REQUEST_OVERHEAD: usize = HEADER_SIZE + 4 + 4 + 2 + 8;

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Type {
    Send = 1,
    ConnRequest = 2,
    ConnReply = 3,
    ConnAck = 4,
    Nack = 5,
    RmaWrite = 6,
    RmaRead = 7,
    Keepalive = 8,
}

impl Type {
    fn from_byte(x: u8) -> Option<Self> {
        Some(match x {
            1 => Type::Send,
            2 => Type::ConnRequest,
            3 => Type::ConnReply,
            4 => Type::ConnAck,
            5 => Type::Nack,
            6 => Type::RmaWrite,
            7 => Type::RmaRead,
            8 => Type::Keepalive,
            _ => {
                return None;
            }
        })
    }
}

impl ::std::fmt::Display for Type {
    fn fmt(&self, f: &mut ::std::fmt::Formatter) -> ::std::fmt::Result {
        write!(f, "{:?}", self)
    }
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct Header {
    pub ty: Type,
    pub sub: u8,
    pub len: u16,
    pub dst_ep: u32,
    pub dst_conn: u32,
}

impl Header {
    fn encode(&self, buf: &mut Vec<u8>) {
        buf.write(self.ty as u8);
        buf.write(self.sub);
        buf.write(self.len);
        buf.write(self.dst_ep);
        buf.write(self.dst_conn);
    }

    fn decode(data: &[u8]) -> Result<Self, PacketDecodeError> {
        if data.len() < HEADER_SIZE {
            return Err(PacketDecodeError::UnexpectedEnd);
        }
        let ty = Type::from_byte(data[0]).ok_or(PacketDecodeError::UnknownType(data[0]))?;
        Ok(Header {
            ty,
            sub: data[1],
            len: BigEndian::read_u16(&data[2..4]),
            dst_ep: BigEndian::read_u32(&data[4..8]),
            dst_conn: BigEndian::read_u32(&data[8..12]),
        })
    }
}

/// Disposition of a connection request, carried in the CONN_REPLY sub-field.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum ReplyStatus {
    Accept,
    Reject,
}

/// Body of an RMA_WRITE or RMA_READ request.
///
/// The sub-field of the generic header carries a status byte: zero on
/// requests, an error status on a reply that refuses the operation. `local`
/// names a region at the message's sender, `remote` one at its receiver.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct RmaBody {
    pub seq: u64,
    pub ack: u64,
    pub local: RmaHandle,
    pub remote: RmaHandle,
    pub local_offset: u64,
    pub remote_offset: u64,
    pub frag_offset: u64,
    pub frag_len: u32,
    pub fence: bool,
    pub completion_len: u16,
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub enum Packet {
    Send {
        seq: u64,
        ack: u64,
        payload: Bytes,
    },
    ConnRequest {
        attribute: Attribute,
        initiator_conn: u32,
        initiator_ep: u32,
        seq: u64,
        payload: Bytes,
    },
    ConnReply {
        status: ReplyStatus,
        target_conn: u32,
        target_ep: u32,
        seq: u64,
        ack: u64,
    },
    ConnAck {
        seq: u64,
        ack: u64,
    },
    Nack {
        seq: u64,
        ack: u64,
    },
    RmaWrite {
        status: u8,
        body: RmaBody,
        payload: Bytes,
    },
    RmaRead {
        status: u8,
        body: RmaBody,
    },
    Keepalive,
}

#[derive(Debug, Fail, Clone, Copy, Eq, PartialEq)]
pub enum PacketDecodeError {
    #[fail(display = "unexpected end of datagram")]
    UnexpectedEnd,
    #[fail(display = "unknown message type {}", _0)]
    UnknownType(u8),
    #[fail(display = "unknown connection attribute {}", _0)]
    UnknownAttribute(u8),
    #[fail(display = "stated length exceeds datagram")]
    LengthMismatch,
    #[fail(display = "oversized connection request payload")]
    RequestTooLong,
}

impl From<coding::UnexpectedEnd> for PacketDecodeError {
    fn from(_: coding::UnexpectedEnd) -> Self {
        PacketDecodeError::UnexpectedEnd
    }
}

fn decode_handle(r: &mut Cursor<&[u8]>) -> Result<RmaHandle, PacketDecodeError> {
    let bytes = r.get_bytes(RMA_HANDLE_SIZE)?;
    let mut raw = [0; RMA_HANDLE_SIZE];
    raw.copy_from_slice(&bytes);
    Ok(RmaHandle(raw))
}

fn decode_rma_body(r: &mut Cursor<&[u8]>) -> Result<RmaBody, PacketDecodeError> {
    let seq = r.get::<u64>()?;
    let ack = r.get::<u64>()?;
    let local = decode_handle(r)?;
    let remote = decode_handle(r)?;
    let local_offset = r.get::<u64>()?;
    let remote_offset = r.get::<u64>()?;
    let frag_offset = r.get::<u64>()?;
    let frag_len = r.get::<u32>()?;
    let flags = r.get::<u8>()?;
    let completion_len = r.get::<u16>()?;
    Ok(RmaBody {
        seq,
        ack,
        local,
        remote,
        local_offset,
        remote_offset,
        frag_offset,
        frag_len,
        fence: flags & 0x1 != 0,
        completion_len,
    })
}

fn encode_rma_body(body: &RmaBody, buf: &mut Vec<u8>) {
    buf.write(body.seq);
    buf.write(body.ack);
    buf.extend_from_slice(&body.local.0);
    buf.extend_from_slice(&body.remote.0);
    buf.write(body.local_offset);
    buf.write(body.remote_offset);
    buf.write(body.frag_offset);
    buf.write(body.frag_len);
    buf.write(if body.fence { 0x1u8 } else { 0 });
    buf.write(body.completion_len);
}

impl Packet {
    /// Decode one datagram. The body length stated in the header bounds the
    /// payload; trailing garbage past it is tolerated and ignored.
    pub fn decode(datagram: &[u8]) -> Result<(Header, Packet), PacketDecodeError> {
        let header = Header::decode(datagram)?;
        let body = &datagram[HEADER_SIZE..];
        if (header.len as usize) > body.len() {
            return Err(PacketDecodeError::LengthMismatch);
        }
        let body = &body[..header.len as usize];
        let mut r = Cursor::new(body);
        let packet = match header.ty {
            Type::Send => {
                let seq = r.get::<u64>()?;
                let ack = r.get::<u64>()?;
                let payload = Bytes::from(&body[r.position() as usize..]);
                Packet::Send { seq, ack, payload }
            }
            Type::ConnRequest => {
                let attribute = Attribute::from_byte(header.sub)
                    .ok_or(PacketDecodeError::UnknownAttribute(header.sub))?;
                let initiator_conn = r.get::<u32>()?;
                let initiator_ep = r.get::<u32>()?;
                let payload_len = r.get::<u16>()? as usize;
                let seq = r.get::<u64>()?;
                if payload_len > CONN_REQ_LEN {
                    return Err(PacketDecodeError::RequestTooLong);
                }
                let rest = &body[r.position() as usize..];
                if payload_len > rest.len() {
                    return Err(PacketDecodeError::LengthMismatch);
                }
                Packet::ConnRequest {
                    attribute,
                    initiator_conn,
                    initiator_ep,
                    seq,
                    payload: Bytes::from(&rest[..payload_len]),
                }
            }
            Type::ConnReply => {
                let status = match header.sub {
                    0 => ReplyStatus::Accept,
                    _ => ReplyStatus::Reject,
                };
                Packet::ConnReply {
                    status,
                    target_conn: r.get::<u32>()?,
                    target_ep: r.get::<u32>()?,
                    seq: r.get::<u64>()?,
                    ack: r.get::<u64>()?,
                }
            }
            Type::ConnAck => Packet::ConnAck {
                seq: r.get::<u64>()?,
                ack: r.get::<u64>()?,
            },
            Type::Nack => Packet::Nack {
                seq: r.get::<u64>()?,
                ack: r.get::<u64>()?,
            },
            Type::RmaWrite => {
                let rma = decode_rma_body(&mut r)?;
                let rest = &body[r.position() as usize..];
                if (rma.frag_len as usize) > rest.len() {
                    return Err(PacketDecodeError::LengthMismatch);
                }
                let payload = Bytes::from(&rest[..rma.frag_len as usize]);
                Packet::RmaWrite {
                    status: header.sub,
                    body: rma,
                    payload,
                }
            }
            Type::RmaRead => Packet::RmaRead {
                status: header.sub,
                body: decode_rma_body(&mut r)?,
            },
            Type::Keepalive => Packet::Keepalive,
        };
        Ok((header, packet))
    }

    /// Pack one datagram addressed to `(dst_ep, dst_conn)`.
    pub fn encode(&self, dst_ep: u32, dst_conn: u32, buf: &mut Vec<u8>) {
        let start = buf.len();
        let (ty, sub) = match *self {
            Packet::Send { .. } => (Type::Send, 0),
            Packet::ConnRequest { attribute, .. } => (Type::ConnRequest, attribute.to_byte()),
            Packet::ConnReply { status, .. } => (
                Type::ConnReply,
                match status {
                    ReplyStatus::Accept => 0,
                    ReplyStatus::Reject => 1,
                },
            ),
            Packet::ConnAck { .. } => (Type::ConnAck, 0),
            Packet::Nack { .. } => (Type::Nack, 0),
            Packet::RmaWrite { status, .. } => (Type::RmaWrite, status),
            Packet::RmaRead { status, .. } => (Type::RmaRead, status),
            Packet::Keepalive => (Type::Keepalive, 0),
        };
        Header {
            ty,
            sub,
            len: 0, // patched below
            dst_ep,
            dst_conn,
        }.encode(buf);
        match *self {
            Packet::Send {
                seq,
                ack,
                ref payload,
            } => {
                buf.write(seq);
                buf.write(ack);
                buf.extend_from_slice(payload);
            }
            Packet::ConnRequest {
                initiator_conn,
                initiator_ep,
                seq,
                ref payload,
                ..
            } => {
                buf.write(initiator_conn);
                buf.write(initiator_ep);
                buf.write(payload.len() as u16);
                buf.write(seq);
                buf.extend_from_slice(payload);
            }
            Packet::ConnReply {
                target_conn,
                target_ep,
                seq,
                ack,
                ..
            } => {
                buf.write(target_conn);
                buf.write(target_ep);
                buf.write(seq);
                buf.write(ack);
            }
            Packet::ConnAck { seq, ack } | Packet::Nack { seq, ack } => {
                buf.write(seq);
                buf.write(ack);
            }
            Packet::RmaWrite {
                ref body,
                ref payload,
                ..
            } => {
                debug_assert_eq!(body.frag_len as usize, payload.len());
                encode_rma_body(body, buf);
                buf.extend_from_slice(payload);
            }
            Packet::RmaRead { ref body, .. } => {
                encode_rma_body(body, buf);
            }
            Packet::Keepalive => {}
        }
        let body_len = buf.len() - start - HEADER_SIZE;
        debug_assert!(body_len <= u16::max_value() as usize);
        BigEndian::write_u16(&mut buf[start + 2..start + 4], body_len as u16);
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use Attribute;

    fn roundtrip(packet: Packet, dst_ep: u32, dst_conn: u32) -> (Header, Packet) {
        let mut buf = Vec::new();
        packet.encode(dst_ep, dst_conn, &mut buf);
        Packet::decode(&buf).expect("decode failed")
    }

    #[test]
    fn send_layout() {
        let mut buf = Vec::new();
        Packet::Send {
            seq: 0x0102_0304_0506_0708,
            ack: 0x1112_1314_1516_1718,
            payload: Bytes::from(&b"hi"[..]),
        }.encode(0xaabb_ccdd, 0x0a0b_0c0d, &mut buf);
        assert_eq!(
            &buf[..HEADER_SIZE],
            &hex!("01000012aabbccdd0a0b0c0d")[..]
        );
        assert_eq!(
            &buf[HEADER_SIZE..],
            &hex!("010203040506070811121314151617186869")[..]
        );
    }

    #[test]
    fn send_roundtrip() {
        let (header, packet) = roundtrip(
            Packet::Send {
                seq: 7,
                ack: 3,
                payload: Bytes::from(&b"ping"[..]),
            },
            1,
            2,
        );
        assert_eq!(header.dst_ep, 1);
        assert_eq!(header.dst_conn, 2);
        assert_matches!(packet, Packet::Send { seq: 7, ack: 3, ref payload } if &payload[..] == b"ping");
    }

    #[test]
    fn conn_request_roundtrip() {
        let (header, packet) = roundtrip(
            Packet::ConnRequest {
                attribute: Attribute::Ru,
                initiator_conn: 9,
                initiator_ep: 4,
                seq: 0xffff_0000_1111,
                payload: Bytes::from(&b"hello"[..]),
            },
            0,
            0,
        );
        assert_eq!(header.ty, Type::ConnRequest);
        assert_eq!(header.sub, Attribute::Ru.to_byte());
        assert_matches!(
            packet,
            Packet::ConnRequest { attribute: Attribute::Ru, initiator_conn: 9, initiator_ep: 4, .. }
        );
    }

    #[test]
    fn rma_roundtrip() {
        let body = RmaBody {
            seq: 42,
            ack: 17,
            local: RmaHandle([0x11; RMA_HANDLE_SIZE]),
            remote: RmaHandle([0x22; RMA_HANDLE_SIZE]),
            local_offset: 4096,
            remote_offset: 8192,
            frag_offset: 12288,
            frag_len: 3,
            fence: true,
            completion_len: 0,
        };
        let (_, packet) = roundtrip(
            Packet::RmaWrite {
                status: 0,
                body: body.clone(),
                payload: Bytes::from(&b"abc"[..]),
            },
            5,
            6,
        );
        match packet {
            Packet::RmaWrite {
                status: 0,
                body: ref b,
                ref payload,
            } => {
                assert_eq!(*b, body);
                assert_eq!(&payload[..], b"abc");
            }
            x => panic!("unexpected packet {:?}", x),
        }
    }

    #[test]
    fn malformed() {
        // truncated header
        assert_eq!(
            Packet::decode(&hex!("010000")),
            Err(PacketDecodeError::UnexpectedEnd)
        );
        // unknown type
        assert_eq!(
            Packet::decode(&hex!("7f0000000000000000000000")),
            Err(PacketDecodeError::UnknownType(0x7f))
        );
        // stated length runs past the datagram
        assert_eq!(
            Packet::decode(&hex!("080000040000000000000000")),
            Err(PacketDecodeError::LengthMismatch)
        );
        // send without a full seq/ack trailer
        assert_eq!(
            Packet::decode(&hex!("010000040000000000000000deadbeef")),
            Err(PacketDecodeError::UnexpectedEnd)
        );
    }

    #[test]
    fn oversized_request_rejected() {
        let mut buf = Vec::new();
        Packet::ConnRequest {
            attribute: Attribute::Ro,
            initiator_conn: 1,
            initiator_ep: 1,
            seq: 1,
            payload: Bytes::from(vec![0; CONN_REQ_LEN + 1]),
        }.encode(0, 0, &mut buf);
        assert_eq!(
            Packet::decode(&buf),
            Err(PacketDecodeError::RequestTooLong)
        );
    }

    #[test]
    fn trailing_garbage_ignored() {
        let mut buf = Vec::new();
        Packet::Keepalive.encode(3, 4, &mut buf);
        buf.extend_from_slice(b"xxxx");
        let (header, packet) = Packet::decode(&buf).unwrap();
        assert_eq!(header.dst_conn, 4);
        assert_eq!(packet, Packet::Keepalive);
    }
}
