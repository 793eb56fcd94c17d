//! RMA region registration and the opaque handles that name regions on the
//! wire.
//!
//! A handle is 32 bytes, portable over any channel (typically shipped to the
//! peer inside an ordinary send): a magic tag, the owning endpoint id, the
//! region id, the granted access bits and a validity nonce, zero-padded. The
//! nonce makes a handle from a stale registration fail resolution instead of
//! aliasing a new region.

use byteorder::{BigEndian, ByteOrder};
use rand::Rng;
use slab::Slab;

pub const RMA_HANDLE_SIZE: usize = 32;

const HANDLE_MAGIC: u32 = 0x6363_6972;

#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash)]
pub struct RmaHandle(pub(crate) [u8; RMA_HANDLE_SIZE]);

impl RmaHandle {
    pub fn as_bytes(&self) -> &[u8; RMA_HANDLE_SIZE] {
        &self.0
    }

    /// Reconstitute a handle received over the wire.
    pub fn from_bytes(raw: [u8; RMA_HANDLE_SIZE]) -> Self {
        RmaHandle(raw)
    }

    pub fn from_slice(raw: &[u8]) -> Option<Self> {
        if raw.len() != RMA_HANDLE_SIZE {
            return None;
        }
        let mut bytes = [0; RMA_HANDLE_SIZE];
        bytes.copy_from_slice(raw);
        Some(RmaHandle(bytes))
    }

    fn pack(ep_id: u32, region: u32, access: Access, nonce: u32) -> Self {
        let mut raw = [0; RMA_HANDLE_SIZE];
        BigEndian::write_u32(&mut raw[0..4], HANDLE_MAGIC);
        BigEndian::write_u32(&mut raw[4..8], ep_id);
        BigEndian::write_u32(&mut raw[8..12], region);
        BigEndian::write_u32(&mut raw[12..16], access.to_bits());
        BigEndian::write_u32(&mut raw[16..20], nonce);
        RmaHandle(raw)
    }

    pub(crate) fn unpack(&self) -> Option<HandleFields> {
        if BigEndian::read_u32(&self.0[0..4]) != HANDLE_MAGIC {
            return None;
        }
        Some(HandleFields {
            ep_id: BigEndian::read_u32(&self.0[4..8]),
            region: BigEndian::read_u32(&self.0[8..12]),
            access: Access::from_bits(BigEndian::read_u32(&self.0[12..16])),
            nonce: BigEndian::read_u32(&self.0[16..20]),
        })
    }
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub(crate) struct HandleFields {
    pub ep_id: u32,
    pub region: u32,
    pub access: Access,
    pub nonce: u32,
}

/// Access granted to the remote side of a connection.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct Access {
    pub remote_read: bool,
    pub remote_write: bool,
}

impl Access {
    pub fn read_write() -> Self {
        Access {
            remote_read: true,
            remote_write: true,
        }
    }

    fn to_bits(self) -> u32 {
        (self.remote_read as u32) | (self.remote_write as u32) << 1
    }

    fn from_bits(bits: u32) -> Self {
        Access {
            remote_read: bits & 0x1 != 0,
            remote_write: bits & 0x2 != 0,
        }
    }
}

pub(crate) struct Region {
    pub mem: Box<[u8]>,
    pub access: Access,
    pub nonce: u32,
    /// Operations (local or remote-initiated) currently touching the region.
    pub in_flight: u32,
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub(crate) enum DeregError {
    Unknown,
    Busy,
}

pub(crate) struct RegionTable {
    regions: Slab<Region>,
}

impl RegionTable {
    pub fn new() -> Self {
        Self {
            regions: Slab::new(),
        }
    }

    pub fn register<R: Rng>(
        &mut self,
        ep_id: u32,
        mem: Box<[u8]>,
        access: Access,
        rng: &mut R,
    ) -> RmaHandle {
        let nonce = rng.gen();
        let region = self.regions.insert(Region {
            mem,
            access,
            nonce,
            in_flight: 0,
        });
        RmaHandle::pack(ep_id, region as u32, access, nonce)
    }

    pub fn deregister(&mut self, handle: &RmaHandle) -> Result<Box<[u8]>, DeregError> {
        let idx = self.resolve(handle).ok_or(DeregError::Unknown)?;
        if self.regions[idx].in_flight != 0 {
            return Err(DeregError::Busy);
        }
        Ok(self.regions.remove(idx).mem)
    }

    /// Validate a handle against the live table: known region, matching
    /// nonce. Access checks are the caller's, since the required right
    /// depends on the direction of the operation.
    pub fn resolve(&self, handle: &RmaHandle) -> Option<usize> {
        let fields = handle.unpack()?;
        let region = self.regions.get(fields.region as usize)?;
        if region.nonce != fields.nonce {
            return None;
        }
        Some(fields.region as usize)
    }

    pub fn get(&self, idx: usize) -> &Region {
        &self.regions[idx]
    }

    pub fn get_mut(&mut self, idx: usize) -> &mut Region {
        &mut self.regions[idx]
    }
}
