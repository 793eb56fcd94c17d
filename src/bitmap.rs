//! Endpoint-local 32-bit identifier allocation.
//!
//! Ids come out of a dense bitmap probed at a random index, so a freed id is
//! unlikely to be handed out again while stale datagrams naming it may still
//! be in flight.

use rand::Rng;

const BLOCK_BITS: u32 = 64;

pub struct IdBitmap {
    blocks: Box<[u64]>,
    capacity: u32,
    used: u32,
}

impl IdBitmap {
    /// Create a bitmap able to track `capacity` ids, rounded up to a whole
    /// number of blocks.
    pub fn new(capacity: u32) -> Self {
        let nblocks = ((capacity + BLOCK_BITS - 1) / BLOCK_BITS) as usize;
        Self {
            blocks: vec![0; nblocks].into_boxed_slice(),
            capacity: nblocks as u32 * BLOCK_BITS,
            used: 0,
        }
    }

    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    pub fn used(&self) -> u32 {
        self.used
    }

    /// Allocate an id, probing from a random position and scanning forward.
    /// Expected O(1) while the map is not close to full.
    pub fn alloc<R: Rng>(&mut self, rng: &mut R) -> Option<u32> {
        if self.used == self.capacity {
            return None;
        }
        let start = rng.gen_range(0, self.capacity);
        for i in 0..self.capacity {
            let id = (start + i) % self.capacity;
            let (block, bit) = (id / BLOCK_BITS, id % BLOCK_BITS);
            if self.blocks[block as usize] & (1 << bit) == 0 {
                self.blocks[block as usize] |= 1 << bit;
                self.used += 1;
                return Some(id);
            }
        }
        unreachable!("used/capacity accounting out of sync");
    }

    /// Release an id.
    ///
    /// # Panics
    /// - if the id was not allocated
    pub fn release(&mut self, id: u32) {
        let (block, bit) = (id / BLOCK_BITS, id % BLOCK_BITS);
        let mask = 1u64 << bit;
        assert!(
            self.blocks[block as usize] & mask != 0,
            "releasing unallocated id {}",
            id
        );
        self.blocks[block as usize] &= !mask;
        self.used -= 1;
    }

    #[cfg(test)]
    fn is_set(&self, id: u32) -> bool {
        self.blocks[(id / BLOCK_BITS) as usize] & (1 << (id % BLOCK_BITS)) != 0
    }
}
