//! A minimalistic dynamically sized compact bit vector with a fixed block size of 64 bits.
//!
//! Used for visitation marks in graph traversals. Only a very limited set of operations are supported.

/// A dynamically sized compact bit vector with a fixed block size of 64 bits.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct BitVec {
    blocks: Vec<u64>,
    bit_count: usize,
}

#[inline]
fn bits_to_blocks(bits: usize) -> usize {
    bits.div_ceil(u64::BITS as usize)
}

impl BitVec {
    /// Creates a new [`BitVec`] with `bit_count` unset bits.
    #[inline]
    pub fn new(bit_count: usize) -> Self {
        Self {
            blocks: vec![0; bits_to_blocks(bit_count)],
            bit_count,
        }
    }

    /// Sets the bit count of the [`BitVec`] and clears all bits.
    ///
    /// Existing block storage is reused when it is large enough.
    #[inline]
    pub fn set_bit_count_and_clear(&mut self, bit_count: usize) {
        let block_count = bits_to_blocks(bit_count);
        self.blocks.clear();
        self.blocks.resize(block_count, 0);
        self.bit_count = bit_count;
    }

    /// Returns the number of bits in the [`BitVec`].
    #[inline]
    pub fn len(&self) -> usize {
        self.bit_count
    }

    /// Returns `true` if the [`BitVec`] holds no bits.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.bit_count == 0
    }

    /// Sets the bit at the specified index.
    ///
    /// # Panics
    ///
    /// Panics if the index is out of bounds with `debug_assertions` enabled.
    #[inline]
    pub fn set(&mut self, index: usize) {
        debug_assert!(index < self.bit_count);
        let mask = 1 << (index % 64);
        self.blocks[index / 64] |= mask;
    }

    /// Sets the bit at the specified index, returning `true` if it was previously unset.
    #[inline]
    pub fn insert(&mut self, index: usize) -> bool {
        let was_set = self.get(index);
        self.set(index);
        !was_set
    }

    /// Unsets the bit at the specified index.
    #[inline]
    pub fn unset(&mut self, index: usize) {
        if index >= self.bit_count {
            return;
        }
        let mask = 1 << (index % 64);
        self.blocks[index / 64] &= !mask;
    }

    /// Gets the bit at the specified index.
    ///
    /// Returns `false` if the index is out of bounds or the bit is unset.
    #[inline]
    pub fn get(&self, index: usize) -> bool {
        if index >= self.bit_count {
            return false;
        }
        let mask = 1 << (index % 64);
        (self.blocks[index / 64] & mask) != 0
    }

    /// Returns the number of set bits.
    #[inline]
    pub fn count_ones(&self) -> usize {
        self.blocks.iter().map(|b| b.count_ones() as usize).sum()
    }

    /// Clears all bits in the [`BitVec`].
    #[inline]
    pub fn clear(&mut self) {
        self.blocks.iter_mut().for_each(|b| *b = 0);
    }
}
