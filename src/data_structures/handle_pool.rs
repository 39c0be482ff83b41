//! A [`HandlePool`] for allocating and reusing generational handles.

use core::cmp::Reverse;
use core::marker::PhantomData;
use std::collections::BinaryHeap;

/// A handle made of a slot index and a generation.
///
/// The generation is bumped every time the slot is freed, so handles to a freed
/// slot can be told apart from handles to a later occupant of the same slot.
pub trait PoolHandle: Copy {
    /// Creates a handle from a raw index and generation.
    fn from_raw_parts(index: u32, generation: u32) -> Self;
    /// Returns the slot index of the handle.
    fn index(self) -> u32;
    /// Returns the generation of the handle.
    fn generation(self) -> u32;
}

/// Implements [`PoolHandle`] and the common accessors for a handle newtype
/// with `index` and `generation` fields.
macro_rules! impl_pool_handle {
    ($ty:ident) => {
        impl $crate::data_structures::handle_pool::PoolHandle for $ty {
            #[inline]
            fn from_raw_parts(index: u32, generation: u32) -> Self {
                Self { index, generation }
            }

            #[inline]
            fn index(self) -> u32 {
                self.index
            }

            #[inline]
            fn generation(self) -> u32 {
                self.generation
            }
        }

        impl $ty {
            /// Returns the slot index as a `usize`, for indexing into dense storage.
            #[inline]
            pub const fn slot(self) -> usize {
                self.index as usize
            }

            /// Packs the handle into a single `u64`.
            #[inline]
            pub const fn to_bits(self) -> u64 {
                (self.generation as u64) << 32 | self.index as u64
            }
        }
    };
}

pub(crate) use impl_pool_handle;

/// A pool for efficient allocation and reuse of generational handles.
///
/// Freed indices are stored in a min-heap, and reused such that the lowest available indices
/// are allocated first. This keeps slot-addressed storage compact.
#[derive(Clone, Debug)]
pub struct HandlePool<H: PoolHandle> {
    /// A min-heap of free indices. The lowest free indices are allocated first.
    free_indices: BinaryHeap<Reverse<u32>>,
    /// The current generation of every slot that has ever been allocated.
    generations: Vec<u32>,
    /// Whether each slot is currently allocated.
    alive: Vec<bool>,
    _marker: PhantomData<H>,
}

impl<H: PoolHandle> Default for HandlePool<H> {
    fn default() -> Self {
        Self::new()
    }
}

impl<H: PoolHandle> HandlePool<H> {
    /// Creates a new empty [`HandlePool`].
    #[inline]
    pub const fn new() -> Self {
        Self {
            free_indices: BinaryHeap::new(),
            generations: Vec::new(),
            alive: Vec::new(),
            _marker: PhantomData,
        }
    }

    /// Allocates a new handle.
    ///
    /// If there are free slots available, the lowest free slot is reused with a new generation.
    pub fn alloc(&mut self) -> H {
        if let Some(Reverse(index)) = self.free_indices.pop() {
            self.alive[index as usize] = true;
            H::from_raw_parts(index, self.generations[index as usize])
        } else {
            let index = self.generations.len() as u32;
            self.generations.push(0);
            self.alive.push(true);
            H::from_raw_parts(index, 0)
        }
    }

    /// Frees a handle, making its slot available for reuse.
    ///
    /// Returns `false` if the handle is stale or was already freed.
    pub fn free(&mut self, handle: H) -> bool {
        if !self.contains(handle) {
            return false;
        }
        let index = handle.index() as usize;
        self.alive[index] = false;
        self.generations[index] = self.generations[index].wrapping_add(1);
        self.free_indices.push(Reverse(handle.index()));
        true
    }

    /// Returns `true` if the handle refers to a currently allocated slot.
    #[inline]
    pub fn contains(&self, handle: H) -> bool {
        let index = handle.index() as usize;
        self.alive.get(index).copied().unwrap_or(false)
            && self.generations[index] == handle.generation()
    }

    /// Returns the number of allocated handles.
    #[inline]
    pub fn len(&self) -> usize {
        self.generations.len() - self.free_indices.len()
    }

    /// Returns `true` if no handles are allocated.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns the total number of slots (allocated + free).
    #[inline]
    pub fn slot_count(&self) -> usize {
        self.generations.len()
    }
}
