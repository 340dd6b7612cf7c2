//! Defines the [`TinyLists`] struct, the free lists for the two tiny size classes.
//!
//! Tiny blocks are too small to hold tree links, so each one stores a single
//! word: the offset of the next free block of the same size.
//!
//! ```text
//! size 8:  | header (allocated) | next |
//! size 16: | header (free)      | next | unused | footer |
//! ```
//!
//! A free 8-byte block has no room for a footer. It stays marked allocated
//! so that its neighbours never try to walk backward through it.

use tracing::trace;

use crate::header::{ALIGNMENT, DOUBLE_TINY_BLOCK, TINY_BLOCK};
use crate::heap::Heap;

/// Sizes served by the tiny lists, smallest first.
pub(crate) const TINY_CLASSES: [usize; 2] = [TINY_BLOCK, DOUBLE_TINY_BLOCK];

#[derive(Debug)]
pub(crate) struct TinyLists {
    heads: [Option<usize>; 2],
}

impl TinyLists {
    /// Creates two empty lists.
    #[inline]
    pub(crate) const fn new() -> Self {
        TinyLists { heads: [None; 2] }
    }

    #[inline(always)]
    fn index(size: usize) -> usize {
        debug_assert!(
            TINY_CLASSES.contains(&size),
            "{size} is not a tiny size class."
        );
        size / ALIGNMENT - 1
    }

    /// Returns the head of the list for `size`.
    #[inline]
    pub(crate) fn head(&self, size: usize) -> Option<usize> {
        self.heads[Self::index(size)]
    }

    /// Links the block at `bp` in front of the list matching its size.
    /// This operation has a time complexity of *O*(1).
    ///
    /// # Safety
    /// `bp` must be a tiny block that is free but not yet owned by any list,
    /// with its header already written.
    pub(crate) unsafe fn push(&mut self, heap: &mut Heap, bp: usize) {
        let size = heap.header(bp).size();
        let head = &mut self.heads[Self::index(size)];
        heap.set_link(bp, *head);
        *head = Some(bp);
        trace!(bp, size, "Pushed tiny block.");
    }

    /// Unlinks and returns the head of the list for `size`
    /// or `None` if the list is empty.
    /// This operation has a time complexity of *O*(1).
    ///
    /// # Safety
    /// The list must only contain blocks of `heap`.
    pub(crate) unsafe fn pop(&mut self, heap: &Heap, size: usize) -> Option<usize> {
        let head = &mut self.heads[Self::index(size)];
        let bp = (*head)?;
        *head = heap.link(bp);
        trace!(bp, size, "Popped tiny block.");
        Some(bp)
    }
}
