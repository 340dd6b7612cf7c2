//! Defines the [`Header`] boundary tag and the block layout constants.

use static_assertions::const_assert;

/// Size of a header, footer or link word.
pub const WORD: usize = 4;
/// Every block size and payload offset is a multiple of this.
pub const ALIGNMENT: usize = 8;

/// Smallest block: a header followed by a single link word.
pub const TINY_BLOCK: usize = ALIGNMENT;
/// Second tiny size class. Large enough for a footer, too small for tree links.
pub const DOUBLE_TINY_BLOCK: usize = 2 * ALIGNMENT;
/// Smallest block that can hold the four tree link words plus a footer.
pub const TREE_MIN_BLOCK: usize = 3 * ALIGNMENT;

const ALLOCATED: u32 = 0b001;
const PREV_ALLOCATED: u32 = 0b010;
const TREE_NODE: u32 = 0b100;
const STATUS_MASK: u32 = ALLOCATED | PREV_ALLOCATED | TREE_NODE;

// All status bits must fit below the alignment unit.
const_assert!((STATUS_MASK as usize) < ALIGNMENT);
const_assert!(TREE_MIN_BLOCK >= 5 * WORD);
const_assert!(DOUBLE_TINY_BLOCK >= 3 * WORD);

/// A header or footer word.
///
/// # Tagging
/// Block sizes are multiples of [`ALIGNMENT`], which leaves the three low bits
/// of the word free for status:
/// * bit 0: the block is allocated,
/// * bit 1: the block immediately before it is allocated,
/// * bit 2: a free tree-eligible block is the tree node for its size
///   (clear for same-size chain links).
///
/// A free block's footer is always a byte-for-byte copy of its header.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[repr(transparent)]
pub struct Header(u32);

impl Header {
    /// Encodes a block size and its two allocation bits.
    ///
    /// # Panics
    /// Panics in debug builds if `size` is not a multiple of [`ALIGNMENT`]
    /// or does not fit the word.
    #[inline(always)]
    pub fn new(size: usize, allocated: bool, prev_allocated: bool) -> Header {
        debug_assert_eq!(size % ALIGNMENT, 0, "size should be aligned.");
        debug_assert!(size <= u32::MAX as usize, "size should fit a word.");
        let mut word = size as u32;
        if allocated {
            word |= ALLOCATED;
        }
        if prev_allocated {
            word |= PREV_ALLOCATED;
        }
        Header(word)
    }

    #[inline(always)]
    pub fn allocated(size: usize, prev_allocated: bool) -> Header {
        Header::new(size, true, prev_allocated)
    }

    #[inline(always)]
    pub fn free(size: usize, prev_allocated: bool) -> Header {
        Header::new(size, false, prev_allocated)
    }

    #[inline(always)]
    pub const fn from_raw(word: u32) -> Header {
        Header(word)
    }

    #[inline(always)]
    pub const fn raw(self) -> u32 {
        self.0
    }

    /// Returns the full block size, header and footer included.
    #[inline(always)]
    pub const fn size(self) -> usize {
        (self.0 & !STATUS_MASK) as usize
    }

    #[inline(always)]
    pub const fn is_allocated(self) -> bool {
        self.0 & ALLOCATED != 0
    }

    #[inline(always)]
    pub const fn is_prev_allocated(self) -> bool {
        self.0 & PREV_ALLOCATED != 0
    }

    #[inline(always)]
    pub const fn is_tree_node(self) -> bool {
        self.0 & TREE_NODE != 0
    }

    #[inline(always)]
    pub const fn with_prev_allocated(self, prev_allocated: bool) -> Header {
        match prev_allocated {
            true => Header(self.0 | PREV_ALLOCATED),
            false => Header(self.0 & !PREV_ALLOCATED),
        }
    }

    #[inline(always)]
    pub const fn with_tree_node(self, tree_node: bool) -> Header {
        match tree_node {
            true => Header(self.0 | TREE_NODE),
            false => Header(self.0 & !TREE_NODE),
        }
    }
}
