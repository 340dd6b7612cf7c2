//! Allocator tunables.

use crate::header::ALIGNMENT;

/// Tunables of a [`ForestMalloc`](crate::ForestMalloc).
///
/// None of these affect correctness, only how the heap grows and which
/// free block ends up serving a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Config {
    /// Minimum number of bytes the heap grows by when no free block fits.
    pub chunk_size: usize,
    /// Free blocks up to this size live in the small tree, larger ones in
    /// the large tree.
    pub large_tree_threshold: usize,
    /// Back-end splitting kicks in only while the previous split was at most
    /// this large. Zero disables it.
    pub reverse_split_limit: usize,
    /// Round requests just below 128, 256 and 512 bytes up to those sizes.
    pub size_class_rounding: bool,
}

impl Config {
    pub const DEFAULT_CHUNK_SIZE: usize = 4096;
    pub const DEFAULT_LARGE_TREE_THRESHOLD: usize = 8192;
    pub const DEFAULT_REVERSE_SPLIT_LIMIT: usize = 32;

    #[inline]
    pub const fn new() -> Self {
        Config {
            chunk_size: Self::DEFAULT_CHUNK_SIZE,
            large_tree_threshold: Self::DEFAULT_LARGE_TREE_THRESHOLD,
            reverse_split_limit: Self::DEFAULT_REVERSE_SPLIT_LIMIT,
            size_class_rounding: true,
        }
    }

    /// Sets the growth chunk. The value is rounded up to the alignment unit.
    pub const fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = (chunk_size + ALIGNMENT - 1) & !(ALIGNMENT - 1);
        self
    }

    pub const fn with_large_tree_threshold(mut self, threshold: usize) -> Self {
        self.large_tree_threshold = threshold;
        self
    }

    pub const fn with_reverse_split_limit(mut self, limit: usize) -> Self {
        self.reverse_split_limit = limit;
        self
    }

    pub const fn with_size_class_rounding(mut self, enabled: bool) -> Self {
        self.size_class_rounding = enabled;
        self
    }
}

impl Default for Config {
    fn default() -> Self {
        Config::new()
    }
}
