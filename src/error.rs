//! Error types returned by the allocator and its growers.

use std::io;

use thiserror::Error;

/// Failure of the arena-growth primitive.
#[derive(Error, Debug)]
pub enum GrowError {
    /// The underlying buffer cannot be extended any further.
    #[error("arena exhausted: requested {requested} bytes, {available} available")]
    Exhausted {
        /// Number of bytes requested.
        requested: usize,
        /// Number of bytes still available.
        available: usize,
    },

    /// The backing mapping could not be created.
    #[error("failed to map arena: {0}")]
    Map(#[source] io::Error),
}

/// Failure of an allocation request.
///
/// None of these are fatal: the heap is left consistent and every live
/// allocation stays valid.
#[derive(Error, Debug)]
pub enum MallocError {
    /// A zero-byte request. This is the "null" result of `malloc(0)`.
    #[error("zero-sized allocation")]
    ZeroSize,

    /// The request cannot be represented as a block size.
    #[error("request of {size} bytes is too large")]
    RequestTooLarge {
        /// Requested payload size.
        size: usize,
    },

    /// Block offsets are 32-bit, so the heap cannot grow past that range.
    #[error("heap growth by {requested} bytes would exceed the addressable heap")]
    HeapLimit {
        /// Number of bytes the heap would have grown by.
        requested: usize,
    },

    /// The grower refused to extend the heap.
    #[error("out of memory: {0}")]
    OutOfMemory(#[from] GrowError),
}
