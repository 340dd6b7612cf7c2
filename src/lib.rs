//! A boundary-tag memory allocator that keeps its free blocks in
//! size-keyed binary search trees.
//!
//! The allocator manages a single contiguous heap that only ever grows at its
//! end, and stores all of its bookkeeping inside that heap: block headers and
//! footers, two free lists for tiny blocks and two free trees. Links between
//! free blocks are 32-bit offsets from the start of the heap, not pointers.
//!
//! # Usage
//! ```
//! use forest_malloc::ForestMalloc;
//! use forest_malloc::growers::MmapGrower;
//!
//! let grower = MmapGrower::with_capacity(1 << 20)?;
//! let mut allocator = ForestMalloc::with_grower(grower);
//!
//! let p = allocator.allocate(100)?;
//! unsafe {
//!     p.as_ptr().write_bytes(0xAB, 100);
//!     allocator.deallocate(p.as_ptr());
//! }
//! assert!(allocator.check().is_consistent());
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```
//!
//! [`ForestMalloc`] is single threaded and takes `&mut self` everywhere.
//! It is [`Send`] when its grower is, so it can be shared behind a `Mutex`.
//!
//! # Mode of operation
//! - A request of `n` bytes needs a block of `n + 4` bytes (the header),
//!   rounded up to a multiple of 8. Requests just below 128, 256 and 512
//!   bytes are first rounded up to those sizes.
//! - The allocator looks for the smallest free block that fits: first in the
//!   [tiny lists](#tiny-lists), then in the small [tree](#free-trees) and
//!   finally in the large tree. A block larger than needed is split and the
//!   remainder is freed again.
//! - If nothing fits, the underlying [grower](#growers) extends the heap by
//!   at least [`Config::chunk_size`] bytes, and the new space is merged with
//!   a free block at the old end of the heap.
//! - On deallocation the block is merged with free neighbours and handed to
//!   the matching free structure.
//!
//! ## Blocks
//! The heap is divided into blocks. Every block starts with a 4-byte
//! header holding its size and two status bits: whether the block is
//! allocated and whether the block right before it is. Free blocks repeat
//! their header in a footer at their end, so that the block after them can
//! find their start. Allocated blocks need no footer, which is what the
//! second status bit is for.
//!
//! The heap starts with a prologue header and ends with an epilogue header,
//! both of size zero and marked allocated, so walks over the blocks never
//! leave the heap.
//!
//! ## Tiny lists
//! Free blocks of 8 and 16 bytes are too small to hold tree links. Each size
//! has its own LIFO list. An 8-byte free block cannot even fit a footer, so
//! it keeps looking allocated to its neighbours and is never merged.
//!
//! ## Free trees
//! Free blocks of 24 bytes and more live in one of two binary search trees
//! keyed by size, split at [`Config::large_tree_threshold`]. Only one block
//! per size is a tree node; further blocks of the same size are chained
//! behind it, which keeps the trees as small as the number of distinct
//! sizes.
//!
//! ## Growers
//! A grower is the allocator's backing buffer. [`ForestMalloc`] is generic
//! over anything that implements [`Grower`], i.e. anything that acts as a
//! contiguous buffer that can grow at its end. Two are provided:
//! [`MmapGrower`], which reserves address space with `mmap`, and
//! [`SliceGrower`], which hands out a caller-provided buffer.
//!
//! ## Checking
//! [`ForestMalloc::check`] walks the whole heap and every free structure and
//! reports each broken invariant as a [`Violation`]. It never panics, even
//! when the heap has been corrupted.
//!
//! [`Grower`]: growers::Grower
//! [`MmapGrower`]: growers::MmapGrower
//! [`SliceGrower`]: growers::SliceGrower

pub use crate::allocators::ForestMalloc;
pub use crate::check::{FreeBlock, HeapReport, Owner, Violation};
pub use crate::config::Config;
pub use crate::error::{GrowError, MallocError};

pub mod allocators;
pub mod check;
pub mod config;
pub mod error;
mod freelist;
pub mod growers;
mod header;
mod heap;
mod tree;
mod util;
