//! A single-threaded best-fit allocator.
//!
// For a general view of the allocator's operational semantics see the [`crate`] level documentation.
//
// # Additional implementation notes
// ## Request sizing
// Every request is turned into a block size before anything else happens:
// the payload plus a header word, rounded up to the alignment unit (see
// [`util::request_size`]). The private functions below only ever deal in
// such block sizes, called `need`.
//
// ## Ownership of free blocks
// At any time a free block is owned by exactly one of the tiny lists or the
// trees, except in between the steps of a single operation: the functions
// that take "unowned" blocks (`coalesce`, `place`, `take`) expect their
// caller to have removed the block from its structure already.

use core::fmt::{self, Debug};
use core::ptr::{self, NonNull};

use tracing::{debug, instrument, Level};

use self::util::request_size;
use crate::check::{check_heap, HeapReport};
use crate::config::Config;
use crate::error::MallocError;
use crate::freelist::{TinyLists, TINY_CLASSES};
use crate::growers::Grower;
use crate::header::{Header, ALIGNMENT, DOUBLE_TINY_BLOCK, TINY_BLOCK, TREE_MIN_BLOCK, WORD};
use crate::heap::Heap;
use crate::tree::Forest;

mod coalesce;
mod place;
mod util;

#[cfg(test)]
mod tests;

/// A single threaded memory allocator.
///
/// All of its bookkeeping lives inside the heap it manages; the struct
/// itself only holds the list heads and tree roots.
pub struct ForestMalloc<G: Grower> {
    heap: Heap,
    grower: G,
    tiny: TinyLists,
    forest: Forest,
    /// Size of the last request that split a block.
    last_split: Option<usize>,
    config: Config,
}

impl<G: Grower> Debug for ForestMalloc<G> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ForestMalloc")
            .field("heap_size", &self.heap.len())
            .field("last_split", &self.last_split)
            .field("config", &self.config)
            .finish()
    }
}

// The heap is only reachable through the allocator, which owns its grower.
unsafe impl<G: Grower + Send> Send for ForestMalloc<G> {}

impl<G: Grower> ForestMalloc<G> {
    /// Creates an allocator with the default [`Config`] on top of `grower`.
    /// Nothing is claimed from the grower until the first allocation or
    /// an explicit [`init`](ForestMalloc::init).
    pub const fn with_grower(grower: G) -> Self {
        Self::with_config(grower, Config::new())
    }

    pub const fn with_config(grower: G, config: Config) -> Self {
        ForestMalloc {
            heap: Heap::new(),
            grower,
            tiny: TinyLists::new(),
            forest: Forest::new(config.large_tree_threshold),
            last_split: None,
            config,
        }
    }

    /// Claims the prologue and epilogue from the grower.
    /// Calling it on an initialized allocator does nothing.
    pub fn init(&mut self) -> Result<(), MallocError> {
        if self.heap.is_initialized() {
            return Ok(());
        }
        self.heap.init(&mut self.grower)
    }

    #[inline]
    pub fn is_initialized(&self) -> bool {
        self.heap.is_initialized()
    }

    /// Returns the current heap size in bytes, prologue and epilogue included.
    #[inline]
    pub fn heap_size(&self) -> usize {
        self.heap.len()
    }

    #[inline]
    pub fn config(&self) -> &Config {
        &self.config
    }

    #[inline]
    pub fn grower(&self) -> &G {
        &self.grower
    }

    /// Allocates at least `size` bytes aligned to 8 bytes.
    ///
    /// The smallest free block that fits is used; the heap only grows when
    /// none does. Failures leave the heap and every live allocation intact.
    #[instrument(level = "info", skip(self), ret(level = Level::INFO), err(Debug, level = Level::ERROR))]
    pub fn allocate(&mut self, size: usize) -> Result<NonNull<u8>, MallocError> {
        if size == 0 {
            return Err(MallocError::ZeroSize);
        }
        self.init()?;
        let need = request_size(size, &self.config)?;
        debug!(need, "Request sized.");

        let bp = match unsafe { self.find_fit(need) } {
            Some(bp) => {
                debug!(bp, "Found free block to accommodate request.");
                bp
            }
            None => {
                debug!("Couldn't find free block to accommodate request, requesting heap growth.");
                unsafe { self.grow_and_place(need)? }
            }
        };
        debug_assert_eq!(bp % ALIGNMENT, 0);
        Ok(self.heap.ptr(bp))
    }

    /// Allocates `count * size` zeroed bytes.
    #[instrument(level = "info", skip(self), ret(level = Level::INFO), err(Debug, level = Level::ERROR))]
    pub fn allocate_zeroed(&mut self, count: usize, size: usize) -> Result<NonNull<u8>, MallocError> {
        let total = count
            .checked_mul(size)
            .ok_or(MallocError::RequestTooLarge { size: usize::MAX })?;
        let ptr = self.allocate(total)?;
        unsafe { ptr.as_ptr().write_bytes(0, total) };
        Ok(ptr)
    }

    /// Returns the block at `ptr` to the allocator. Null is ignored.
    ///
    /// # Safety
    /// `ptr` must be null or a live allocation of this allocator that is
    /// not used afterwards.
    #[instrument(level = "info", skip(self))]
    pub unsafe fn deallocate(&mut self, ptr: *mut u8) {
        let Some(ptr) = NonNull::new(ptr) else {
            return;
        };
        debug_assert!(self.heap.is_initialized());
        let bp = self.heap.offset_of(ptr);
        let header = self.heap.header(bp);
        debug_assert!(header.is_allocated(), "Block shouldn't be free already.");
        let size = header.size();

        if size == TINY_BLOCK {
            // Stays marked allocated, the successor is left as it is.
            self.tiny.push(&mut self.heap, bp);
            return;
        }

        self.heap.set_tags(bp, Header::free(size, header.is_prev_allocated()));
        self.heap.set_prev_allocated(bp + size, false);
        if size == DOUBLE_TINY_BLOCK {
            self.tiny.push(&mut self.heap, bp);
        } else {
            let bp = self.coalesce(bp);
            self.forest.insert(&mut self.heap, bp);
        }
    }

    /// Resizes the allocation at `ptr` to `size` bytes, moving it.
    ///
    /// Returns the new allocation, or `None` if `size` is zero in which
    /// case `ptr` is deallocated. A null `ptr` makes this an allocation.
    /// On failure the old allocation is left untouched.
    ///
    /// # Safety
    /// Same as [`deallocate`](ForestMalloc::deallocate).
    #[instrument(level = "info", skip(self), ret(level = Level::INFO), err(Debug, level = Level::ERROR))]
    pub unsafe fn reallocate(
        &mut self,
        ptr: *mut u8,
        size: usize,
    ) -> Result<Option<NonNull<u8>>, MallocError> {
        if size == 0 {
            self.deallocate(ptr);
            return Ok(None);
        }
        let Some(old) = NonNull::new(ptr) else {
            return self.allocate(size).map(Some);
        };

        let old_size = self.usable_size(old);
        let new = self.allocate(size)?;
        ptr::copy_nonoverlapping(old.as_ptr(), new.as_ptr(), old_size.min(size));
        self.deallocate(old.as_ptr());
        Ok(Some(new))
    }

    /// Returns the number of bytes that can be used at `ptr`, which is at
    /// least the size that was requested.
    ///
    /// # Safety
    /// `ptr` must be a live allocation of this allocator.
    pub unsafe fn usable_size(&self, ptr: NonNull<u8>) -> usize {
        let header = self.heap.header(self.heap.offset_of(ptr));
        debug_assert!(header.is_allocated());
        header.size() - WORD
    }

    /// Checks every heap invariant. This walks the whole heap and all free
    /// structures, so it is meant for tests and debugging.
    pub fn check(&self) -> HeapReport {
        check_heap(&self.heap, &self.tiny, &self.forest)
    }

    /// Looks for a free block of at least `need` bytes, taking it out of
    /// its structure and allocating it. Returns its offset or `None` if
    /// nothing fits.
    ///
    /// # Safety
    /// The heap must be initialized and `need` must be a valid block size.
    #[instrument(level = "debug", skip(self), ret(level = Level::DEBUG))]
    unsafe fn find_fit(&mut self, need: usize) -> Option<usize> {
        for class in TINY_CLASSES.into_iter().filter(|&class| class >= need) {
            if let Some(bp) = self.tiny.pop(&self.heap, class) {
                return Some(self.take(bp, need));
            }
        }
        let bp = self.forest.find_best_fit(&self.heap, need)?;
        self.forest.delete(&mut self.heap, bp);
        Some(self.take(bp, need))
    }

    /// Grows the heap by at least `need` bytes, merges the new space with a
    /// free block at the end of the heap and allocates `need` bytes of it.
    ///
    /// # Safety
    /// Same as [`find_fit`](ForestMalloc::find_fit).
    #[instrument(level = "debug", skip(self), ret(level = Level::DEBUG), err(Debug, level = Level::ERROR))]
    unsafe fn grow_and_place(&mut self, need: usize) -> Result<usize, MallocError> {
        let chunk = self.config.chunk_size & !(ALIGNMENT - 1);
        let size = need.max(chunk).max(TREE_MIN_BLOCK);
        let bp = self.heap.extend(&mut self.grower, size)?;
        let bp = self.coalesce(bp);
        debug!(bp, "Heap growth successful.");
        Ok(self.take(bp, need))
    }
}
