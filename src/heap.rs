//! Defines the [`Heap`] arena: word access, boundary-tag helpers and growth.
//!
//! Blocks are addressed by the arena-relative offset of their payload (`bp`).
//! The header word sits right before the payload, so the header of the
//! block at `bp` lives at `bp - WORD`.
//!
//! ```text
//! offset 0     4     8                                  len-4  len
//!        | pro | hdr | payload ...  | hdr | payload ... | epi |
//! ```
//!
//! The prologue (offset 0) and the epilogue (the last word) are size-zero
//! headers that are always marked allocated, so boundary scans never run off
//! either end of the heap.

use core::ptr::NonNull;

use tracing::{debug, error, instrument, Level};

use crate::error::MallocError;
use crate::growers::Grower;
use crate::header::{Header, ALIGNMENT, DOUBLE_TINY_BLOCK, WORD};
use crate::util::{decode_link, encode_link};

/// Offset of the prologue header.
pub(crate) const PROLOGUE: usize = 0;
/// Payload offset of the first block.
pub(crate) const FIRST_BLOCK: usize = 2 * WORD;
/// Offsets and sizes are stored in 32-bit words.
pub(crate) const MAX_HEAP_LEN: usize = u32::MAX as usize & !(ALIGNMENT - 1);

#[derive(Debug)]
pub(crate) struct Heap {
    base: NonNull<u8>,
    len: usize,
}

impl Heap {
    pub(crate) const fn new() -> Self {
        Heap {
            base: NonNull::dangling(),
            len: 0,
        }
    }

    #[inline(always)]
    pub(crate) fn is_initialized(&self) -> bool {
        self.len != 0
    }

    /// Returns the heap size in bytes, prologue and epilogue included.
    #[inline(always)]
    pub(crate) fn len(&self) -> usize {
        self.len
    }

    /// Claims an 8-aligned start from `grower` and writes the prologue and
    /// the initial epilogue.
    #[instrument(level = "debug", skip_all, err(Debug, level = Level::ERROR))]
    pub(crate) fn init<G: Grower>(&mut self, grower: &mut G) -> Result<(), MallocError> {
        debug_assert!(!self.is_initialized());
        let end = grower.grow(0)?;
        let padding = end.as_ptr().align_offset(ALIGNMENT);
        debug_assert_ne!(padding, usize::MAX, "align_offset() on a *u8 should never fail.");
        let start = grower.grow(padding + FIRST_BLOCK)?;
        debug_assert_eq!(start, end, "Growth should be contiguous.");

        self.base = unsafe { start.add(padding) };
        self.len = FIRST_BLOCK;
        unsafe {
            self.set_word(PROLOGUE, Header::allocated(0, true).raw());
            self.set_header(FIRST_BLOCK, Header::allocated(0, true));
        }
        debug!(base = ?self.base, padding, "Heap initialized.");
        Ok(())
    }

    /// Grows the heap by `size` bytes and turns the new space into one free
    /// block, which is returned. The block is not linked into any free
    /// structure and is not coalesced.
    #[instrument(level = "debug", skip(self, grower), ret(level = Level::DEBUG), err(Debug, level = Level::ERROR))]
    pub(crate) fn extend<G: Grower>(
        &mut self,
        grower: &mut G,
        size: usize,
    ) -> Result<usize, MallocError> {
        debug_assert!(self.is_initialized());
        debug_assert!(size > 0 && size % ALIGNMENT == 0);

        if size > MAX_HEAP_LEN - self.len {
            error!(heap_len = self.len, "Growth failure, heap offsets would overflow.");
            return Err(MallocError::HeapLimit { requested: size });
        }
        let old_end = grower
            .grow(size)
            .inspect_err(|e| error!(%e, "Growth failure, no memory."))?;
        debug_assert_eq!(
            old_end.as_ptr(),
            unsafe { self.base.as_ptr().add(self.len) },
            "Growth should be contiguous."
        );

        // The old epilogue becomes the header of the new block.
        let bp = self.len;
        self.len += size;
        unsafe {
            let prev_allocated = self.header(bp).is_prev_allocated();
            self.set_tags(bp, Header::free(size, prev_allocated));
            self.set_header(self.len, Header::allocated(0, false));
        }
        Ok(bp)
    }

    /// # Safety
    /// `offset` must be word-aligned and the word must lie inside the heap.
    #[inline(always)]
    pub(crate) unsafe fn word(&self, offset: usize) -> u32 {
        debug_assert_eq!(offset % WORD, 0);
        debug_assert!(offset + WORD <= self.len, "{offset:#x} is past the heap end.");
        self.base.as_ptr().add(offset).cast::<u32>().read()
    }

    /// # Safety
    /// Same as [`word`](Heap::word).
    #[inline(always)]
    pub(crate) unsafe fn set_word(&mut self, offset: usize, value: u32) {
        debug_assert_eq!(offset % WORD, 0);
        debug_assert!(offset + WORD <= self.len, "{offset:#x} is past the heap end.");
        self.base.as_ptr().add(offset).cast::<u32>().write(value)
    }

    /// Reads a word, returning `None` if `offset` is misaligned or outside
    /// the heap.
    pub(crate) fn checked_word(&self, offset: usize) -> Option<u32> {
        if offset % WORD != 0 || offset.checked_add(WORD)? > self.len {
            return None;
        }
        unsafe { Some(self.word(offset)) }
    }

    /// # Safety
    /// `bp` must be the payload offset of a block or of the epilogue.
    #[inline(always)]
    pub(crate) unsafe fn header(&self, bp: usize) -> Header {
        Header::from_raw(self.word(bp - WORD))
    }

    /// # Safety
    /// Same as [`header`](Heap::header).
    #[inline(always)]
    pub(crate) unsafe fn set_header(&mut self, bp: usize, header: Header) {
        self.set_word(bp - WORD, header.raw())
    }

    /// Writes `header` both as the header and as the footer of the block.
    ///
    /// # Safety
    /// `bp` must be the payload offset of a block spanning `header.size()`
    /// bytes, which must be large enough to carry a footer.
    #[inline]
    pub(crate) unsafe fn set_tags(&mut self, bp: usize, header: Header) {
        debug_assert!(header.size() >= DOUBLE_TINY_BLOCK);
        self.set_header(bp, header);
        self.set_word(bp + header.size() - 2 * WORD, header.raw());
    }

    /// # Safety
    /// `bp` must be the payload offset of a block.
    #[inline(always)]
    pub(crate) unsafe fn next_block(&self, bp: usize) -> usize {
        bp + self.header(bp).size()
    }

    /// Walks backward through the footer of the preceding block.
    ///
    /// # Safety
    /// `bp` must be the payload offset of a block whose predecessor is free
    /// and carries a footer.
    #[inline]
    pub(crate) unsafe fn prev_block(&self, bp: usize) -> usize {
        debug_assert!(!self.header(bp).is_prev_allocated());
        bp - Header::from_raw(self.word(bp - 2 * WORD)).size()
    }

    /// Updates the previous-allocated bit of the block at `bp`, keeping the
    /// footer of a free block in sync.
    ///
    /// # Safety
    /// `bp` must be the payload offset of a block or of the epilogue.
    #[inline]
    pub(crate) unsafe fn set_prev_allocated(&mut self, bp: usize, prev_allocated: bool) {
        let header = self.header(bp).with_prev_allocated(prev_allocated);
        self.set_header(bp, header);
        if !header.is_allocated() {
            self.set_word(bp + header.size() - 2 * WORD, header.raw());
        }
    }

    /// # Safety
    /// `at` must be a word inside the heap.
    #[inline(always)]
    pub(crate) unsafe fn link(&self, at: usize) -> Option<usize> {
        decode_link(self.word(at))
    }

    /// # Safety
    /// Same as [`link`](Heap::link).
    #[inline(always)]
    pub(crate) unsafe fn set_link(&mut self, at: usize, link: Option<usize>) {
        self.set_word(at, encode_link(link))
    }

    /// Converts a payload offset to a pointer. The epilogue's payload
    /// offset, `len`, is the last valid one.
    #[inline(always)]
    pub(crate) fn ptr(&self, bp: usize) -> NonNull<u8> {
        debug_assert!(bp <= self.len);
        unsafe { self.base.add(bp) }
    }

    /// Converts a payload pointer to its offset.
    #[inline(always)]
    pub(crate) fn offset_of(&self, ptr: NonNull<u8>) -> usize {
        let offset = (ptr.as_ptr() as usize).wrapping_sub(self.base.as_ptr() as usize);
        debug_assert!(
            offset >= FIRST_BLOCK && offset < self.len,
            "{ptr:?} does not belong to the heap."
        );
        offset
    }
}
