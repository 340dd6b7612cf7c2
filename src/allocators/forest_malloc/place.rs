//! Placement of a request into a free block.
//!
//! A free block larger than the request is split in two. A remainder too
//! small for the trees goes to the tiny lists. Otherwise the remainder is
//! coalesced and goes back to the trees, and the request normally takes the
//! front of the block. Right after a small split, a smaller request takes the
//! back instead, which keeps runs of small allocations next to each other
//! and away from the large free remainder.

use tracing::{debug, instrument, Level};

use super::ForestMalloc;
use crate::growers::Grower;
use crate::header::{Header, TINY_BLOCK, TREE_MIN_BLOCK};

impl<G: Grower> ForestMalloc<G> {
    /// Hands out `need` bytes of the unowned free block at `bp` and returns
    /// the payload offset of the allocated part.
    ///
    /// # Safety
    /// `bp` must be a free block larger than `need` which no free structure
    /// owns; `need` must be a valid block size.
    #[instrument(level = "debug", skip(self), ret(level = Level::DEBUG))]
    pub(super) unsafe fn place(&mut self, bp: usize, need: usize) -> usize {
        let header = self.heap.header(bp);
        let size = header.size();
        debug_assert!(size > need);
        let rest = size - need;
        let prev_allocated = header.is_prev_allocated();

        if rest < TREE_MIN_BLOCK {
            self.heap.set_header(bp, Header::allocated(need, prev_allocated));
            self.split_off_tiny(bp + need, rest);
            debug!(rest, "Split off a tiny remainder.");
            return bp;
        }

        let reverse = self
            .last_split
            .is_some_and(|last| need < last && last <= self.config.reverse_split_limit);
        self.last_split = Some(need);

        if reverse {
            let back = bp + rest;
            self.heap.set_tags(bp, Header::free(rest, prev_allocated));
            self.heap.set_header(back, Header::allocated(need, false));
            self.heap.set_prev_allocated(back + need, true);
            let front = self.coalesce(bp);
            self.forest.insert(&mut self.heap, front);
            debug!(back, rest, "Placed request at the back of the block.");
            back
        } else {
            let back = bp + need;
            self.heap.set_header(bp, Header::allocated(need, prev_allocated));
            self.heap.set_tags(back, Header::free(rest, true));
            self.heap.set_prev_allocated(back + rest, false);
            let back = self.coalesce(back);
            self.forest.insert(&mut self.heap, back);
            debug!(back, rest, "Placed request at the front of the block.");
            bp
        }
    }

    /// Turns the `size` bytes at `bp` into a tiny free block and lists it.
    unsafe fn split_off_tiny(&mut self, bp: usize, size: usize) {
        let next = bp + size;
        if size == TINY_BLOCK {
            // No room for a footer, so it stays marked allocated.
            self.heap.set_header(bp, Header::allocated(size, true));
            self.heap.set_prev_allocated(next, true);
        } else {
            self.heap.set_tags(bp, Header::free(size, true));
            self.heap.set_prev_allocated(next, false);
        }
        self.tiny.push(&mut self.heap, bp);
    }

    /// Marks the whole free block at `bp` allocated.
    ///
    /// # Safety
    /// `bp` must be a free block which no free structure owns.
    pub(super) unsafe fn finish_allocation(&mut self, bp: usize) {
        let header = self.heap.header(bp);
        self.heap
            .set_header(bp, Header::allocated(header.size(), header.is_prev_allocated()));
        self.heap.set_prev_allocated(bp + header.size(), true);
    }

    /// Serves `need` bytes from the unowned free block at `bp`, splitting it
    /// if it is larger.
    ///
    /// # Safety
    /// Same as [`place`](ForestMalloc::place), except that the block may
    /// be exactly `need` bytes.
    pub(super) unsafe fn take(&mut self, bp: usize, need: usize) -> usize {
        if self.heap.header(bp).size() > need {
            self.place(bp, need)
        } else {
            self.finish_allocation(bp);
            bp
        }
    }
}
