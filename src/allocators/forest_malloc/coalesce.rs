//! Merging of adjacent free blocks.

use tracing::{debug, instrument, Level};

use super::ForestMalloc;
use crate::growers::Grower;
use crate::header::{Header, TREE_MIN_BLOCK};

impl<G: Grower> ForestMalloc<G> {
    /// Merges the free block at `bp` with a free successor and a free
    /// predecessor, as long as they are tree-eligible. The neighbours are
    /// taken out of their trees. Returns the merged block, which is not owned
    /// by any free structure.
    ///
    /// Tiny neighbours are never merged.
    ///
    /// # Safety
    /// `bp` must be a tree-eligible block whose tags mark it free and which
    /// no free structure owns.
    #[instrument(level = "debug", skip(self), ret(level = Level::DEBUG))]
    pub(super) unsafe fn coalesce(&mut self, mut bp: usize) -> usize {
        let header = self.heap.header(bp);
        debug_assert!(!header.is_allocated(), "Block should be free.");
        debug_assert!(header.size() >= TREE_MIN_BLOCK);
        let mut size = header.size();

        let next = bp + size;
        let next_header = self.heap.header(next);
        if !next_header.is_allocated() && next_header.size() >= TREE_MIN_BLOCK {
            self.forest.delete(&mut self.heap, next);
            size += next_header.size();
            debug!(next, ?next_header, "Merging with successive free block.");
        }

        if !header.is_prev_allocated() {
            let prev = self.heap.prev_block(bp);
            let prev_header = self.heap.header(prev);
            if prev_header.size() >= TREE_MIN_BLOCK {
                self.forest.delete(&mut self.heap, prev);
                size += prev_header.size();
                bp = prev;
                debug!(prev, ?prev_header, "Merging with preceding free block.");
            }
        }

        let prev_allocated = self.heap.header(bp).is_prev_allocated();
        self.heap.set_tags(bp, Header::free(size, prev_allocated));
        bp
    }
}
