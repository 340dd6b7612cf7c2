//! Size-keyed free trees.
//!
//! Every free block of at least [`TREE_MIN_BLOCK`] bytes belongs to one of
//! two binary search trees ordered by block size. Each distinct size present
//! has exactly one tree node; further blocks of that size hang off the node
//! in a doubly linked same-size chain, so the height of a tree is bounded by
//! the number of distinct sizes rather than by the number of free blocks.
//!
//! A free block is one of two variants, told apart by the tree-node bit of
//! its header:
//!
//! ```text
//! Tree-Node:  | header (T) | left | next | right | parent | ... | footer (T) |
//! Chain-Link: | header     | prev | next |  ...                | footer     |
//! ```
//!
//! `next` starts (on a node) or continues (on a link) the same-size chain,
//! and `prev` points back at the node or link before it. Insertion decides
//! the variant, and deletion converts the first link of a chain into a node
//! when the node it hangs off leaves the tree.

use tracing::trace;

use crate::header::{TREE_MIN_BLOCK, WORD};
use crate::heap::Heap;

const LEFT: usize = 0;
const PREV: usize = 0;
const NEXT: usize = WORD;
const RIGHT: usize = 2 * WORD;
const PARENT: usize = 3 * WORD;

/// Link words of a tree node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct NodeLinks {
    pub(crate) left: Option<usize>,
    pub(crate) right: Option<usize>,
    pub(crate) parent: Option<usize>,
    pub(crate) next: Option<usize>,
}

impl NodeLinks {
    const LEAF: NodeLinks = NodeLinks {
        left: None,
        right: None,
        parent: None,
        next: None,
    };
}

/// A decoded tree-eligible free block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum FreeEntry {
    /// The representative of its size in the tree.
    Node(NodeLinks),
    /// A same-size chain member.
    Link { prev: usize, next: Option<usize> },
}

/// Decodes the free block at `bp`.
///
/// # Safety
/// `bp` must be a tree-eligible free block owned by a tree.
pub(crate) unsafe fn read_entry(heap: &Heap, bp: usize) -> FreeEntry {
    if heap.header(bp).is_tree_node() {
        FreeEntry::Node(NodeLinks {
            left: heap.link(bp + LEFT),
            right: heap.link(bp + RIGHT),
            parent: heap.link(bp + PARENT),
            next: heap.link(bp + NEXT),
        })
    } else {
        let prev = heap.word(bp + PREV) as usize;
        debug_assert_ne!(prev, 0, "Chain link {bp:#x} has no predecessor.");
        FreeEntry::Link {
            prev,
            next: heap.link(bp + NEXT),
        }
    }
}

/// Turns the block at `bp` into a tree node with `links`.
unsafe fn write_node(heap: &mut Heap, bp: usize, links: NodeLinks) {
    let header = heap.header(bp).with_tree_node(true);
    heap.set_tags(bp, header);
    heap.set_link(bp + LEFT, links.left);
    heap.set_link(bp + RIGHT, links.right);
    heap.set_link(bp + PARENT, links.parent);
    heap.set_link(bp + NEXT, links.next);
}

/// Turns the block at `bp` into a chain link.
unsafe fn write_link(heap: &mut Heap, bp: usize, prev: usize, next: Option<usize>) {
    let header = heap.header(bp).with_tree_node(false);
    heap.set_tags(bp, header);
    heap.set_link(bp + PREV, Some(prev));
    heap.set_link(bp + NEXT, next);
}

#[inline(always)]
unsafe fn block_size(heap: &Heap, bp: usize) -> usize {
    heap.header(bp).size()
}

#[inline(always)]
unsafe fn left(heap: &Heap, bp: usize) -> Option<usize> {
    heap.link(bp + LEFT)
}

#[inline(always)]
unsafe fn right(heap: &Heap, bp: usize) -> Option<usize> {
    heap.link(bp + RIGHT)
}

#[cfg(test)]
unsafe fn parent(heap: &Heap, bp: usize) -> Option<usize> {
    heap.link(bp + PARENT)
}

#[inline(always)]
unsafe fn set_parent(heap: &mut Heap, bp: Option<usize>, parent: Option<usize>) {
    if let Some(bp) = bp {
        heap.set_link(bp + PARENT, parent);
    }
}

/// A binary search tree of free blocks keyed by size.
#[derive(Debug)]
pub(crate) struct SizeTree {
    root: Option<usize>,
}

impl SizeTree {
    pub(crate) const fn new() -> Self {
        SizeTree { root: None }
    }

    #[inline]
    pub(crate) fn root(&self) -> Option<usize> {
        self.root
    }

    /// Inserts the free block at `bp`.
    ///
    /// If a node of the same size exists the block becomes the first link of
    /// its chain, otherwise it is attached as a new leaf.
    ///
    /// # Safety
    /// `bp` must be a tree-eligible free block with its tags written
    /// and not owned by any free structure.
    pub(crate) unsafe fn insert(&mut self, heap: &mut Heap, bp: usize) {
        let size = block_size(heap, bp);
        debug_assert!(size >= TREE_MIN_BLOCK);

        let mut parent = None;
        let mut current = self.root;
        while let Some(node) = current {
            let node_size = block_size(heap, node);
            if size == node_size {
                let next = heap.link(node + NEXT);
                write_link(heap, bp, node, next);
                if let Some(next) = next {
                    heap.set_link(next + PREV, Some(bp));
                }
                heap.set_link(node + NEXT, Some(bp));
                trace!(bp, size, node, "Chained same-size block.");
                return;
            }
            parent = Some(node);
            current = match size < node_size {
                true => left(heap, node),
                false => right(heap, node),
            };
        }

        write_node(
            heap,
            bp,
            NodeLinks {
                parent,
                ..NodeLinks::LEAF
            },
        );
        match parent {
            None => self.root = Some(bp),
            Some(p) if size < block_size(heap, p) => heap.set_link(p + LEFT, Some(bp)),
            Some(p) => heap.set_link(p + RIGHT, Some(bp)),
        }
        trace!(bp, size, ?parent, "Inserted tree node.");
    }

    /// Returns the tree node of exactly `size` bytes or `None`.
    ///
    /// # Safety
    /// The tree must only contain blocks of `heap`.
    pub(crate) unsafe fn find_exact(&self, heap: &Heap, size: usize) -> Option<usize> {
        let mut current = self.root;
        while let Some(node) = current {
            let node_size = block_size(heap, node);
            if size == node_size {
                return Some(node);
            }
            current = match size < node_size {
                true => left(heap, node),
                false => right(heap, node),
            };
        }
        None
    }

    /// Returns a block of the smallest size that is at least `size`,
    /// or `None` if every block is smaller.
    ///
    /// When the best size has a chain, a chain link is returned since taking
    /// it out leaves the tree untouched.
    ///
    /// # Safety
    /// The tree must only contain blocks of `heap`.
    pub(crate) unsafe fn find_best_fit(&self, heap: &Heap, size: usize) -> Option<usize> {
        let mut best = None;
        let mut current = self.root;
        while let Some(node) = current {
            let node_size = block_size(heap, node);
            if size == node_size {
                best = Some(node);
                break;
            }
            if size < node_size {
                best = Some(node);
                current = left(heap, node);
            } else {
                current = right(heap, node);
            }
        }
        let node = best?;
        Some(heap.link(node + NEXT).unwrap_or(node))
    }

    /// Removes the block at `bp` from the tree.
    ///
    /// # Safety
    /// `bp` must be a block owned by this tree.
    pub(crate) unsafe fn delete(&mut self, heap: &mut Heap, bp: usize) {
        debug_assert!(
            self.find_exact(heap, block_size(heap, bp)).is_some(),
            "{bp:#x} is not in this tree."
        );
        let links = match read_entry(heap, bp) {
            FreeEntry::Link { prev, next } => {
                heap.set_link(prev + NEXT, next);
                if let Some(next) = next {
                    heap.set_link(next + PREV, Some(prev));
                }
                trace!(bp, prev, ?next, "Unchained same-size block.");
                return;
            }
            FreeEntry::Node(links) => links,
        };

        if let Some(successor) = links.next {
            // Promote the first chain link into the node's position.
            let successor_next = heap.link(successor + NEXT);
            write_node(
                heap,
                successor,
                NodeLinks {
                    next: successor_next,
                    ..links
                },
            );
            if let Some(next) = successor_next {
                heap.set_link(next + PREV, Some(successor));
            }
            set_parent(heap, links.left, Some(successor));
            set_parent(heap, links.right, Some(successor));
            self.replace_child(heap, links.parent, bp, Some(successor));
            trace!(bp, successor, "Promoted chain link to tree node.");
            return;
        }

        let Some(left_child) = links.left else {
            set_parent(heap, links.right, links.parent);
            self.replace_child(heap, links.parent, bp, links.right);
            trace!(bp, replacement = ?links.right, "Spliced out tree node.");
            return;
        };

        // Move the in-order predecessor into the node's position.
        let mut max = left_child;
        while let Some(r) = right(heap, max) {
            max = r;
        }
        if max != left_child {
            // `max` sits below `left_child`, so it has a parent.
            let max_parent = heap.word(max + PARENT) as usize;
            debug_assert_ne!(max_parent, 0);
            let max_left = left(heap, max);
            heap.set_link(max_parent + RIGHT, max_left);
            set_parent(heap, max_left, Some(max_parent));
            heap.set_link(max + LEFT, Some(left_child));
            set_parent(heap, Some(left_child), Some(max));
        }
        heap.set_link(max + RIGHT, links.right);
        set_parent(heap, links.right, Some(max));
        heap.set_link(max + PARENT, links.parent);
        self.replace_child(heap, links.parent, bp, Some(max));
        trace!(bp, replacement = max, "Replaced tree node by its predecessor.");
    }

    /// Points whatever referenced `old` (its parent or the root) at `new`.
    unsafe fn replace_child(
        &mut self,
        heap: &mut Heap,
        parent: Option<usize>,
        old: usize,
        new: Option<usize>,
    ) {
        match parent {
            None => {
                debug_assert_eq!(self.root, Some(old));
                self.root = new;
            }
            Some(p) if left(heap, p) == Some(old) => heap.set_link(p + LEFT, new),
            Some(p) => {
                debug_assert_eq!(right(heap, p), Some(old));
                heap.set_link(p + RIGHT, new)
            }
        }
    }
}

/// The two size-keyed trees, split at a size threshold so that the tree
/// serving small and medium requests stays shallow.
#[derive(Debug)]
pub(crate) struct Forest {
    small: SizeTree,
    large: SizeTree,
    threshold: usize,
}

impl Forest {
    /// Creates two empty trees. Blocks of at most `threshold` bytes go to
    /// the small tree.
    pub(crate) const fn new(threshold: usize) -> Self {
        Forest {
            small: SizeTree::new(),
            large: SizeTree::new(),
            threshold,
        }
    }

    #[inline]
    pub(crate) fn small(&self) -> &SizeTree {
        &self.small
    }

    #[inline]
    pub(crate) fn large(&self) -> &SizeTree {
        &self.large
    }

    #[inline]
    pub(crate) fn threshold(&self) -> usize {
        self.threshold
    }

    #[inline]
    fn tree(&self, size: usize) -> &SizeTree {
        match size <= self.threshold {
            true => &self.small,
            false => &self.large,
        }
    }

    #[inline]
    fn tree_mut(&mut self, size: usize) -> &mut SizeTree {
        match size <= self.threshold {
            true => &mut self.small,
            false => &mut self.large,
        }
    }

    /// # Safety
    /// See [`SizeTree::insert`].
    pub(crate) unsafe fn insert(&mut self, heap: &mut Heap, bp: usize) {
        let size = block_size(heap, bp);
        self.tree_mut(size).insert(heap, bp)
    }

    /// # Safety
    /// See [`SizeTree::delete`]; `bp` may belong to either tree.
    pub(crate) unsafe fn delete(&mut self, heap: &mut Heap, bp: usize) {
        let size = block_size(heap, bp);
        self.tree_mut(size).delete(heap, bp)
    }

    /// # Safety
    /// See [`SizeTree::find_exact`].
    pub(crate) unsafe fn find_exact(&self, heap: &Heap, size: usize) -> Option<usize> {
        self.tree(size).find_exact(heap, size)
    }

    /// Searches the small tree first if `size` may be found there, then the
    /// large tree.
    ///
    /// # Safety
    /// See [`SizeTree::find_best_fit`].
    pub(crate) unsafe fn find_best_fit(&self, heap: &Heap, size: usize) -> Option<usize> {
        if size <= self.threshold {
            if let Some(bp) = self.small.find_best_fit(heap, size) {
                return Some(bp);
            }
        }
        self.large.find_best_fit(heap, size)
    }
}
