//! Heap consistency checker.
//!
//! The checker never trusts the heap: every word goes through
//! [`Heap::checked_word`], each walk advances by at least one word or claims
//! a block that was not claimed before, so corrupted metadata shows up as
//! [`Violation`]s instead of panics or endless loops.

use std::collections::BTreeMap;

use thiserror::Error;

use crate::freelist::{TinyLists, TINY_CLASSES};
use crate::header::{Header, ALIGNMENT, DOUBLE_TINY_BLOCK, TINY_BLOCK, TREE_MIN_BLOCK, WORD};
use crate::heap::{Heap, FIRST_BLOCK, PROLOGUE};
use crate::tree::Forest;
use crate::util::decode_link;

/// The free structure a block belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Owner {
    TinyList,
    SmallTree,
    LargeTree,
}

/// A block owned by one of the free structures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FreeBlock {
    /// Payload offset from the start of the heap.
    pub offset: usize,
    pub size: usize,
    pub owner: Owner,
}

/// A broken heap invariant. Offsets are payload offsets.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum Violation {
    #[error("prologue word is {word:#x}")]
    BadPrologue { word: u32 },
    #[error("epilogue expected at {expected:#x}, found at {offset:#x}")]
    BadEpilogue { offset: usize, expected: usize },
    #[error("block {offset:#x} is not aligned")]
    Misaligned { offset: usize },
    #[error("block {offset:#x} has invalid size {size}")]
    BadSize { offset: usize, size: usize },
    #[error("block {offset:#x} of size {size} runs past the heap end")]
    Overrun { offset: usize, size: usize },
    #[error("block {offset:#x} has header {header:#x} but footer {footer:#x}")]
    FooterMismatch {
        offset: usize,
        header: u32,
        footer: u32,
    },
    #[error("block {offset:#x} disagrees with its predecessor about its allocation")]
    PrevAllocatedMismatch { offset: usize },
    #[error("free block {offset:#x} should have been merged with its predecessor")]
    Uncoalesced { offset: usize },
    #[error("offset {offset:#x} is outside the heap")]
    OutOfBounds { offset: usize },
    #[error("offset {offset:#x} is not the start of a block")]
    NotABlock { offset: usize },
    #[error("block {offset:#x} has size {found}, expected {expected}")]
    WrongSize {
        offset: usize,
        expected: usize,
        found: usize,
    },
    #[error("block {offset:#x} of size {size} is in the wrong tree")]
    WrongTree { offset: usize, size: usize },
    #[error("block {offset:#x} has the wrong allocation status for its structure")]
    BadStatus { offset: usize },
    #[error("block {offset:#x} has the wrong node/link variant bit")]
    WrongVariant { offset: usize },
    #[error("tree node {offset:#x} is its own child")]
    SelfChild { offset: usize },
    #[error("tree node {offset:#x} has parent {found:?}, expected {expected:?}")]
    ParentMismatch {
        offset: usize,
        expected: Option<usize>,
        found: Option<usize>,
    },
    #[error("tree node {offset:#x} of size {size} breaks the search order")]
    OrderViolation { offset: usize, size: usize },
    #[error("chain link {offset:#x} does not point back at its predecessor")]
    ChainBackLink { offset: usize },
    #[error("block {offset:#x} is owned more than once")]
    DoubleOwned { offset: usize },
    #[error("free block {offset:#x} is not owned by any structure")]
    Unowned { offset: usize },
}

/// The result of a heap check.
#[derive(Debug, Clone, Default)]
pub struct HeapReport {
    /// Heap size in bytes, prologue and epilogue included.
    pub heap_size: usize,
    /// Blocks found by walking the heap, tiny free blocks included.
    pub block_count: usize,
    pub free_blocks: Vec<FreeBlock>,
    pub violations: Vec<Violation>,
    allocated_bytes: usize,
}

impl HeapReport {
    pub fn is_consistent(&self) -> bool {
        self.violations.is_empty()
    }

    /// Total size of the blocks owned by the free structures.
    pub fn free_bytes(&self) -> usize {
        self.free_blocks.iter().map(|b| b.size).sum()
    }

    /// Total size of the blocks handed out to callers, headers included.
    pub fn allocated_bytes(&self) -> usize {
        self.allocated_bytes
    }

    pub fn free_block_at(&self, offset: usize) -> Option<&FreeBlock> {
        self.free_blocks.iter().find(|b| b.offset == offset)
    }
}

#[derive(Debug, Clone, Copy)]
struct BlockInfo {
    size: usize,
    allocated: bool,
}

pub(crate) struct Checker<'h> {
    heap: &'h Heap,
    blocks: BTreeMap<usize, BlockInfo>,
    owners: BTreeMap<usize, Owner>,
    report: HeapReport,
}

/// Checks `heap` together with the structures that own its free blocks.
pub(crate) fn check_heap(heap: &Heap, tiny: &TinyLists, forest: &Forest) -> HeapReport {
    if !heap.is_initialized() {
        return HeapReport::default();
    }
    let mut checker = Checker::new(heap);
    checker.walk_arena();
    for size in TINY_CLASSES {
        checker.check_list(tiny.head(size), size);
    }
    let threshold = forest.threshold();
    checker.check_tree(forest.small().root(), Owner::SmallTree, TREE_MIN_BLOCK, threshold);
    checker.check_tree(
        forest.large().root(),
        Owner::LargeTree,
        threshold.saturating_add(1).max(TREE_MIN_BLOCK),
        usize::MAX,
    );
    checker.finish()
}

impl<'h> Checker<'h> {
    pub(crate) fn new(heap: &'h Heap) -> Self {
        Checker {
            heap,
            blocks: BTreeMap::new(),
            owners: BTreeMap::new(),
            report: HeapReport {
                heap_size: heap.len(),
                ..HeapReport::default()
            },
        }
    }

    fn violation(&mut self, violation: Violation) {
        self.report.violations.push(violation);
    }

    /// Walks every block from the prologue to the epilogue.
    pub(crate) fn walk_arena(&mut self) {
        let heap = self.heap;
        match heap.checked_word(PROLOGUE) {
            Some(word) if word == Header::allocated(0, true).raw() => {}
            Some(word) => self.violation(Violation::BadPrologue { word }),
            None => self.violation(Violation::OutOfBounds { offset: PROLOGUE }),
        }

        let mut bp = FIRST_BLOCK;
        let mut prev_allocated = true;
        let mut prev_tree_free = false;
        loop {
            let Some(word) = heap.checked_word(bp - WORD) else {
                self.violation(Violation::OutOfBounds { offset: bp });
                return;
            };
            let header = Header::from_raw(word);
            let size = header.size();
            if header.is_prev_allocated() != prev_allocated {
                self.violation(Violation::PrevAllocatedMismatch { offset: bp });
            }
            if size == 0 {
                if bp != heap.len() || !header.is_allocated() {
                    self.violation(Violation::BadEpilogue {
                        offset: bp,
                        expected: heap.len(),
                    });
                }
                return;
            }
            if bp.checked_add(size).map_or(true, |end| end > heap.len()) {
                self.violation(Violation::Overrun { offset: bp, size });
                return;
            }

            let allocated = header.is_allocated();
            if !allocated {
                if size < DOUBLE_TINY_BLOCK {
                    self.violation(Violation::BadSize { offset: bp, size });
                } else {
                    let footer = heap.checked_word(bp + size - 2 * WORD).unwrap_or_default();
                    if footer != word {
                        self.violation(Violation::FooterMismatch {
                            offset: bp,
                            header: word,
                            footer,
                        });
                    }
                }
                let tree_free = size >= TREE_MIN_BLOCK;
                if tree_free && prev_tree_free {
                    self.violation(Violation::Uncoalesced { offset: bp });
                }
                prev_tree_free = tree_free;
            } else {
                prev_tree_free = false;
                self.report.allocated_bytes += size;
            }

            self.blocks.insert(bp, BlockInfo { size, allocated });
            self.report.block_count += 1;
            prev_allocated = allocated;
            bp += size;
        }
    }

    /// Looks up a structure member, reporting it if it is not a block.
    fn member(&mut self, bp: usize) -> Option<BlockInfo> {
        if bp % ALIGNMENT != 0 {
            self.violation(Violation::Misaligned { offset: bp });
            return None;
        }
        if bp >= self.heap.len() {
            self.violation(Violation::OutOfBounds { offset: bp });
            return None;
        }
        let info = self.blocks.get(&bp).copied();
        if info.is_none() {
            self.violation(Violation::NotABlock { offset: bp });
        }
        info
    }

    /// Records `owner` for the block at `bp`. Returns `false` if the block
    /// was already owned, which also stops walks around cycles.
    fn claim(&mut self, bp: usize, info: BlockInfo, owner: Owner) -> bool {
        if self.owners.contains_key(&bp) {
            self.violation(Violation::DoubleOwned { offset: bp });
            return false;
        }
        self.owners.insert(bp, owner);
        self.report.free_blocks.push(FreeBlock {
            offset: bp,
            size: info.size,
            owner,
        });
        if info.allocated && info.size == TINY_BLOCK {
            // Free tiny blocks are marked allocated.
            self.report.allocated_bytes -= TINY_BLOCK;
        }
        true
    }

    fn link(&mut self, at: usize) -> Option<Option<usize>> {
        let link = self.heap.checked_word(at).map(decode_link);
        if link.is_none() {
            self.violation(Violation::OutOfBounds { offset: at });
        }
        link
    }

    /// Checks the tiny list starting at `head` whose blocks are `size` bytes.
    pub(crate) fn check_list(&mut self, head: Option<usize>, size: usize) {
        let mut current = head;
        while let Some(bp) = current {
            let Some(info) = self.member(bp) else { return };
            if info.size != size {
                self.violation(Violation::WrongSize {
                    offset: bp,
                    expected: size,
                    found: info.size,
                });
            }
            // Only 16-byte tiny blocks can afford to be marked free.
            if info.allocated != (info.size == TINY_BLOCK) {
                self.violation(Violation::BadStatus { offset: bp });
            }
            if !self.claim(bp, info, Owner::TinyList) {
                return;
            }
            let Some(next) = self.link(bp) else { return };
            current = next;
        }
    }

    /// Checks the tree rooted at `root` whose sizes must lie within
    /// `min..=max`.
    pub(crate) fn check_tree(&mut self, root: Option<usize>, owner: Owner, min: usize, max: usize) {
        // (node, expected parent, lowest size allowed, highest size allowed)
        let mut stack: Vec<(usize, Option<usize>, usize, usize)> = vec![];
        if let Some(root) = root {
            stack.push((root, None, min, max));
        }
        while let Some((bp, expected_parent, lo, hi)) = stack.pop() {
            let Some(info) = self.member(bp) else { continue };
            let size = info.size;
            if info.allocated {
                self.violation(Violation::BadStatus { offset: bp });
            }
            if size < TREE_MIN_BLOCK {
                self.violation(Violation::BadSize { offset: bp, size });
                continue;
            }
            if !self.claim(bp, info, owner) {
                continue;
            }
            if size < min || size > max {
                self.violation(Violation::WrongTree { offset: bp, size });
            } else if size < lo || size > hi {
                self.violation(Violation::OrderViolation { offset: bp, size });
            }
            let header = self.heap.checked_word(bp - WORD).map(Header::from_raw);
            if !header.is_some_and(Header::is_tree_node) {
                self.violation(Violation::WrongVariant { offset: bp });
            }

            let (Some(left), Some(next), Some(right), Some(parent)) = (
                self.link(bp),
                self.link(bp + WORD),
                self.link(bp + 2 * WORD),
                self.link(bp + 3 * WORD),
            ) else {
                continue;
            };
            if parent != expected_parent {
                self.violation(Violation::ParentMismatch {
                    offset: bp,
                    expected: expected_parent,
                    found: parent,
                });
            }
            self.check_chain(bp, size, next, owner);

            for (child, lo, hi) in [
                (right, size.saturating_add(1), hi),
                (left, lo, size.saturating_sub(1)),
            ] {
                match child {
                    Some(child) if child == bp => {
                        self.violation(Violation::SelfChild { offset: bp })
                    }
                    Some(child) => stack.push((child, Some(bp), lo, hi)),
                    None => {}
                }
            }
        }
    }

    fn check_chain(&mut self, node: usize, size: usize, first: Option<usize>, owner: Owner) {
        let mut prev = node;
        let mut current = first;
        while let Some(bp) = current {
            let Some(info) = self.member(bp) else { return };
            if info.allocated {
                self.violation(Violation::BadStatus { offset: bp });
            }
            if info.size != size {
                self.violation(Violation::WrongSize {
                    offset: bp,
                    expected: size,
                    found: info.size,
                });
            }
            if !self.claim(bp, info, owner) {
                return;
            }
            let header = self.heap.checked_word(bp - WORD).map(Header::from_raw);
            if header.map_or(true, Header::is_tree_node) {
                self.violation(Violation::WrongVariant { offset: bp });
            }
            let (Some(back), Some(next)) = (self.link(bp), self.link(bp + WORD)) else {
                return;
            };
            if back != Some(prev) {
                self.violation(Violation::ChainBackLink { offset: bp });
            }
            prev = bp;
            current = next;
        }
    }

    /// Checks that every free-marked block is owned and returns the report.
    pub(crate) fn finish(mut self) -> HeapReport {
        let unowned: Vec<usize> = self
            .blocks
            .iter()
            .filter(|(bp, info)| !info.allocated && !self.owners.contains_key(bp))
            .map(|(&bp, _)| bp)
            .collect();
        for offset in unowned {
            self.violation(Violation::Unowned { offset });
        }
        self.report
    }
}
