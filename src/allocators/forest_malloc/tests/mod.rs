use std::sync::Once;

use crate::check::{FreeBlock, HeapReport, Owner};
use crate::error::GrowError;
use crate::growers::{MmapGrower, SliceGrower};
use crate::heap::FIRST_BLOCK;

use self::format::{RecordEntryLayer, SimpleFormatter};

use super::*;

use tracing_subscriber::fmt::Layer;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::{EnvFilter, Registry};


/// Installs the log formatter once per test binary. Logs stay off unless
/// `RUST_LOG` asks for them, e.g. `RUST_LOG=forest_malloc::allocators=debug`.
fn init_tracing() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("off"));
        let subscriber = Registry::default()
            .with(filter)
            .with(RecordEntryLayer::default())
            .with(Layer::new().with_test_writer().event_format(SimpleFormatter));
        let _ = tracing::subscriber::set_global_default(subscriber);
    });
}

fn allocator(buf: &mut [u8]) -> ForestMalloc<SliceGrower<'_>> {
    init_tracing();
    ForestMalloc::with_grower(SliceGrower::new(buf))
}

fn assert_consistent<G: Grower>(allocator: &ForestMalloc<G>) -> HeapReport {
    let report = allocator.check();
    assert!(report.is_consistent(), "{:#?}", report.violations);
    if !allocator.is_initialized() {
        assert_eq!(report.block_count, 0);
        return report;
    }
    // Every byte between the prologue and the epilogue is in some block.
    assert_eq!(
        report.allocated_bytes() + report.free_bytes(),
        allocator.heap_size() - 2 * WORD
    );
    report
}

unsafe fn fill(p: NonNull<u8>, len: usize, seed: u8) {
    for i in 0..len {
        p.as_ptr().add(i).write(seed.wrapping_add(i as u8));
    }
}

unsafe fn verify(p: NonNull<u8>, len: usize, seed: u8) {
    for i in 0..len {
        assert_eq!(
            p.as_ptr().add(i).read(),
            seed.wrapping_add(i as u8),
            "Byte {i} of {p:?} was overwritten."
        );
    }
}

#[test]
fn test_1() {
    // Two small allocations never overlap.
    let mut buf = vec![0_u8; 64 * 1024];
    let mut allocator = allocator(&mut buf);
    allocator.init().unwrap();
    let p1 = allocator.allocate(8).unwrap();
    let p2 = allocator.allocate(8).unwrap();
    assert_ne!(p1, p2);
    assert!((p1.as_ptr() as usize).abs_diff(p2.as_ptr() as usize) >= 8);
    assert_eq!(p1.as_ptr() as usize % ALIGNMENT, 0);
    assert_eq!(p2.as_ptr() as usize % ALIGNMENT, 0);
    unsafe {
        fill(p1, 8, 1);
        fill(p2, 8, 101);
        verify(p1, 8, 1);
        verify(p2, 8, 101);
    }
    assert_consistent(&allocator);
}

#[test]
fn test_2() {
    // A freed block is reused without growing the heap.
    let mut buf = vec![0_u8; 64 * 1024];
    let mut allocator = allocator(&mut buf);
    let p1 = allocator.allocate(4096).unwrap();
    let heap_size = allocator.heap_size();
    unsafe { allocator.deallocate(p1.as_ptr()) };
    assert_consistent(&allocator);
    let p2 = allocator.allocate(4096).unwrap();
    assert_eq!(p1, p2);
    assert_eq!(allocator.heap_size(), heap_size);
    assert_consistent(&allocator);
}

#[test]
fn test_3() {
    // An exact fit beats growing the heap.
    let mut buf = vec![0_u8; 64 * 1024];
    let mut allocator = allocator(&mut buf);
    let _p1 = allocator.allocate(32).unwrap();
    let p2 = allocator.allocate(32).unwrap();
    let _p3 = allocator.allocate(32).unwrap();
    unsafe { allocator.deallocate(p2.as_ptr()) };
    let heap_size = allocator.heap_size();
    assert_eq!(allocator.allocate(32).unwrap(), p2);
    assert_eq!(allocator.heap_size(), heap_size);
    assert_consistent(&allocator);
}

#[test]
fn test_4() {
    // Freeing both neighbours of a free block leaves one merged block.
    let mut buf = vec![0_u8; 64 * 1024];
    let mut allocator = allocator(&mut buf);
    let before = allocator.allocate(64).unwrap();
    let middle = allocator.allocate(64).unwrap();
    let after = allocator.allocate(64).unwrap();
    let _guard = allocator.allocate(64).unwrap();

    unsafe {
        allocator.deallocate(middle.as_ptr());
        allocator.deallocate(before.as_ptr());
        allocator.deallocate(after.as_ptr());
    }
    let report = assert_consistent(&allocator);
    let offset = allocator.heap.offset_of(before);
    assert_eq!(offset, FIRST_BLOCK);
    assert_eq!(
        report.free_block_at(offset),
        Some(&FreeBlock {
            offset,
            size: 3 * 72,
            owner: Owner::SmallTree
        })
    );
    assert!(report.free_block_at(allocator.heap.offset_of(middle)).is_none());
    assert!(report.free_block_at(allocator.heap.offset_of(after)).is_none());
    assert!(report.free_blocks.iter().all(|b| b.owner != Owner::TinyList));
}

#[test]
fn test_5() {
    // Best fit: the smallest free block that is large enough is chosen.
    let mut buf = vec![0_u8; 64 * 1024];
    let mut allocator = allocator(&mut buf);
    // Blocks of 200, 104 and 160 bytes, each followed by a 24-byte guard.
    let mut blocks = vec![];
    for size in [196, 100, 156] {
        blocks.push(allocator.allocate(size).unwrap());
        allocator.allocate(20).unwrap();
    }
    for p in &blocks {
        unsafe { allocator.deallocate(p.as_ptr()) };
    }
    assert_consistent(&allocator);

    let p = allocator.allocate(130).unwrap();
    assert_eq!(p, blocks[2]);
    let report = assert_consistent(&allocator);
    // The 24-byte remainder of the 160-byte block went back to the tree.
    let rest = allocator.heap.offset_of(blocks[2]) + 136;
    assert_eq!(report.free_block_at(rest).map(|b| b.size), Some(24));
}

#[test]
fn test_6() {
    // Allocating and freeing everything leaves only free blocks behind.
    let mut buf = vec![0_u8; 256 * 1024];
    let mut allocator = allocator(&mut buf);
    let sizes = [1, 8, 12, 13, 24, 100, 120, 250, 500, 1000, 4096, 9000, 5, 17];
    let mut live = vec![];
    for round in 0..3 {
        for (i, &size) in sizes.iter().enumerate() {
            let p = allocator.allocate(size).unwrap();
            unsafe { fill(p, size, (round * 16 + i) as u8) };
            live.push((p, size, (round * 16 + i) as u8));
        }
        assert_consistent(&allocator);
    }
    for (i, &(p, size, seed)) in live.iter().enumerate() {
        unsafe {
            verify(p, size, seed);
            if i % 2 == 0 {
                allocator.deallocate(p.as_ptr());
            }
        }
    }
    assert_consistent(&allocator);
    for (i, &(p, _, _)) in live.iter().enumerate() {
        if i % 2 == 1 {
            unsafe { allocator.deallocate(p.as_ptr()) };
        }
    }
    let report = assert_consistent(&allocator);
    assert_eq!(report.allocated_bytes(), 0);
}

#[test]
fn test_7() {
    // Reallocation keeps the contents up to the smaller size.
    let mut buf = vec![0_u8; 64 * 1024];
    let mut allocator = allocator(&mut buf);
    unsafe {
        let p = allocator.allocate(100).unwrap();
        fill(p, 100, 7);
        let _guard = allocator.allocate(16).unwrap();

        let q = allocator.reallocate(p.as_ptr(), 1000).unwrap().unwrap();
        verify(q, 100, 7);
        assert!(allocator.usable_size(q) >= 1000);
        let r = allocator.reallocate(q.as_ptr(), 10).unwrap().unwrap();
        verify(r, 10, 7);
        assert_consistent(&allocator);

        assert!(allocator.reallocate(r.as_ptr(), 0).unwrap().is_none());
        let s = allocator.reallocate(core::ptr::null_mut(), 50).unwrap();
        assert!(s.is_some());
        assert_consistent(&allocator);
    }
}

#[test]
fn test_8() {
    // Failed reallocations leave the old allocation alone.
    let mut buf = vec![0_u8; 16 * 1024];
    let mut allocator = allocator(&mut buf);
    unsafe {
        let p = allocator.allocate(64).unwrap();
        fill(p, 64, 3);
        let err = allocator.reallocate(p.as_ptr(), 1 << 20).unwrap_err();
        assert!(matches!(err, MallocError::OutOfMemory(GrowError::Exhausted { .. })));
        verify(p, 64, 3);
        assert_consistent(&allocator);
        allocator.deallocate(p.as_ptr());
    }
    assert_consistent(&allocator);
}

#[test]
fn test_9() {
    let mut buf = vec![0_u8; 64 * 1024];
    let mut allocator = allocator(&mut buf);
    unsafe {
        let dirty = allocator.allocate(256).unwrap();
        dirty.as_ptr().write_bytes(0xFF, 256);
        allocator.deallocate(dirty.as_ptr());
    }
    let p = allocator.allocate_zeroed(16, 16).unwrap();
    unsafe {
        assert!(core::slice::from_raw_parts(p.as_ptr(), 256)
            .iter()
            .all(|&b| b == 0));
    }
    assert!(matches!(
        allocator.allocate_zeroed(usize::MAX, 2),
        Err(MallocError::RequestTooLarge { .. })
    ));
    assert!(matches!(
        allocator.allocate_zeroed(0, 5),
        Err(MallocError::ZeroSize)
    ));
    assert_consistent(&allocator);
}

#[test]
fn test_10() {
    // Exhaustion is reported and leaves the heap usable.
    let mut buf = vec![0_u8; 8192];
    let mut allocator = allocator(&mut buf);
    assert!(matches!(allocator.allocate(0), Err(MallocError::ZeroSize)));
    assert!(matches!(
        allocator.allocate(usize::MAX),
        Err(MallocError::RequestTooLarge { .. })
    ));

    let p = allocator.allocate(3000).unwrap();
    unsafe { fill(p, 3000, 9) };
    let heap_size = allocator.heap_size();
    assert!(matches!(
        allocator.allocate(6000),
        Err(MallocError::OutOfMemory(GrowError::Exhausted { .. }))
    ));
    assert_eq!(allocator.heap_size(), heap_size);
    assert_consistent(&allocator);
    unsafe { verify(p, 3000, 9) };

    // Whatever is left still serves smaller requests.
    let q = allocator.allocate(500).unwrap();
    assert!(q > p);
    assert_consistent(&allocator);
}

#[test]
fn test_11() {
    // Tiny blocks are recycled through their lists.
    let mut buf = vec![0_u8; 64 * 1024];
    let mut allocator = allocator(&mut buf);
    let p = allocator.allocate(4).unwrap();
    unsafe { allocator.deallocate(p.as_ptr()) };
    let report = assert_consistent(&allocator);
    assert_eq!(
        report.free_block_at(allocator.heap.offset_of(p)).map(|b| b.owner),
        Some(Owner::TinyList)
    );
    let q = allocator.allocate(3).unwrap();
    assert_eq!(p, q);

    let r = allocator.allocate(12).unwrap();
    unsafe { allocator.deallocate(r.as_ptr()) };
    assert_consistent(&allocator);
    // An 8-byte request splits a 16-byte block when the 8-byte list is empty.
    let s = allocator.allocate(1).unwrap();
    assert_eq!(s, r);
    let report = assert_consistent(&allocator);
    let rest = allocator.heap.offset_of(r) + TINY_BLOCK;
    assert_eq!(
        report.free_block_at(rest),
        Some(&FreeBlock {
            offset: rest,
            size: TINY_BLOCK,
            owner: Owner::TinyList
        })
    );
    let t = allocator.allocate(2).unwrap();
    assert_eq!(allocator.heap.offset_of(t), rest);
    assert_consistent(&allocator);
}

#[test]
fn test_12() {
    // A tiny free neighbour is never merged.
    let mut buf = vec![0_u8; 64 * 1024];
    let mut allocator = allocator(&mut buf);
    let a = allocator.allocate(12).unwrap();
    let b = allocator.allocate(100).unwrap();
    unsafe {
        allocator.deallocate(a.as_ptr());
        allocator.deallocate(b.as_ptr());
    }
    let report = assert_consistent(&allocator);
    let a_offset = allocator.heap.offset_of(a);
    let b_offset = allocator.heap.offset_of(b);
    assert_eq!(
        report.free_block_at(a_offset).map(|b| b.size),
        Some(DOUBLE_TINY_BLOCK)
    );
    // The freed block merged forward with the rest of the heap instead.
    assert_eq!(
        report.free_block_at(b_offset).map(|b| b.size),
        Some(allocator.heap_size() - 2 * WORD - DOUBLE_TINY_BLOCK)
    );
}

#[test]
fn test_13() {
    // Growth merges with a free block at the end of the heap.
    let mut buf = vec![0_u8; 64 * 1024];
    let mut allocator = allocator(&mut buf);
    let p1 = allocator.allocate(4000).unwrap();
    let p2 = allocator.allocate(5000).unwrap();
    assert_eq!(p2.as_ptr() as usize - p1.as_ptr() as usize, 4008);
    assert_eq!(allocator.heap_size(), FIRST_BLOCK + 4096 + 5008);
    assert_consistent(&allocator);
}

#[test]
fn test_14() {
    // A small request right after a small split is served from the back.
    let mut buf = vec![0_u8; 64 * 1024];
    let mut allocator = allocator(&mut buf);
    let p1 = allocator.allocate(20).unwrap();
    let p2 = allocator.allocate(12).unwrap();
    assert_eq!(allocator.heap.offset_of(p1), FIRST_BLOCK);
    assert_eq!(allocator.heap.offset_of(p2), allocator.heap_size() - 16);
    assert_consistent(&allocator);

    let mut buf = vec![0_u8; 64 * 1024];
    init_tracing();
    let config = Config::new().with_reverse_split_limit(0);
    let mut allocator = ForestMalloc::with_config(SliceGrower::new(&mut buf), config);
    let p1 = allocator.allocate(20).unwrap();
    let p2 = allocator.allocate(12).unwrap();
    assert_eq!(p2.as_ptr() as usize - p1.as_ptr() as usize, 24);
    assert_consistent(&allocator);
}

#[test]
fn test_15() {
    // Large blocks live in their own tree.
    init_tracing();
    let grower = MmapGrower::with_capacity(1 << 24).unwrap();
    let mut allocator = ForestMalloc::with_grower(grower);
    let big = allocator.allocate(20_000).unwrap();
    let _guard = allocator.allocate(100).unwrap();
    let bigger = allocator.allocate(30_000).unwrap();
    let _guard = allocator.allocate(100).unwrap();
    unsafe {
        allocator.deallocate(big.as_ptr());
        allocator.deallocate(bigger.as_ptr());
    }
    let report = assert_consistent(&allocator);
    let owner = |p| report.free_block_at(allocator.heap.offset_of(p)).map(|b| b.owner);
    assert_eq!(owner(big), Some(Owner::LargeTree));
    assert_eq!(owner(bigger), Some(Owner::LargeTree));

    // Requests above the threshold skip the small tree.
    let p = allocator.allocate(25_000).unwrap();
    assert_eq!(p, bigger);
    assert_consistent(&allocator);
}

#[test]
fn test_16() {
    let mut buf = vec![0_u8; 4096];
    let mut allocator = allocator(&mut buf);
    assert!(!allocator.is_initialized());
    assert_eq!(allocator.heap_size(), 0);
    assert_consistent(&allocator);
    allocator.init().unwrap();
    allocator.init().unwrap();
    assert_eq!(allocator.heap_size(), FIRST_BLOCK);
    // Null is ignored.
    unsafe { allocator.deallocate(core::ptr::null_mut()) };
    assert_consistent(&allocator);
}
