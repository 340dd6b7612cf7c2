//! [`Grower`] trait and structures that implement it.
//!
//! The [`Grower`] trait is the arena-growth primitive of the allocator:
//! anything that acts as a contiguous buffer which can grow at its end can
//! back a [`ForestMalloc`](crate::ForestMalloc).

use core::marker::PhantomData;
use core::ptr::{self, NonNull};
use std::io;

use tracing::debug;

use crate::error::GrowError;

/// A trait for types that act as if they were a contiguous growable buffer.
///
/// # Safety
/// * every successful `grow` must return the end of the previous growth, so
///   that consecutive growths form one contiguous region;
/// * `grow(0)` must not grow the buffer and must return its current end;
/// * the returned memory must stay valid, and must not be handed to anybody
///   else, for as long as the grower is alive. Moving the grower must not
///   invalidate it.
pub unsafe trait Grower {
    /// Grows the underlying buffer by exactly `size` bytes.
    /// Returns the old end of the buffer or an error if the growth failed,
    /// in which case the buffer is left as it was.
    fn grow(&mut self, size: usize) -> Result<NonNull<u8>, GrowError>;
}

#[cfg(any(target_os = "linux", target_os = "android"))]
const MAP_FLAGS: libc::c_int = libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_NORESERVE;
#[cfg(not(any(target_os = "linux", target_os = "android")))]
const MAP_FLAGS: libc::c_int = libc::MAP_PRIVATE | libc::MAP_ANONYMOUS;

/// A grower that reserves one anonymous mapping up front
/// and hands it out front to back, like `sbrk` over a fixed maximum heap.
///
/// Pages are only committed by the kernel once they are touched.
#[derive(Debug)]
pub struct MmapGrower {
    start: NonNull<u8>,
    used: usize,
    capacity: usize,
}

impl MmapGrower {
    /// Maps `capacity` bytes of address space.
    pub fn with_capacity(capacity: usize) -> Result<Self, GrowError> {
        if capacity == 0 {
            return Err(GrowError::Map(io::Error::new(
                io::ErrorKind::InvalidInput,
                "arena capacity must be non-zero",
            )));
        }
        let p = unsafe {
            libc::mmap(
                ptr::null_mut(),
                capacity,
                libc::PROT_READ | libc::PROT_WRITE,
                MAP_FLAGS,
                -1,
                0,
            )
        };
        if p == libc::MAP_FAILED {
            return Err(GrowError::Map(io::Error::last_os_error()));
        }
        let start = NonNull::new(p.cast::<u8>())
            .ok_or_else(|| GrowError::Map(io::Error::other("mmap returned null")))?;
        debug!(?start, capacity, "Mapped arena.");
        Ok(MmapGrower {
            start,
            used: 0,
            capacity,
        })
    }

    /// Returns the number of bytes handed out so far.
    #[inline]
    pub fn used(&self) -> usize {
        self.used
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

unsafe impl Grower for MmapGrower {
    fn grow(&mut self, size: usize) -> Result<NonNull<u8>, GrowError> {
        let available = self.capacity - self.used;
        if size > available {
            return Err(GrowError::Exhausted {
                requested: size,
                available,
            });
        }
        let old_end = unsafe { self.start.add(self.used) };
        self.used += size;
        Ok(old_end)
    }
}

impl Drop for MmapGrower {
    fn drop(&mut self) {
        let rc = unsafe { libc::munmap(self.start.as_ptr().cast(), self.capacity) };
        debug_assert_eq!(rc, 0, "munmap() of our own mapping should never fail.");
    }
}

// The mapping is owned exclusively by the grower.
unsafe impl Send for MmapGrower {}

/// A grower that operates on a caller-provided buffer.
#[derive(Debug)]
pub struct SliceGrower<'a> {
    start: NonNull<u8>,
    used: usize,
    capacity: usize,
    _buf: PhantomData<&'a mut [u8]>,
}

impl<'a> SliceGrower<'a> {
    /// Creates a grower that hands out `buf` front to back.
    pub fn new(buf: &'a mut [u8]) -> Self {
        let capacity = buf.len();
        SliceGrower {
            start: NonNull::from(buf).cast(),
            used: 0,
            capacity,
            _buf: PhantomData,
        }
    }

    #[inline]
    pub fn used(&self) -> usize {
        self.used
    }
}

unsafe impl Grower for SliceGrower<'_> {
    fn grow(&mut self, size: usize) -> Result<NonNull<u8>, GrowError> {
        let available = self.capacity - self.used;
        if size > available {
            return Err(GrowError::Exhausted {
                requested: size,
                available,
            });
        }
        let old_end = unsafe { self.start.add(self.used) };
        self.used += size;
        Ok(old_end)
    }
}

unsafe impl Send for SliceGrower<'_> {}
