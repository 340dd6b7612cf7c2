//! Utility functions.

/// Returns the smallest multiple of `align` that is greater or equal to `x`
/// or `None` if that multiple does not fit a `usize`.
///
/// # Panics
/// Panics if `align` is 0.
#[inline]
pub(crate) fn align_up(x: usize, align: usize) -> Option<usize> {
    if x % align == 0 {
        Some(x)
    } else {
        ((x / align) * align).checked_add(align)
    }
}

/// Link words hold arena offsets. Offset 0 is the prologue, which is never a
/// payload, so 0 stands for "none".
#[inline(always)]
pub(crate) fn encode_link(link: Option<usize>) -> u32 {
    match link {
        Some(offset) => {
            debug_assert_ne!(offset, 0, "offset 0 can not be linked.");
            debug_assert!(offset <= u32::MAX as usize);
            offset as u32
        }
        None => 0,
    }
}

#[inline(always)]
pub(crate) fn decode_link(word: u32) -> Option<usize> {
    (word != 0).then_some(word as usize)
}
