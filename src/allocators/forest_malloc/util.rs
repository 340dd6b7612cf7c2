//! Request sizing.

use crate::config::Config;
use crate::error::MallocError;
use crate::header::{ALIGNMENT, WORD};
use crate::heap::MAX_HEAP_LEN;
use crate::util::align_up;

/// Rounds requests that fall just short of 128, 256 or 512 bytes up to
/// that size, so that the blocks they leave behind when freed can be
/// reused by requests of the neighbouring sizes.
#[inline]
pub(crate) fn round_to_size_class(size: usize) -> usize {
    match size {
        112..=127 => 128,
        224..=255 => 256,
        448..=511 => 512,
        _ => size,
    }
}

/// Returns the block size needed to serve a `size`-byte request:
/// the payload plus a header word, aligned.
pub(crate) fn request_size(size: usize, config: &Config) -> Result<usize, MallocError> {
    let rounded = match config.size_class_rounding {
        true => round_to_size_class(size),
        false => size,
    };
    match rounded.checked_add(WORD).and_then(|s| align_up(s, ALIGNMENT)) {
        Some(need) if need <= MAX_HEAP_LEN => Ok(need),
        _ => Err(MallocError::RequestTooLarge { size }),
    }
}
