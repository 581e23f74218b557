//! Power-of-two size classes: 16, 32, 64, ..., 131072.

use crate::config::{HUGE_THRESHOLD, MIN_CLASS_SIZE, SIZE_CLASSES};

/// Directory slot for `size`: 0 up to 16 bytes, otherwise `ceil(log2(size)) - 4`.
///
/// Callers route `size >= HUGE_THRESHOLD` to the huge path before asking; `HUGE_THRESHOLD`
/// itself still maps to the last slot.
#[inline(always)]
pub const fn index(size: usize) -> usize {
  if size <= MIN_CLASS_SIZE {
    return 0;
  }
  let ceil_log2 = (usize::BITS - (size - 1).leading_zeros()) as usize;
  ceil_log2 - MIN_CLASS_SIZE.trailing_zeros() as usize
}

/// Object size served by slot `index`.
#[inline(always)]
pub const fn class_size(index: usize) -> usize {
  MIN_CLASS_SIZE << index
}

#[inline(always)]
pub const fn is_huge(size: usize) -> bool {
  size >= HUGE_THRESHOLD
}

const _: () = assert!(index(HUGE_THRESHOLD) == SIZE_CLASSES - 1);
const _: () = assert!(class_size(SIZE_CLASSES - 1) == HUGE_THRESHOLD);
