//! Huge objects: one dedicated mapping each, header in the leading page.
//!
//! ```text
//!  base                payload = base + PAGE_SIZE
//!  | .... | header(16) | payload (round_up(size, PAGE_SIZE)) |
//! ```
//!
//! Nothing here logs: these are also the allocations served while a logger runs inside the
//! allocator.

use core::ptr::NonNull;

use crate::{
  config::PAGE_SIZE,
  error::AllocError,
  header::{self, Header},
  platform::{align_up, os_map, os_unmap},
};

fn rounded(size: usize) -> Result<usize, AllocError> {
  size
    .checked_add(PAGE_SIZE - 1)
    .map(|s| s & !(PAGE_SIZE - 1))
    .ok_or(AllocError::MapFailed { size })
}

/// Map `round_up(size) + PAGE_SIZE` bytes and return the page-aligned payload.
pub fn allocate(size: usize) -> Result<NonNull<u8>, AllocError> {
  let payload_size = rounded(size)?;
  let total = payload_size
    .checked_add(PAGE_SIZE)
    .ok_or(AllocError::MapFailed { size })?;

  let base = os_map(total)?;
  let payload = unsafe { base.add(PAGE_SIZE) };
  unsafe { header::write_huge(payload, payload_size) };
  Ok(payload)
}

/// Like [`allocate`], with the payload aligned to `alignment` (a power of two).
///
/// The mapping is over-reserved and trimmed, so what stays mapped is exactly the span
/// [`free`] releases.
pub fn allocate_aligned(size: usize, alignment: usize) -> Result<NonNull<u8>, AllocError> {
  if alignment <= PAGE_SIZE {
    return allocate(size);
  }

  let payload_size = rounded(size)?;
  let total = payload_size
    .checked_add(PAGE_SIZE)
    .and_then(|t| t.checked_add(alignment))
    .ok_or(AllocError::MapFailed { size })?;

  let base = os_map(total)?.as_ptr() as usize;
  let payload = align_up(base + PAGE_SIZE, alignment);
  let lead = payload - PAGE_SIZE - base;
  let tail_start = payload + payload_size;
  let tail = base + total - tail_start;
  unsafe {
    if lead > 0 {
      os_unmap(base as *mut u8, lead);
    }
    if tail > 0 {
      os_unmap(tail_start as *mut u8, tail);
    }
  }

  let payload = NonNull::new(payload as *mut u8).ok_or(AllocError::MapFailed { size })?;
  unsafe { header::write_huge(payload, payload_size) };
  Ok(payload)
}

/// Mapped span `(start, len)` backing a huge payload.
///
/// # Safety
/// `payload` must be a live huge allocation.
pub unsafe fn span(payload: NonNull<u8>) -> (usize, usize) {
  match unsafe { header::read(payload) } {
    Header::Huge { size } => (payload.as_ptr() as usize - PAGE_SIZE, size + PAGE_SIZE),
    Header::Regular(_) => unreachable!("span of a regular object"),
  }
}

/// Unmap a huge object.
///
/// # Safety
/// `payload` must be a live huge allocation; it is invalid afterwards.
pub unsafe fn free(payload: NonNull<u8>) {
  let (start, len) = unsafe { span(payload) };
  unsafe { os_unmap(start as *mut u8, len) };
}
