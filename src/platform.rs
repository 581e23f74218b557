//! OS virtual memory.

use core::{
  marker::PhantomData,
  ops::{Deref, DerefMut},
  ptr::{NonNull, null_mut},
  slice,
};

use crate::{config::PAGE_SIZE, error::AllocError};

/// Reserve `size` bytes of zeroed, read-write, lazily committed memory.
pub fn os_map(size: usize) -> Result<NonNull<u8>, AllocError> {
  let ptr = unsafe {
    libc::mmap(
      null_mut(),
      size,
      libc::PROT_READ | libc::PROT_WRITE,
      libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_NORESERVE,
      -1,
      0,
    )
  };

  if ptr == libc::MAP_FAILED {
    return Err(AllocError::MapFailed { size });
  }
  NonNull::new(ptr.cast()).ok_or(AllocError::MapFailed { size })
}

/// Release a span previously obtained from [`os_map`] (or a page-aligned part of one).
pub unsafe fn os_unmap(ptr: *mut u8, size: usize) {
  unsafe { libc::munmap(ptr.cast(), size) };
}

/// Tell the OS the physical pages covering `[start, end)` may be dropped. The range is shrunk
/// to whole pages; the mapping itself stays valid and reads back as zeros.
pub unsafe fn os_discard(start: usize, end: usize) {
  let start = align_up(start, PAGE_SIZE);
  let end = align_down(end, PAGE_SIZE);
  if end > start {
    unsafe { libc::madvise(start as *mut libc::c_void, end - start, libc::MADV_DONTNEED) };
  }
}

/// Rounds `x` up to the next multiple of alignment `align`. Alignment must be a power of 2.
#[inline(always)]
pub const fn align_up(x: usize, align: usize) -> usize {
  let mask = align - 1;
  (x + mask) & !mask
}

#[inline(always)]
pub const fn align_down(x: usize, align: usize) -> usize {
  x & !(align - 1)
}

// =============================================================================
// OS-backed tables
// =============================================================================

/// Types whose all-zero bit pattern is a valid value.
///
/// # Safety
/// Implementors must be valid when every byte is zero.
pub unsafe trait Zeroable {}

/// Fixed-length array living directly in an anonymous mapping.
///
/// Tables consulted on the allocation path cannot come from the heap they implement, and fresh
/// mappings are already zeroed, so construction is a single `mmap`.
pub struct OsArray<T: Zeroable> {
  ptr: NonNull<T>,
  len: usize,
  _marker: PhantomData<T>,
}

impl<T: Zeroable> OsArray<T> {
  pub fn zeroed(len: usize) -> Result<Self, AllocError> {
    let bytes = Self::bytes_for(len);
    let ptr = os_map(bytes)?;
    Ok(Self {
      ptr: ptr.cast(),
      len,
      _marker: PhantomData,
    })
  }

  fn bytes_for(len: usize) -> usize {
    align_up((len * size_of::<T>()).max(1), PAGE_SIZE)
  }
}

impl<T: Zeroable> Deref for OsArray<T> {
  type Target = [T];

  fn deref(&self) -> &[T] {
    unsafe { slice::from_raw_parts(self.ptr.as_ptr(), self.len) }
  }
}

impl<T: Zeroable> DerefMut for OsArray<T> {
  fn deref_mut(&mut self) -> &mut [T] {
    unsafe { slice::from_raw_parts_mut(self.ptr.as_ptr(), self.len) }
  }
}

impl<T: Zeroable> Drop for OsArray<T> {
  fn drop(&mut self) {
    unsafe { os_unmap(self.ptr.as_ptr().cast(), Self::bytes_for(self.len)) };
  }
}
