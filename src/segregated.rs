//! Fixed-object-size allocator: a bump cursor plus an intrusive LIFO free list.

use core::ptr::{NonNull, null_mut};

use crate::config::HEADER_SIZE;
#[cfg(feature = "release-mem")]
use crate::{config::RELEASE_THRESHOLD, platform::os_discard};

/// Free slot. The link overlays the first word of the slot's header; the control byte at the
/// end of the header is left intact so a stale pointer still reads as "not allocated".
#[repr(C)]
struct FreeSlot {
  next: *mut FreeSlot,
}

/// One size class worth of objects.
///
/// A slot is `HEADER_SIZE + object_size` bytes and starts with the object header. Slots of
/// earlier extents remain valid after [`extend`](Self::extend) and keep circulating through the
/// free list.
pub struct SegregatedPool {
  base: usize,
  bump: usize,
  capacity: usize,
  slot_size: usize,
  free_list: *mut FreeSlot,
  extents: u32,
}

impl SegregatedPool {
  pub fn new(base: NonNull<u8>, object_size: usize, capacity: usize) -> Self {
    let base = base.as_ptr() as usize;
    Self {
      base,
      bump: base,
      capacity,
      slot_size: object_size + HEADER_SIZE,
      free_list: null_mut(),
      extents: 1,
    }
  }

  /// Hand out a slot (header included). Most recently freed first; `None` when both the free
  /// list and the current extent are exhausted.
  #[inline]
  pub fn allocate_object(&mut self) -> Option<NonNull<u8>> {
    let slot = self.free_list;
    if !slot.is_null() {
      self.free_list = unsafe { (*slot).next };
      return NonNull::new(slot.cast());
    }

    let end = self.bump + self.slot_size;
    if end - self.base > self.capacity {
      return None;
    }
    let slot = self.bump;
    self.bump = end;
    NonNull::new(slot as *mut u8)
  }

  /// Return a slot to the free list.
  ///
  /// # Safety
  /// `slot` must have come from [`allocate_object`](Self::allocate_object) on this pool and
  /// must not be on the free list already.
  #[inline]
  pub unsafe fn free_object(&mut self, slot: NonNull<u8>) {
    let node = slot.as_ptr().cast::<FreeSlot>();
    unsafe { (*node).next = self.free_list };
    self.free_list = node;

    #[cfg(feature = "release-mem")]
    if self.object_size() >= RELEASE_THRESHOLD {
      let start = slot.as_ptr() as usize + HEADER_SIZE;
      unsafe { os_discard(start, slot.as_ptr() as usize + self.slot_size) };
    }
  }

  /// Rebind the bump region to a fresh extent. The free list is untouched.
  pub fn extend(&mut self, base: NonNull<u8>, capacity: usize) {
    log::debug!(
      "[segregated] {}-byte pool extended to {:p} (+{} bytes, extent #{})",
      self.object_size(),
      base,
      capacity,
      self.extents + 1
    );
    self.base = base.as_ptr() as usize;
    self.bump = self.base;
    self.capacity = capacity;
    self.extents += 1;
  }

  /// Payload bytes per object (the size class).
  #[inline]
  pub fn object_size(&self) -> usize {
    self.slot_size - HEADER_SIZE
  }

  pub fn slot_size(&self) -> usize {
    self.slot_size
  }

  /// Number of extents this pool has bumped through.
  pub fn extents(&self) -> u32 {
    self.extents
  }
}
