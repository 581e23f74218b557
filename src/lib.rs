#![allow(clippy::missing_safety_doc)]

//! Call-site-sensitive pooling allocator.
//!
//! Every thread owns a [`MemoryManager`] with a global directory of power-of-two pools. Call
//! sites that allocate inside loops (as tagged by an instrumentation pass in the size argument,
//! see [`AllocRequest`]) are promoted to pools of their own, so objects from different sites
//! never share a slot. Requests of 128 KiB and up get a dedicated mapping each.

use core::{
  alloc::{GlobalAlloc, Layout},
  ptr::{self, NonNull, null_mut},
  sync::atomic::{AtomicBool, Ordering},
};

pub mod config;
pub mod directory;
pub mod encoding;
pub mod error;
pub mod header;
pub mod huge;
pub mod manager;
pub mod platform;
pub mod pool;
pub mod registry;
pub mod remote;
pub mod segregated;
pub mod site_table;
pub mod size_class;
pub mod stats;

pub use encoding::AllocRequest;
pub use error::AllocError;
pub use header::{Header, Ownership};
pub use manager::MemoryManager;
pub use stats::StatsSnapshot;

use crate::{error::or_fatal, header::RegularHeader};

// =============================================================================
// Entry points
// =============================================================================

/// Allocate for an encoded size argument. Null for a zero size.
pub fn allocate(encoded: u64) -> *mut u8 {
  allocate_request(AllocRequest::decode(encoded))
}

fn allocate_request(request: AllocRequest) -> *mut u8 {
  match or_fatal(registry::with_manager(|m| m.allocate(request))) {
    Some(payload) => payload.map_or(null_mut(), NonNull::as_ptr),
    None => allocate_without_manager(request.size(), None),
  }
}

/// Serve a request made while this thread's manager is busy (a logger formatting a message
/// from inside the allocator) with a mapping of its own.
#[cold]
fn allocate_without_manager(size: usize, alignment: Option<usize>) -> *mut u8 {
  if size == 0 {
    return null_mut();
  }
  let payload = match alignment {
    Some(alignment) if !alignment.is_power_of_two() => {
      error::fatal(AllocError::InvalidAlignment { alignment })
    }
    Some(alignment) => huge::allocate_aligned(size, alignment),
    None => huge::allocate(size),
  };
  stats::record_huge();
  or_fatal(payload).as_ptr()
}

/// Free `ptr`. Objects owned by another thread are queued for their owner.
pub unsafe fn free(ptr: *mut u8) {
  let Some(payload) = NonNull::new(ptr) else {
    return;
  };

  match unsafe { header::read(payload) } {
    Header::Huge { .. } => unsafe { huge::free(payload) },
    Header::Regular(RegularHeader {
      allocated: false, ..
    }) => error::fatal(AllocError::DoubleFree {
      addr: payload.as_ptr() as usize,
    }),
    Header::Regular(header) if registry::current_slot() == Some(header.thread) => {
      let freed = or_fatal(registry::with_manager(|m| unsafe { m.free(payload) }));
      if freed.is_none() {
        // Manager busy: queue the object for its own next drain.
        unsafe { registry::free_from_other_thread(header.thread, payload) }
      }
    }
    Header::Regular(header) => unsafe { registry::free_from_other_thread(header.thread, payload) },
  }
}

/// Resize `ptr` to the size in `encoded`, keeping its call-site tag for the new object.
pub unsafe fn reallocate(ptr: *mut u8, encoded: u64) -> *mut u8 {
  let Some(payload) = NonNull::new(ptr) else {
    return allocate(encoded);
  };
  let request = AllocRequest::decode(encoded);
  if request.size() == 0 {
    unsafe { free(ptr) };
    return null_mut();
  }

  let old_size = unsafe { manager::usable_size(payload) };
  if request.size() <= old_size {
    return ptr;
  }

  let new_ptr = allocate_request(request);
  if !new_ptr.is_null() {
    unsafe {
      ptr::copy_nonoverlapping(ptr, new_ptr, old_size);
      free(ptr);
    }
  }
  new_ptr
}

/// Zeroed array of `count` elements of the encoded size. Null on overflow.
pub fn allocate_zeroed(count: usize, encoded: u64) -> *mut u8 {
  let request = AllocRequest::decode(encoded);
  let Some(total) = count.checked_mul(request.size()) else {
    return null_mut();
  };

  let ptr = allocate_request(request.with_size(total));
  if let Some(payload) = NonNull::new(ptr) {
    // Huge objects are fresh mappings and already zero.
    if let Header::Regular(_) = unsafe { header::read(payload) } {
      unsafe { ptr::write_bytes(ptr, 0, total) };
    }
  }
  ptr
}

/// Allocate with the payload aligned to `alignment`. A non-power-of-two alignment is fatal.
pub fn allocate_aligned(alignment: usize, encoded: u64) -> *mut u8 {
  let request = AllocRequest::decode(encoded);
  match or_fatal(registry::with_manager(|m| m.allocate_aligned(alignment, request))) {
    Some(payload) => payload.map_or(null_mut(), NonNull::as_ptr),
    None => allocate_without_manager(request.size(), Some(alignment)),
  }
}

/// `posix_memalign` semantics: `EINVAL` for an alignment that is not a power of two or is
/// smaller than a pointer, otherwise 0 with the allocation stored in `out`.
pub unsafe fn posix_aligned_allocate(out: *mut *mut u8, alignment: usize, encoded: u64) -> i32 {
  if !alignment.is_power_of_two() || alignment < size_of::<*mut u8>() {
    return libc::EINVAL;
  }
  unsafe { *out = allocate_aligned(alignment, encoded) };
  0
}

/// Bytes usable at `ptr`; 0 for null.
pub unsafe fn usable_size(ptr: *mut u8) -> usize {
  NonNull::new(ptr).map_or(0, |payload| unsafe { manager::usable_size(payload) })
}

static FINALIZED: AtomicBool = AtomicBool::new(false);

/// Process-exit hook. On the thread holding slot 0 the statistics are dumped (once) and
/// returned; every other caller gets `None`. The C API build calls this on its own at exit.
pub fn finalize() -> Option<StatsSnapshot> {
  if registry::current_slot() != Some(0) {
    return None;
  }
  dump_once()
}

/// Exit hook registered by slot 0 in the C API build.
#[cfg(feature = "c_api")]
pub(crate) extern "C" fn finalize_at_exit() {
  dump_once();
}

fn dump_once() -> Option<StatsSnapshot> {
  if FINALIZED.swap(true, Ordering::AcqRel) {
    return None;
  }
  let snapshot = stats::snapshot();
  if cfg!(feature = "stats") {
    stats::dump(&snapshot);
  }
  Some(snapshot)
}

// =============================================================================
// GlobalAlloc
// =============================================================================

/// Plain (untagged) allocator for `#[global_allocator]`.
pub struct Allocator;

unsafe impl GlobalAlloc for Allocator {
  unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
    let request = AllocRequest::plain(layout.size().max(1));
    if layout.align() > config::HEADER_SIZE {
      return allocate_aligned(layout.align(), request.encode());
    }
    allocate_request(request)
  }

  unsafe fn dealloc(&self, ptr: *mut u8, _layout: Layout) {
    unsafe { free(ptr) }
  }

  unsafe fn realloc(&self, ptr: *mut u8, layout: Layout, new_size: usize) -> *mut u8 {
    if layout.align() <= config::HEADER_SIZE {
      return unsafe { reallocate(ptr, AllocRequest::plain(new_size.max(1)).encode()) };
    }

    let new_ptr =
      unsafe { self.alloc(Layout::from_size_align_unchecked(new_size, layout.align())) };
    if !new_ptr.is_null() {
      unsafe {
        ptr::copy_nonoverlapping(ptr, new_ptr, layout.size().min(new_size));
        free(ptr);
      }
    }
    new_ptr
  }

  unsafe fn alloc_zeroed(&self, layout: Layout) -> *mut u8 {
    if layout.align() <= config::HEADER_SIZE {
      return allocate_zeroed(1, AllocRequest::plain(layout.size().max(1)).encode());
    }
    let ptr = unsafe { self.alloc(layout) };
    if !ptr.is_null() {
      unsafe { ptr::write_bytes(ptr, 0, layout.size()) }
    }
    ptr
  }
}

// =============================================================================
// C API (enabled with --features c_api)
// =============================================================================

/// libc allocator symbols. The `size` arguments carry the encoded form, so uninstrumented
/// callers get plain allocations.
#[cfg(feature = "c_api")]
pub mod c_api {
  use super::*;
  use crate::{config::PAGE_SIZE, platform::align_up};

  #[unsafe(no_mangle)]
  pub unsafe extern "C" fn malloc(size: usize) -> *mut u8 {
    allocate(size as u64)
  }

  #[unsafe(no_mangle)]
  pub unsafe extern "C" fn free(ptr: *mut u8) {
    unsafe { super::free(ptr) }
  }

  #[unsafe(no_mangle)]
  pub unsafe extern "C" fn calloc(nmemb: usize, size: usize) -> *mut u8 {
    allocate_zeroed(nmemb, size as u64)
  }

  #[unsafe(no_mangle)]
  pub unsafe extern "C" fn realloc(ptr: *mut u8, size: usize) -> *mut u8 {
    unsafe { reallocate(ptr, size as u64) }
  }

  #[unsafe(no_mangle)]
  pub unsafe extern "C" fn memalign(alignment: usize, size: usize) -> *mut u8 {
    allocate_aligned(alignment, size as u64)
  }

  #[unsafe(no_mangle)]
  pub unsafe extern "C" fn aligned_alloc(alignment: usize, size: usize) -> *mut u8 {
    allocate_aligned(alignment, size as u64)
  }

  #[unsafe(no_mangle)]
  pub unsafe extern "C" fn posix_memalign(
    memptr: *mut *mut u8,
    alignment: usize,
    size: usize,
  ) -> i32 {
    unsafe { posix_aligned_allocate(memptr, alignment, size as u64) }
  }

  #[unsafe(no_mangle)]
  pub unsafe extern "C" fn malloc_usable_size(ptr: *mut u8) -> usize {
    unsafe { usable_size(ptr) }
  }

  #[unsafe(no_mangle)]
  pub unsafe extern "C" fn valloc(size: usize) -> *mut u8 {
    allocate_aligned(PAGE_SIZE, size as u64)
  }

  #[unsafe(no_mangle)]
  pub unsafe extern "C" fn pvalloc(size: usize) -> *mut u8 {
    let request = AllocRequest::decode(size as u64);
    let rounded = align_up(request.size().max(1), PAGE_SIZE);
    allocate_aligned(PAGE_SIZE, request.with_size(rounded).encode())
  }
}
