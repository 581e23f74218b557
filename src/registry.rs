//! Thread registry: one memory manager per thread, created on first use, never destroyed.
//!
//! Slot `n` owns `MANAGERS[n]` and `QUEUES[n]`. A manager is only ever dereferenced by the
//! thread that created it; every other thread reaches it through its queue.

use core::{
  cell::Cell,
  mem::size_of,
  ptr::{NonNull, null_mut},
  sync::atomic::{AtomicPtr, AtomicUsize, Ordering},
};

use crate::{
  config::MAX_THREADS,
  error::AllocError,
  manager::MemoryManager,
  platform::os_map,
  remote::RemoteFreeQueue,
  stats,
};

static QUEUES: [RemoteFreeQueue; MAX_THREADS] = [const { RemoteFreeQueue::new() }; MAX_THREADS];
static MANAGERS: [AtomicPtr<MemoryManager>; MAX_THREADS] =
  [const { AtomicPtr::new(null_mut()) }; MAX_THREADS];
static NEXT_SLOT: AtomicUsize = AtomicUsize::new(0);

// =============================================================================
// TLS
// =============================================================================

thread_local! {
  static CURRENT: Cell<*mut MemoryManager> = const { Cell::new(null_mut()) };
  static IN_ALLOC: Cell<bool> = const { Cell::new(false) };
}

/// Claim the next slot and build its manager in OS memory, so registration never recurses
/// into the allocator.
fn register_current_thread() -> Result<NonNull<MemoryManager>, AllocError> {
  let slot = NEXT_SLOT.fetch_add(1, Ordering::Relaxed);
  if slot >= MAX_THREADS {
    return Err(AllocError::ThreadLimit { max: MAX_THREADS });
  }

  let manager = MemoryManager::new(slot as u16, &QUEUES[slot])?;
  let storage = os_map(size_of::<MemoryManager>())?.cast::<MemoryManager>();
  unsafe { storage.as_ptr().write(manager) };
  MANAGERS[slot].store(storage.as_ptr(), Ordering::Release);

  // The first thread to register dumps the statistics at exit.
  #[cfg(feature = "c_api")]
  if slot == 0 {
    unsafe { libc::atexit(crate::finalize_at_exit) };
  }

  log::debug!("[registry] thread registered in slot {}", slot);
  Ok(storage)
}

/// This thread's manager, registering it on first use. `None` once TLS is gone.
fn current_manager() -> Result<Option<NonNull<MemoryManager>>, AllocError> {
  let Ok(current) = CURRENT.try_with(Cell::get) else {
    return Ok(None);
  };
  if let Some(manager) = NonNull::new(current) {
    return Ok(Some(manager));
  }

  let manager = register_current_thread()?;
  let _ = CURRENT.try_with(|cell| cell.set(manager.as_ptr()));
  Ok(Some(manager))
}

/// Run `f` on this thread's manager.
///
/// `Ok(None)` when the manager is unavailable: the call is re-entrant (e.g. a logger allocating
/// while the manager logs) or TLS is being torn down. Callers must then serve the request
/// without touching the manager.
pub(crate) fn with_manager<R, F>(f: F) -> Result<Option<R>, AllocError>
where
  F: FnOnce(&mut MemoryManager) -> Result<R, AllocError>,
{
  let Ok(in_alloc) = IN_ALLOC.try_with(Cell::get) else {
    return Ok(None);
  };
  if in_alloc {
    return Ok(None);
  }

  let _ = IN_ALLOC.try_with(|flag| flag.set(true));
  let result = match current_manager() {
    Ok(Some(manager)) => f(unsafe { &mut *manager.as_ptr() }).map(Some),
    Ok(None) => Ok(None),
    Err(err) => Err(err),
  };
  let _ = IN_ALLOC.try_with(|flag| flag.set(false));
  result
}

/// Slot of the calling thread, if it has allocated through this crate yet.
pub fn current_slot() -> Option<u16> {
  let current = CURRENT.try_with(Cell::get).ok()?;
  let manager = NonNull::new(current)?;
  Some(unsafe { manager.as_ref() }.thread_id())
}

/// Number of threads that have registered a manager.
pub fn registered_threads() -> usize {
  NEXT_SLOT.load(Ordering::Relaxed).min(MAX_THREADS)
}

/// Hand `payload` back to the manager in slot `thread`. It is reclaimed on that manager's next
/// allocate or free.
///
/// # Safety
/// `payload` must be a live regular allocation owned by `thread`; the caller gives it up.
pub unsafe fn free_from_other_thread(thread: u16, payload: NonNull<u8>) {
  debug_assert!(
    !MANAGERS[thread as usize].load(Ordering::Acquire).is_null(),
    "object owned by unregistered slot {thread}"
  );
  unsafe { QUEUES[thread as usize].push(payload) };
  stats::record_remote_free();
}
