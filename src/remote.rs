//! Cross-thread frees: a multi-producer, single-consumer Treiber stack.
//!
//! Any thread may push a payload it does not own; only the owning manager drains. The link is
//! written into the first word of the payload, so the header (and its allocated bit) is left
//! alone until the owner performs the real free.

use core::{
  ptr::{NonNull, null_mut},
  sync::atomic::{AtomicPtr, Ordering},
};

#[repr(C)]
pub struct RemoteNode {
  next: *mut RemoteNode,
}

pub struct RemoteFreeQueue {
  head: AtomicPtr<RemoteNode>,
}

impl RemoteFreeQueue {
  pub const fn new() -> Self {
    Self {
      head: AtomicPtr::new(null_mut()),
    }
  }

  /// Enqueue `payload` for its owner.
  ///
  /// # Safety
  /// `payload` must be a live allocation of at least one pointer, not queued already, and the
  /// caller must not touch it afterwards.
  pub unsafe fn push(&self, payload: NonNull<u8>) {
    let node = payload.as_ptr().cast::<RemoteNode>();
    loop {
      let head = self.head.load(Ordering::Relaxed);
      unsafe { (*node).next = head };
      if self
        .head
        .compare_exchange_weak(head, node, Ordering::Release, Ordering::Relaxed)
        .is_ok()
      {
        return;
      }
    }
  }

  /// Detach the whole stack in one swap. Owner thread only.
  pub fn take_all(&self) -> Drain {
    Drain {
      node: self.head.swap(null_mut(), Ordering::Acquire),
    }
  }

  pub fn is_empty(&self) -> bool {
    self.head.load(Ordering::Relaxed).is_null()
  }
}

impl Default for RemoteFreeQueue {
  fn default() -> Self {
    Self::new()
  }
}

/// Payloads detached from a [`RemoteFreeQueue`], newest first. Each link is read before the
/// payload is yielded, so the consumer may recycle it immediately.
pub struct Drain {
  node: *mut RemoteNode,
}

impl Iterator for Drain {
  type Item = NonNull<u8>;

  fn next(&mut self) -> Option<NonNull<u8>> {
    let node = NonNull::new(self.node)?;
    self.node = unsafe { (*node.as_ptr()).next };
    Some(node.cast())
  }
}
