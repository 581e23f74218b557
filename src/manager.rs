//! Per-thread memory manager.
//!
//! Owns a global directory, the call-site tables, the backing store for individual pools and a
//! handle to its cross-thread free queue. All of it is single-writer: only the owning thread
//! calls `&mut self` methods. Other threads reach the manager through its queue alone.

use core::ptr::NonNull;

use crate::{
  config::{
    CSI_TABLE_CAPACITY, HEADER_SIZE, LAZY_FILTER_CAPACITY, LAZY_OCCUR, METADATA_POOL_SIZE,
  },
  directory::{GlobalDirectory, place_pool},
  encoding::AllocRequest,
  error::AllocError,
  header::{self, Header, Ownership},
  huge,
  platform::align_up,
  pool::{BackingStore, Pool},
  remote::RemoteFreeQueue,
  segregated::SegregatedPool,
  site_table::{CsiTable, LazyFilter, Promotion},
  size_class,
  stats::{self, Served},
};

pub struct MemoryManager {
  thread: u16,
  /// `SegregatedPool` records.
  metadata: Pool,
  data: BackingStore,
  global: GlobalDirectory,
  sites: CsiTable,
  lazy: LazyFilter,
  remote: &'static RemoteFreeQueue,
}

impl MemoryManager {
  pub fn new(thread: u16, remote: &'static RemoteFreeQueue) -> Result<Self, AllocError> {
    let mut metadata = Pool::reserve(METADATA_POOL_SIZE)?;
    let global = GlobalDirectory::new(&mut metadata)?;
    let manager = Self {
      thread,
      metadata,
      data: BackingStore::new()?,
      global,
      sites: CsiTable::new(CSI_TABLE_CAPACITY)?,
      lazy: LazyFilter::new(LAZY_FILTER_CAPACITY, LAZY_OCCUR)?,
      remote,
    };
    log::debug!("[manager] created for thread slot {}", thread);
    Ok(manager)
  }

  pub fn thread_id(&self) -> u16 {
    self.thread
  }

  pub fn remote_queue(&self) -> &'static RemoteFreeQueue {
    self.remote
  }

  // ===========================================================================
  // Allocation
  // ===========================================================================

  /// Serve `request`. `None` for a zero-size request.
  pub fn allocate(&mut self, request: AllocRequest) -> Result<Option<NonNull<u8>>, AllocError> {
    self.drain_remote_frees()?;

    match request {
      AllocRequest::Huge { size } => self.allocate_huge(size, None),
      AllocRequest::Regular { size: 0, .. } => Ok(None),
      AllocRequest::Regular { size, .. } if size_class::is_huge(size) => {
        self.allocate_huge(size, None)
      }
      AllocRequest::Regular { size, csi, in_loop } => {
        self.allocate_regular(size, csi, in_loop).map(Some)
      }
    }
  }

  /// Serve `request` with the payload aligned to `alignment`.
  pub fn allocate_aligned(
    &mut self,
    alignment: usize,
    request: AllocRequest,
  ) -> Result<Option<NonNull<u8>>, AllocError> {
    if !alignment.is_power_of_two() {
      return Err(AllocError::InvalidAlignment { alignment });
    }
    // Every regular payload is already 16-byte aligned.
    if alignment <= HEADER_SIZE {
      return self.allocate(request);
    }
    self.drain_remote_frees()?;

    let size = request.size();
    if size == 0 {
      return Ok(None);
    }
    let padded = size
      .checked_add(alignment)
      .ok_or(AllocError::MapFailed { size })?;

    let (csi, in_loop) = match request.with_size(padded) {
      AllocRequest::Regular { size, csi, in_loop } if !size_class::is_huge(size) => (csi, in_loop),
      _ => return self.allocate_huge(size, Some(alignment)),
    };

    let payload = self.allocate_regular(padded, csi, in_loop)?;
    let aligned = align_up(payload.as_ptr() as usize, alignment);
    let offset = aligned - payload.as_ptr() as usize;
    if offset == 0 {
      return Ok(Some(payload));
    }

    let Header::Regular(original) = (unsafe { header::read(payload) }) else {
      unreachable!("fresh regular allocation carries a huge header");
    };
    let aligned = unsafe { payload.add(offset) };
    unsafe {
      header::write_regular(
        aligned,
        original.pool,
        self.thread,
        offset as u32,
        original.ownership,
      );
      header::mark_free(payload);
    }
    Ok(Some(aligned))
  }

  fn allocate_huge(
    &mut self,
    size: usize,
    alignment: Option<usize>,
  ) -> Result<Option<NonNull<u8>>, AllocError> {
    if size == 0 {
      return Ok(None);
    }
    stats::record_huge();
    let payload = match alignment {
      Some(alignment) => huge::allocate_aligned(size, alignment)?,
      None => huge::allocate(size)?,
    };
    Ok(Some(payload))
  }

  /// Decide which directory serves a regular request from `csi`.
  fn route(&mut self, csi: u32, in_loop: bool) -> Result<Served, AllocError> {
    if !in_loop {
      return Ok(Served::Global);
    }
    if !cfg!(feature = "lazy-loop") {
      return Ok(Served::Individual);
    }
    Ok(match self.lazy.observe(csi)? {
      Promotion::Lazy => Served::Lazy,
      Promotion::Promoted => Served::Individual,
    })
  }

  fn allocate_regular(
    &mut self,
    size: usize,
    csi: u32,
    in_loop: bool,
  ) -> Result<NonNull<u8>, AllocError> {
    let served = self.route(csi, in_loop)?;
    let (pool, ownership) = match served {
      Served::Individual => (self.individual_pool(csi, size)?, Ownership::Individual),
      Served::Global | Served::Lazy => (self.global.pool_for(size), Ownership::Global),
    };

    let slot = self.allocate_from(pool)?;
    let payload = unsafe { slot.add(HEADER_SIZE) };
    unsafe { header::write_regular(payload, pool.as_ptr(), self.thread, 0, ownership) };
    stats::record_regular(served, size + HEADER_SIZE);
    Ok(payload)
  }

  /// Allocate a slot from `pool`, extending it once with a fresh chunk if it is exhausted.
  fn allocate_from(&mut self, pool: NonNull<SegregatedPool>) -> Result<NonNull<u8>, AllocError> {
    let pool = unsafe { &mut *pool.as_ptr() };
    if let Some(slot) = pool.allocate_object() {
      return Ok(slot);
    }

    let chunk = self.data.acquire_chunk()?;
    pool.extend(chunk, self.data.chunk_size());
    pool.allocate_object().ok_or(AllocError::PoolExhausted {
      object_size: pool.object_size(),
    })
  }

  /// Pool for `(csi, size class)`, creating the directory entry and the pool on first use.
  fn individual_pool(
    &mut self,
    csi: u32,
    size: usize,
  ) -> Result<NonNull<SegregatedPool>, AllocError> {
    let slot = self.sites.resolve(csi)?.size_to_slot(size);
    if let Some(pool) = *slot {
      return Ok(pool);
    }

    let object_size = size_class::class_size(size_class::index(size));
    let chunk = self.data.acquire_chunk()?;
    let pool = place_pool(
      &mut self.metadata,
      SegregatedPool::new(chunk, object_size, self.data.chunk_size()),
    )?;
    *slot = Some(pool);
    stats::record_individual_pool();
    log::debug!(
      "[manager] thread {} csi {} gets a {}-byte pool at {:p}",
      self.thread,
      csi,
      object_size,
      chunk
    );
    Ok(pool)
  }

  // ===========================================================================
  // Free
  // ===========================================================================

  /// Free an object owned by this manager.
  ///
  /// # Safety
  /// `payload` must come from this allocator and, if regular, belong to this manager.
  pub unsafe fn free(&mut self, payload: NonNull<u8>) -> Result<(), AllocError> {
    self.drain_remote_frees()?;
    unsafe { self.free_local(payload) }
  }

  unsafe fn free_local(&mut self, payload: NonNull<u8>) -> Result<(), AllocError> {
    let header = match unsafe { header::read(payload) } {
      Header::Huge { .. } => {
        unsafe { huge::free(payload) };
        return Ok(());
      }
      Header::Regular(header) => header,
    };

    if !header.allocated {
      return Err(AllocError::DoubleFree {
        addr: payload.as_ptr() as usize,
      });
    }
    debug_assert_eq!(header.thread, self.thread, "free routed to the wrong manager");

    let slot = unsafe { payload.sub(HEADER_SIZE + header.align_offset as usize) };
    unsafe {
      header::mark_free(payload);
      (*header.pool).free_object(slot);
    }
    Ok(())
  }

  /// Free everything other threads queued for this manager. Returns how many objects were
  /// reclaimed.
  pub fn drain_remote_frees(&mut self) -> Result<usize, AllocError> {
    let mut reclaimed = 0;
    for payload in self.remote.take_all() {
      unsafe { self.free_local(payload)? };
      reclaimed += 1;
    }
    Ok(reclaimed)
  }

  // ===========================================================================
  // Introspection
  // ===========================================================================

  /// Whether `addr` lies in the global directory's eager reservations.
  pub fn in_global_reservation(&self, addr: usize) -> bool {
    self.global.reserved_contains(addr)
  }

  /// Call sites owning an individual directory.
  pub fn tracked_sites(&self) -> usize {
    self.sites.sites()
  }

  /// Loop-tagged hits recorded for `csi` by the lazy filter.
  pub fn lazy_hits(&self, csi: u32) -> u8 {
    self.lazy.hits(csi)
  }
}

/// Bytes usable at `payload`.
///
/// # Safety
/// `payload` must be a live allocation of this allocator.
pub unsafe fn usable_size(payload: NonNull<u8>) -> usize {
  match unsafe { header::read(payload) } {
    Header::Huge { size } => size,
    Header::Regular(header) => {
      let pool = unsafe { &*header.pool };
      pool.object_size() - header.align_offset as usize
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::config::{DATA_CHUNK_SIZE, HUGE_THRESHOLD, PAGE_SIZE};
  use std::{collections::HashSet, thread};

  fn queue() -> &'static RemoteFreeQueue {
    Box::leak(Box::new(RemoteFreeQueue::new()))
  }

  fn manager() -> MemoryManager {
    MemoryManager::new(1, queue()).unwrap()
  }

  fn alloc(m: &mut MemoryManager, request: AllocRequest) -> NonNull<u8> {
    m.allocate(request).unwrap().unwrap()
  }

  fn regular(p: NonNull<u8>) -> header::RegularHeader {
    match unsafe { header::read(p) } {
      Header::Regular(h) => h,
      Header::Huge { .. } => panic!("expected a regular header"),
    }
  }

  #[test]
  fn zero_size_is_null() {
    let mut m = manager();
    assert_eq!(m.allocate(AllocRequest::plain(0)).unwrap(), None);
    assert_eq!(m.allocate(AllocRequest::Huge { size: 0 }).unwrap(), None);
    assert_eq!(m.allocate_aligned(64, AllocRequest::plain(0)).unwrap(), None);
  }

  #[test]
  fn plain_allocation_writes_a_global_header() {
    let mut m = manager();
    let p = alloc(&mut m, AllocRequest::plain(24));
    assert_eq!(p.as_ptr() as usize % 16, 0);

    let h = regular(p);
    assert!(h.allocated);
    assert_eq!(h.ownership, Ownership::Global);
    assert_eq!(h.thread, 1);
    assert_eq!(h.align_offset, 0);
    assert_eq!(unsafe { usable_size(p) }, 32);
    assert!(m.in_global_reservation(p.as_ptr() as usize));

    unsafe { p.as_ptr().write_bytes(0xCD, 24) };
    unsafe { m.free(p).unwrap() };
  }

  #[test]
  fn free_list_reuse_is_lifo() {
    let mut m = manager();
    let x = alloc(&mut m, AllocRequest::plain(32));
    unsafe { m.free(x).unwrap() };
    let y = alloc(&mut m, AllocRequest::plain(32));
    assert_eq!(x, y);
  }

  #[test]
  fn double_free_is_detected() {
    let mut m = manager();
    let x = alloc(&mut m, AllocRequest::plain(40));
    unsafe { m.free(x).unwrap() };
    assert_eq!(
      unsafe { m.free(x) },
      Err(AllocError::DoubleFree {
        addr: x.as_ptr() as usize
      })
    );
  }

  #[test]
  fn huge_requests_bypass_directories() {
    let mut m = manager();
    let at_threshold = alloc(&mut m, AllocRequest::plain(HUGE_THRESHOLD));
    assert_eq!(
      unsafe { header::read(at_threshold) },
      Header::Huge {
        size: HUGE_THRESHOLD
      }
    );

    let flagged = alloc(&mut m, AllocRequest::Huge { size: 100 });
    assert_eq!(unsafe { usable_size(flagged) }, PAGE_SIZE);

    let p = alloc(&mut m, AllocRequest::plain(200_000));
    assert_eq!(unsafe { header::read(p) }, Header::Huge { size: 200_704 });
    assert_eq!(unsafe { huge::span(p) }.1, 200_704 + PAGE_SIZE);

    unsafe {
      m.free(at_threshold).unwrap();
      m.free(flagged).unwrap();
      m.free(p).unwrap();
    }
  }

  #[test]
  fn sites_without_loop_flag_stay_global() {
    let mut m = manager();
    for _ in 0..10 {
      let p = alloc(&mut m, AllocRequest::at_site(16, 77, false));
      assert_eq!(regular(p).ownership, Ownership::Global);
    }
    assert_eq!(m.tracked_sites(), 0);
    assert_eq!(m.lazy_hits(77), 0);
  }

  #[cfg(feature = "lazy-loop")]
  #[test]
  fn loop_sites_are_promoted_lazily() {
    let mut m = manager();
    let request = AllocRequest::at_site(16, 5, true);

    for hit in 1..u32::from(LAZY_OCCUR) {
      let p = alloc(&mut m, request);
      assert_eq!(regular(p).ownership, Ownership::Global, "hit {hit}");
      assert!(m.in_global_reservation(p.as_ptr() as usize));
    }
    assert_eq!(m.tracked_sites(), 0);

    for _ in 0..5 {
      let p = alloc(&mut m, request);
      assert_eq!(regular(p).ownership, Ownership::Individual);
      assert!(!m.in_global_reservation(p.as_ptr() as usize));
    }
    assert_eq!(m.tracked_sites(), 1);
    assert_eq!(m.lazy_hits(5), LAZY_OCCUR);
  }

  #[test]
  fn promoted_sites_never_share_slots() {
    let mut m = manager();
    let a = AllocRequest::at_site(16, 1, true);
    let b = AllocRequest::at_site(16, 2, true);
    for _ in 0..u32::from(LAZY_OCCUR) {
      alloc(&mut m, a);
      alloc(&mut m, b);
    }

    let mut live_a = Vec::new();
    let mut live_b = Vec::new();
    for round in 0..200 {
      live_a.push(alloc(&mut m, a));
      live_b.push(alloc(&mut m, b));
      if round % 3 == 0 {
        unsafe {
          m.free(live_a.remove(0)).unwrap();
          m.free(live_b.pop().unwrap()).unwrap();
        }
      }
      let set_a: HashSet<_> = live_a.iter().collect();
      assert!(live_b.iter().all(|p| !set_a.contains(p)));
    }

    let pool_a = regular(live_a[0]).pool;
    let pool_b = regular(live_b[0]).pool;
    assert_ne!(pool_a, pool_b);
    assert!(live_a.iter().all(|&p| regular(p).pool == pool_a));
    assert!(live_b.iter().all(|&p| regular(p).pool == pool_b));
  }

  #[test]
  fn one_directory_per_site_many_classes() {
    let mut m = manager();
    for _ in 0..u32::from(LAZY_OCCUR) {
      alloc(&mut m, AllocRequest::at_site(16, 9, true));
    }
    let small = alloc(&mut m, AllocRequest::at_site(16, 9, true));
    let large = alloc(&mut m, AllocRequest::at_site(5000, 9, true));
    assert_eq!(m.tracked_sites(), 1);
    assert_ne!(regular(small).pool, regular(large).pool);
    assert_eq!(unsafe { usable_size(large) }, 8192);
  }

  #[test]
  fn exhausted_individual_pool_is_extended() {
    let mut m = manager();
    let request = AllocRequest::at_site(100_000, 3, true);
    for _ in 0..u32::from(LAZY_OCCUR) {
      alloc(&mut m, request);
    }

    let per_chunk = DATA_CHUNK_SIZE / (HUGE_THRESHOLD + HEADER_SIZE);
    let mut seen = HashSet::new();
    let mut last = None;
    for _ in 0..per_chunk + 5 {
      let p = alloc(&mut m, request);
      assert!(seen.insert(p));
      last = Some(p);
    }
    let pool = unsafe { &*regular(last.unwrap()).pool };
    assert_eq!(pool.extents(), 2);
  }

  #[test]
  fn remote_frees_are_reclaimed_on_next_call() {
    let mut m = manager();
    let x = alloc(&mut m, AllocRequest::plain(64));
    let queue = m.remote_queue();

    let addr = x.as_ptr() as usize;
    thread::spawn(move || unsafe { queue.push(NonNull::new(addr as *mut u8).unwrap()) })
      .join()
      .unwrap();

    // Still allocated until the owner drains.
    assert!(regular(x).allocated);
    let y = alloc(&mut m, AllocRequest::plain(64));
    assert_eq!(x, y);
    assert!(queue.is_empty());
  }

  #[test]
  fn drain_reports_reclaimed_objects() {
    let mut m = manager();
    let objects: Vec<_> = (0..4).map(|_| alloc(&mut m, AllocRequest::plain(16))).collect();
    for &p in &objects {
      unsafe { m.remote_queue().push(p) };
    }
    assert_eq!(m.drain_remote_frees().unwrap(), 4);
    assert_eq!(m.drain_remote_frees().unwrap(), 0);
    assert!(objects.iter().all(|&p| !regular(p).allocated));
  }

  #[test]
  fn aligned_allocations() {
    let mut m = manager();
    for alignment in [32, 64, 256, 4096] {
      let p = m
        .allocate_aligned(alignment, AllocRequest::plain(100))
        .unwrap()
        .unwrap();
      assert_eq!(p.as_ptr() as usize % alignment, 0, "alignment {alignment}");
      assert!(unsafe { usable_size(p) } >= 100);
      unsafe {
        p.as_ptr().write_bytes(0xEE, 100);
        m.free(p).unwrap();
        assert!(matches!(m.free(p), Err(AllocError::DoubleFree { .. })));
      }
    }
  }

  #[test]
  fn aligned_allocations_keep_their_site() {
    let mut m = manager();
    let request = AllocRequest::at_site(48, 11, true);
    for _ in 0..u32::from(LAZY_OCCUR) {
      alloc(&mut m, request);
    }
    let p = m.allocate_aligned(128, request).unwrap().unwrap();
    assert_eq!(p.as_ptr() as usize % 128, 0);
    assert_eq!(regular(p).ownership, Ownership::Individual);
  }

  #[test]
  fn large_alignment_goes_huge() {
    let mut m = manager();
    let p = m
      .allocate_aligned(1 << 21, AllocRequest::plain(64))
      .unwrap()
      .unwrap();
    assert_eq!(p.as_ptr() as usize % (1 << 21), 0);
    assert!(matches!(unsafe { header::read(p) }, Header::Huge { .. }));
    unsafe { m.free(p).unwrap() };
  }

  #[test]
  fn invalid_alignment_is_rejected() {
    let mut m = manager();
    assert_eq!(
      m.allocate_aligned(48, AllocRequest::plain(8)),
      Err(AllocError::InvalidAlignment { alignment: 48 })
    );
  }
}
