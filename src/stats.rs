//! Allocation counters (feature `stats`).
//!
//! Process-wide relaxed counters; without the feature every `record_*` call compiles to nothing
//! and the snapshot stays zero.

use core::sync::atomic::{AtomicU64, Ordering};

static REGULAR_ALLOCATIONS: AtomicU64 = AtomicU64::new(0);
static INDIVIDUAL_POOLS: AtomicU64 = AtomicU64::new(0);
static INDIVIDUAL_ALLOCATIONS: AtomicU64 = AtomicU64::new(0);
static LAZY_BYTES: AtomicU64 = AtomicU64::new(0);
static GLOBAL_BYTES: AtomicU64 = AtomicU64::new(0);
static INDIVIDUAL_BYTES: AtomicU64 = AtomicU64::new(0);
static HUGE_ALLOCATIONS: AtomicU64 = AtomicU64::new(0);
static REMOTE_FREES: AtomicU64 = AtomicU64::new(0);

/// Where a regular allocation was served from.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Served {
  /// Loop-tagged but not promoted yet.
  Lazy,
  Global,
  Individual,
}

#[inline(always)]
fn bump(counter: &AtomicU64, by: u64) {
  if cfg!(feature = "stats") {
    counter.fetch_add(by, Ordering::Relaxed);
  }
}

#[inline(always)]
pub(crate) fn record_regular(served: Served, bytes: usize) {
  bump(&REGULAR_ALLOCATIONS, 1);
  match served {
    Served::Lazy => bump(&LAZY_BYTES, bytes as u64),
    Served::Global => bump(&GLOBAL_BYTES, bytes as u64),
    Served::Individual => {
      bump(&INDIVIDUAL_ALLOCATIONS, 1);
      bump(&INDIVIDUAL_BYTES, bytes as u64);
    }
  }
}

#[inline(always)]
pub(crate) fn record_individual_pool() {
  bump(&INDIVIDUAL_POOLS, 1);
}

#[inline(always)]
pub(crate) fn record_huge() {
  bump(&HUGE_ALLOCATIONS, 1);
}

#[inline(always)]
pub(crate) fn record_remote_free() {
  bump(&REMOTE_FREES, 1);
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
  pub regular_allocations: u64,
  pub individual_pools: u64,
  pub individual_allocations: u64,
  pub lazy_bytes: u64,
  pub global_bytes: u64,
  pub individual_bytes: u64,
  pub huge_allocations: u64,
  pub remote_frees: u64,
}

pub fn snapshot() -> StatsSnapshot {
  let load = |c: &AtomicU64| c.load(Ordering::Relaxed);
  StatsSnapshot {
    regular_allocations: load(&REGULAR_ALLOCATIONS),
    individual_pools: load(&INDIVIDUAL_POOLS),
    individual_allocations: load(&INDIVIDUAL_ALLOCATIONS),
    lazy_bytes: load(&LAZY_BYTES),
    global_bytes: load(&GLOBAL_BYTES),
    individual_bytes: load(&INDIVIDUAL_BYTES),
    huge_allocations: load(&HUGE_ALLOCATIONS),
    remote_frees: load(&REMOTE_FREES),
  }
}

pub(crate) fn dump(stats: &StatsSnapshot) {
  log::info!(
    "[stats] allocations={} individual_pools={} individual_allocations={} lazy_bytes={} \
     global_bytes={} individual_bytes={} huge={} remote_frees={}",
    stats.regular_allocations,
    stats.individual_pools,
    stats.individual_allocations,
    stats.lazy_bytes,
    stats.global_bytes,
    stats.individual_bytes,
    stats.huge_allocations,
    stats.remote_frees
  );
  eprintln!("Number of allocations: {}", stats.regular_allocations);
  eprintln!("Number of individual pools: {}", stats.individual_pools);
  eprintln!("Number of individual allocations: {}", stats.individual_allocations);
  eprintln!("Size of lazy memory: {}", stats.lazy_bytes);
  eprintln!("Size of global memory: {}", stats.global_bytes);
  eprintln!("Size of individual memory: {}", stats.individual_bytes);
  eprintln!("Number of huge allocations: {}", stats.huge_allocations);
  eprintln!("Number of cross-thread frees: {}", stats.remote_frees);
}
