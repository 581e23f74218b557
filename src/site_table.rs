//! Per-manager call-site tables: CSI -> individual directory, and the lazy promotion filter.
//!
//! Both are open-addressed with linear scanning, in fixed-size OS mappings, so lookups
//! and claiming never allocate. An occupied entry stores `csi | OCCUPIED`, which keeps the
//! all-zero mapping a valid empty table and lets CSI 0 be tracked like any other.

use crate::{
  directory::Directory,
  error::AllocError,
  platform::{OsArray, Zeroable},
};

const OCCUPIED: u64 = 1 << 63;

#[inline(always)]
fn key(csi: u32) -> u64 {
  csi as u64 | OCCUPIED
}

/// Fibonacci hashing into a power-of-two table.
#[inline(always)]
fn home(csi: u32, mask: usize) -> usize {
  ((csi as u64).wrapping_mul(0x9E37_79B9_7F4A_7C15) >> 32) as usize & mask
}

enum Lookup {
  Found(usize),
  Vacant(usize),
  Full,
}

/// Linear scan for `csi`, visiting every entry at most once.
fn lookup<T>(entries: &[T], csi: u32, key_of: impl Fn(&T) -> u64) -> Lookup {
  let mask = entries.len() - 1;
  let start = home(csi, mask);
  let wanted = key(csi);
  for offset in 0..entries.len() {
    let index = (start + offset) & mask;
    match key_of(&entries[index]) {
      k if k == wanted => return Lookup::Found(index),
      0 => return Lookup::Vacant(index),
      _ => {}
    }
  }
  Lookup::Full
}

// =============================================================================
// Individual directory table
// =============================================================================

#[derive(Clone, Copy)]
struct SiteEntry {
  key: u64,
  directory: Directory,
}

unsafe impl Zeroable for SiteEntry {}

pub struct CsiTable {
  entries: OsArray<SiteEntry>,
  sites: usize,
}

impl CsiTable {
  pub fn new(capacity: usize) -> Result<Self, AllocError> {
    debug_assert!(capacity.is_power_of_two());
    Ok(Self {
      entries: OsArray::zeroed(capacity)?,
      sites: 0,
    })
  }

  /// Directory owned by `csi`, claiming an entry on first sight. Size classes inside it are
  /// left for the caller to populate.
  pub fn resolve(&mut self, csi: u32) -> Result<&mut Directory, AllocError> {
    let index = match lookup(&self.entries[..], csi, |e| e.key) {
      Lookup::Found(index) => index,
      Lookup::Vacant(index) => {
        self.entries[index].key = key(csi);
        self.sites += 1;
        index
      }
      Lookup::Full => {
        return Err(AllocError::CsiTableFull {
          capacity: self.entries.len(),
        });
      }
    };
    Ok(&mut self.entries[index].directory)
  }

  /// Distinct call sites holding an entry.
  pub fn sites(&self) -> usize {
    self.sites
  }
}

// =============================================================================
// Lazy promotion filter
// =============================================================================

#[derive(Clone, Copy)]
struct LazyEntry {
  key: u64,
  hits: u8,
}

unsafe impl Zeroable for LazyEntry {}

/// Where a loop-tagged allocation should be served.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Promotion {
  /// Not seen often enough yet: serve from the global directory.
  Lazy,
  /// Serve from the call site's own directory.
  Promoted,
}

/// Counts loop-tagged hits per call site, saturating at the promotion threshold.
pub struct LazyFilter {
  entries: OsArray<LazyEntry>,
  threshold: u8,
}

impl LazyFilter {
  pub fn new(capacity: usize, threshold: u8) -> Result<Self, AllocError> {
    debug_assert!(capacity.is_power_of_two());
    debug_assert!(threshold >= 1);
    Ok(Self {
      entries: OsArray::zeroed(capacity)?,
      threshold,
    })
  }

  /// Record one hit of `csi`. The `threshold`-th hit and every later one are promoted.
  pub fn observe(&mut self, csi: u32) -> Result<Promotion, AllocError> {
    let entry = match lookup(&self.entries[..], csi, |e| e.key) {
      Lookup::Found(index) => &mut self.entries[index],
      Lookup::Vacant(index) => {
        let entry = &mut self.entries[index];
        entry.key = key(csi);
        entry
      }
      Lookup::Full => {
        return Err(AllocError::LazyFilterFull {
          capacity: self.entries.len(),
        });
      }
    };

    if entry.hits < self.threshold {
      entry.hits += 1;
    }
    Ok(if entry.hits >= self.threshold {
      Promotion::Promoted
    } else {
      Promotion::Lazy
    })
  }

  /// Hits recorded for `csi` so far (0 if never seen).
  pub fn hits(&self, csi: u32) -> u8 {
    match lookup(&self.entries[..], csi, |e| e.key) {
      Lookup::Found(index) => self.entries[index].hits,
      _ => 0,
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use core::ptr::NonNull;

  #[test]
  fn one_entry_per_site() {
    let mut table = CsiTable::new(64).unwrap();
    let marker = NonNull::<crate::segregated::SegregatedPool>::dangling();
    *table.resolve(42).unwrap().size_to_slot(16) = Some(marker);

    // Same CSI resolves to the same directory.
    assert_eq!(*table.resolve(42).unwrap().size_to_slot(16), Some(marker));
    // Another CSI gets a fresh, empty one.
    assert_eq!(table.resolve(43).unwrap().populated(), 0);
    assert_eq!(table.sites(), 2);
  }

  #[test]
  fn csi_zero_is_a_real_site() {
    let mut table = CsiTable::new(8).unwrap();
    table.resolve(0).unwrap();
    table.resolve(0).unwrap();
    assert_eq!(table.sites(), 1);
  }

  #[test]
  fn full_table_is_reported() {
    let mut table = CsiTable::new(4).unwrap();
    for csi in 0..4 {
      table.resolve(csi).unwrap();
    }
    // Existing sites still resolve.
    assert!(table.resolve(2).is_ok());
    assert_eq!(
      table.resolve(100).err(),
      Some(AllocError::CsiTableFull { capacity: 4 })
    );
  }

  #[test]
  fn colliding_sites_take_the_next_free_entry() {
    let mut table = CsiTable::new(2).unwrap();
    let a = NonNull::<crate::segregated::SegregatedPool>::dangling();
    *table.resolve(1).unwrap().size_to_slot(64) = Some(a);
    table.resolve(2).unwrap();
    assert_eq!(*table.resolve(1).unwrap().size_to_slot(64), Some(a));
    assert_eq!(table.resolve(2).unwrap().populated(), 0);
  }

  #[test]
  fn promotion_after_threshold_hits() {
    let mut filter = LazyFilter::new(16, 3).unwrap();
    assert_eq!(filter.observe(9).unwrap(), Promotion::Lazy);
    assert_eq!(filter.observe(9).unwrap(), Promotion::Lazy);
    assert_eq!(filter.observe(9).unwrap(), Promotion::Promoted);
    assert_eq!(filter.observe(9).unwrap(), Promotion::Promoted);
    assert_eq!(filter.hits(9), 3);

    // Independent counters per site.
    assert_eq!(filter.hits(10), 0);
    assert_eq!(filter.observe(10).unwrap(), Promotion::Lazy);
    assert_eq!(filter.hits(10), 1);
  }

  #[test]
  fn threshold_of_one_promotes_immediately() {
    let mut filter = LazyFilter::new(16, 1).unwrap();
    assert_eq!(filter.observe(5).unwrap(), Promotion::Promoted);
  }

  #[test]
  fn full_filter_is_reported() {
    let mut filter = LazyFilter::new(2, 2).unwrap();
    filter.observe(1).unwrap();
    filter.observe(2).unwrap();
    assert_eq!(
      filter.observe(3).err(),
      Some(AllocError::LazyFilterFull { capacity: 2 })
    );
  }
}
