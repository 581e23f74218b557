//! Size class -> segregated pool maps.

use core::ptr::NonNull;

use crate::{
  config::{GLOBAL_POOL_RESERVATION, SIZE_CLASSES},
  error::AllocError,
  platform::{Zeroable, os_map},
  pool::Pool,
  segregated::SegregatedPool,
  size_class,
};

/// One slot per size class. Slots of an individual directory fill in lazily.
#[derive(Clone, Copy)]
pub struct Directory {
  pools: [Option<NonNull<SegregatedPool>>; SIZE_CLASSES],
}

// `Option<NonNull<_>>` is null-pointer optimised: all zeroes is `None`.
unsafe impl Zeroable for Directory {}

impl Directory {
  pub const fn empty() -> Self {
    Self {
      pools: [None; SIZE_CLASSES],
    }
  }

  /// Slot serving `size`.
  #[inline]
  pub fn size_to_slot(&mut self, size: usize) -> &mut Option<NonNull<SegregatedPool>> {
    &mut self.pools[size_class::index(size)]
  }

  pub fn populated(&self) -> usize {
    self.pools.iter().filter(|p| p.is_some()).count()
  }
}

/// Place a new segregated pool record in the metadata arena.
pub(crate) fn place_pool(
  metadata: &mut Pool,
  pool: SegregatedPool,
) -> Result<NonNull<SegregatedPool>, AllocError> {
  let slot = metadata
    .allocate(size_of::<SegregatedPool>())
    .ok_or(AllocError::MetadataExhausted)?
    .cast::<SegregatedPool>();
  unsafe { slot.as_ptr().write(pool) };
  Ok(slot)
}

// =============================================================================
// Global directory
// =============================================================================

/// The manager's shared directory: all fourteen classes, created eagerly, each with its own
/// large reservation.
pub struct GlobalDirectory {
  directory: Directory,
  reservations: [usize; SIZE_CLASSES],
}

impl GlobalDirectory {
  pub fn new(metadata: &mut Pool) -> Result<Self, AllocError> {
    let mut directory = Directory::empty();
    let mut reservations = [0; SIZE_CLASSES];
    for (class, (slot, reservation)) in directory
      .pools
      .iter_mut()
      .zip(reservations.iter_mut())
      .enumerate()
    {
      let data = os_map(GLOBAL_POOL_RESERVATION)?;
      let pool = SegregatedPool::new(
        data,
        size_class::class_size(class),
        GLOBAL_POOL_RESERVATION,
      );
      *slot = Some(place_pool(metadata, pool)?);
      *reservation = data.as_ptr() as usize;
    }
    Ok(Self {
      directory,
      reservations,
    })
  }

  /// Pool serving `size`. Every class is populated at construction.
  #[inline]
  pub fn pool_for(&mut self, size: usize) -> NonNull<SegregatedPool> {
    match *self.directory.size_to_slot(size) {
      Some(pool) => pool,
      None => unreachable!("global directory is populated eagerly"),
    }
  }

  /// Whether `addr` lies in one of the eager per-class reservations.
  pub fn reserved_contains(&self, addr: usize) -> bool {
    self
      .reservations
      .iter()
      .any(|&base| addr >= base && addr < base + GLOBAL_POOL_RESERVATION)
  }
}
