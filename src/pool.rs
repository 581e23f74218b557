//! Bump-pointer arena over one contiguous virtual reservation.

use core::ptr::NonNull;

use crate::{
  config::{CHUNKS_PER_SEGMENT, DATA_CHUNK_SIZE, MAX_DATA_SEGMENTS},
  error::AllocError,
  platform::os_map,
};

/// Monotonic arena. Never moves, never shrinks, never hands a region out twice.
///
/// Not thread-safe: each pool belongs to exactly one memory manager.
pub struct Pool {
  bump: usize,
  boundary: usize,
}

impl Pool {
  /// Reserve a fresh `capacity`-byte region from the OS.
  pub fn reserve(capacity: usize) -> Result<Self, AllocError> {
    let base = os_map(capacity)?.as_ptr() as usize;
    log::debug!("[pool] reserved {:#x}..{:#x}", base, base + capacity);
    Ok(Self {
      bump: base,
      boundary: base + capacity,
    })
  }

  /// Carve `size` bytes off the cursor. `None` once the reservation is exhausted; the caller
  /// provisions a new pool.
  #[inline]
  pub fn allocate(&mut self, size: usize) -> Option<NonNull<u8>> {
    let end = self.bump.checked_add(size)?;
    if end > self.boundary {
      return None;
    }
    let ptr = self.bump;
    self.bump = end;
    NonNull::new(ptr as *mut u8)
  }
}

// =============================================================================
// Backing store
// =============================================================================

/// Source of fixed-size data chunks for individual pools and pool extensions.
///
/// Chunks are bumped out of the current segment; an exhausted segment is replaced by a fresh
/// one (never revisited) until the segment limit is hit.
pub struct BackingStore {
  current: Pool,
  segments: usize,
  chunk_size: usize,
  chunks_per_segment: usize,
  max_segments: usize,
}

impl BackingStore {
  pub fn new() -> Result<Self, AllocError> {
    Self::with_limits(DATA_CHUNK_SIZE, CHUNKS_PER_SEGMENT, MAX_DATA_SEGMENTS)
  }

  pub fn with_limits(
    chunk_size: usize,
    chunks_per_segment: usize,
    max_segments: usize,
  ) -> Result<Self, AllocError> {
    Ok(Self {
      current: Pool::reserve(chunk_size * chunks_per_segment)?,
      segments: 1,
      chunk_size,
      chunks_per_segment,
      max_segments,
    })
  }

  pub fn acquire_chunk(&mut self) -> Result<NonNull<u8>, AllocError> {
    if let Some(chunk) = self.current.allocate(self.chunk_size) {
      return Ok(chunk);
    }

    if self.segments >= self.max_segments {
      return Err(AllocError::SegmentLimit {
        max: self.max_segments,
      });
    }
    self.current = Pool::reserve(self.chunk_size * self.chunks_per_segment)?;
    self.segments += 1;
    log::debug!("[pool] backing segment #{} mapped", self.segments);

    self.current.allocate(self.chunk_size).ok_or(AllocError::SegmentLimit {
      max: self.max_segments,
    })
  }

  pub fn chunk_size(&self) -> usize {
    self.chunk_size
  }

  pub fn segments(&self) -> usize {
    self.segments
  }
}
