//! In-band object header.
//!
//! Sixteen bytes immediately before every payload, decodable from the bare pointer:
//!
//! ```text
//!  0        8           12       14   15
//!  | word   | offset:u32 | tid:u16 | -- | control |
//! ```
//!
//! `control` is always the last byte: `.....ABT` with T = huge, B = global (vs individual),
//! A = allocated. For a huge object `word` is the mapped payload size and nothing else is used;
//! for a regular object `word` points at the owning [`SegregatedPool`].

use core::ptr::NonNull;

use crate::{config::HEADER_SIZE, segregated::SegregatedPool};

const CONTROL_HUGE: u8 = 0b001;
const CONTROL_GLOBAL: u8 = 0b010;
const CONTROL_ALLOCATED: u8 = 0b100;

#[repr(C)]
pub(crate) struct RawHeader {
  word: u64,
  align_offset: u32,
  thread: u16,
  _reserved: u8,
  control: u8,
}

const _: () = assert!(size_of::<RawHeader>() == 16);
const _: () = assert!(core::mem::offset_of!(RawHeader, control) == 15);

/// Which directory owns a regular object.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Ownership {
  Global,
  Individual,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RegularHeader {
  pub pool: *mut SegregatedPool,
  pub thread: u16,
  /// Distance from the slot's natural payload to this (aligned) payload.
  pub align_offset: u32,
  pub ownership: Ownership,
  pub allocated: bool,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Header {
  Huge { size: usize },
  Regular(RegularHeader),
}

#[inline(always)]
fn raw(payload: NonNull<u8>) -> *mut RawHeader {
  unsafe { payload.as_ptr().sub(HEADER_SIZE).cast() }
}

/// Decode the header in front of `payload`, control byte first.
///
/// # Safety
/// `payload` must have been returned by this allocator.
#[inline]
pub unsafe fn read(payload: NonNull<u8>) -> Header {
  let header = unsafe { &*raw(payload) };
  let control = header.control;
  if control & CONTROL_HUGE != 0 {
    return Header::Huge {
      size: header.word as usize,
    };
  }
  Header::Regular(RegularHeader {
    pool: header.word as usize as *mut SegregatedPool,
    thread: header.thread,
    align_offset: header.align_offset,
    ownership: if control & CONTROL_GLOBAL != 0 {
      Ownership::Global
    } else {
      Ownership::Individual
    },
    allocated: control & CONTROL_ALLOCATED != 0,
  })
}

/// # Safety
/// The 16 bytes before `payload` must be writable and owned by the caller.
#[inline]
pub unsafe fn write_huge(payload: NonNull<u8>, size: usize) {
  unsafe {
    raw(payload).write(RawHeader {
      word: size as u64,
      align_offset: 0,
      thread: 0,
      _reserved: 0,
      control: CONTROL_HUGE,
    })
  };
}

/// Write an allocated regular header.
///
/// # Safety
/// The 16 bytes before `payload` must be writable and owned by the caller.
#[inline]
pub unsafe fn write_regular(
  payload: NonNull<u8>,
  pool: *mut SegregatedPool,
  thread: u16,
  align_offset: u32,
  ownership: Ownership,
) {
  let mut control = CONTROL_ALLOCATED;
  if ownership == Ownership::Global {
    control |= CONTROL_GLOBAL;
  }
  unsafe {
    raw(payload).write(RawHeader {
      word: pool as usize as u64,
      align_offset,
      thread,
      _reserved: 0,
      control,
    })
  };
}

/// Clear the allocated bit, leaving every other field as it is.
///
/// # Safety
/// `payload` must carry a regular header.
#[inline]
pub unsafe fn mark_free(payload: NonNull<u8>) {
  unsafe { (*raw(payload)).control &= !CONTROL_ALLOCATED };
}

#[cfg(test)]
mod tests {
  use super::*;

  #[repr(C, align(16))]
  struct Slot([u8; 64]);

  fn payload(slot: &mut Slot) -> NonNull<u8> {
    NonNull::new(unsafe { slot.0.as_mut_ptr().add(HEADER_SIZE) }).unwrap()
  }

  #[test]
  fn regular_round_trip() {
    let mut slot = Slot([0xFF; 64]);
    let data = payload(&mut slot);
    let pool = 0xDEAD_BEE0usize as *mut SegregatedPool;

    unsafe { write_regular(data, pool, 7, 32, Ownership::Individual) };
    assert_eq!(
      unsafe { read(data) },
      Header::Regular(RegularHeader {
        pool,
        thread: 7,
        align_offset: 32,
        ownership: Ownership::Individual,
        allocated: true,
      })
    );
    assert_eq!(slot.0[15], CONTROL_ALLOCATED);
  }

  #[test]
  fn mark_free_only_touches_the_allocated_bit() {
    let mut slot = Slot([0; 64]);
    let data = payload(&mut slot);
    let pool = 0x1000usize as *mut SegregatedPool;

    unsafe {
      write_regular(data, pool, 3, 0, Ownership::Global);
      mark_free(data);
    }
    let Header::Regular(header) = (unsafe { read(data) }) else {
      panic!("regular header decoded as huge");
    };
    assert!(!header.allocated);
    assert_eq!(header.ownership, Ownership::Global);
    assert_eq!(header.pool, pool);
    assert_eq!(header.thread, 3);
  }

  #[test]
  fn huge_is_discriminated_by_the_low_control_bit() {
    let mut slot = Slot([0; 64]);
    let data = payload(&mut slot);

    unsafe { write_huge(data, 200_704) };
    assert_eq!(unsafe { read(data) }, Header::Huge { size: 200_704 });
    assert_eq!(slot.0[15] & CONTROL_HUGE, CONTROL_HUGE);
  }
}
