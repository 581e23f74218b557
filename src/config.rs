//! Compile-time configuration.
//!
//! The allocator runs before `main` and below every other subsystem, so all tuning knobs are
//! constants. Behavioural switches are Cargo features (`lazy-loop`, `release-mem`, `stats`,
//! `c_api`).

use crate::header::RawHeader;

// =============================================================================
// Pages
// =============================================================================

pub const PAGE_SIZE_BITS: usize = 12;
pub const PAGE_SIZE: usize = 1 << PAGE_SIZE_BITS; // 4KB

// =============================================================================
// Size classes
// =============================================================================

/// Smallest size class.
pub const MIN_CLASS_SIZE: usize = 16;

/// Number of power-of-two size classes (16 B ... 128 KiB).
pub const SIZE_CLASSES: usize = 14;

/// Requests at or above this size bypass the directories.
pub const HUGE_THRESHOLD: usize = MIN_CLASS_SIZE << (SIZE_CLASSES - 1); // 128KB

/// In-band header preceding every payload.
pub const HEADER_SIZE: usize = size_of::<RawHeader>();

/// Freed objects at least this large get their backing pages discarded.
pub const RELEASE_THRESHOLD: usize = 8 * PAGE_SIZE;

// =============================================================================
// Reservations
// =============================================================================

/// Virtual reservation of each global segregated pool. Large enough that extension is rare.
pub const GLOBAL_POOL_RESERVATION: usize = 1 << 30; // 1GB

/// Chunk handed to an individual pool on creation, and to any pool on extension.
pub const DATA_CHUNK_SIZE: usize = 1 << 26; // 64MB

/// Chunks carved from one backing-store segment.
pub const CHUNKS_PER_SEGMENT: usize = 16; // 1GB segments

/// Backing-store segments a single manager may map before giving up.
pub const MAX_DATA_SEGMENTS: usize = 1 << 14;

/// Bump arena holding `SegregatedPool` records.
pub const METADATA_POOL_SIZE: usize = 1 << 28; // 256MB

// =============================================================================
// Call-site tables
// =============================================================================

/// Entries in the per-manager CSI -> directory table.
pub const CSI_TABLE_CAPACITY: usize = 1 << 16;

/// Entries in the per-manager lazy promotion filter.
pub const LAZY_FILTER_CAPACITY: usize = 1 << 20;

/// Loop-tagged hits of a call site before it gets its own directory.
pub const LAZY_OCCUR: u8 = 2;

// =============================================================================
// Threads
// =============================================================================

/// Registry capacity. Thread slots are stored as `u16` in object headers.
pub const MAX_THREADS: usize = 1024;

// =============================================================================
// Compile-Time Assertions
// =============================================================================

const _: () = assert!(PAGE_SIZE.is_power_of_two());
const _: () = assert!(MIN_CLASS_SIZE.is_power_of_two());
const _: () = assert!(HEADER_SIZE == 16);
const _: () = assert!(HUGE_THRESHOLD == 131072);
const _: () = assert!(DATA_CHUNK_SIZE % PAGE_SIZE == 0);
const _: () = assert!(DATA_CHUNK_SIZE >= HUGE_THRESHOLD + HEADER_SIZE);
const _: () = assert!(GLOBAL_POOL_RESERVATION >= DATA_CHUNK_SIZE);
const _: () = assert!(CSI_TABLE_CAPACITY.is_power_of_two());
const _: () = assert!(LAZY_FILTER_CAPACITY.is_power_of_two());
const _: () = assert!(LAZY_OCCUR >= 1);
const _: () = assert!(MAX_THREADS <= u16::MAX as usize);
