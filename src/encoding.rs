//! Size-argument wire format.
//!
//! Instrumented call sites pass a single 64-bit value in place of the plain size:
//!
//! | bits  | meaning                                                          |
//! |-------|------------------------------------------------------------------|
//! | 0-31  | requested size                                                   |
//! | 32-61 | call-site identifier (CSI)                                       |
//! | 62    | call site is inside a loop                                       |
//! | 63    | huge: bits 0-62 are the exact size, no CSI or loop information   |
//!
//! A plain `malloc(n)` with `n < 2^32` decodes as CSI 0 with both flags clear.

const SIZE_MASK: u64 = 0x0000_0000_FFFF_FFFF;
const CSI_SHIFT: u32 = 32;
const CSI_MASK: u64 = 0x3FFF_FFFF;
const LOOP_BIT: u64 = 1 << 62;
const HUGE_BIT: u64 = 1 << 63;
const HUGE_SIZE_MASK: u64 = !HUGE_BIT;

/// Largest CSI representable in the 30-bit window.
pub const MAX_CSI: u32 = CSI_MASK as u32;

/// Decoded allocation request.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AllocRequest {
  /// Exact-size request that bypasses the size-class directories.
  Huge { size: usize },
  Regular { size: usize, csi: u32, in_loop: bool },
}

impl AllocRequest {
  /// An uninstrumented request. Sizes that do not fit the 32-bit window use the huge form.
  pub fn plain(size: usize) -> Self {
    if size as u64 > SIZE_MASK {
      Self::Huge { size }
    } else {
      Self::Regular {
        size,
        csi: 0,
        in_loop: false,
      }
    }
  }

  /// A request tagged with a call site. Only the low 30 bits of `csi` are kept.
  pub fn at_site(size: u32, csi: u32, in_loop: bool) -> Self {
    Self::Regular {
      size: size as usize,
      csi: csi & MAX_CSI,
      in_loop,
    }
  }

  pub fn decode(raw: u64) -> Self {
    if raw & HUGE_BIT != 0 {
      return Self::Huge {
        size: (raw & HUGE_SIZE_MASK) as usize,
      };
    }
    Self::Regular {
      size: (raw & SIZE_MASK) as usize,
      csi: ((raw >> CSI_SHIFT) & CSI_MASK) as u32,
      in_loop: raw & LOOP_BIT != 0,
    }
  }

  pub fn encode(self) -> u64 {
    match self {
      Self::Huge { size } => HUGE_BIT | (size as u64 & HUGE_SIZE_MASK),
      Self::Regular { size, csi, in_loop } => {
        let mut raw = (size as u64 & SIZE_MASK) | ((csi as u64 & CSI_MASK) << CSI_SHIFT);
        if in_loop {
          raw |= LOOP_BIT;
        }
        raw
      }
    }
  }

  pub fn size(self) -> usize {
    match self {
      Self::Huge { size } | Self::Regular { size, .. } => size,
    }
  }

  /// Same call-site information, different size. Used by calloc/memalign/realloc, which
  /// allocate a derived size on behalf of the original call site.
  pub fn with_size(self, new_size: usize) -> Self {
    match self {
      Self::Huge { .. } => Self::Huge { size: new_size },
      Self::Regular { csi, in_loop, .. } if new_size as u64 <= SIZE_MASK => Self::Regular {
        size: new_size,
        csi,
        in_loop,
      },
      Self::Regular { .. } => Self::Huge { size: new_size },
    }
  }
}
