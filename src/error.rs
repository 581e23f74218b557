//! Failure taxonomy.
//!
//! Nothing inside the allocator recovers from these. Internal code propagates them with `?` and the
//! public entry points hand them to [`fatal`], which terminates the process.

use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum AllocError {
  #[error("mmap of {size} bytes failed")]
  MapFailed { size: usize },
  #[error("call-site table full (capacity={capacity})")]
  CsiTableFull { capacity: usize },
  #[error("lazy promotion filter full (capacity={capacity})")]
  LazyFilterFull { capacity: usize },
  #[error("backing-store segment limit reached (max={max})")]
  SegmentLimit { max: usize },
  #[error("metadata pool exhausted, cannot create another segregated pool")]
  MetadataExhausted,
  #[error("segregated pool of {object_size}-byte objects exhausted after extension")]
  PoolExhausted { object_size: usize },
  #[error("double free of {addr:#x}")]
  DoubleFree { addr: usize },
  #[error("invalid alignment {alignment}")]
  InvalidAlignment { alignment: usize },
  #[error("thread registry full (max={max})")]
  ThreadLimit { max: usize },
}

/// Escalate an allocator failure: log it, print a diagnostic and abort.
#[cold]
#[inline(never)]
pub fn fatal(err: AllocError) -> ! {
  log::error!("[sitealloc] fatal: {err}");
  eprintln!("sitealloc: fatal: {err}");
  std::process::abort()
}

/// Unwrap an allocator result or terminate the process.
#[inline]
pub(crate) fn or_fatal<T>(result: Result<T, AllocError>) -> T {
  match result {
    Ok(value) => value,
    Err(err) => fatal(err),
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn messages_carry_context() {
    let err = AllocError::DoubleFree { addr: 0x1000 };
    assert_eq!(err.to_string(), "double free of 0x1000");

    let err = AllocError::CsiTableFull { capacity: 8 };
    assert_eq!(err.to_string(), "call-site table full (capacity=8)");
  }
}
