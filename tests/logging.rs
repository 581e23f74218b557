//! A logger that allocates while the allocator itself is logging.

use std::{
  sync::atomic::{AtomicUsize, Ordering},
  thread,
};

use log::{LevelFilter, Log, Metadata, Record};
use sitealloc::Allocator;

#[global_allocator]
static GLOBAL: Allocator = Allocator;

static FORMATTED: AtomicUsize = AtomicUsize::new(0);

struct FormattingLogger;

impl Log for FormattingLogger {
  fn enabled(&self, _metadata: &Metadata) -> bool {
    true
  }

  fn log(&self, record: &Record) {
    let line = format!("{} {}", record.level(), record.args());
    FORMATTED.fetch_add(line.len(), Ordering::Relaxed);
  }

  fn flush(&self) {}
}

static LOGGER: FormattingLogger = FormattingLogger;

#[test]
fn allocating_logger_does_not_starve_threads() {
  log::set_logger(&LOGGER).unwrap();
  log::set_max_level(LevelFilter::Debug);

  // Each new thread registers a manager and logs while doing so.
  let lengths: Vec<usize> = (0..4)
    .map(|i| thread::spawn(move || vec![1u8; 100 + i].len()))
    .collect::<Vec<_>>()
    .into_iter()
    .map(|h| h.join().unwrap())
    .collect();
  assert_eq!(lengths, vec![100, 101, 102, 103]);

  assert!(FORMATTED.load(Ordering::Relaxed) > 0);
}
