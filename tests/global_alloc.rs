//! The whole test binary runs on top of the allocator.

use std::{collections::HashMap, sync::mpsc, thread};

use sitealloc::Allocator;

#[global_allocator]
static GLOBAL: Allocator = Allocator;

#[repr(align(256))]
struct Aligned([u8; 256]);

#[test]
fn collections_grow_and_shrink() {
  let mut map: HashMap<u64, String> = HashMap::new();
  for i in 0..10_000 {
    map.insert(i, format!("value-{i}"));
  }
  assert_eq!(map[&4242], "value-4242");
  map.retain(|k, _| k % 3 == 0);
  map.shrink_to_fit();
  assert_eq!(map.len(), 3334);

  let mut v: Vec<u32> = Vec::new();
  for i in 0..100_000 {
    v.push(i);
  }
  assert_eq!(v.iter().map(|&x| x as u64).sum::<u64>(), 4_999_950_000);
  v.truncate(10);
  v.shrink_to_fit();
  assert_eq!(v, (0..10).collect::<Vec<_>>());
}

#[test]
fn over_aligned_boxes() {
  let boxes: Vec<Box<Aligned>> = (0..64).map(|i| Box::new(Aligned([i as u8; 256]))).collect();
  for (i, b) in boxes.iter().enumerate() {
    assert_eq!(&**b as *const Aligned as usize % 256, 0);
    assert_eq!(b.0[255], i as u8);
  }

  let zeroed = vec![0u8; 1 << 20];
  assert!(zeroed.iter().all(|&b| b == 0));
}

#[test]
fn values_cross_threads() {
  let (tx, rx) = mpsc::channel::<Vec<String>>();
  let producer = thread::spawn(move || {
    for round in 0..100 {
      tx.send((0..100).map(|i| format!("{round}:{i}")).collect()).unwrap();
    }
  });

  let mut total = 0;
  for batch in rx {
    total += batch.len();
  }
  producer.join().unwrap();
  assert_eq!(total, 10_000);
}
