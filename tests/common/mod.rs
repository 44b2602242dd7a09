#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use framecache::{CacheData, CacheRegistry};

pub const SHORT_TIMEOUT: Duration = Duration::from_millis(100);
pub const LONG_TIMEOUT: Duration = Duration::from_secs(3);

// A cache value that counts its destroy calls, so tests can assert that
// payload release runs exactly once and only on eviction paths.
pub struct Tracked {
  pub label: String,
  destroys: Arc<AtomicUsize>,
}

impl Tracked {
  pub fn new(label: impl Into<String>, destroys: &Arc<AtomicUsize>) -> Self {
    Self {
      label: label.into(),
      destroys: destroys.clone(),
    }
  }
}

impl CacheData for Tracked {
  fn destroy(&self) {
    self.destroys.fetch_add(1, Ordering::SeqCst);
  }
}

pub fn destroy_counter() -> Arc<AtomicUsize> {
  Arc::new(AtomicUsize::new(0))
}

// Registry whose generators run inline on the calling thread and whose
// clock can be advanced by arbitrary amounts in a single tick. Tests drive
// time explicitly with `tick_by`.
pub fn deterministic_registry() -> CacheRegistry {
  CacheRegistry::builder()
    .max_clock_step(Duration::from_secs(3600))
    .synchronous_workers(true)
    .build()
    .unwrap()
}

// Registry with real worker threads but a test-controlled clock.
pub fn threaded_registry() -> CacheRegistry {
  CacheRegistry::builder()
    .max_clock_step(Duration::from_secs(3600))
    .build()
    .unwrap()
}
