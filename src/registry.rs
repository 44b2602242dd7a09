use crate::clock::{FrameClock, DEFAULT_MAX_STEP};
use crate::error::BuildError;
use crate::pool::{WorkerPool, DEFAULT_KEEPALIVE, DEFAULT_MIN_IDLE};

use std::fmt;
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;

/// The per-frame maintenance surface of a cache, object-safe so the
/// registry can drive heterogeneous sections through one list.
pub trait MaintainedCache: Send + Sync {
  fn name(&self) -> &str;
  /// Sweeps expired entries.
  fn update(&self);
  /// Removes every entry immediately.
  fn clear(&self);
  fn len(&self) -> usize;
}

/// One cache universe: a shared clock, a shared worker pool and the list of
/// caches they drive.
///
/// Sections register themselves on construction and are held weakly, so a
/// dropped section unregisters by itself. Independent registries are fully
/// isolated; a host can run one per document, per test or per plugin.
pub struct CacheRegistry {
  clock: Arc<FrameClock>,
  workers: Arc<WorkerPool>,
  caches: Mutex<Vec<Weak<dyn MaintainedCache>>>,
}

impl CacheRegistry {
  /// Registry with default clock and pool settings.
  pub fn new() -> Self {
    RegistryBuilder::new().into_registry()
  }

  pub fn builder() -> RegistryBuilder {
    RegistryBuilder::new()
  }

  #[inline]
  pub fn clock(&self) -> &Arc<FrameClock> {
    &self.clock
  }

  #[inline]
  pub fn workers(&self) -> &Arc<WorkerPool> {
    &self.workers
  }

  pub(crate) fn register(&self, cache: Weak<dyn MaintainedCache>) {
    let mut caches = self.caches.lock();
    caches.retain(|entry| entry.strong_count() > 0);
    caches.push(cache);
  }

  /// Advances the clock for `frame` and sweeps every registered cache.
  /// Hosts call this once per frame from their main loop.
  pub fn tick(&self, frame: u64) {
    self.clock.tick(frame);
    self.update_all();
  }

  /// Deterministic variant of [`tick`] with an externally measured delta.
  ///
  /// [`tick`]: CacheRegistry::tick
  pub fn tick_by(&self, frame: u64, real_delta: Duration) {
    self.clock.tick_by(frame, real_delta);
    self.update_all();
  }

  /// Sweeps expired entries from every registered cache without advancing
  /// the clock.
  pub fn update_all(&self) {
    for cache in self.live_caches() {
      cache.update();
    }
  }

  /// Empties every registered cache.
  pub fn clear_all(&self) {
    for cache in self.live_caches() {
      cache.clear();
    }
  }

  /// Names of the currently registered caches.
  pub fn cache_names(&self) -> Vec<String> {
    self
      .live_caches()
      .iter()
      .map(|cache| cache.name().to_owned())
      .collect()
  }

  /// Entry count summed over every registered cache.
  pub fn total_entries(&self) -> usize {
    self.live_caches().iter().map(|cache| cache.len()).sum()
  }

  fn live_caches(&self) -> Vec<Arc<dyn MaintainedCache>> {
    let mut caches = self.caches.lock();
    caches.retain(|entry| entry.strong_count() > 0);
    caches.iter().filter_map(Weak::upgrade).collect()
  }
}

impl Default for CacheRegistry {
  fn default() -> Self {
    Self::new()
  }
}

impl fmt::Debug for CacheRegistry {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("CacheRegistry")
      .field("clock", &self.clock)
      .field("caches", &self.cache_names())
      .finish()
  }
}

/// A builder for [`CacheRegistry`].
pub struct RegistryBuilder {
  max_clock_step: Duration,
  pool_name: String,
  min_idle: usize,
  max_idle: usize,
  keepalive: Duration,
  synchronous: bool,
}

impl RegistryBuilder {
  fn new() -> Self {
    Self {
      max_clock_step: DEFAULT_MAX_STEP,
      pool_name: "cache-worker".to_owned(),
      min_idle: DEFAULT_MIN_IDLE,
      max_idle: crate::pool::default_max_idle(),
      keepalive: DEFAULT_KEEPALIVE,
      synchronous: false,
    }
  }

  /// Upper bound for a single clock step. Large real-time gaps (debugger,
  /// suspend) advance cache time by at most this much.
  pub fn max_clock_step(mut self, max_step: Duration) -> Self {
    self.max_clock_step = max_step;
    self
  }

  /// Thread-name prefix for the shared worker pool.
  pub fn pool_name(mut self, name: impl Into<String>) -> Self {
    self.pool_name = name.into();
    self
  }

  /// Idle-worker bounds of the shared pool.
  pub fn worker_bounds(mut self, min_idle: usize, max_idle: usize) -> Self {
    self.min_idle = min_idle;
    self.max_idle = max_idle;
    self
  }

  /// Keepalive of idle workers in the shared pool.
  pub fn worker_keepalive(mut self, keepalive: Duration) -> Self {
    self.keepalive = keepalive;
    self
  }

  /// Runs generators inline on the calling thread. Intended for hosts
  /// without threads and for deterministic tests.
  pub fn synchronous_workers(mut self, synchronous: bool) -> Self {
    self.synchronous = synchronous;
    self
  }

  pub fn build(self) -> Result<CacheRegistry, BuildError> {
    if self.max_clock_step.is_zero() {
      return Err(BuildError::ZeroClockStep);
    }
    let workers = WorkerPool::builder(self.pool_name)
      .min_idle(self.min_idle)
      .max_idle(self.max_idle)
      .keepalive(self.keepalive)
      .synchronous(self.synchronous)
      .build()?;
    Ok(CacheRegistry {
      clock: Arc::new(FrameClock::with_max_step(self.max_clock_step)),
      workers: Arc::new(workers),
      caches: Mutex::new(Vec::new()),
    })
  }

  fn into_registry(self) -> CacheRegistry {
    CacheRegistry {
      clock: Arc::new(FrameClock::with_max_step(self.max_clock_step)),
      workers: Arc::new(WorkerPool::new(self.pool_name)),
      caches: Mutex::new(Vec::new()),
    }
  }
}

impl fmt::Debug for RegistryBuilder {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("RegistryBuilder")
      .field("max_clock_step", &self.max_clock_step)
      .field("pool_name", &self.pool_name)
      .field("min_idle", &self.min_idle)
      .field("max_idle", &self.max_idle)
      .field("keepalive", &self.keepalive)
      .field("synchronous", &self.synchronous)
      .finish()
  }
}
