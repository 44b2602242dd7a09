use crate::clock::FrameClock;
use crate::data::CacheData;
use crate::error::{panic_message, GenerateError};
use crate::metrics::{Metrics, MetricsSnapshot};
use crate::pool::WorkerPool;
use crate::promise::{Promise, PromiseState};
use crate::registry::{CacheRegistry, MaintainedCache};

use std::collections::HashMap;
use std::fmt;
use std::hash::Hash;
use std::mem;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

/// Default sliding expiry granted to entries whose caller asked for less.
pub const DEFAULT_GRACE: Duration = Duration::from_millis(250);

/// How long a blocking lookup waits quietly before logging about it.
const LONG_WAIT: Duration = Duration::from_millis(500);

/// Per-section tuning.
#[derive(Clone, Debug)]
pub struct SectionConfig {
  /// Minimum lifetime granted to an entry. Expiry extensions are floored at
  /// twice this value, so short-timeout callers cannot starve an entry that
  /// is still being generated.
  pub grace: Duration,
}

impl Default for SectionConfig {
  fn default() -> Self {
    Self {
      grace: DEFAULT_GRACE,
    }
  }
}

/// A keyed map of promises with request deduplication and frame-driven
/// expiry.
///
/// The first lookup of a key inserts a pending promise and schedules its
/// generator on the registry's worker pool; every concurrent lookup of the
/// same key receives the same promise, so at most one generator per key is
/// in flight. Entries expire on a sliding timeout measured against the
/// registry's [`FrameClock`] and are destroyed by the frame sweep, never
/// mid-access.
pub struct CacheSection<K, V: CacheData> {
  name: String,
  entries: Mutex<HashMap<K, Arc<Promise<V>>, ahash::RandomState>>,
  clock: Arc<FrameClock>,
  workers: Arc<WorkerPool>,
  config: SectionConfig,
  metrics: Metrics,
  /// Generation tasks admitted by `get_entry_limited` and not yet finished.
  in_flight: AtomicI64,
}

impl<K, V> CacheSection<K, V>
where
  K: Eq + Hash + Clone + fmt::Debug + Send + Sync + 'static,
  V: CacheData,
{
  /// Creates a section with default tuning and registers it for the
  /// registry's frame sweep.
  pub fn new(name: impl Into<String>, registry: &CacheRegistry) -> Arc<Self> {
    Self::with_config(name, SectionConfig::default(), registry)
  }

  pub fn with_config(
    name: impl Into<String>,
    config: SectionConfig,
    registry: &CacheRegistry,
  ) -> Arc<Self> {
    let section = Self::detached(name, config, registry);
    let weak = Arc::downgrade(&section);
    registry.register(weak);
    section
  }

  /// Creates a section that is not registered for the frame sweep. The
  /// caller owns maintenance, typically because it wraps the section in a
  /// larger cache that registers itself.
  pub(crate) fn detached(
    name: impl Into<String>,
    config: SectionConfig,
    registry: &CacheRegistry,
  ) -> Arc<Self> {
    Arc::new(Self {
      name: name.into(),
      entries: Mutex::new(HashMap::default()),
      clock: registry.clock().clone(),
      workers: registry.workers().clone(),
      config,
      metrics: Metrics::new(),
      in_flight: AtomicI64::new(0),
    })
  }

  /// Returns the promise for `key`, scheduling `generator` on the worker
  /// pool when no live entry exists yet.
  ///
  /// The generator receives the key and the pending promise and must
  /// eventually resolve it, either before returning or from machinery it
  /// hands the promise to. When it returns an error or panics instead, the
  /// promise resolves to the absent value so waiters never hang; the absent
  /// result stays cached until the entry times out, which keeps a missing
  /// source from being retried every frame.
  pub fn get_entry<G>(self: &Arc<Self>, key: K, timeout: Duration, generator: G) -> Arc<Promise<V>>
  where
    G: FnOnce(&K, &Arc<Promise<V>>) -> Result<(), GenerateError> + Send + 'static,
  {
    let (promise, inserted) = self.lookup_or_insert(&key, timeout);
    if inserted {
      self.spawn_generation(key, promise.clone(), generator, None);
    }
    promise
  }

  /// Like [`get_entry`], but runs the generator inline, so the promise is
  /// settled by the time it is returned. When another caller's generation is
  /// already in flight, this blocks until that one settles. Meant for
  /// tooling and tests; interactive callers subscribe to the promise
  /// instead of parking a thread.
  ///
  /// [`get_entry`]: CacheSection::get_entry
  pub fn get_entry_sync<G>(&self, key: K, timeout: Duration, generator: G) -> Arc<Promise<V>>
  where
    G: FnOnce(&K, &Arc<Promise<V>>) -> Result<(), GenerateError>,
  {
    let (promise, inserted) = self.lookup_or_insert(&key, timeout);
    if inserted {
      self.generate_safely(&key, &promise, generator);
    }
    if promise.is_pending() {
      self.wait_logged(&key, &promise);
    }
    promise
  }

  /// Returns the promise for `key` like [`get_entry`], except that at most
  /// `limit` generation tasks may be in flight for this section. Beyond the
  /// limit no entry is created and `None` is returned, so callers issuing
  /// speculative lookups (prefetchers, visibility scans) cannot flood the
  /// worker pool. Existing entries are always returned and never count
  /// against the limit.
  ///
  /// [`get_entry`]: CacheSection::get_entry
  pub fn get_entry_limited<G>(
    self: &Arc<Self>,
    key: K,
    timeout: Duration,
    limit: i64,
    generator: G,
  ) -> Option<Arc<Promise<V>>>
  where
    G: FnOnce(&K, &Arc<Promise<V>>) -> Result<(), GenerateError> + Send + 'static,
  {
    if let Some(promise) = self.get_entry_without_generator(&key, timeout) {
      return Some(promise);
    }
    let queued = self.in_flight.fetch_add(1, Ordering::AcqRel) + 1;
    if queued > limit {
      self.in_flight.fetch_sub(1, Ordering::AcqRel);
      // Retry the lookup so a concurrent insert is still honored.
      return self.get_entry_without_generator(&key, timeout);
    }
    let (promise, inserted) = self.lookup_or_insert(&key, timeout);
    if !inserted {
      self.in_flight.fetch_sub(1, Ordering::AcqRel);
      return Some(promise);
    }
    let section = self.clone();
    self.spawn_generation(
      key,
      promise.clone(),
      generator,
      Some(Box::new(move || {
        section.in_flight.fetch_sub(1, Ordering::AcqRel);
      })),
    );
    Some(promise)
  }

  /// Returns the existing promise for `key` without ever starting a
  /// generator, extending its expiry by `extend_by`.
  pub fn get_entry_without_generator(
    &self,
    key: &K,
    extend_by: Duration,
  ) -> Option<Arc<Promise<V>>> {
    let promise = {
      let entries = self.entries.lock();
      entries.get(key).filter(|p| !p.is_destroyed()).cloned()
    };
    if let Some(promise) = &promise {
      self.metrics.hits.fetch_add(1, Ordering::Relaxed);
      promise.update(extend_by);
    }
    promise
  }

  /// True when `key` holds a settled value, including the absent one.
  /// Pending generations do not count.
  pub fn has_entry(&self, key: &K) -> bool {
    self
      .entries
      .lock()
      .get(key)
      .map_or(false, |promise| promise.has_value())
  }

  /// Stores `value` under `key` unconditionally, replacing whatever is
  /// there. A replaced promise is destroyed, so its waiters settle with the
  /// no-value signal and a still-running generator finds its resolution
  /// discarded.
  pub fn override_entry(&self, key: K, value: Option<V>, timeout: Duration) -> Arc<Promise<V>> {
    let promise = Arc::new(Promise::completed(
      self.clock.clone(),
      self.config.grace,
      value,
    ));
    promise.update(timeout);
    let previous = self.entries.lock().insert(key, promise.clone());
    self.metrics.overrides.fetch_add(1, Ordering::Relaxed);
    if let Some(previous) = previous {
      previous.destroy();
    }
    promise
  }

  /// Removes and destroys the entry for `key`. Returns whether one existed.
  pub fn remove_entry(&self, key: &K) -> bool {
    let removed = self.entries.lock().remove(key);
    match removed {
      Some(promise) => {
        self.metrics.invalidations.fetch_add(1, Ordering::Relaxed);
        promise.destroy();
        true
      }
      None => false,
    }
  }

  /// Removes and destroys every entry matching `predicate`, returning how
  /// many were removed. Destruction runs after the map lock is released.
  pub fn remove_if<F>(&self, mut predicate: F) -> usize
  where
    F: FnMut(&K, &Arc<Promise<V>>) -> bool,
  {
    let mut victims = Vec::new();
    {
      let mut entries = self.entries.lock();
      entries.retain(|key, promise| {
        if predicate(key, promise) {
          victims.push(promise.clone());
          false
        } else {
          true
        }
      });
    }
    if !victims.is_empty() {
      self
        .metrics
        .invalidations
        .fetch_add(victims.len() as u64, Ordering::Relaxed);
    }
    for promise in &victims {
      promise.destroy();
    }
    victims.len()
  }

  /// Destroys every entry at once. Loud on purpose: a full clear during
  /// normal operation usually means an invalidation bug upstream.
  pub fn clear(&self) {
    let drained: Vec<(K, Arc<Promise<V>>)> = {
      let mut entries = self.entries.lock();
      entries.drain().collect()
    };
    if drained.is_empty() {
      return;
    }
    tracing::warn!(
      section = %self.name,
      entries = drained.len(),
      "clearing cache section"
    );
    for (_, promise) in drained {
      promise.destroy();
    }
  }

  /// Sweeps out expired entries. Driven once per frame by the registry.
  pub fn update(&self) {
    let mut expired = Vec::new();
    {
      let mut entries = self.entries.lock();
      entries.retain(|_, promise| {
        if promise.has_expired() {
          expired.push(promise.clone());
          false
        } else {
          true
        }
      });
    }
    if expired.is_empty() {
      return;
    }
    let timed_out = expired
      .iter()
      .filter(|promise| !promise.is_destroyed())
      .count() as u64;
    if timed_out > 0 {
      self
        .metrics
        .evicted_by_timeout
        .fetch_add(timed_out, Ordering::Relaxed);
    }
    tracing::trace!(
      section = %self.name,
      evicted = expired.len(),
      "swept expired cache entries"
    );
    for promise in expired {
      promise.destroy();
    }
  }

  fn lookup_or_insert(&self, key: &K, timeout: Duration) -> (Arc<Promise<V>>, bool) {
    let (promise, inserted) = {
      let mut entries = self.entries.lock();
      match entries.get(key) {
        Some(existing) if !existing.is_destroyed() => (existing.clone(), false),
        _ => {
          let promise = Arc::new(Promise::new(self.clock.clone(), self.config.grace));
          entries.insert(key.clone(), promise.clone());
          (promise, true)
        }
      }
    };
    if inserted {
      self.metrics.misses.fetch_add(1, Ordering::Relaxed);
    } else {
      self.metrics.hits.fetch_add(1, Ordering::Relaxed);
    }
    promise.update(timeout);
    (promise, inserted)
  }

  fn spawn_generation<G>(
    self: &Arc<Self>,
    key: K,
    promise: Arc<Promise<V>>,
    generator: G,
    on_complete: Option<Box<dyn FnOnce() + Send>>,
  ) where
    G: FnOnce(&K, &Arc<Promise<V>>) -> Result<(), GenerateError> + Send + 'static,
  {
    let task_name = format!("{}<{:?}>", self.name, key);
    let section = self.clone();
    self.workers.submit(task_name, move || {
      section.generate_safely(&key, &promise, generator);
      if let Some(on_complete) = on_complete {
        on_complete();
      }
    });
  }

  /// Runs one generator, translating every failure mode into a settled
  /// promise and a log line of matching severity.
  fn generate_safely<G>(&self, key: &K, promise: &Arc<Promise<V>>, generator: G)
  where
    G: FnOnce(&K, &Arc<Promise<V>>) -> Result<(), GenerateError>,
  {
    self.metrics.generator_runs.fetch_add(1, Ordering::Relaxed);
    let outcome = panic::catch_unwind(AssertUnwindSafe(|| generator(key, promise)));
    match outcome {
      Ok(Ok(())) => {
        // The generator may have handed the promise to asynchronous
        // machinery that resolves it later, so a still-pending promise is
        // left alone here.
        if matches!(promise.state(), PromiseState::Ready(None)) {
          self.metrics.negative_results.fetch_add(1, Ordering::Relaxed);
        }
        return;
      }
      Ok(Err(GenerateError::Cancelled)) => {}
      Ok(Err(GenerateError::MissingSource(message))) => {
        tracing::warn!(section = %self.name, "{}", message);
      }
      Ok(Err(error @ GenerateError::Failed(_))) => {
        self.metrics.generator_failures.fetch_add(1, Ordering::Relaxed);
        tracing::error!(
          section = %self.name,
          key = ?key,
          error = %error,
          "generator failed"
        );
      }
      Err(payload) => {
        self.metrics.generator_failures.fetch_add(1, Ordering::Relaxed);
        tracing::error!(
          section = %self.name,
          key = ?key,
          "generator panicked: {}",
          panic_message(&payload)
        );
      }
    }
    if promise.is_pending() {
      self.metrics.negative_results.fetch_add(1, Ordering::Relaxed);
      promise.set_value(None);
    }
  }

  fn wait_logged(&self, key: &K, promise: &Arc<Promise<V>>) -> Option<Arc<V>> {
    if let Some(value) = promise.wait_for_timeout(LONG_WAIT) {
      return Some(value);
    }
    if !promise.is_pending() {
      return promise.value();
    }
    tracing::warn!(
      section = %self.name,
      key = ?key,
      "still waiting after {:?}, generator is running long",
      LONG_WAIT
    );
    let value = promise.wait_for();
    tracing::debug!(section = %self.name, key = ?key, "long generation finished");
    value
  }

  #[inline]
  pub fn name(&self) -> &str {
    &self.name
  }

  pub fn len(&self) -> usize {
    self.entries.lock().len()
  }

  pub fn is_empty(&self) -> bool {
    self.entries.lock().is_empty()
  }

  /// Generation tasks admitted by [`get_entry_limited`] that have not
  /// finished yet.
  ///
  /// [`get_entry_limited`]: CacheSection::get_entry_limited
  pub fn pending_generations(&self) -> i64 {
    self.in_flight.load(Ordering::Acquire)
  }

  pub fn metrics(&self) -> MetricsSnapshot {
    self.metrics.snapshot()
  }

  #[inline]
  pub fn config(&self) -> &SectionConfig {
    &self.config
  }
}

impl<K, V> MaintainedCache for CacheSection<K, V>
where
  K: Eq + Hash + Clone + fmt::Debug + Send + Sync + 'static,
  V: CacheData,
{
  fn name(&self) -> &str {
    CacheSection::name(self)
  }

  fn update(&self) {
    CacheSection::update(self)
  }

  fn clear(&self) {
    CacheSection::clear(self)
  }

  fn len(&self) -> usize {
    CacheSection::len(self)
  }
}

impl<K, V: CacheData> Drop for CacheSection<K, V> {
  fn drop(&mut self) {
    let entries = mem::take(self.entries.get_mut());
    for (_, promise) in entries {
      promise.destroy();
    }
  }
}

impl<K, V: CacheData> fmt::Debug for CacheSection<K, V> {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("CacheSection")
      .field("name", &self.name)
      .field("entries", &self.entries.lock().len())
      .finish()
  }
}
