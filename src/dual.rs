use crate::clock::FrameClock;
use crate::data::CacheData;
use crate::error::{panic_message, GenerateError};
use crate::maps::KeyPairMap;
use crate::metrics::{Metrics, MetricsSnapshot};
use crate::pool::WorkerPool;
use crate::promise::{Promise, PromiseState};
use crate::registry::{CacheRegistry, MaintainedCache};
use crate::section::SectionConfig;

use std::fmt;
use std::hash::Hash;
use std::mem;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

/// How long a blocking lookup waits quietly before logging about it.
const LONG_WAIT: Duration = Duration::from_millis(500);

/// A cache section addressed by an ordered key pair.
///
/// Behaves like [`CacheSection`] with a compound key, and additionally
/// supports removing every entry under one outer key at a stroke. The
/// canonical use is an asset cache keyed by (document, element): closing
/// the document invalidates all of its elements with [`remove_outer`].
///
/// [`CacheSection`]: crate::section::CacheSection
/// [`remove_outer`]: DualCacheSection::remove_outer
pub struct DualCacheSection<K1, K2, V: CacheData> {
  name: String,
  entries: Mutex<KeyPairMap<K1, K2, Arc<Promise<V>>>>,
  clock: Arc<FrameClock>,
  workers: Arc<WorkerPool>,
  config: SectionConfig,
  metrics: Metrics,
}

impl<K1, K2, V> DualCacheSection<K1, K2, V>
where
  K1: Eq + Hash + Clone + fmt::Debug + Send + Sync + 'static,
  K2: Eq + Hash + Clone + fmt::Debug + Send + Sync + 'static,
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
    let section = Arc::new(Self {
      name: name.into(),
      entries: Mutex::new(KeyPairMap::new()),
      clock: registry.clock().clone(),
      workers: registry.workers().clone(),
      config,
      metrics: Metrics::new(),
    });
    let weak = Arc::downgrade(&section);
    registry.register(weak);
    section
  }

  /// Returns the promise for the pair, scheduling `generator` on the worker
  /// pool when no live entry exists yet. Failure handling matches
  /// [`CacheSection::get_entry`].
  ///
  /// [`CacheSection::get_entry`]: crate::section::CacheSection::get_entry
  pub fn get_entry<G>(
    self: &Arc<Self>,
    k1: K1,
    k2: K2,
    timeout: Duration,
    generator: G,
  ) -> Arc<Promise<V>>
  where
    G: FnOnce(&K1, &K2, &Arc<Promise<V>>) -> Result<(), GenerateError> + Send + 'static,
  {
    let (promise, inserted) = self.lookup_or_insert(&k1, &k2, timeout);
    if inserted {
      let task_name = format!("{}<{:?},{:?}>", self.name, k1, k2);
      let section = self.clone();
      let task_promise = promise.clone();
      self.workers.submit(task_name, move || {
        section.generate_safely(&k1, &k2, &task_promise, generator);
      });
    }
    promise
  }

  /// Like [`get_entry`], but runs the generator inline, so the promise is
  /// settled by the time it is returned. When another caller's generation is
  /// already in flight, this blocks until that one settles.
  ///
  /// [`get_entry`]: DualCacheSection::get_entry
  pub fn get_entry_sync<G>(
    &self,
    k1: K1,
    k2: K2,
    timeout: Duration,
    generator: G,
  ) -> Arc<Promise<V>>
  where
    G: FnOnce(&K1, &K2, &Arc<Promise<V>>) -> Result<(), GenerateError>,
  {
    let (promise, inserted) = self.lookup_or_insert(&k1, &k2, timeout);
    if inserted {
      self.generate_safely(&k1, &k2, &promise, generator);
    }
    if promise.is_pending() {
      self.wait_logged(&k1, &k2, &promise);
    }
    promise
  }

  /// Returns the existing promise for the pair without ever starting a
  /// generator, extending its expiry by `extend_by`.
  pub fn get_entry_without_generator(
    &self,
    k1: &K1,
    k2: &K2,
    extend_by: Duration,
  ) -> Option<Arc<Promise<V>>> {
    let promise = {
      let entries = self.entries.lock();
      entries.get(k1, k2).filter(|p| !p.is_destroyed()).cloned()
    };
    if let Some(promise) = &promise {
      self.metrics.hits.fetch_add(1, Ordering::Relaxed);
      promise.update(extend_by);
    }
    promise
  }

  /// True when the pair holds a settled value, including the absent one.
  pub fn has_entry(&self, k1: &K1, k2: &K2) -> bool {
    self
      .entries
      .lock()
      .get(k1, k2)
      .map_or(false, |promise| promise.has_value())
  }

  /// Stores `value` under the pair unconditionally, replacing whatever is
  /// there.
  pub fn override_entry(
    &self,
    k1: K1,
    k2: K2,
    value: Option<V>,
    timeout: Duration,
  ) -> Arc<Promise<V>> {
    let promise = Arc::new(Promise::completed(
      self.clock.clone(),
      self.config.grace,
      value,
    ));
    promise.update(timeout);
    let previous = self.entries.lock().insert(k1, k2, promise.clone());
    self.metrics.overrides.fetch_add(1, Ordering::Relaxed);
    if let Some(previous) = previous {
      previous.destroy();
    }
    promise
  }

  /// Removes and destroys the entry for the pair. Returns whether one
  /// existed.
  pub fn remove_entry(&self, k1: &K1, k2: &K2) -> bool {
    let removed = self.entries.lock().remove(k1, k2);
    match removed {
      Some(promise) => {
        self.metrics.invalidations.fetch_add(1, Ordering::Relaxed);
        promise.destroy();
        true
      }
      None => false,
    }
  }

  /// Removes and destroys every entry under `k1`, returning how many were
  /// removed.
  pub fn remove_outer(&self, k1: &K1) -> usize {
    let removed = self.entries.lock().remove_outer(k1);
    if !removed.is_empty() {
      self
        .metrics
        .invalidations
        .fetch_add(removed.len() as u64, Ordering::Relaxed);
    }
    for promise in &removed {
      promise.destroy();
    }
    removed.len()
  }

  /// Removes and destroys every entry matching `predicate`, returning how
  /// many were removed.
  pub fn remove_if<F>(&self, mut predicate: F) -> usize
  where
    F: FnMut(&K1, &K2, &Arc<Promise<V>>) -> bool,
  {
    let mut victims = Vec::new();
    {
      let mut entries = self.entries.lock();
      entries.retain(|k1, k2, promise| {
        if predicate(k1, k2, promise) {
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

  /// Destroys every entry at once.
  pub fn clear(&self) {
    let drained = {
      let mut entries = self.entries.lock();
      mem::take(&mut *entries)
    };
    if drained.is_empty() {
      return;
    }
    tracing::warn!(
      section = %self.name,
      entries = drained.len(),
      "clearing cache section"
    );
    for promise in drained.into_values() {
      promise.destroy();
    }
  }

  /// Sweeps out expired entries. Driven once per frame by the registry.
  pub fn update(&self) {
    let mut expired = Vec::new();
    {
      let mut entries = self.entries.lock();
      entries.retain(|_, _, promise| {
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

  fn lookup_or_insert(&self, k1: &K1, k2: &K2, timeout: Duration) -> (Arc<Promise<V>>, bool) {
    let (promise, inserted) = {
      let mut entries = self.entries.lock();
      match entries.get(k1, k2) {
        Some(existing) if !existing.is_destroyed() => (existing.clone(), false),
        _ => {
          let promise = Arc::new(Promise::new(self.clock.clone(), self.config.grace));
          entries.insert(k1.clone(), k2.clone(), promise.clone());
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

  fn generate_safely<G>(&self, k1: &K1, k2: &K2, promise: &Arc<Promise<V>>, generator: G)
  where
    G: FnOnce(&K1, &K2, &Arc<Promise<V>>) -> Result<(), GenerateError>,
  {
    self.metrics.generator_runs.fetch_add(1, Ordering::Relaxed);
    let outcome = panic::catch_unwind(AssertUnwindSafe(|| generator(k1, k2, promise)));
    match outcome {
      Ok(Ok(())) => {
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
          key = ?(k1, k2),
          error = %error,
          "generator failed"
        );
      }
      Err(payload) => {
        self.metrics.generator_failures.fetch_add(1, Ordering::Relaxed);
        tracing::error!(
          section = %self.name,
          key = ?(k1, k2),
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

  fn wait_logged(&self, k1: &K1, k2: &K2, promise: &Arc<Promise<V>>) -> Option<Arc<V>> {
    if let Some(value) = promise.wait_for_timeout(LONG_WAIT) {
      return Some(value);
    }
    if !promise.is_pending() {
      return promise.value();
    }
    tracing::warn!(
      section = %self.name,
      key = ?(k1, k2),
      "still waiting after {:?}, generator is running long",
      LONG_WAIT
    );
    let value = promise.wait_for();
    tracing::debug!(section = %self.name, key = ?(k1, k2), "long generation finished");
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

  pub fn metrics(&self) -> MetricsSnapshot {
    self.metrics.snapshot()
  }

  #[inline]
  pub fn config(&self) -> &SectionConfig {
    &self.config
  }
}

impl<K1, K2, V> MaintainedCache for DualCacheSection<K1, K2, V>
where
  K1: Eq + Hash + Clone + fmt::Debug + Send + Sync + 'static,
  K2: Eq + Hash + Clone + fmt::Debug + Send + Sync + 'static,
  V: CacheData,
{
  fn name(&self) -> &str {
    DualCacheSection::name(self)
  }

  fn update(&self) {
    DualCacheSection::update(self)
  }

  fn clear(&self) {
    DualCacheSection::clear(self)
  }

  fn len(&self) -> usize {
    DualCacheSection::len(self)
  }
}

impl<K1, K2, V: CacheData> Drop for DualCacheSection<K1, K2, V> {
  fn drop(&mut self) {
    let entries = mem::take(self.entries.get_mut());
    for promise in entries.into_values() {
      promise.destroy();
    }
  }
}

impl<K1, K2, V: CacheData> fmt::Debug for DualCacheSection<K1, K2, V> {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("DualCacheSection")
      .field("name", &self.name)
      .field("entries", &self.entries.lock().len())
      .finish()
  }
}
