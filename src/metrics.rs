use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use crossbeam_utils::CachePadded;

/// A thread-safe metrics collector for one cache section.
/// All fields are atomic to allow for lock-free updates.
#[derive(Debug)]
pub struct Metrics {
  // --- Hit/Miss Ratios ---
  pub(crate) hits: CachePadded<AtomicU64>,
  pub(crate) misses: CachePadded<AtomicU64>,

  // --- Generation ---
  pub(crate) generator_runs: CachePadded<AtomicU64>,
  pub(crate) generator_failures: CachePadded<AtomicU64>,
  pub(crate) negative_results: CachePadded<AtomicU64>,

  // --- Eviction / Removal ---
  pub(crate) evicted_by_timeout: CachePadded<AtomicU64>,
  pub(crate) invalidations: CachePadded<AtomicU64>,
  pub(crate) overrides: CachePadded<AtomicU64>,

  // --- Timestamps for Uptime ---
  created_at: Instant,
}

// Manual implementation of Default to handle the non-default `Instant`.
impl Default for Metrics {
  fn default() -> Self {
    Self {
      hits: CachePadded::new(AtomicU64::new(0)),
      misses: CachePadded::new(AtomicU64::new(0)),
      generator_runs: CachePadded::new(AtomicU64::new(0)),
      generator_failures: CachePadded::new(AtomicU64::new(0)),
      negative_results: CachePadded::new(AtomicU64::new(0)),
      evicted_by_timeout: CachePadded::new(AtomicU64::new(0)),
      invalidations: CachePadded::new(AtomicU64::new(0)),
      overrides: CachePadded::new(AtomicU64::new(0)),
      created_at: Instant::now(),
    }
  }
}

impl Metrics {
  pub(crate) fn new() -> Self {
    Self::default()
  }

  /// Creates a point-in-time snapshot of the current metrics.
  pub(crate) fn snapshot(&self) -> MetricsSnapshot {
    let hits = self.hits.load(Ordering::Relaxed);
    let misses = self.misses.load(Ordering::Relaxed);
    let total_lookups = hits + misses;

    MetricsSnapshot {
      hits,
      misses,
      hit_ratio: if total_lookups == 0 {
        0.0
      } else {
        hits as f64 / total_lookups as f64
      },
      generator_runs: self.generator_runs.load(Ordering::Relaxed),
      generator_failures: self.generator_failures.load(Ordering::Relaxed),
      negative_results: self.negative_results.load(Ordering::Relaxed),
      evicted_by_timeout: self.evicted_by_timeout.load(Ordering::Relaxed),
      invalidations: self.invalidations.load(Ordering::Relaxed),
      overrides: self.overrides.load(Ordering::Relaxed),
      uptime_secs: self.created_at.elapsed().as_secs(),
    }
  }
}

/// A point-in-time, public-facing snapshot of a section's metrics.
#[derive(Clone)]
pub struct MetricsSnapshot {
  /// Lookups that found a live entry.
  pub hits: u64,
  /// Lookups that inserted a fresh placeholder (or found nothing).
  pub misses: u64,
  /// The cache hit ratio (hits / (hits + misses)).
  pub hit_ratio: f64,
  /// The number of generator invocations dispatched.
  pub generator_runs: u64,
  /// Generator outcomes logged at error level (failures and panics).
  pub generator_failures: u64,
  /// Generator runs that settled their entry at an absent value.
  pub negative_results: u64,
  /// Entries evicted by the periodic sweep.
  pub evicted_by_timeout: u64,
  /// Entries removed explicitly (removal, filtered removal, clear).
  pub invalidations: u64,
  /// Entries force-inserted with a precomputed value.
  pub overrides: u64,
  /// The number of seconds the section has been running.
  pub uptime_secs: u64,
}

impl fmt::Debug for MetricsSnapshot {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("MetricsSnapshot")
      .field("hits", &self.hits)
      .field("misses", &self.misses)
      .field("hit_ratio", &format!("{:.2}%", self.hit_ratio * 100.0))
      .field("generator_runs", &self.generator_runs)
      .field("generator_failures", &self.generator_failures)
      .field("negative_results", &self.negative_results)
      .field("evicted_by_timeout", &self.evicted_by_timeout)
      .field("invalidations", &self.invalidations)
      .field("overrides", &self.overrides)
      .field("uptime_secs", &self.uptime_secs)
      .finish()
  }
}
