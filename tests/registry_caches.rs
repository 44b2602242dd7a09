mod common;

use common::{deterministic_registry, SHORT_TIMEOUT};
use framecache::{BuildError, CacheRegistry, CacheSection};

use std::time::Duration;

#[test]
fn registries_are_isolated_universes() {
  let hot = deterministic_registry();
  let cold = deterministic_registry();
  let hot_section = CacheSection::<&'static str, u32>::new("shared-name", &hot);
  let cold_section = CacheSection::<&'static str, u32>::new("shared-name", &cold);

  hot_section.override_entry("k", Some(1), Duration::from_millis(500));
  cold_section.override_entry("k", Some(2), Duration::from_millis(500));

  // Advancing one universe far past the timeout leaves the other alone.
  hot.tick_by(1, Duration::from_secs(10));
  assert!(hot_section.is_empty());
  assert!(cold_section.has_entry(&"k"));
  assert_eq!(cold.clock().now(), 0);
}

#[test]
fn a_frame_number_only_advances_the_clock_once() {
  let registry = deterministic_registry();
  registry.tick_by(5, Duration::from_millis(100));
  registry.tick_by(5, Duration::from_millis(100));
  assert_eq!(registry.clock().now(), 100);

  registry.tick_by(6, Duration::from_millis(50));
  assert_eq!(registry.clock().now(), 150);
}

#[test]
fn update_all_sweeps_without_touching_the_clock() {
  let registry = deterministic_registry();
  let section = CacheSection::<&'static str, u32>::new("swept", &registry);
  section.override_entry("k", Some(1), SHORT_TIMEOUT);

  registry.clock().tick_by(1, Duration::from_millis(501));
  assert_eq!(section.len(), 1);

  registry.update_all();
  assert_eq!(section.len(), 0);
  assert_eq!(registry.clock().now(), 501);
}

#[test]
fn clear_all_reaches_every_registered_cache() {
  let registry = deterministic_registry();
  let textures = CacheSection::<u32, u32>::new("textures", &registry);
  let shapes = CacheSection::<u32, u32>::new("shapes", &registry);
  textures.override_entry(1, Some(1), SHORT_TIMEOUT);
  shapes.override_entry(2, Some(2), SHORT_TIMEOUT);
  shapes.override_entry(3, Some(3), SHORT_TIMEOUT);
  assert_eq!(registry.total_entries(), 3);

  registry.clear_all();
  assert_eq!(registry.total_entries(), 0);
  assert!(textures.is_empty());
  assert!(shapes.is_empty());
}

#[test]
fn dropped_caches_unregister_themselves() {
  let registry = deterministic_registry();
  let keeper = CacheSection::<u32, u32>::new("keeper", &registry);
  {
    let _scoped = CacheSection::<u32, u32>::new("scoped", &registry);
    let mut names = registry.cache_names();
    names.sort();
    assert_eq!(names, vec!["keeper", "scoped"]);
  }

  assert_eq!(registry.cache_names(), vec!["keeper"]);
  // Sweeping after the drop must not trip over the dead registration.
  registry.tick_by(1, Duration::from_millis(1));
  keeper.override_entry(1, Some(1), SHORT_TIMEOUT);
  assert_eq!(registry.total_entries(), 1);
}

#[test]
fn zero_clock_steps_are_rejected() {
  let error = CacheRegistry::builder()
    .max_clock_step(Duration::ZERO)
    .build()
    .unwrap_err();
  assert_eq!(error, BuildError::ZeroClockStep);
}

#[test]
fn bad_worker_bounds_are_rejected_at_the_registry() {
  let error = CacheRegistry::builder()
    .worker_bounds(2, 1)
    .build()
    .unwrap_err();
  assert_eq!(
    error,
    BuildError::InvalidWorkerBounds {
      min_idle: 2,
      max_idle: 1
    }
  );
}

#[test]
fn the_default_registry_is_usable_as_is() {
  let registry = CacheRegistry::default();
  let section = CacheSection::<&'static str, u32>::new("defaults", &registry);
  let promise = section.get_entry_sync("k", SHORT_TIMEOUT, |_, promise| {
    promise.set_value(Some(3));
    Ok(())
  });
  assert_eq!(*promise.value().unwrap(), 3);
}
