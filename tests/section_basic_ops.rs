mod common;

use common::{destroy_counter, deterministic_registry, Tracked, SHORT_TIMEOUT};
use framecache::{CacheSection, GenerateError};

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

#[test]
fn lookups_of_one_key_share_a_single_generator_run() {
  let registry = deterministic_registry();
  let section = CacheSection::<String, u32>::new("numbers", &registry);
  let runs = Arc::new(AtomicUsize::new(0));

  let counter = runs.clone();
  let first = section.get_entry("a".to_owned(), SHORT_TIMEOUT, move |_, promise| {
    counter.fetch_add(1, Ordering::SeqCst);
    promise.set_value(Some(42));
    Ok(())
  });
  assert_eq!(*first.value().unwrap(), 42);

  let second = section.get_entry("a".to_owned(), SHORT_TIMEOUT, |_, _| {
    unreachable!("a live entry never re-runs its generator")
  });
  assert!(Arc::ptr_eq(&first, &second));
  assert_eq!(runs.load(Ordering::SeqCst), 1);

  let metrics = section.metrics();
  assert_eq!(metrics.misses, 1);
  assert_eq!(metrics.hits, 1);
  assert_eq!(metrics.generator_runs, 1);
}

#[test]
fn get_entry_sync_resolves_before_returning() {
  let registry = deterministic_registry();
  let section = CacheSection::<&'static str, u32>::new("sync", &registry);

  let promise = section.get_entry_sync("five", SHORT_TIMEOUT, |_, promise| {
    promise.set_value(Some(5));
    Ok(())
  });
  assert!(!promise.is_pending());
  assert_eq!(*promise.value().unwrap(), 5);
  assert!(section.has_entry(&"five"));
}

#[test]
fn failures_are_cached_as_absent_until_the_entry_times_out() {
  let registry = deterministic_registry();
  let section = CacheSection::<&'static str, u32>::new("negatives", &registry);
  let runs = Arc::new(AtomicUsize::new(0));

  let counter = runs.clone();
  let promise = section.get_entry("broken", Duration::from_millis(100), move |_, _| {
    counter.fetch_add(1, Ordering::SeqCst);
    Err(GenerateError::failed("backend unreachable"))
  });
  assert!(promise.has_value());
  assert!(promise.value().is_none());
  assert!(section.has_entry(&"broken"));

  // The absent result is served from cache, not retried per lookup.
  let again = section.get_entry("broken", Duration::from_millis(100), |_, _| {
    unreachable!("the cached absence answers this lookup")
  });
  assert!(again.value().is_none());
  assert_eq!(runs.load(Ordering::SeqCst), 1);

  let metrics = section.metrics();
  assert_eq!(metrics.negative_results, 1);
  assert_eq!(metrics.generator_failures, 1);

  // Once the entry times out the next lookup tries again. The 100 ms
  // timeout is floored at twice the 250 ms grace.
  registry.tick_by(1, Duration::from_millis(501));
  assert_eq!(section.len(), 0);
  let counter = runs.clone();
  section.get_entry("broken", Duration::from_millis(100), move |_, promise| {
    counter.fetch_add(1, Ordering::SeqCst);
    promise.set_value(Some(13));
    Ok(())
  });
  assert_eq!(runs.load(Ordering::SeqCst), 2);
}

#[test]
fn missing_sources_cache_the_absence_without_counting_as_failure() {
  let registry = deterministic_registry();
  let section = CacheSection::<&'static str, u32>::new("sources", &registry);

  let promise = section.get_entry("gone", SHORT_TIMEOUT, |key, _| {
    Err(GenerateError::MissingSource(format!("no source for {key}")))
  });
  assert!(promise.has_value());
  assert!(promise.value().is_none());

  let metrics = section.metrics();
  assert_eq!(metrics.negative_results, 1);
  assert_eq!(metrics.generator_failures, 0);
}

#[test]
fn a_panicking_generator_still_settles_the_promise() {
  let registry = deterministic_registry();
  let section = CacheSection::<&'static str, u32>::new("panics", &registry);

  let promise = section.get_entry("boom", SHORT_TIMEOUT, |_, _| panic!("generator bug"));
  assert!(promise.has_value());
  assert!(promise.value().is_none());
  assert_eq!(section.metrics().generator_failures, 1);
}

#[test]
fn override_entry_replaces_and_destroys_the_previous_value() {
  let registry = deterministic_registry();
  let section = CacheSection::<&'static str, Tracked>::new("overrides", &registry);
  let destroys = destroy_counter();

  let tracked = Tracked::new("generated", &destroys);
  section.get_entry("slot", SHORT_TIMEOUT, move |_, promise| {
    promise.set_value(Some(tracked));
    Ok(())
  });

  let replacement = Tracked::new("forced", &destroys);
  let promise = section.override_entry("slot", Some(replacement), SHORT_TIMEOUT);
  assert_eq!(destroys.load(Ordering::SeqCst), 1);
  assert_eq!(promise.value().unwrap().label, "forced");
  assert_eq!(section.metrics().overrides, 1);

  // Overriding an absent key simply inserts.
  section.override_entry("fresh", Some(Tracked::new("new", &destroys)), SHORT_TIMEOUT);
  assert_eq!(section.len(), 2);
}

#[test]
fn remove_entry_destroys_and_reports_presence() {
  let registry = deterministic_registry();
  let section = CacheSection::<&'static str, Tracked>::new("removals", &registry);
  let destroys = destroy_counter();

  section.override_entry("a", Some(Tracked::new("a", &destroys)), SHORT_TIMEOUT);
  assert!(section.remove_entry(&"a"));
  assert_eq!(destroys.load(Ordering::SeqCst), 1);
  assert_eq!(section.len(), 0);
  assert!(!section.remove_entry(&"a"));
  assert_eq!(section.metrics().invalidations, 1);
}

#[test]
fn remove_if_filters_by_key() {
  let registry = deterministic_registry();
  let section = CacheSection::<u32, u32>::new("filtered", &registry);
  for key in 0..6 {
    section.override_entry(key, Some(key * 10), SHORT_TIMEOUT);
  }

  let removed = section.remove_if(|key, _| key % 2 == 0);
  assert_eq!(removed, 3);
  assert_eq!(section.len(), 3);
  assert!(!section.has_entry(&0));
  assert!(section.has_entry(&1));
}

#[test]
fn clear_destroys_everything() {
  let registry = deterministic_registry();
  let section = CacheSection::<u32, Tracked>::new("cleared", &registry);
  let destroys = destroy_counter();
  for key in 0..4 {
    section.override_entry(key, Some(Tracked::new(format!("{key}"), &destroys)), SHORT_TIMEOUT);
  }

  section.clear();
  assert!(section.is_empty());
  assert_eq!(destroys.load(Ordering::SeqCst), 4);
}

#[test]
fn has_entry_only_reports_settled_values() {
  let registry = deterministic_registry();
  let section = CacheSection::<&'static str, u32>::new("presence", &registry);
  assert!(!section.has_entry(&"nope"));

  section.override_entry("yes", Some(1), SHORT_TIMEOUT);
  section.override_entry("absent", None, SHORT_TIMEOUT);
  assert!(section.has_entry(&"yes"));
  // A cached absence is still a settled entry.
  assert!(section.has_entry(&"absent"));
}

#[test]
fn peeking_never_creates_entries() {
  let registry = deterministic_registry();
  let section = CacheSection::<&'static str, u32>::new("peek", &registry);
  assert!(section.get_entry_without_generator(&"a", SHORT_TIMEOUT).is_none());
  assert_eq!(section.len(), 0);

  section.override_entry("a", Some(1), SHORT_TIMEOUT);
  let peeked = section.get_entry_without_generator(&"a", SHORT_TIMEOUT);
  assert_eq!(*peeked.unwrap().value().unwrap(), 1);
}

#[test]
fn limited_lookups_refuse_work_beyond_the_budget() {
  let registry = deterministic_registry();
  let section = CacheSection::<&'static str, u32>::new("limited", &registry);

  // A zero budget admits no new generation and creates no entry.
  let refused = section.get_entry_limited("a", SHORT_TIMEOUT, 0, |_, promise| {
    promise.set_value(Some(1));
    Ok(())
  });
  assert!(refused.is_none());
  assert_eq!(section.len(), 0);

  // Within budget the lookup behaves like get_entry.
  let admitted = section.get_entry_limited("a", SHORT_TIMEOUT, 1, |_, promise| {
    promise.set_value(Some(1));
    Ok(())
  });
  assert_eq!(*admitted.unwrap().value().unwrap(), 1);
  assert_eq!(section.pending_generations(), 0);

  // Existing entries never count against the budget.
  let cached = section.get_entry_limited("a", SHORT_TIMEOUT, 0, |_, _| {
    unreachable!("served from cache")
  });
  assert!(cached.is_some());
}

#[test]
fn dropping_a_section_destroys_its_entries() {
  let registry = deterministic_registry();
  let destroys = destroy_counter();
  {
    let section = CacheSection::<&'static str, Tracked>::new("scoped", &registry);
    section.override_entry("a", Some(Tracked::new("a", &destroys)), SHORT_TIMEOUT);
  }
  assert_eq!(destroys.load(Ordering::SeqCst), 1);
  assert!(registry.cache_names().is_empty());
}
