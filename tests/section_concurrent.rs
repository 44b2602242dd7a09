mod common;

use common::{threaded_registry, LONG_TIMEOUT, SHORT_TIMEOUT};
use framecache::CacheSection;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{mpsc, Arc, Barrier};
use std::thread;
use std::time::Duration;

#[test]
fn concurrent_lookups_of_one_key_run_the_generator_once() {
  let registry = threaded_registry();
  let section = CacheSection::<&'static str, u32>::new("dedup", &registry);
  let runs = Arc::new(AtomicUsize::new(0));

  let threads = 8;
  let barrier = Arc::new(Barrier::new(threads));
  let mut handles = Vec::new();
  for _ in 0..threads {
    let section = section.clone();
    let barrier = barrier.clone();
    let runs = runs.clone();
    handles.push(thread::spawn(move || {
      barrier.wait();
      let promise = section.get_entry("answer", LONG_TIMEOUT, move |_, promise| {
        runs.fetch_add(1, Ordering::SeqCst);
        thread::sleep(Duration::from_millis(50));
        promise.set_value(Some(42));
        Ok(())
      });
      *promise.wait_for().unwrap()
    }));
  }

  for handle in handles {
    assert_eq!(handle.join().unwrap(), 42);
  }
  assert_eq!(runs.load(Ordering::SeqCst), 1);
  assert_eq!(section.metrics().generator_runs, 1);
}

#[test]
fn waiters_see_a_generation_started_by_another_thread() {
  let registry = threaded_registry();
  let section = CacheSection::<&'static str, u32>::new("handoff", &registry);

  let promise = section.get_entry("slow", LONG_TIMEOUT, |_, promise| {
    thread::sleep(Duration::from_millis(80));
    promise.set_value(Some(7));
    Ok(())
  });
  // The generator runs on a pool worker; this thread just waits.
  assert_eq!(*promise.wait_for().unwrap(), 7);
}

#[test]
fn distinct_keys_generate_in_parallel() {
  let registry = threaded_registry();
  let section = CacheSection::<u32, u32>::new("parallel", &registry);
  let runs = Arc::new(AtomicUsize::new(0));

  let promises: Vec<_> = (0..16)
    .map(|key| {
      let runs = runs.clone();
      section.get_entry(key, LONG_TIMEOUT, move |key, promise| {
        runs.fetch_add(1, Ordering::SeqCst);
        thread::sleep(Duration::from_millis(10));
        promise.set_value(Some(key * 2));
        Ok(())
      })
    })
    .collect();

  for (key, promise) in promises.iter().enumerate() {
    assert_eq!(*promise.wait_for().unwrap(), key as u32 * 2);
  }
  assert_eq!(runs.load(Ordering::SeqCst), 16);
}

#[test]
fn callbacks_fire_from_the_generating_thread() {
  let registry = threaded_registry();
  let section = CacheSection::<&'static str, u32>::new("callbacks", &registry);
  let (sender, receiver) = mpsc::channel();

  let promise = section.get_entry("later", LONG_TIMEOUT, |_, promise| {
    thread::sleep(Duration::from_millis(30));
    promise.set_value(Some(3));
    Ok(())
  });
  promise.add_callback(move |value| {
    let _ = sender.send(*value.unwrap());
  });

  let delivered = receiver.recv_timeout(Duration::from_secs(2)).unwrap();
  assert_eq!(delivered, 3);
}

#[test]
fn lookups_and_invalidations_interleave_without_deadlock() {
  let registry = threaded_registry();
  let section = CacheSection::<u32, u32>::new("churn", &registry);

  let threads = 6;
  let barrier = Arc::new(Barrier::new(threads + 1));
  let mut handles = Vec::new();
  for _ in 0..threads {
    let section = section.clone();
    let barrier = barrier.clone();
    handles.push(thread::spawn(move || {
      barrier.wait();
      for _ in 0..20 {
        let promise = section.get_entry_sync(1, SHORT_TIMEOUT, |key, promise| {
          promise.set_value(Some(key * 10));
          Ok(())
        });
        // The remover may destroy the entry mid-generation, in which case
        // the lookup settles without a value. When a value arrives it is
        // always 10.
        if let Some(value) = promise.value() {
          assert_eq!(*value, 10);
        }
      }
    }));
  }

  let remover = {
    let section = section.clone();
    let barrier = barrier.clone();
    thread::spawn(move || {
      barrier.wait();
      for _ in 0..20 {
        section.remove_entry(&1);
        thread::yield_now();
      }
    })
  };

  for handle in handles {
    handle.join().unwrap();
  }
  remover.join().unwrap();
}
