use crate::clock::FrameClock;
use crate::data::CacheData;
use crate::error::panic_message;

use std::collections::VecDeque;
use std::fmt;
use std::future::Future;
use std::mem;
use std::ops::Deref;
use std::panic::{self, AssertUnwindSafe};
use std::pin::Pin;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll, Waker};
use std::thread::{self, Thread};
use std::time::{Duration, Instant};

use parking_lot::Mutex;

/// Represents a waiter blocked on a pending promise.
enum Waiter {
  Sync(Thread),
  Async(Waker),
}

impl Waiter {
  fn wake(self) {
    match self {
      Waiter::Sync(thread) => thread.unpark(),
      Waiter::Async(waker) => waker.wake(),
    }
  }
}

type Callback<V> = Box<dyn FnOnce(Option<Arc<V>>) + Send>;

/// Resolution state of a [`Promise`].
///
/// `Ready(None)` records a computation that completed without producing a
/// value (negative caching) and is distinct from both `Pending` and
/// `Destroyed`.
pub enum PromiseState<V> {
  Pending,
  Ready(Option<Arc<V>>),
  Destroyed,
}

impl<V> Clone for PromiseState<V> {
  fn clone(&self) -> Self {
    match self {
      PromiseState::Pending => PromiseState::Pending,
      PromiseState::Ready(value) => PromiseState::Ready(value.clone()),
      PromiseState::Destroyed => PromiseState::Destroyed,
    }
  }
}

impl<V> fmt::Debug for PromiseState<V> {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      PromiseState::Pending => f.write_str("Pending"),
      PromiseState::Ready(Some(_)) => f.write_str("Ready(Some)"),
      PromiseState::Ready(None) => f.write_str("Ready(None)"),
      PromiseState::Destroyed => f.write_str("Destroyed"),
    }
  }
}

/// The internal, mutex-protected core of the promise.
struct Inner<V> {
  state: PromiseState<V>,
  callbacks: VecDeque<Callback<V>>,
  waiters: VecDeque<Waiter>,
}

/// A single-assignment value container shared between cache consumers and
/// the generator computing the value.
///
/// A promise starts pending, then either resolves (possibly to an absent
/// value) or is destroyed. Consumers subscribe with [`add_callback`], await
/// it (`(&*promise).await`), or block on [`wait_for`] from tooling code.
/// Expiry bookkeeping runs against the owning registry's [`FrameClock`]:
/// the promise tracks a sliding expiry timestamp and an active pin count,
/// and the sweep only evicts entries whose [`has_expired`] reports true.
///
/// [`add_callback`]: Promise::add_callback
/// [`wait_for`]: Promise::wait_for
/// [`has_expired`]: Promise::has_expired
pub struct Promise<V: CacheData> {
  inner: Mutex<Inner<V>>,
  /// Expiry timestamp in virtual millis. Only ever raised (fetch-max).
  expires_at: AtomicU64,
  /// Active pin count. A pinned promise is never evicted by the sweep.
  pins: AtomicI64,
  grace_millis: u64,
  clock: Arc<FrameClock>,
}

impl<V: CacheData> Promise<V> {
  /// Creates a pending promise whose initial expiry is `now + grace`.
  pub fn new(clock: Arc<FrameClock>, grace: Duration) -> Self {
    let grace_millis = grace.as_millis() as u64;
    let expires_at = clock.now() + grace_millis;
    Self {
      inner: Mutex::new(Inner {
        state: PromiseState::Pending,
        callbacks: VecDeque::new(),
        waiters: VecDeque::new(),
      }),
      expires_at: AtomicU64::new(expires_at),
      pins: AtomicI64::new(0),
      grace_millis,
      clock,
    }
  }

  /// Creates a promise that is already resolved to `value`.
  pub fn completed(clock: Arc<FrameClock>, grace: Duration, value: Option<V>) -> Self {
    let promise = Self::new(clock, grace);
    promise.set_value(value);
    promise
  }

  /// Resolves the promise, waking all waiters and draining queued callbacks
  /// in registration order.
  ///
  /// Resolving a destroyed promise releases `value` immediately (its
  /// [`CacheData::destroy`] runs) and does nothing else. Resolving an
  /// already resolved promise replaces the payload; the previous payload is
  /// dropped without `destroy`, since earlier readers may still hold it.
  pub fn set_value(&self, value: Option<V>) {
    let value = value.map(Arc::new);
    let (callbacks, waiters) = {
      let mut inner = self.inner.lock();
      if matches!(inner.state, PromiseState::Destroyed) {
        drop(inner);
        if let Some(value) = value {
          value.destroy();
        }
        return;
      }
      inner.state = PromiseState::Ready(value.clone());
      (
        mem::take(&mut inner.callbacks),
        mem::take(&mut inner.waiters),
      )
    };
    for waiter in waiters {
      waiter.wake();
    }
    Self::run_callbacks(callbacks, &value);
  }

  /// Destroys the promise, releasing its payload. Idempotent: the second
  /// call is a no-op and the payload's [`CacheData::destroy`] runs at most
  /// once. Queued callbacks fire with the no-value signal.
  pub fn destroy(&self) {
    let (payload, callbacks, waiters) = {
      let mut inner = self.inner.lock();
      if matches!(inner.state, PromiseState::Destroyed) {
        return;
      }
      let payload = match mem::replace(&mut inner.state, PromiseState::Destroyed) {
        PromiseState::Ready(value) => value,
        _ => None,
      };
      (
        payload,
        mem::take(&mut inner.callbacks),
        mem::take(&mut inner.waiters),
      )
    };
    // The payload release can be expensive (GPU handles, mapped files), so
    // it runs outside the state lock.
    if let Some(payload) = payload {
      payload.destroy();
    }
    for waiter in waiters {
      waiter.wake();
    }
    Self::run_callbacks(callbacks, &None);
  }

  /// Registers `cb` to run with the resolved value (`None` for an absent
  /// result or a destroyed promise).
  ///
  /// An already settled promise runs `cb` before this returns; otherwise it
  /// is queued and fires exactly once, in registration order relative to
  /// other queued callbacks.
  pub fn add_callback<F>(&self, cb: F)
  where
    F: FnOnce(Option<Arc<V>>) + Send + 'static,
  {
    let cb: Callback<V> = Box::new(cb);
    // The queue decision and the enqueue happen under one lock, so a
    // concurrent resolution cannot slip between them and strand the
    // callback.
    let immediate = {
      let mut inner = self.inner.lock();
      match &inner.state {
        PromiseState::Pending => {
          inner.callbacks.push_back(cb);
          None
        }
        PromiseState::Ready(value) => Some((cb, value.clone())),
        PromiseState::Destroyed => Some((cb, None)),
      }
    };
    if let Some((cb, value)) = immediate {
      Self::invoke_callback(cb, value);
    }
  }

  fn run_callbacks(callbacks: VecDeque<Callback<V>>, value: &Option<Arc<V>>) {
    for callback in callbacks {
      Self::invoke_callback(callback, value.clone());
    }
  }

  /// Runs one callback, catching panics so a failing subscriber cannot
  /// block the remaining ones.
  fn invoke_callback(callback: Callback<V>, value: Option<Arc<V>>) {
    if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(move || callback(value))) {
      tracing::error!("promise callback panicked: {}", panic_message(&payload));
    }
  }

  /// Extends the expiry to at least `now + max(extra, 2 × grace)`. The
  /// expiry never moves backwards.
  pub fn update(&self, extra: Duration) {
    let floor = self.grace_millis.saturating_mul(2);
    let target = self.clock.now() + (extra.as_millis() as u64).max(floor);
    self.expires_at.fetch_max(target, Ordering::AcqRel);
  }

  /// Pins the promise, keeping it safe from eviction until the returned
  /// guard drops. Pins nest; every guard must drop before the entry becomes
  /// evictable again.
  pub fn pin(self: &Arc<Self>) -> PinGuard<V> {
    self.pins.fetch_add(1, Ordering::AcqRel);
    PinGuard {
      promise: self.clone(),
    }
  }

  fn unpin(&self) {
    let previous = self.pins.fetch_sub(1, Ordering::AcqRel);
    assert!(previous > 0, "pin count underflow: unpin without a matching pin");
    // Refresh the expiry so the sweep running this frame cannot catch the
    // entry in the instant after the pin ends.
    self.update(Duration::from_millis(1));
  }

  /// Number of active pins.
  pub fn pin_count(&self) -> i64 {
    self.pins.load(Ordering::Acquire)
  }

  /// True when the promise may be evicted: destroyed, or past its expiry
  /// with no active pins.
  pub fn has_expired(&self) -> bool {
    if self.is_destroyed() {
      return true;
    }
    self.clock.now() > self.expires_at.load(Ordering::Acquire)
      && self.pins.load(Ordering::Acquire) <= 0
  }

  /// A snapshot of the resolution state.
  pub fn state(&self) -> PromiseState<V> {
    self.inner.lock().state.clone()
  }

  /// True when a value has been assigned, even an absent one.
  pub fn has_value(&self) -> bool {
    matches!(self.inner.lock().state, PromiseState::Ready(_))
  }

  pub fn is_pending(&self) -> bool {
    matches!(self.inner.lock().state, PromiseState::Pending)
  }

  pub fn is_destroyed(&self) -> bool {
    matches!(self.inner.lock().state, PromiseState::Destroyed)
  }

  /// The resolved payload, if any.
  pub fn value(&self) -> Option<Arc<V>> {
    match &self.inner.lock().state {
      PromiseState::Ready(value) => value.clone(),
      _ => None,
    }
  }

  /// Blocks until the promise settles, returning the value (`None` for an
  /// absent result or a destroyed promise).
  ///
  /// Parked waits belong in tests and tooling. Latency-sensitive callers
  /// subscribe with [`add_callback`] or await the promise instead.
  ///
  /// [`add_callback`]: Promise::add_callback
  pub fn wait_for(&self) -> Option<Arc<V>> {
    loop {
      {
        let mut inner = self.inner.lock();
        match &inner.state {
          PromiseState::Ready(value) => return value.clone(),
          PromiseState::Destroyed => return None,
          PromiseState::Pending => {
            inner.waiters.push_back(Waiter::Sync(thread::current()));
          }
        }
      }
      thread::park();
    }
  }

  /// Like [`wait_for`], but gives up once `timeout` elapses, returning
  /// `None` while the promise is still pending.
  ///
  /// [`wait_for`]: Promise::wait_for
  pub fn wait_for_timeout(&self, timeout: Duration) -> Option<Arc<V>> {
    let deadline = Instant::now() + timeout;
    loop {
      {
        let mut inner = self.inner.lock();
        match &inner.state {
          PromiseState::Ready(value) => return value.clone(),
          PromiseState::Destroyed => return None,
          PromiseState::Pending => {
            inner.waiters.push_back(Waiter::Sync(thread::current()));
          }
        }
      }
      let now = Instant::now();
      if now >= deadline {
        return None;
      }
      thread::park_timeout(deadline - now);
    }
  }
}

impl<V: CacheData> fmt::Debug for Promise<V> {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("Promise")
      .field("state", &self.state())
      .field("expires_at", &self.expires_at.load(Ordering::Acquire))
      .field("pins", &self.pin_count())
      .finish()
  }
}

impl<V: CacheData> Future for &Promise<V> {
  type Output = Option<Arc<V>>;

  fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
    let mut inner = self.inner.lock();
    match &inner.state {
      PromiseState::Ready(value) => Poll::Ready(value.clone()),
      PromiseState::Destroyed => Poll::Ready(None),
      PromiseState::Pending => {
        inner.waiters.push_back(Waiter::Async(cx.waker().clone()));
        Poll::Pending
      }
    }
  }
}

/// Scoped pin on a promise.
///
/// Dropping the guard (on any exit path) releases the pin and refreshes the
/// expiry by a millisecond, so the entry survives the sweep of the frame in
/// which the pin ended.
pub struct PinGuard<V: CacheData> {
  promise: Arc<Promise<V>>,
}

impl<V: CacheData> PinGuard<V> {
  /// The pinned promise.
  pub fn promise(&self) -> &Arc<Promise<V>> {
    &self.promise
  }
}

impl<V: CacheData> Deref for PinGuard<V> {
  type Target = Promise<V>;

  fn deref(&self) -> &Self::Target {
    &self.promise
  }
}

impl<V: CacheData> Drop for PinGuard<V> {
  fn drop(&mut self) {
    self.promise.unpin();
  }
}
