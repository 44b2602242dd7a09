use parking_lot::Mutex;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// Default upper bound for a single clock step.
pub const DEFAULT_MAX_STEP: Duration = Duration::from_millis(16);

/// State touched only while ticking, kept apart from the hot `now` path.
struct TickState {
  last_frame: Option<u64>,
  last_instant: Instant,
}

/// A monotonic, frame-quantized virtual time source.
///
/// All expiry math in this crate runs against a `FrameClock` instead of
/// wall-clock time. The clock advances once per external frame by the real
/// elapsed time clamped to `[1, max_step]` milliseconds, so a debugger
/// pause, a long GC or one slow frame moves cache time forward by at most a
/// single step and cannot mass-evict entries. The minimum step of 1 ms
/// keeps time moving even at very high frame rates.
pub struct FrameClock {
  /// Virtual time in milliseconds. Readable without locking.
  now_millis: AtomicU64,
  max_step_millis: u64,
  tick_state: Mutex<TickState>,
}

impl FrameClock {
  pub fn new() -> Self {
    Self::with_max_step(DEFAULT_MAX_STEP)
  }

  /// Creates a clock with a custom per-frame step bound. A zero bound is
  /// raised to 1 ms so the clock always makes progress.
  pub fn with_max_step(max_step: Duration) -> Self {
    Self {
      now_millis: AtomicU64::new(0),
      max_step_millis: (max_step.as_millis() as u64).max(1),
      tick_state: Mutex::new(TickState {
        last_frame: None,
        last_instant: Instant::now(),
      }),
    }
  }

  /// Current virtual time in milliseconds.
  #[inline]
  pub fn now(&self) -> u64 {
    self.now_millis.load(Ordering::Acquire)
  }

  /// The configured per-frame step bound.
  pub fn max_step(&self) -> Duration {
    Duration::from_millis(self.max_step_millis)
  }

  /// Advances the clock for frame `frame`, measuring the real delta since
  /// the previous tick. Calling this again with the same frame number is a
  /// no-op, so several drivers within one frame advance time only once.
  pub fn tick(&self, frame: u64) {
    let mut state = self.tick_state.lock();
    if state.last_frame == Some(frame) {
      return;
    }
    let now = Instant::now();
    let delta = now.duration_since(state.last_instant);
    state.last_instant = now;
    state.last_frame = Some(frame);
    self.advance(delta);
  }

  /// Advances the clock for frame `frame` by an externally measured delta.
  /// Deterministic drivers (tests, replay) use this instead of [`tick`].
  ///
  /// [`tick`]: FrameClock::tick
  pub fn tick_by(&self, frame: u64, real_delta: Duration) {
    let mut state = self.tick_state.lock();
    if state.last_frame == Some(frame) {
      return;
    }
    state.last_instant = Instant::now();
    state.last_frame = Some(frame);
    self.advance(real_delta);
  }

  fn advance(&self, real_delta: Duration) {
    let step = (real_delta.as_millis() as u64).clamp(1, self.max_step_millis);
    self.now_millis.fetch_add(step, Ordering::AcqRel);
  }
}

impl Default for FrameClock {
  fn default() -> Self {
    Self::new()
  }
}

impl fmt::Debug for FrameClock {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("FrameClock")
      .field("now_millis", &self.now())
      .field("max_step_millis", &self.max_step_millis)
      .finish()
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn minimum_step_is_one_millisecond() {
    let clock = FrameClock::new();
    clock.tick_by(1, Duration::ZERO);
    assert_eq!(clock.now(), 1);
  }

  #[test]
  fn large_deltas_are_clamped() {
    let clock = FrameClock::new();
    clock.tick_by(1, Duration::from_secs(30));
    assert_eq!(clock.now(), 16);
  }

  #[test]
  fn same_frame_ticks_once() {
    let clock = FrameClock::with_max_step(Duration::from_secs(1));
    clock.tick_by(7, Duration::from_millis(5));
    clock.tick_by(7, Duration::from_millis(5));
    assert_eq!(clock.now(), 5);
    clock.tick_by(8, Duration::from_millis(3));
    assert_eq!(clock.now(), 8);
  }

  #[test]
  fn custom_step_bound_applies() {
    let clock = FrameClock::with_max_step(Duration::from_secs(10));
    clock.tick_by(1, Duration::from_millis(600));
    assert_eq!(clock.now(), 600);
  }

  #[test]
  fn real_ticks_are_monotonic() {
    let clock = FrameClock::new();
    let mut previous = clock.now();
    for frame in 0..32 {
      clock.tick(frame);
      let now = clock.now();
      assert!(now > previous);
      previous = now;
    }
  }
}
