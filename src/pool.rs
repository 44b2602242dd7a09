use crate::error::{panic_message, BuildError};

use std::collections::HashMap;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use fibre::mpmc;
use fibre::RecvErrorTimeout;
use parking_lot::Mutex;

/// Default lower bound of idle workers kept warm.
pub const DEFAULT_MIN_IDLE: usize = 1;
/// Default keepalive an idle worker waits before re-checking the pool size.
pub const DEFAULT_KEEPALIVE: Duration = Duration::from_millis(250);

pub(crate) fn default_max_idle() -> usize {
  num_cpus::get().max(2)
}

/// A unit of work with a diagnostic name.
struct Task {
  name: String,
  run: Box<dyn FnOnce() + Send>,
}

/// Counters and tables shared between the pool handle and its workers.
///
/// Workers hold this (not the pool itself) so that dropping the last pool
/// handle closes the queue and lets them retire.
struct PoolState {
  name: String,
  idle: AtomicUsize,
  live: AtomicUsize,
  next_worker: AtomicUsize,
  max_idle: usize,
  keepalive: Duration,
  /// Worker id → name of the task it is currently running.
  running: Mutex<HashMap<usize, String, ahash::RandomState>>,

  submitted: AtomicU64,
  completed: AtomicU64,
  panicked: AtomicU64,
  spawned: AtomicU64,
  retired: AtomicU64,
}

impl PoolState {
  /// Runs one task, isolating panics so a failing task cannot kill the
  /// worker (or the submitting thread, in synchronous mode).
  fn execute(&self, worker: Option<usize>, task: Task) {
    let Task { name, run } = task;
    if let Some(id) = worker {
      self.running.lock().insert(id, name.clone());
    }
    let outcome = panic::catch_unwind(AssertUnwindSafe(run));
    if let Some(id) = worker {
      self.running.lock().remove(&id);
    }
    match outcome {
      Ok(()) => {
        self.completed.fetch_add(1, Ordering::Relaxed);
      }
      Err(payload) => {
        self.panicked.fetch_add(1, Ordering::Relaxed);
        tracing::error!(
          pool = %self.name,
          task = %name,
          "task panicked: {}",
          panic_message(&payload)
        );
      }
    }
  }
}

fn worker_loop(state: Arc<PoolState>, receiver: mpmc::Receiver<Task>, id: usize) {
  loop {
    state.idle.fetch_add(1, Ordering::AcqRel);
    let received = receiver.recv_timeout(state.keepalive);
    state.idle.fetch_sub(1, Ordering::AcqRel);
    match received {
      Ok(task) => state.execute(Some(id), task),
      Err(RecvErrorTimeout::Timeout) => {
        // `idle` no longer counts this worker, so it retires when the rest
        // of the idle population already fills the allowance.
        if state.idle.load(Ordering::Acquire) >= state.max_idle {
          break;
        }
      }
      Err(RecvErrorTimeout::Disconnected) => break,
    }
  }
  state.live.fetch_sub(1, Ordering::AcqRel);
  state.retired.fetch_add(1, Ordering::Relaxed);
  tracing::trace!(pool = %state.name, worker = id, "worker retired");
}

/// An elastic pool of named worker threads.
///
/// Workers are spawned on demand whenever a task arrives while fewer than
/// `min_idle` workers are parked on the queue, and retire once the idle
/// population exceeds `max_idle`. The queue is unbounded, so submission
/// never blocks. In synchronous mode no threads exist and every task runs
/// inline on the submitting thread, for hosts without scheduling capability
/// and for deterministic tests.
pub struct WorkerPool {
  state: Arc<PoolState>,
  sender: mpmc::Sender<Task>,
  receiver: mpmc::Receiver<Task>,
  min_idle: usize,
  synchronous: bool,
  shut: AtomicBool,
}

impl WorkerPool {
  pub fn builder(name: impl Into<String>) -> WorkerPoolBuilder {
    WorkerPoolBuilder::new(name)
  }

  /// Pool with default bounds.
  pub fn new(name: impl Into<String>) -> Self {
    WorkerPoolBuilder::new(name).into_pool()
  }

  /// Enqueues `task` under `name`, spawning a worker first when too few are
  /// idle. Never blocks.
  pub fn submit<F>(&self, name: impl Into<String>, task: F)
  where
    F: FnOnce() + Send + 'static,
  {
    let task = Task {
      name: name.into(),
      run: Box::new(task),
    };
    self.state.submitted.fetch_add(1, Ordering::Relaxed);
    if self.synchronous || self.shut.load(Ordering::Acquire) {
      // No scheduling available (or the queue is already shut down): run
      // the task right here so its promise still settles.
      self.state.execute(None, task);
      return;
    }
    if self.state.idle.load(Ordering::Acquire) < self.min_idle {
      self.spawn_worker();
    }
    let _ = self.sender.send(task);
  }

  fn spawn_worker(&self) {
    let state = self.state.clone();
    let receiver = self.receiver.clone();
    let id = state.next_worker.fetch_add(1, Ordering::Relaxed);
    let thread_name = format!("{}-{}", state.name, id);
    self.state.live.fetch_add(1, Ordering::AcqRel);
    let spawned = thread::Builder::new()
      .name(thread_name)
      .spawn(move || worker_loop(state, receiver, id));
    match spawned {
      Ok(_) => {
        self.state.spawned.fetch_add(1, Ordering::Relaxed);
      }
      Err(error) => {
        self.state.live.fetch_sub(1, Ordering::AcqRel);
        tracing::error!(pool = %self.state.name, %error, "failed to spawn worker");
      }
    }
  }

  /// Closes the queue. Queued tasks still drain and workers retire once the
  /// queue is empty; tasks submitted afterwards run inline.
  pub fn shutdown(&self) {
    self.shut.store(true, Ordering::Release);
    let _ = self.sender.close();
  }

  pub fn name(&self) -> &str {
    &self.state.name
  }

  pub fn is_synchronous(&self) -> bool {
    self.synchronous
  }

  /// Tasks waiting in the queue.
  pub fn queued(&self) -> usize {
    self.sender.len()
  }

  pub fn idle_workers(&self) -> usize {
    self.state.idle.load(Ordering::Acquire)
  }

  pub fn live_workers(&self) -> usize {
    self.state.live.load(Ordering::Acquire)
  }

  /// Names of the tasks currently being executed by workers.
  pub fn active_tasks(&self) -> Vec<String> {
    self.state.running.lock().values().cloned().collect()
  }

  pub fn tasks_submitted(&self) -> u64 {
    self.state.submitted.load(Ordering::Relaxed)
  }

  pub fn tasks_completed(&self) -> u64 {
    self.state.completed.load(Ordering::Relaxed)
  }

  pub fn tasks_panicked(&self) -> u64 {
    self.state.panicked.load(Ordering::Relaxed)
  }

  pub fn workers_spawned(&self) -> u64 {
    self.state.spawned.load(Ordering::Relaxed)
  }

  pub fn workers_retired(&self) -> u64 {
    self.state.retired.load(Ordering::Relaxed)
  }
}

impl Drop for WorkerPool {
  fn drop(&mut self) {
    let _ = self.sender.close();
  }
}

impl fmt::Debug for WorkerPool {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("WorkerPool")
      .field("name", &self.state.name)
      .field("live", &self.live_workers())
      .field("idle", &self.idle_workers())
      .field("queued", &self.queued())
      .field("synchronous", &self.synchronous)
      .finish()
  }
}

/// A builder for [`WorkerPool`].
pub struct WorkerPoolBuilder {
  name: String,
  min_idle: usize,
  max_idle: usize,
  keepalive: Duration,
  synchronous: bool,
}

impl WorkerPoolBuilder {
  fn new(name: impl Into<String>) -> Self {
    Self {
      name: name.into(),
      min_idle: DEFAULT_MIN_IDLE,
      max_idle: default_max_idle(),
      keepalive: DEFAULT_KEEPALIVE,
      synchronous: false,
    }
  }

  /// Workers are spawned while fewer than this many are idle.
  pub fn min_idle(mut self, min_idle: usize) -> Self {
    self.min_idle = min_idle;
    self
  }

  /// Idle workers retire while more than this many are parked.
  pub fn max_idle(mut self, max_idle: usize) -> Self {
    self.max_idle = max_idle;
    self
  }

  /// How long an idle worker waits for work before re-checking the bounds.
  pub fn keepalive(mut self, keepalive: Duration) -> Self {
    self.keepalive = keepalive;
    self
  }

  /// Runs every task inline on the submitting thread instead of spawning
  /// workers.
  pub fn synchronous(mut self, synchronous: bool) -> Self {
    self.synchronous = synchronous;
    self
  }

  pub fn build(self) -> Result<WorkerPool, BuildError> {
    if !self.synchronous {
      if self.min_idle == 0 {
        return Err(BuildError::ZeroMinIdle);
      }
      if self.min_idle > self.max_idle {
        return Err(BuildError::InvalidWorkerBounds {
          min_idle: self.min_idle,
          max_idle: self.max_idle,
        });
      }
      if self.keepalive.is_zero() {
        return Err(BuildError::ZeroKeepalive);
      }
    }
    Ok(self.into_pool())
  }

  fn into_pool(self) -> WorkerPool {
    let (sender, receiver) = mpmc::unbounded();
    WorkerPool {
      state: Arc::new(PoolState {
        name: self.name,
        idle: AtomicUsize::new(0),
        live: AtomicUsize::new(0),
        next_worker: AtomicUsize::new(0),
        max_idle: self.max_idle,
        keepalive: self.keepalive,
        running: Mutex::new(HashMap::default()),
        submitted: AtomicU64::new(0),
        completed: AtomicU64::new(0),
        panicked: AtomicU64::new(0),
        spawned: AtomicU64::new(0),
        retired: AtomicU64::new(0),
      }),
      sender,
      receiver,
      min_idle: self.min_idle,
      synchronous: self.synchronous,
      shut: AtomicBool::new(false),
    }
  }
}

impl fmt::Debug for WorkerPoolBuilder {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("WorkerPoolBuilder")
      .field("name", &self.name)
      .field("min_idle", &self.min_idle)
      .field("max_idle", &self.max_idle)
      .field("keepalive", &self.keepalive)
      .field("synchronous", &self.synchronous)
      .finish()
  }
}
