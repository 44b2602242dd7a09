use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

/// Contract for values held by the cache.
///
/// `destroy` releases whatever the value owns beyond plain memory (GPU
/// handles, file locks, pooled buffers). The cache calls it exactly once per
/// evicted promise while other holders of the same `Arc` may still exist,
/// so implementations must be idempotent and safe to run concurrently with
/// readers. The default no-op is correct for plain data.
pub trait CacheData: Send + Sync + 'static {
  fn destroy(&self) {}
}

macro_rules! plain_cache_data {
  ($($ty:ty),* $(,)?) => {
    $(impl CacheData for $ty {})*
  };
}

plain_cache_data!(
  (),
  bool,
  char,
  u8,
  u16,
  u32,
  u64,
  u128,
  usize,
  i8,
  i16,
  i32,
  i64,
  i128,
  isize,
  f32,
  f64,
  String,
  &'static str,
  PathBuf,
  Duration,
);

impl<T: CacheData> CacheData for Vec<T> {
  fn destroy(&self) {
    for item in self {
      item.destroy();
    }
  }
}

impl<T: CacheData> CacheData for Option<T> {
  fn destroy(&self) {
    if let Some(item) = self {
      item.destroy();
    }
  }
}

impl<T: CacheData> CacheData for Box<T> {
  fn destroy(&self) {
    (**self).destroy();
  }
}

// Forwarding through `Arc` relies on `destroy` being idempotent: several
// cached values sharing one payload will each forward to it.
impl<T: CacheData> CacheData for Arc<T> {
  fn destroy(&self) {
    (**self).destroy();
  }
}
