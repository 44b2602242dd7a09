use crate::data::CacheData;
use crate::error::{FileCacheError, GenerateError};
use crate::metrics::MetricsSnapshot;
use crate::promise::Promise;
use crate::registry::{CacheRegistry, MaintainedCache};
use crate::section::{CacheSection, SectionConfig};

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::fmt::Write as _;
use std::fs;
use std::hash::Hash;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use parking_lot::Mutex;
use sha2::{Digest, Sha256};

pub use tempfile::NamedTempFile;

/// Files unused for this long are deleted the next time the cache starts.
pub const DEFAULT_STALENESS: Duration = Duration::from_secs(7 * 24 * 60 * 60);

/// Stable file name for an arbitrary key string: the lowercase hex SHA-256
/// digest of the input. Useful when keys contain paths, URLs or other
/// characters that do not belong in a file name.
pub fn hashed_file_name(input: &str) -> String {
  let digest = Sha256::digest(input.as_bytes());
  let mut name = String::with_capacity(digest.len() * 2);
  for byte in digest {
    let _ = write!(name, "{byte:02x}");
  }
  name
}

/// How a [`FileCache`] produces and consumes its on-disk artifacts.
///
/// `generate` writes the expensive-to-build artifact; `load` turns the
/// artifact into the in-memory value. Keeping the two apart lets a restart
/// skip generation entirely and go straight to `load`.
pub trait FileSource<K, V>: Send + Sync + 'static {
  /// File name (not path) of the artifact for `key`. Must be stable across
  /// runs; see [`hashed_file_name`] for unwieldy keys.
  fn file_name(&self, key: &K) -> String;

  /// Produces the artifact for `key` into `out`. The file only becomes
  /// visible under its final name after this returns successfully.
  fn generate(&self, key: &K, out: &mut NamedTempFile) -> Result<(), GenerateError>;

  /// Turns the artifact into the cached value. `file` is `None` when
  /// generation reported a missing source; implementations may return a
  /// fallback value, or `Ok(None)` to cache the absence.
  fn load(&self, key: &K, file: Option<&Path>) -> Result<Option<V>, GenerateError>;
}

/// Tuning for a [`FileCache`].
#[derive(Clone, Debug)]
pub struct FileCacheConfig {
  /// Files unused for longer than this are deleted on startup.
  pub staleness: Duration,
  pub section: SectionConfig,
}

impl Default for FileCacheConfig {
  fn default() -> Self {
    Self {
      staleness: DEFAULT_STALENESS,
      section: SectionConfig::default(),
    }
  }
}

/// A cache section whose artifacts also live on disk and survive restarts.
///
/// Lookups behave exactly like [`CacheSection::get_entry`], except the
/// generator is supplied by a [`FileSource`]: when the artifact file already
/// exists it is loaded directly, otherwise it is generated into a temp file
/// and atomically moved into place first. A JSON index next to the cache
/// folder records when each file was last used; files unused for longer
/// than the configured staleness are pruned at startup, as are files the
/// index does not know about.
pub struct FileCache<K, V: CacheData> {
  section: Arc<CacheSection<K, V>>,
  source: Arc<dyn FileSource<K, V>>,
  folder: PathBuf,
  index_path: PathBuf,
  /// File name → epoch millis of last use.
  index: Mutex<HashMap<String, u64>>,
  dirty: AtomicBool,
  staleness: Duration,
}

impl<K, V> FileCache<K, V>
where
  K: Eq + Hash + Clone + fmt::Debug + Send + Sync + 'static,
  V: CacheData,
{
  /// Opens (or creates) the cache folder `<root>/<name>/` and its index,
  /// prunes stale files and registers the cache for the frame sweep.
  pub fn new<S>(
    name: impl Into<String>,
    root: impl AsRef<Path>,
    source: S,
    registry: &CacheRegistry,
  ) -> Result<Arc<Self>, FileCacheError>
  where
    S: FileSource<K, V>,
  {
    Self::with_config(name, root, source, FileCacheConfig::default(), registry)
  }

  pub fn with_config<S>(
    name: impl Into<String>,
    root: impl AsRef<Path>,
    source: S,
    config: FileCacheConfig,
    registry: &CacheRegistry,
  ) -> Result<Arc<Self>, FileCacheError>
  where
    S: FileSource<K, V>,
  {
    let name = name.into();
    let root = root.as_ref();
    let folder = root.join(&name);
    fs::create_dir_all(&folder)?;
    let index_path = root.join(format!("{name}.json"));

    let mut index = load_index(&index_path);
    prune_stale(&folder, &mut index, config.staleness)?;

    let cache = Arc::new(Self {
      section: CacheSection::detached(name, config.section, registry),
      source: Arc::new(source),
      folder,
      index_path,
      index: Mutex::new(index),
      dirty: AtomicBool::new(false),
      staleness: config.staleness,
    });
    cache.flush_index()?;
    let weak = Arc::downgrade(&cache);
    registry.register(weak);
    Ok(cache)
  }

  /// Returns the promise for `key`, generating or loading its file on the
  /// worker pool when no live entry exists yet.
  pub fn get_file(self: &Arc<Self>, key: K, timeout: Duration) -> Arc<Promise<V>> {
    let cache = self.clone();
    self.section.get_entry(key, timeout, move |key, promise| {
      let value = cache.produce(key)?;
      promise.set_value(value);
      Ok(())
    })
  }

  /// Blocking variant of [`get_file`] for tooling and tests: the returned
  /// promise is settled.
  ///
  /// [`get_file`]: FileCache::get_file
  pub fn get_file_sync(self: &Arc<Self>, key: K, timeout: Duration) -> Arc<Promise<V>> {
    let cache = self.clone();
    self.section.get_entry_sync(key, timeout, move |key, promise| {
      let value = cache.produce(key)?;
      promise.set_value(value);
      Ok(())
    })
  }

  /// Returns the existing promise for `key` without generating anything.
  pub fn get_entry_without_generator(
    &self,
    key: &K,
    extend_by: Duration,
  ) -> Option<Arc<Promise<V>>> {
    self.section.get_entry_without_generator(key, extend_by)
  }

  /// True when `key` holds a settled in-memory value. The on-disk artifact
  /// alone does not count; it only shortcuts the next generation.
  pub fn has_entry(&self, key: &K) -> bool {
    self.section.has_entry(key)
  }

  /// Removes the in-memory entry, the artifact file and its index record.
  /// Returns whether anything existed.
  pub fn remove(&self, key: &K) -> Result<bool, FileCacheError> {
    let removed = self.section.remove_entry(key);
    let file_name = self.source.file_name(key);
    if self.index.lock().remove(&file_name).is_some() {
      self.dirty.store(true, Ordering::Release);
    }
    match fs::remove_file(self.folder.join(&file_name)) {
      Ok(()) => Ok(true),
      Err(error) if error.kind() == io::ErrorKind::NotFound => Ok(removed),
      Err(error) => Err(error.into()),
    }
  }

  /// The path the artifact for `key` lives at (whether or not it exists).
  pub fn path_for(&self, key: &K) -> PathBuf {
    self.folder.join(self.source.file_name(key))
  }

  #[inline]
  pub fn folder(&self) -> &Path {
    &self.folder
  }

  #[inline]
  pub fn name(&self) -> &str {
    self.section.name()
  }

  #[inline]
  pub fn staleness(&self) -> Duration {
    self.staleness
  }

  pub fn len(&self) -> usize {
    self.section.len()
  }

  pub fn is_empty(&self) -> bool {
    self.section.is_empty()
  }

  pub fn metrics(&self) -> MetricsSnapshot {
    self.section.metrics()
  }

  /// Builds the value for `key`, reusing the on-disk artifact when present.
  fn produce(&self, key: &K) -> Result<Option<V>, GenerateError> {
    let file_name = self.source.file_name(key);
    let target = self.folder.join(&file_name);
    let file = match self.ensure_file(key, &target) {
      Ok(()) => {
        self.touch(&file_name);
        Some(target.as_path())
      }
      Err(GenerateError::MissingSource(message)) => {
        tracing::warn!(cache = %self.section.name(), "{}", message);
        None
      }
      Err(error) => return Err(error),
    };
    self.source.load(key, file)
  }

  fn ensure_file(&self, key: &K, target: &Path) -> Result<(), GenerateError> {
    if target.exists() {
      return Ok(());
    }
    let mut temp = NamedTempFile::new_in(&self.folder).map_err(GenerateError::failed)?;
    self.source.generate(key, &mut temp)?;
    persist_temp(temp, target).map_err(GenerateError::failed)?;
    Ok(())
  }

  fn touch(&self, file_name: &str) {
    self.index.lock().insert(file_name.to_owned(), epoch_millis());
    self.dirty.store(true, Ordering::Release);
  }

  /// Writes the index when it changed since the last flush. Called from
  /// the frame sweep, so at most one write happens per frame.
  fn flush_if_dirty(&self) {
    if !self.dirty.swap(false, Ordering::AcqRel) {
      return;
    }
    if let Err(error) = self.flush_index() {
      self.dirty.store(true, Ordering::Release);
      tracing::error!(
        cache = %self.section.name(),
        %error,
        "failed to write cache index"
      );
    }
  }
}

impl<K, V: CacheData> FileCache<K, V> {
  fn flush_index(&self) -> Result<(), FileCacheError> {
    let serialized = {
      let index = self.index.lock();
      serde_json::to_vec_pretty(&*index)?
    };
    fs::write(&self.index_path, serialized)?;
    Ok(())
  }
}

impl<K, V> MaintainedCache for FileCache<K, V>
where
  K: Eq + Hash + Clone + fmt::Debug + Send + Sync + 'static,
  V: CacheData,
{
  fn name(&self) -> &str {
    self.section.name()
  }

  fn update(&self) {
    self.section.update();
    self.flush_if_dirty();
  }

  /// Clears the in-memory entries. Artifact files stay on disk; surviving a
  /// restart is the point of this cache.
  fn clear(&self) {
    self.section.clear();
  }

  fn len(&self) -> usize {
    self.section.len()
  }
}

impl<K, V: CacheData> Drop for FileCache<K, V> {
  fn drop(&mut self) {
    if !self.dirty.swap(false, Ordering::AcqRel) {
      return;
    }
    if let Err(error) = self.flush_index() {
      tracing::error!(path = %self.index_path.display(), %error, "failed to write cache index");
    }
  }
}

impl<K, V> fmt::Debug for FileCache<K, V>
where
  K: Eq + Hash + Clone + fmt::Debug + Send + Sync + 'static,
  V: CacheData,
{
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("FileCache")
      .field("folder", &self.folder)
      .field("entries", &self.section.len())
      .finish()
  }
}

fn epoch_millis() -> u64 {
  SystemTime::now()
    .duration_since(UNIX_EPOCH)
    .map_or(0, |elapsed| elapsed.as_millis() as u64)
}

/// Moves a finished temp file to its final name. The cache folder can
/// vanish between startup and persist when an external cleaner runs, so a
/// failed persist recreates the folder and retries once.
fn persist_temp(temp: NamedTempFile, target: &Path) -> io::Result<()> {
  match temp.persist(target) {
    Ok(_) => Ok(()),
    Err(persist_error) => {
      if let Some(parent) = target.parent() {
        fs::create_dir_all(parent)?;
      }
      persist_error
        .file
        .persist(target)
        .map(|_| ())
        .map_err(|retry_error| retry_error.error)
    }
  }
}

fn load_index(path: &Path) -> HashMap<String, u64> {
  match fs::read(path) {
    Ok(bytes) => match serde_json::from_slice(&bytes) {
      Ok(index) => index,
      Err(error) => {
        tracing::warn!(
          path = %path.display(),
          %error,
          "cache index is corrupt, starting fresh"
        );
        HashMap::new()
      }
    },
    Err(error) if error.kind() == io::ErrorKind::NotFound => HashMap::new(),
    Err(error) => {
      tracing::warn!(
        path = %path.display(),
        %error,
        "cache index is unreadable, starting fresh"
      );
      HashMap::new()
    }
  }
}

/// Deletes files that have not been used within `staleness`, along with
/// files the index does not know about (leftovers of a crashed run), and
/// drops index records whose file is gone.
fn prune_stale(
  folder: &Path,
  index: &mut HashMap<String, u64>,
  staleness: Duration,
) -> Result<(), FileCacheError> {
  let cutoff = epoch_millis().saturating_sub(staleness.as_millis() as u64);
  let mut kept = HashSet::new();
  let mut removed = 0usize;
  let mut bytes = 0u64;
  for entry in fs::read_dir(folder)? {
    let entry = entry?;
    let path = entry.path();
    if !path.is_file() {
      continue;
    }
    let file_name = entry.file_name().to_string_lossy().into_owned();
    let fresh = index.get(&file_name).map_or(false, |&last_used| last_used >= cutoff);
    if fresh {
      kept.insert(file_name);
      continue;
    }
    if let Ok(metadata) = entry.metadata() {
      bytes += metadata.len();
    }
    match fs::remove_file(&path) {
      Ok(()) => removed += 1,
      Err(error) => {
        tracing::warn!(path = %path.display(), %error, "failed to remove stale cache file");
      }
    }
  }
  index.retain(|file_name, _| kept.contains(file_name));
  if removed > 0 {
    tracing::info!(
      folder = %folder.display(),
      removed,
      bytes,
      retained = kept.len(),
      "pruned stale cache files"
    );
  }
  Ok(())
}
