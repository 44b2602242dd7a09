//! An asynchronous cache for values that are expensive to produce, driven
//! by a frame-quantized virtual clock.
//!
//! # Features
//! - **Request Deduplication**: Concurrent lookups of one key share a single
//!   generator run and a single [`Promise`].
//! - **Sync & Async**: Promises can be subscribed to with callbacks, awaited,
//!   or (in tooling) blocked on.
//! - **Frame Time**: Expiry runs against a [`FrameClock`] that advances by a
//!   clamped step once per frame, so debugger pauses and slow frames cannot
//!   mass-evict entries.
//! - **Pinning**: RAII [`PinGuard`]s keep entries alive across multi-frame
//!   operations regardless of timeouts.
//! - **Elastic Workers**: Generators run on a shared [`WorkerPool`] that
//!   grows under load and shrinks when idle.
//! - **Persistence**: [`FileCache`] sections keep their artifacts on disk
//!   and survive restarts.

// Public modules that form the API
pub mod clock;
pub mod data;
pub mod dual;
pub mod error;
pub mod file_cache;
pub mod maps;
pub mod metrics;
pub mod pool;
pub mod promise;
pub mod registry;
pub mod section;

// Re-export the primary user-facing types for convenience
pub use clock::FrameClock;
pub use data::CacheData;
pub use dual::DualCacheSection;
pub use error::{BuildError, FileCacheError, GenerateError};
pub use file_cache::{hashed_file_name, FileCache, FileCacheConfig, FileSource, NamedTempFile};
pub use maps::KeyPairMap;
pub use metrics::MetricsSnapshot;
pub use pool::{WorkerPool, WorkerPoolBuilder};
pub use promise::{PinGuard, Promise, PromiseState};
pub use registry::{CacheRegistry, MaintainedCache, RegistryBuilder};
pub use section::{CacheSection, SectionConfig};
