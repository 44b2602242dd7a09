use std::any::Any;
use std::io;

use thiserror::Error;

/// Errors reported while validating cache configuration.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum BuildError {
  #[error("worker pool bounds are invalid: min_idle {min_idle} exceeds max_idle {max_idle}")]
  InvalidWorkerBounds { min_idle: usize, max_idle: usize },
  #[error("worker pool needs an idle worker target of at least one")]
  ZeroMinIdle,
  #[error("worker keepalive must be non-zero")]
  ZeroKeepalive,
  #[error("max clock step must be non-zero")]
  ZeroClockStep,
}

/// Outcome a generator reports when it cannot resolve a value.
///
/// The dispatch wrapper turns every variant into an absent cache entry, so
/// callers of the lookup operations observe "not found" rather than errors;
/// the variants only control how the failure is logged.
#[derive(Debug, Error)]
pub enum GenerateError {
  /// The backing resource does not exist. Logged as a warning, message only.
  #[error("missing source: {0}")]
  MissingSource(String),
  /// An expected short-circuit (shutdown, superseded request). Not logged.
  #[error("generation cancelled")]
  Cancelled,
  /// Any other generation failure. Logged with full detail.
  #[error("generation failed: {0}")]
  Failed(#[source] Box<dyn std::error::Error + Send + Sync>),
}

impl GenerateError {
  /// Wraps an arbitrary error as a generation failure.
  pub fn failed<E>(error: E) -> Self
  where
    E: Into<Box<dyn std::error::Error + Send + Sync>>,
  {
    GenerateError::Failed(error.into())
  }
}

impl From<io::Error> for GenerateError {
  fn from(error: io::Error) -> Self {
    match error.kind() {
      io::ErrorKind::NotFound => GenerateError::MissingSource(error.to_string()),
      _ => GenerateError::Failed(Box::new(error)),
    }
  }
}

/// Errors reported by the disk-backed cache outside of generation.
#[derive(Debug, Error)]
pub enum FileCacheError {
  #[error("cache io: {0}")]
  Io(#[from] io::Error),
  #[error("cache metadata: {0}")]
  Metadata(#[from] serde_json::Error),
}

/// Best-effort text of a caught panic payload.
pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> &str {
  if let Some(message) = payload.downcast_ref::<&str>() {
    message
  } else if let Some(message) = payload.downcast_ref::<String>() {
    message
  } else {
    "non-string panic payload"
  }
}
