use std::fmt;

use thiserror::Error;

/// Errors produced by backends, locks and policy strategies.
///
/// Every variant is an ordinary, recoverable failure. Policy rejections
/// (`RateLimit`, `CircuitBreakerOpen`, `PerfDegradation`) are expected signals,
/// not bugs.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Error {
  /// Storage could not be reached or refused the command.
  #[error("backend `{backend}` unavailable: {reason}")]
  BackendUnavailable { backend: String, reason: String },

  /// A lock could not be claimed before the wait timeout elapsed.
  #[error("timed out waiting for lock `{key}`")]
  LockTimeout { key: String },

  /// The lock was already expired or held by another token on release.
  #[error("lock `{key}` was lost before release")]
  LockLost { key: String },

  /// The call was rejected by a rate limiter.
  #[error("rate limit reached for `{key}`")]
  RateLimit { key: String },

  /// The call was short-circuited by an open circuit breaker.
  #[error("circuit breaker open for `{key}`")]
  CircuitBreakerOpen { key: String },

  /// Calls for `key` are refused for a while after a slow one.
  #[error("performance degraded for `{key}`")]
  PerfDegradation { key: String },

  #[error("invalid ttl `{0}`")]
  InvalidTtl(String),

  /// A strategy or backend option was out of range.
  #[error("invalid option: {0}")]
  InvalidOption(String),

  #[error("invalid key template `{template}`: {reason}")]
  InvalidKeyTemplate { template: String, reason: String },

  #[error("unknown key transform `{0}`")]
  UnknownTransform(String),

  /// A value could not be encoded or decoded.
  #[error("codec `{tag}` failed: {reason}")]
  Codec { tag: String, reason: String },

  /// The stored value at `key` is not of the kind the command expects.
  #[error("wrong kind of value stored at `{key}`")]
  WrongType { key: String },

  /// An increment would take the counter at `key` past the `i64` range.
  #[error("increment of `{key}` would overflow")]
  Overflow { key: String },

  /// No backend was registered for a prefix matching `key`.
  #[error("no backend configured for `{key}`")]
  NotConfigured { key: String },

  /// The backend was closed and no longer accepts commands.
  #[error("backend `{0}` is closed")]
  Closed(String),

  /// An interceptor answered a command with a reply of the wrong shape.
  #[error("unexpected reply to `{0}`")]
  UnexpectedReply(String),
}

impl Error {
  pub(crate) fn unavailable(backend: &str, reason: impl fmt::Display) -> Self {
    Error::BackendUnavailable {
      backend: backend.to_string(),
      reason: reason.to_string(),
    }
  }

  pub(crate) fn codec(tag: &str, reason: impl fmt::Display) -> Self {
    Error::Codec {
      tag: tag.to_string(),
      reason: reason.to_string(),
    }
  }

  /// Returns `true` for storage I/O failures, the only kind `SafeMode` suppresses.
  pub fn is_unavailable(&self) -> bool {
    matches!(self, Error::BackendUnavailable { .. } | Error::Closed(_))
  }
}

pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur when building a cache or a backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BuildError {
  /// The cache was built without any backend.
  NoBackend,
  /// Two backends were registered under the same key prefix.
  DuplicatePrefix(String),
  /// The memory backend was configured with a capacity of zero.
  ZeroCapacity,
  /// The memory backend was configured with zero shards.
  ZeroShards,
}

impl fmt::Display for BuildError {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      BuildError::NoBackend => write!(f, "a cache needs at least one backend"),
      BuildError::DuplicatePrefix(prefix) => {
        write!(f, "a backend is already registered for prefix `{}`", prefix)
      }
      BuildError::ZeroCapacity => write!(f, "memory backend capacity cannot be zero"),
      BuildError::ZeroShards => write!(f, "shard count cannot be zero"),
    }
  }
}

impl std::error::Error for BuildError {}
