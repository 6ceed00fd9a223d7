//! Declarative cache configuration.
//!
//! [`CacheSettings`] deserializes from any serde format and turns into a
//! [`CacheBuilder`] wired with memory backends. Durations are written as
//! strings in any form [`parse_duration`](crate::ttl::parse_duration)
//! accepts, e.g. `"10m"`, `"1h 30m"` or `"90"`.
//!
//! ```json
//! {
//!   "safe": true,
//!   "transaction_mode": "serializable",
//!   "transaction_timeout": "5s",
//!   "memory": { "capacity": 10000, "janitor_tick": "500ms" },
//!   "prefixes": { "sessions:": { "name": "sessions", "capacity": 500 } }
//! }
//! ```

use crate::backend::{MemoryBackend, Tracing};
use crate::cache::{Cache, CacheBuilder};
use crate::error::{BuildError, Error};
use crate::lock::Backoff;
use crate::transaction::TransactionMode;
use crate::ttl::parse_duration;

use std::collections::BTreeMap;
use std::time::Duration;

use serde::Deserialize;

/// Errors turning settings into a cache.
#[derive(Debug, thiserror::Error)]
pub enum SettingsError {
  #[error("settings could not be parsed: {0}")]
  Parse(String),
  #[error(transparent)]
  Value(#[from] Error),
  #[error(transparent)]
  Build(#[from] BuildError),
}

#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct CacheSettings {
  /// Suppress backend unavailability.
  #[serde(default)]
  pub safe: bool,
  /// Log every backend command at trace level.
  #[serde(default)]
  pub trace_commands: bool,
  #[serde(default)]
  pub transaction_mode: TransactionMode,
  #[serde(default)]
  pub transaction_timeout: Option<String>,
  #[serde(default)]
  pub lock_backoff: Option<BackoffSettings>,
  /// The default backend.
  #[serde(default)]
  pub memory: MemorySettings,
  /// Additional memory backends by key prefix.
  #[serde(default)]
  pub prefixes: BTreeMap<String, MemorySettings>,
}

#[derive(Debug, Clone, Default, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct MemorySettings {
  #[serde(default)]
  pub name: Option<String>,
  #[serde(default)]
  pub capacity: Option<usize>,
  #[serde(default)]
  pub shards: Option<usize>,
  /// Sweep interval, or `"off"` to disable the janitor.
  #[serde(default)]
  pub janitor_tick: Option<String>,
}

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct BackoffSettings {
  pub initial: String,
  #[serde(default = "default_factor")]
  pub factor: u32,
  pub max: String,
}

fn default_factor() -> u32 {
  2
}

impl CacheSettings {
  pub fn from_json(text: &str) -> Result<Self, SettingsError> {
    serde_json::from_str(text).map_err(|e| SettingsError::Parse(e.to_string()))
  }

  /// A builder configured from these settings. Codecs, clocks, spawners and
  /// failover predicates can still be set on it.
  pub fn builder(&self) -> Result<CacheBuilder, SettingsError> {
    let mut builder = Cache::builder()
      .safe(self.safe)
      .transaction_mode(self.transaction_mode)
      .backend(self.memory.build()?);
    for (prefix, memory) in &self.prefixes {
      builder = builder.backend_with_prefix(prefix.clone(), memory.build()?);
    }
    if self.trace_commands {
      builder = builder.interceptor(Tracing);
    }
    if let Some(timeout) = &self.transaction_timeout {
      builder = builder.transaction_timeout(parse_duration(timeout)?);
    }
    if let Some(backoff) = &self.lock_backoff {
      builder = builder.lock_backoff(backoff.resolve()?);
    }
    Ok(builder)
  }

  pub fn build(&self) -> Result<Cache, SettingsError> {
    Ok(self.builder()?.build()?)
  }
}

impl MemorySettings {
  fn build(&self) -> Result<MemoryBackend, SettingsError> {
    let mut builder = MemoryBackend::builder();
    if let Some(name) = &self.name {
      builder = builder.name(name.clone());
    }
    if let Some(capacity) = self.capacity {
      builder = builder.capacity(capacity);
    }
    if let Some(shards) = self.shards {
      builder = builder.shards(shards);
    }
    if let Some(tick) = &self.janitor_tick {
      builder = builder.janitor_tick_interval(parse_tick(tick)?);
    }
    Ok(builder.build()?)
  }
}

impl BackoffSettings {
  fn resolve(&self) -> Result<Backoff, Error> {
    Ok(Backoff {
      initial: parse_duration(&self.initial)?,
      factor: self.factor,
      max: parse_duration(&self.max)?,
    })
  }
}

fn parse_tick(tick: &str) -> Result<Option<Duration>, Error> {
  match tick.trim() {
    "off" | "none" => Ok(None),
    tick => parse_duration(tick).map(Some),
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use pretty_assertions::assert_eq;

  #[test]
  fn parses_a_full_document() {
    let settings = CacheSettings::from_json(
      r#"{
        "safe": true,
        "transaction_mode": "serializable",
        "transaction_timeout": "5s",
        "lock_backoff": { "initial": "10ms", "max": "1s" },
        "memory": { "capacity": 100, "janitor_tick": "off" },
        "prefixes": { "sessions:": { "name": "sessions", "shards": 2 } }
      }"#,
    )
    .unwrap();

    assert!(settings.safe);
    assert_eq!(settings.transaction_mode, TransactionMode::Serializable);
    assert_eq!(settings.memory.capacity, Some(100));
    assert_eq!(settings.prefixes["sessions:"].name.as_deref(), Some("sessions"));
    assert_eq!(
      settings.lock_backoff.as_ref().unwrap().resolve().unwrap(),
      Backoff {
        initial: Duration::from_millis(10),
        factor: 2,
        max: Duration::from_secs(1),
      }
    );
    assert_eq!(parse_tick("off").unwrap(), None);
  }

  #[test]
  fn unknown_fields_are_rejected() {
    let err = CacheSettings::from_json(r#"{ "sharding": 3 }"#).unwrap_err();
    assert!(matches!(err, SettingsError::Parse(_)));
  }

  #[test]
  fn bad_durations_surface_on_build() {
    let settings = CacheSettings::from_json(r#"{ "transaction_timeout": "whenever" }"#).unwrap();
    assert!(matches!(
      settings.builder(),
      Err(SettingsError::Value(Error::InvalidTtl(_)))
    ));
  }

  #[test]
  fn zero_capacity_is_a_build_error() {
    let settings = CacheSettings::from_json(r#"{ "memory": { "capacity": 0 } }"#).unwrap();
    assert!(matches!(
      settings.builder(),
      Err(SettingsError::Build(BuildError::ZeroCapacity))
    ));
  }
}
