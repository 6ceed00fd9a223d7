//! The storage contract every backend satisfies.
//!
//! All operations are asynchronous and may fail with
//! [`Error::BackendUnavailable`]. Values are opaque byte vectors; counters are
//! stored as decimal text so `get` on a counter key returns its digits.

pub mod interceptor;
pub mod memory;
pub(crate) mod router;

use crate::error::{Error, Result};

use std::collections::HashSet;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::stream::BoxStream;
use futures_util::StreamExt;
use regex::Regex;

pub use interceptor::{Command, DisableControl, Interceptor, Next, Reply, Request, SafeMode, Tracing};
pub use memory::{MemoryBackend, MemoryBackendBuilder};

/// Condition attached to a write.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Exist {
  /// Write unconditionally.
  #[default]
  Any,
  /// Write only when the key is already present.
  MustExist,
  /// Write only when the key is absent. This is the primitive locks are built on.
  MustNotExist,
}

/// Remaining lifetime of a key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Expiry {
  /// The key does not exist.
  Missing,
  /// The key exists and never expires.
  Persistent,
  /// The key expires after the given duration.
  In(Duration),
}

impl Expiry {
  /// The remaining duration, if the key expires.
  pub fn remaining(&self) -> Option<Duration> {
    match self {
      Expiry::In(d) => Some(*d),
      _ => None,
    }
  }
}

/// An asynchronous key-value store.
#[async_trait]
pub trait Backend: Send + Sync + 'static {
  /// A short name used in logs and observations.
  fn name(&self) -> &str;

  async fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;

  async fn get_many(&self, keys: &[String]) -> Result<Vec<Option<Vec<u8>>>>;

  /// Writes `value`, honoring `exist`. Returns whether the write happened.
  async fn set(&self, key: &str, value: Vec<u8>, ttl: Option<Duration>, exist: Exist) -> Result<bool>;

  async fn set_many(&self, pairs: Vec<(String, Vec<u8>)>, ttl: Option<Duration>) -> Result<()>;

  /// Adds `by` to the counter at `key` and returns the new count. A missing
  /// key counts from zero; `ttl` is applied only when this increment created
  /// the counter.
  async fn incr(&self, key: &str, by: i64, ttl: Option<Duration>) -> Result<i64>;

  async fn expire(&self, key: &str, ttl: Duration) -> Result<bool>;

  async fn get_expire(&self, key: &str) -> Result<Expiry>;

  async fn delete(&self, key: &str) -> Result<bool>;

  async fn delete_many(&self, keys: &[String]) -> Result<u64>;

  /// Deletes every key matching the glob `pattern` (`*` and `?`).
  async fn delete_match(&self, pattern: &str) -> Result<u64>;

  /// Lazily yields the keys matching `pattern`. Each call starts a new scan.
  fn scan(&self, pattern: &str) -> BoxStream<'static, Result<String>>;

  async fn exists(&self, key: &str) -> Result<bool>;

  async fn get_keys_count(&self) -> Result<u64>;

  /// Round-trips `message` (or `"PONG"`) to prove the backend is reachable.
  async fn ping(&self, message: Option<&str>) -> Result<String>;

  async fn clear(&self) -> Result<()>;

  /// Releases the backend. Later calls fail.
  async fn close(&self) -> Result<()>;

  /// Deletes `key` only if it currently holds `value`.
  ///
  /// The default is a read followed by a delete; backends with a native
  /// compare-and-delete should override it.
  async fn delete_if_eq(&self, key: &str, value: &[u8]) -> Result<bool> {
    match self.get(key).await? {
      Some(current) if current == value => self.delete(key).await,
      _ => Ok(false),
    }
  }

  /// Adds members to the set stored at `key`, returning how many were new.
  async fn set_add(&self, key: &str, members: &[String], ttl: Option<Duration>) -> Result<u64> {
    let mut set = read_set(self, key).await?;
    let before = set.len();
    set.extend(members.iter().cloned());
    let added = (set.len() - before) as u64;
    write_set(self, key, &set, ttl).await?;
    Ok(added)
  }

  /// Removes members from the set stored at `key`.
  async fn set_remove(&self, key: &str, members: &[String]) -> Result<u64> {
    let mut set = read_set(self, key).await?;
    let removed = members.iter().filter(|m| set.remove(*m)).count() as u64;
    if set.is_empty() {
      self.delete(key).await?;
    } else {
      let ttl = self.get_expire(key).await?.remaining();
      write_set(self, key, &set, ttl).await?;
    }
    Ok(removed)
  }

  /// Removes and returns up to `count` members of the set at `key`.
  async fn set_pop(&self, key: &str, count: usize) -> Result<Vec<String>> {
    let set = read_set(self, key).await?;
    let popped: Vec<String> = set.iter().take(count).cloned().collect();
    if !popped.is_empty() {
      self.set_remove(key, &popped).await?;
    }
    Ok(popped)
  }

  /// Reads the bits at `indexes` from the bit array at `key`.
  async fn get_bits(&self, key: &str, indexes: &[u64]) -> Result<Vec<bool>> {
    let bytes = self.get(key).await?.unwrap_or_default();
    Ok(indexes.iter().map(|&i| bit_at(&bytes, i)).collect())
  }

  /// Sets the bits at `indexes` in the bit array at `key`.
  async fn set_bits(&self, key: &str, indexes: &[u64], ttl: Option<Duration>) -> Result<()> {
    let mut bytes = self.get(key).await?.unwrap_or_default();
    for &index in indexes {
      set_bit(&mut bytes, index);
    }
    self.set(key, bytes, ttl, Exist::Any).await.map(|_| ())
  }

  /// Returns every key matching `pattern` together with its value.
  async fn get_match(&self, pattern: &str) -> Result<Vec<(String, Vec<u8>)>> {
    let keys: Vec<String> = self
      .scan(pattern)
      .collect::<Vec<_>>()
      .await
      .into_iter()
      .collect::<Result<_>>()?;
    let values = self.get_many(&keys).await?;
    Ok(
      keys
        .into_iter()
        .zip(values)
        .filter_map(|(k, v)| v.map(|v| (k, v)))
        .collect(),
    )
  }
}

async fn read_set<B: Backend + ?Sized>(backend: &B, key: &str) -> Result<HashSet<String>> {
  match backend.get(key).await? {
    Some(bytes) => serde_json::from_slice(&bytes).map_err(|_| Error::WrongType {
      key: key.to_string(),
    }),
    None => Ok(HashSet::new()),
  }
}

async fn write_set<B: Backend + ?Sized>(
  backend: &B,
  key: &str,
  set: &HashSet<String>,
  ttl: Option<Duration>,
) -> Result<()> {
  let bytes = serde_json::to_vec(set).map_err(|e| Error::codec("json", e))?;
  backend.set(key, bytes, ttl, Exist::Any).await.map(|_| ())
}

#[inline]
pub(crate) fn bit_at(bytes: &[u8], index: u64) -> bool {
  let byte = (index / 8) as usize;
  bytes
    .get(byte)
    .map(|b| b & (1 << (index % 8)) != 0)
    .unwrap_or(false)
}

#[inline]
pub(crate) fn set_bit(bytes: &mut Vec<u8>, index: u64) {
  let byte = (index / 8) as usize;
  if bytes.len() <= byte {
    bytes.resize(byte + 1, 0);
  }
  bytes[byte] |= 1 << (index % 8);
}

/// A compiled glob pattern supporting `*` (any run) and `?` (one character).
#[derive(Debug, Clone)]
pub struct Glob(Regex);

impl Glob {
  pub fn new(pattern: &str) -> Result<Self> {
    let mut source = String::with_capacity(pattern.len() + 8);
    source.push('^');
    for ch in pattern.chars() {
      match ch {
        '*' => source.push_str(".*"),
        '?' => source.push('.'),
        other => source.push_str(&regex::escape(other.encode_utf8(&mut [0u8; 4]))),
      }
    }
    source.push('$');
    Regex::new(&source)
      .map(Glob)
      .map_err(|e| Error::InvalidKeyTemplate {
        template: pattern.to_string(),
        reason: e.to_string(),
      })
  }

  #[inline]
  pub fn matches(&self, key: &str) -> bool {
    self.0.is_match(key)
  }

  /// Returns `true` when the pattern contains no wildcard.
  pub fn is_literal(pattern: &str) -> bool {
    !pattern.contains(['*', '?'])
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn glob_wildcards() {
    let glob = Glob::new("user:*:name?").unwrap();
    assert!(glob.matches("user:1:name1"));
    assert!(glob.matches("user::nameX"));
    assert!(!glob.matches("user:1:name"));
    assert!(!glob.matches("xuser:1:name1"));
  }

  #[test]
  fn glob_escapes_regex_syntax() {
    let glob = Glob::new("a.b+(c)*").unwrap();
    assert!(glob.matches("a.b+(c)tail"));
    assert!(!glob.matches("aXb+(c)tail"));
    assert!(Glob::is_literal("a.b"));
    assert!(!Glob::is_literal("a*"));
  }

  #[test]
  fn bit_helpers() {
    let mut bytes = Vec::new();
    set_bit(&mut bytes, 0);
    set_bit(&mut bytes, 13);
    assert_eq!(bytes.len(), 2);
    assert!(bit_at(&bytes, 0));
    assert!(bit_at(&bytes, 13));
    assert!(!bit_at(&bytes, 12));
    assert!(!bit_at(&bytes, 999));
  }
}
