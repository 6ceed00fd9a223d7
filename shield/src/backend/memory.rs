//! An in-process backend.
//!
//! Keys are spread over independently locked shards. Each shard holds raw
//! values, string sets (tag membership) and bit arrays (bloom filters) side by
//! side; using a key as the wrong kind fails with [`Error::WrongType`].
//! Expired entries are never returned and are swept by a background janitor.

use crate::backend::{bit_at, set_bit, Backend, Exist, Expiry, Glob};
use crate::clock;
use crate::error::{BuildError, Error, Result};
use crate::task::janitor::Janitor;

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use crossbeam_utils::CachePadded;
use futures_util::stream::{self, BoxStream, StreamExt};
use parking_lot::{Mutex, RwLock};
use rand::Rng;

/// Entries inspected when a full shard needs a victim.
const EVICTION_SAMPLE_SIZE: usize = 5;

enum Data {
  Raw(Vec<u8>),
  Set(HashSet<String>),
  Bits(Vec<u8>),
}

struct Slot {
  data: Data,
  /// Monotonic deadline, as a duration since the crate epoch.
  expires_at: Option<Duration>,
  last_access: AtomicU64,
}

impl Slot {
  fn new(data: Data, ttl: Option<Duration>, now: Duration) -> Self {
    Self {
      data,
      expires_at: ttl.map(|ttl| now + ttl),
      last_access: AtomicU64::new(now.as_millis() as u64),
    }
  }

  #[inline]
  fn is_expired(&self, now: Duration) -> bool {
    matches!(self.expires_at, Some(deadline) if deadline <= now)
  }

  #[inline]
  fn touch(&self, now: Duration) {
    self.last_access.store(now.as_millis() as u64, Ordering::Relaxed);
  }
}

type ShardMap = HashMap<String, Slot, ahash::RandomState>;

/// The shared state of a [`MemoryBackend`], also reached by its janitor.
pub(crate) struct MemoryStore {
  name: String,
  shards: Box<[CachePadded<RwLock<ShardMap>>]>,
  hasher: ahash::RandomState,
  shard_capacity: usize,
  closed: AtomicBool,
}

impl MemoryStore {
  #[inline]
  fn shard(&self, key: &str) -> &RwLock<ShardMap> {
    let index = self.hasher.hash_one(key) as usize % self.shards.len();
    &self.shards[index]
  }

  fn check_open(&self) -> Result<()> {
    if self.closed.load(Ordering::Acquire) {
      Err(Error::Closed(self.name.clone()))
    } else {
      Ok(())
    }
  }

  /// Removes expired entries from every shard. Returns how many were removed.
  pub(crate) fn purge_expired(&self) -> usize {
    let now = clock::now_duration();
    let mut removed = 0;
    for shard in self.shards.iter() {
      let mut map = shard.write();
      let before = map.len();
      map.retain(|_, slot| !slot.is_expired(now));
      removed += before - map.len();
    }
    removed
  }

  /// Inserts `slot`, evicting an approximately least recently used entry if
  /// the shard is full.
  fn insert(&self, map: &mut ShardMap, key: &str, slot: Slot, now: Duration) {
    if !map.contains_key(key) && map.len() >= self.shard_capacity {
      map.retain(|_, slot| !slot.is_expired(now));
      if map.len() >= self.shard_capacity {
        let skip = rand::rng().random_range(0..map.len());
        let victim = map
          .iter()
          .cycle()
          .skip(skip)
          .take(EVICTION_SAMPLE_SIZE.min(map.len()))
          .min_by_key(|(_, slot)| slot.last_access.load(Ordering::Relaxed))
          .map(|(key, _)| key.clone());
        if let Some(victim) = victim {
          tracing::trace!(backend = %self.name, key = %victim, "evicting entry at capacity");
          map.remove(&victim);
        }
      }
    }
    map.insert(key.to_string(), slot);
  }

  fn keys_matching(&self, shard: usize, glob: &Glob) -> Vec<String> {
    let now = clock::now_duration();
    self.shards[shard]
      .read()
      .iter()
      .filter(|(key, slot)| !slot.is_expired(now) && glob.matches(key))
      .map(|(key, _)| key.clone())
      .collect()
  }

  fn wrong_type(key: &str) -> Error {
    Error::WrongType {
      key: key.to_string(),
    }
  }
}

/// A sharded, optionally bounded, in-process [`Backend`].
pub struct MemoryBackend {
  store: Arc<MemoryStore>,
  janitor: Mutex<Option<Janitor>>,
}

impl fmt::Debug for MemoryBackend {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("MemoryBackend")
      .field("name", &self.store.name)
      .field("shards", &self.store.shards.len())
      .finish()
  }
}

impl MemoryBackend {
  /// Creates an unbounded backend with default settings.
  pub fn new() -> Self {
    Self::from_builder(MemoryBackendBuilder::default())
  }

  pub fn builder() -> MemoryBackendBuilder {
    MemoryBackendBuilder::default()
  }

  fn from_builder(builder: MemoryBackendBuilder) -> Self {
    let shards = builder.shards.max(1);
    let shard_capacity = match builder.capacity {
      Some(capacity) => capacity.div_ceil(shards),
      None => usize::MAX,
    };
    let hasher = ahash::RandomState::new();
    let store = Arc::new(MemoryStore {
      name: builder.name,
      shards: (0..shards)
        .map(|_| CachePadded::new(RwLock::new(HashMap::with_hasher(hasher.clone()))))
        .collect(),
      hasher,
      shard_capacity,
      closed: AtomicBool::new(false),
    });
    let janitor = builder
      .janitor_tick_interval
      .map(|tick| Janitor::spawn(store.clone(), tick));
    Self {
      store,
      janitor: Mutex::new(janitor),
    }
  }

  fn stop_janitor(&self) {
    if let Some(janitor) = self.janitor.lock().take() {
      janitor.stop();
    }
  }
}

impl Default for MemoryBackend {
  fn default() -> Self {
    Self::new()
  }
}

impl Drop for MemoryBackend {
  fn drop(&mut self) {
    self.stop_janitor();
  }
}

#[async_trait]
impl Backend for MemoryBackend {
  fn name(&self) -> &str {
    &self.store.name
  }

  async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
    self.store.check_open()?;
    let now = clock::now_duration();
    let map = self.store.shard(key).read();
    match map.get(key) {
      Some(slot) if !slot.is_expired(now) => {
        slot.touch(now);
        match &slot.data {
          Data::Raw(bytes) => Ok(Some(bytes.clone())),
          _ => Err(MemoryStore::wrong_type(key)),
        }
      }
      _ => Ok(None),
    }
  }

  async fn get_many(&self, keys: &[String]) -> Result<Vec<Option<Vec<u8>>>> {
    let mut values = Vec::with_capacity(keys.len());
    for key in keys {
      values.push(self.get(key).await?);
    }
    Ok(values)
  }

  async fn set(&self, key: &str, value: Vec<u8>, ttl: Option<Duration>, exist: Exist) -> Result<bool> {
    self.store.check_open()?;
    let now = clock::now_duration();
    let mut map = self.store.shard(key).write();
    let present = map.get(key).is_some_and(|slot| !slot.is_expired(now));
    let allowed = match exist {
      Exist::Any => true,
      Exist::MustExist => present,
      Exist::MustNotExist => !present,
    };
    if allowed {
      self
        .store
        .insert(&mut map, key, Slot::new(Data::Raw(value), ttl, now), now);
    }
    Ok(allowed)
  }

  async fn set_many(&self, pairs: Vec<(String, Vec<u8>)>, ttl: Option<Duration>) -> Result<()> {
    for (key, value) in pairs {
      self.set(&key, value, ttl, Exist::Any).await?;
    }
    Ok(())
  }

  async fn incr(&self, key: &str, by: i64, ttl: Option<Duration>) -> Result<i64> {
    self.store.check_open()?;
    let now = clock::now_duration();
    let mut map = self.store.shard(key).write();
    match map.get_mut(key).filter(|slot| !slot.is_expired(now)) {
      Some(slot) => {
        let Data::Raw(bytes) = &mut slot.data else {
          return Err(MemoryStore::wrong_type(key));
        };
        let current: i64 = std::str::from_utf8(bytes)
          .ok()
          .and_then(|text| text.parse().ok())
          .ok_or_else(|| MemoryStore::wrong_type(key))?;
        let next = current
          .checked_add(by)
          .ok_or_else(|| Error::Overflow { key: key.to_string() })?;
        *bytes = next.to_string().into_bytes();
        slot.touch(now);
        Ok(next)
      }
      None => {
        let slot = Slot::new(Data::Raw(by.to_string().into_bytes()), ttl, now);
        self.store.insert(&mut map, key, slot, now);
        Ok(by)
      }
    }
  }

  async fn expire(&self, key: &str, ttl: Duration) -> Result<bool> {
    self.store.check_open()?;
    let now = clock::now_duration();
    let mut map = self.store.shard(key).write();
    match map.get_mut(key) {
      Some(slot) if !slot.is_expired(now) => {
        slot.expires_at = Some(now + ttl);
        Ok(true)
      }
      _ => Ok(false),
    }
  }

  async fn get_expire(&self, key: &str) -> Result<Expiry> {
    self.store.check_open()?;
    let now = clock::now_duration();
    let map = self.store.shard(key).read();
    Ok(match map.get(key) {
      Some(slot) if !slot.is_expired(now) => match slot.expires_at {
        Some(deadline) => Expiry::In(deadline.saturating_sub(now)),
        None => Expiry::Persistent,
      },
      _ => Expiry::Missing,
    })
  }

  async fn delete(&self, key: &str) -> Result<bool> {
    self.store.check_open()?;
    let now = clock::now_duration();
    let removed = self.store.shard(key).write().remove(key);
    Ok(removed.is_some_and(|slot| !slot.is_expired(now)))
  }

  async fn delete_many(&self, keys: &[String]) -> Result<u64> {
    let mut removed = 0;
    for key in keys {
      if self.delete(key).await? {
        removed += 1;
      }
    }
    Ok(removed)
  }

  async fn delete_match(&self, pattern: &str) -> Result<u64> {
    self.store.check_open()?;
    let glob = Glob::new(pattern)?;
    let now = clock::now_duration();
    let mut removed = 0u64;
    for shard in self.store.shards.iter() {
      let mut map = shard.write();
      map.retain(|key, slot| {
        if glob.matches(key) {
          if !slot.is_expired(now) {
            removed += 1;
          }
          false
        } else {
          true
        }
      });
    }
    Ok(removed)
  }

  fn scan(&self, pattern: &str) -> BoxStream<'static, Result<String>> {
    if let Err(e) = self.store.check_open() {
      return stream::once(async move { Err(e) }).boxed();
    }
    let glob = match Glob::new(pattern) {
      Ok(glob) => glob,
      Err(e) => return stream::once(async move { Err(e) }).boxed(),
    };
    let store = self.store.clone();
    stream::iter(0..store.shards.len())
      .flat_map(move |shard| stream::iter(store.keys_matching(shard, &glob).into_iter().map(Ok)))
      .boxed()
  }

  async fn exists(&self, key: &str) -> Result<bool> {
    self.store.check_open()?;
    let now = clock::now_duration();
    let map = self.store.shard(key).read();
    Ok(map.get(key).is_some_and(|slot| !slot.is_expired(now)))
  }

  async fn get_keys_count(&self) -> Result<u64> {
    self.store.check_open()?;
    let now = clock::now_duration();
    Ok(
      self
        .store
        .shards
        .iter()
        .map(|shard| shard.read().values().filter(|slot| !slot.is_expired(now)).count() as u64)
        .sum(),
    )
  }

  async fn ping(&self, message: Option<&str>) -> Result<String> {
    self.store.check_open()?;
    Ok(message.unwrap_or("PONG").to_string())
  }

  async fn clear(&self) -> Result<()> {
    self.store.check_open()?;
    for shard in self.store.shards.iter() {
      shard.write().clear();
    }
    Ok(())
  }

  async fn close(&self) -> Result<()> {
    self.store.closed.store(true, Ordering::Release);
    self.stop_janitor();
    for shard in self.store.shards.iter() {
      shard.write().clear();
    }
    tracing::debug!(backend = %self.store.name, "memory backend closed");
    Ok(())
  }

  async fn delete_if_eq(&self, key: &str, value: &[u8]) -> Result<bool> {
    self.store.check_open()?;
    let now = clock::now_duration();
    let mut map = self.store.shard(key).write();
    let matches = matches!(
      map.get(key),
      Some(Slot { data: Data::Raw(bytes), .. }) if bytes.as_slice() == value
    ) && map.get(key).is_some_and(|slot| !slot.is_expired(now));
    if matches {
      map.remove(key);
    }
    Ok(matches)
  }

  async fn set_add(&self, key: &str, members: &[String], ttl: Option<Duration>) -> Result<u64> {
    self.store.check_open()?;
    let now = clock::now_duration();
    let mut map = self.store.shard(key).write();
    if let Some(slot) = map.get_mut(key).filter(|slot| !slot.is_expired(now)) {
      let Data::Set(set) = &mut slot.data else {
        return Err(MemoryStore::wrong_type(key));
      };
      let before = set.len();
      set.extend(members.iter().cloned());
      if ttl.is_some() {
        slot.expires_at = ttl.map(|ttl| now + ttl);
      }
      return Ok((set.len() - before) as u64);
    }
    let set: HashSet<String> = members.iter().cloned().collect();
    let added = set.len() as u64;
    self
      .store
      .insert(&mut map, key, Slot::new(Data::Set(set), ttl, now), now);
    Ok(added)
  }

  async fn set_remove(&self, key: &str, members: &[String]) -> Result<u64> {
    self.store.check_open()?;
    let now = clock::now_duration();
    let mut map = self.store.shard(key).write();
    let Some(slot) = map.get_mut(key).filter(|slot| !slot.is_expired(now)) else {
      return Ok(0);
    };
    let Data::Set(set) = &mut slot.data else {
      return Err(MemoryStore::wrong_type(key));
    };
    let removed = members.iter().filter(|m| set.remove(m.as_str())).count() as u64;
    if set.is_empty() {
      map.remove(key);
    }
    Ok(removed)
  }

  async fn set_pop(&self, key: &str, count: usize) -> Result<Vec<String>> {
    self.store.check_open()?;
    let now = clock::now_duration();
    let mut map = self.store.shard(key).write();
    let Some(slot) = map.get_mut(key).filter(|slot| !slot.is_expired(now)) else {
      return Ok(Vec::new());
    };
    let Data::Set(set) = &mut slot.data else {
      return Err(MemoryStore::wrong_type(key));
    };
    let popped: Vec<String> = set.iter().take(count).cloned().collect();
    for member in &popped {
      set.remove(member);
    }
    if set.is_empty() {
      map.remove(key);
    }
    Ok(popped)
  }

  async fn get_bits(&self, key: &str, indexes: &[u64]) -> Result<Vec<bool>> {
    self.store.check_open()?;
    let now = clock::now_duration();
    let map = self.store.shard(key).read();
    match map.get(key).filter(|slot| !slot.is_expired(now)) {
      Some(slot) => match &slot.data {
        Data::Bits(bytes) => Ok(indexes.iter().map(|&i| bit_at(bytes, i)).collect()),
        _ => Err(MemoryStore::wrong_type(key)),
      },
      None => Ok(vec![false; indexes.len()]),
    }
  }

  async fn set_bits(&self, key: &str, indexes: &[u64], ttl: Option<Duration>) -> Result<()> {
    self.store.check_open()?;
    let now = clock::now_duration();
    let mut map = self.store.shard(key).write();
    if let Some(slot) = map.get_mut(key).filter(|slot| !slot.is_expired(now)) {
      let Data::Bits(bytes) = &mut slot.data else {
        return Err(MemoryStore::wrong_type(key));
      };
      for &index in indexes {
        set_bit(bytes, index);
      }
      return Ok(());
    }
    let mut bytes = Vec::new();
    for &index in indexes {
      set_bit(&mut bytes, index);
    }
    self
      .store
      .insert(&mut map, key, Slot::new(Data::Bits(bytes), ttl, now), now);
    Ok(())
  }
}

/// A builder for [`MemoryBackend`].
#[derive(Debug, Clone)]
pub struct MemoryBackendBuilder {
  name: String,
  capacity: Option<usize>,
  shards: usize,
  janitor_tick_interval: Option<Duration>,
}

impl Default for MemoryBackendBuilder {
  fn default() -> Self {
    Self {
      name: "memory".to_string(),
      capacity: None,
      shards: (num_cpus::get() * 4).max(1).next_power_of_two(),
      janitor_tick_interval: Some(Duration::from_secs(1)),
    }
  }
}

impl MemoryBackendBuilder {
  /// Sets the name reported in logs and observations. Defaults to `"memory"`.
  pub fn name(mut self, name: impl Into<String>) -> Self {
    self.name = name.into();
    self
  }

  /// Bounds the number of stored keys. Each shard holds an equal share, so
  /// the bound is approximate when several shards are used.
  pub fn capacity(mut self, capacity: usize) -> Self {
    self.capacity = Some(capacity);
    self
  }

  pub fn shards(mut self, shards: usize) -> Self {
    self.shards = shards;
    self
  }

  /// How often expired entries are swept. `None` disables the janitor;
  /// expired entries are then only dropped when overwritten or evicted.
  pub fn janitor_tick_interval(mut self, interval: Option<Duration>) -> Self {
    self.janitor_tick_interval = interval;
    self
  }

  pub fn build(self) -> std::result::Result<MemoryBackend, BuildError> {
    if self.capacity == Some(0) {
      return Err(BuildError::ZeroCapacity);
    }
    if self.shards == 0 {
      return Err(BuildError::ZeroShards);
    }
    Ok(MemoryBackend::from_builder(self))
  }
}
