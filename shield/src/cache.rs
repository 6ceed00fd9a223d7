//! The cache context handed to strategies.
//!
//! A [`Cache`] is a cheap, cloneable handle owned by the application. It
//! routes each key to the backend registered under the longest matching
//! prefix, runs every command through the interceptor chain, and redirects
//! writes made inside a transaction scope to that transaction.

use crate::backend::router::{Route, Router};
use crate::backend::{Backend, Exist, Expiry, Interceptor, SafeMode};
use crate::clock::{Clock, SystemClock};
use crate::codec::CodecRegistry;
use crate::counter::CounterEngine;
use crate::error::{BuildError, Result};
use crate::lock::{Backoff, LockManager};
use crate::runtime::{TaskSpawner, TokioSpawner};
use crate::transaction::{self, TransactionBuilder, TransactionMode};

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::stream::BoxStream;
use once_cell::sync::OnceCell;
use serde::de::DeserializeOwned;
use serde::Serialize;

/// Prefix of the sets holding tag membership.
pub const TAG_PREFIX: &str = "_tag:";

/// Members popped per round when deleting a tag.
const TAG_DELETE_BATCH: usize = 100;

static NEXT_CACHE_ID: AtomicU64 = AtomicU64::new(1);

static DEFAULT_CACHE: OnceCell<Cache> = OnceCell::new();

/// Decides whether an operation error should be answered from cache.
pub type ErrorPredicate = Arc<dyn Fn(&(dyn std::error::Error + 'static)) -> bool + Send + Sync>;

pub(crate) struct CacheInner {
  id: u64,
  router: Arc<Router>,
  codecs: CodecRegistry,
  clock: Arc<dyn Clock>,
  spawner: Arc<dyn TaskSpawner>,
  default_failover: Option<ErrorPredicate>,
  transaction_mode: TransactionMode,
  transaction_timeout: Duration,
  lock_backoff: Backoff,
}

/// A handle to a configured set of backends.
#[derive(Clone)]
pub struct Cache {
  inner: Arc<CacheInner>,
}

impl fmt::Debug for Cache {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("Cache")
      .field("id", &self.inner.id)
      .field("backend", &self.inner.router.name())
      .field("transaction_mode", &self.inner.transaction_mode)
      .finish()
  }
}

impl Cache {
  pub fn builder() -> CacheBuilder {
    CacheBuilder::default()
  }

  pub(crate) fn id(&self) -> u64 {
    self.inner.id
  }

  pub(crate) fn router(&self) -> Arc<Router> {
    self.inner.router.clone()
  }

  /// The backend commands should go to: the active transaction of the
  /// current task, or the router.
  fn target(&self) -> Arc<dyn Backend> {
    match transaction::active(self.inner.id) {
      Some(tx) => tx as Arc<dyn Backend>,
      None => self.inner.router.clone() as Arc<dyn Backend>,
    }
  }

  /// Name of the backend serving `key`.
  pub fn backend_name(&self, key: &str) -> String {
    self.inner.router.backend_name(key)
  }

  pub fn codecs(&self) -> &CodecRegistry {
    &self.inner.codecs
  }

  pub fn clock(&self) -> &Arc<dyn Clock> {
    &self.inner.clock
  }

  pub(crate) fn spawn(&self, future: impl Future<Output = ()> + Send + 'static) {
    self.inner.spawner.spawn(Box::pin(future) as Pin<Box<dyn Future<Output = ()> + Send>>);
  }

  pub(crate) fn default_failover(&self) -> Option<&ErrorPredicate> {
    self.inner.default_failover.as_ref()
  }

  /// A lock manager over this cache's backends. Locks bypass transactions.
  pub fn locks(&self) -> LockManager {
    LockManager::with_backoff(self.inner.router.clone(), self.inner.lock_backoff)
  }

  /// A counter engine over this cache's backends. Counters bypass
  /// transactions.
  pub fn counters(&self) -> CounterEngine {
    CounterEngine::new(self.inner.router.clone(), self.inner.clock.clone())
  }

  /// Starts configuring a transaction with this cache's defaults.
  pub fn transaction(&self) -> TransactionBuilder {
    TransactionBuilder::new(
      self.clone(),
      self.inner.transaction_mode,
      self.inner.transaction_timeout,
    )
  }

  /// Reads and decodes the value at `key`.
  pub async fn get_value<T>(&self, key: &str) -> Result<Option<T>>
  where
    T: DeserializeOwned + 'static,
  {
    match self.get(key).await? {
      Some(bytes) => self.inner.codecs.decode(&bytes).map(Some),
      None => Ok(None),
    }
  }

  /// Encodes and writes `value` at `key`.
  pub async fn set_value<T>(&self, key: &str, value: &T, ttl: Option<Duration>) -> Result<bool>
  where
    T: Serialize + 'static,
  {
    let bytes = self.inner.codecs.encode(value)?;
    self.set(key, bytes, ttl, Exist::Any).await
  }

  /// Writes `value` at `key` and registers the key under every tag.
  pub async fn set_tagged(
    &self,
    key: &str,
    value: Vec<u8>,
    ttl: Option<Duration>,
    tags: &[String],
  ) -> Result<bool> {
    let written = self.set(key, value, ttl, Exist::Any).await?;
    if written {
      self.tag_key(key, tags).await?;
    }
    Ok(written)
  }

  /// Adds `key` to the membership set of every tag.
  pub async fn tag_key(&self, key: &str, tags: &[String]) -> Result<()> {
    let member = [key.to_string()];
    for tag in tags {
      self.set_add(&tag_key(tag), &member, None).await?;
    }
    Ok(())
  }

  /// Deletes every key registered under the given tags, then the tags
  /// themselves. Returns how many keys were deleted.
  pub async fn delete_tags(&self, tags: &[String]) -> Result<u64> {
    let mut deleted = 0;
    for tag in tags {
      let set_key = tag_key(tag);
      loop {
        let members = self.set_pop(&set_key, TAG_DELETE_BATCH).await?;
        if members.is_empty() {
          break;
        }
        deleted += self.delete_many(&members).await?;
      }
      tracing::debug!(tag = %tag, deleted, "tag invalidated");
    }
    Ok(deleted)
  }

  /// Makes this cache the process-wide default. Fails, returning the cache,
  /// if a default was already set.
  pub fn set_default(self) -> std::result::Result<(), Cache> {
    DEFAULT_CACHE.set(self)
  }
}

fn tag_key(tag: &str) -> String {
  format!("{}{}", TAG_PREFIX, tag)
}

/// Installs `cache` as the process-wide default.
pub fn set_default(cache: Cache) -> std::result::Result<(), Cache> {
  cache.set_default()
}

/// The process-wide default cache, if one was installed.
pub fn default_cache() -> Option<Cache> {
  DEFAULT_CACHE.get().cloned()
}

#[async_trait]
impl Backend for Cache {
  fn name(&self) -> &str {
    self.inner.router.name()
  }

  async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
    self.target().get(key).await
  }

  async fn get_many(&self, keys: &[String]) -> Result<Vec<Option<Vec<u8>>>> {
    self.target().get_many(keys).await
  }

  async fn set(&self, key: &str, value: Vec<u8>, ttl: Option<Duration>, exist: Exist) -> Result<bool> {
    self.target().set(key, value, ttl, exist).await
  }

  async fn set_many(&self, pairs: Vec<(String, Vec<u8>)>, ttl: Option<Duration>) -> Result<()> {
    self.target().set_many(pairs, ttl).await
  }

  async fn incr(&self, key: &str, by: i64, ttl: Option<Duration>) -> Result<i64> {
    self.target().incr(key, by, ttl).await
  }

  async fn expire(&self, key: &str, ttl: Duration) -> Result<bool> {
    self.target().expire(key, ttl).await
  }

  async fn get_expire(&self, key: &str) -> Result<Expiry> {
    self.target().get_expire(key).await
  }

  async fn delete(&self, key: &str) -> Result<bool> {
    self.target().delete(key).await
  }

  async fn delete_many(&self, keys: &[String]) -> Result<u64> {
    self.target().delete_many(keys).await
  }

  async fn delete_match(&self, pattern: &str) -> Result<u64> {
    self.target().delete_match(pattern).await
  }

  fn scan(&self, pattern: &str) -> BoxStream<'static, Result<String>> {
    self.target().scan(pattern)
  }

  async fn exists(&self, key: &str) -> Result<bool> {
    self.target().exists(key).await
  }

  async fn get_keys_count(&self) -> Result<u64> {
    self.target().get_keys_count().await
  }

  async fn ping(&self, message: Option<&str>) -> Result<String> {
    self.target().ping(message).await
  }

  async fn clear(&self) -> Result<()> {
    self.target().clear().await
  }

  async fn close(&self) -> Result<()> {
    self.inner.router.close().await
  }

  async fn delete_if_eq(&self, key: &str, value: &[u8]) -> Result<bool> {
    self.target().delete_if_eq(key, value).await
  }

  async fn set_add(&self, key: &str, members: &[String], ttl: Option<Duration>) -> Result<u64> {
    self.target().set_add(key, members, ttl).await
  }

  async fn set_remove(&self, key: &str, members: &[String]) -> Result<u64> {
    self.target().set_remove(key, members).await
  }

  async fn set_pop(&self, key: &str, count: usize) -> Result<Vec<String>> {
    self.target().set_pop(key, count).await
  }

  async fn get_bits(&self, key: &str, indexes: &[u64]) -> Result<Vec<bool>> {
    self.target().get_bits(key, indexes).await
  }

  async fn set_bits(&self, key: &str, indexes: &[u64], ttl: Option<Duration>) -> Result<()> {
    self.target().set_bits(key, indexes, ttl).await
  }

  async fn get_match(&self, pattern: &str) -> Result<Vec<(String, Vec<u8>)>> {
    self.target().get_match(pattern).await
  }
}

/// A builder for [`Cache`].
pub struct CacheBuilder {
  routes: Vec<(String, Arc<dyn Backend>)>,
  interceptors: Vec<Arc<dyn Interceptor>>,
  safe: bool,
  codecs: CodecRegistry,
  clock: Arc<dyn Clock>,
  spawner: Option<Arc<dyn TaskSpawner>>,
  default_failover: Option<ErrorPredicate>,
  transaction_mode: TransactionMode,
  transaction_timeout: Duration,
  lock_backoff: Backoff,
}

impl Default for CacheBuilder {
  fn default() -> Self {
    Self {
      routes: Vec::new(),
      interceptors: Vec::new(),
      safe: false,
      codecs: CodecRegistry::new(),
      clock: Arc::new(SystemClock),
      spawner: None,
      default_failover: None,
      transaction_mode: TransactionMode::default(),
      transaction_timeout: transaction::DEFAULT_TIMEOUT,
      lock_backoff: Backoff::default(),
    }
  }
}

impl fmt::Debug for CacheBuilder {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let prefixes: Vec<_> = self.routes.iter().map(|(p, _)| p.as_str()).collect();
    f.debug_struct("CacheBuilder")
      .field("prefixes", &prefixes)
      .field("interceptors", &self.interceptors.len())
      .field("safe", &self.safe)
      .field("transaction_mode", &self.transaction_mode)
      .field("transaction_timeout", &self.transaction_timeout)
      .finish()
  }
}

impl CacheBuilder {
  /// Registers the default backend, serving every key no prefix claims.
  pub fn backend(self, backend: impl Backend) -> Self {
    self.backend_with_prefix("", backend)
  }

  /// Registers a backend for keys starting with `prefix`.
  pub fn backend_with_prefix(self, prefix: impl Into<String>, backend: impl Backend) -> Self {
    self.shared_backend(prefix, Arc::new(backend))
  }

  /// Registers an already shared backend for keys starting with `prefix`.
  pub fn shared_backend(mut self, prefix: impl Into<String>, backend: Arc<dyn Backend>) -> Self {
    self.routes.push((prefix.into(), backend));
    self
  }

  /// Appends an interceptor. Interceptors run in the order they are added.
  pub fn interceptor(mut self, interceptor: impl Interceptor) -> Self {
    self.interceptors.push(Arc::new(interceptor));
    self
  }

  /// Suppresses backend unavailability, answering with absent replies.
  /// Off by default.
  pub fn safe(mut self, safe: bool) -> Self {
    self.safe = safe;
    self
  }

  pub fn codecs(mut self, codecs: CodecRegistry) -> Self {
    self.codecs = codecs;
    self
  }

  pub fn clock(mut self, clock: impl Clock) -> Self {
    self.clock = Arc::new(clock);
    self
  }

  /// Uses a shared clock, e.g. a `ManualClock` the caller keeps advancing.
  pub fn shared_clock(mut self, clock: Arc<dyn Clock>) -> Self {
    self.clock = clock;
    self
  }

  /// Sets the spawner used for detached refreshes. Defaults to Tokio.
  pub fn spawner(mut self, spawner: impl TaskSpawner) -> Self {
    self.spawner = Some(Arc::new(spawner));
    self
  }

  /// Sets which operation errors failover strategies answer from cache when
  /// they have no predicate of their own.
  pub fn default_failover(
    mut self,
    predicate: impl Fn(&(dyn std::error::Error + 'static)) -> bool + Send + Sync + 'static,
  ) -> Self {
    self.default_failover = Some(Arc::new(predicate));
    self
  }

  pub fn transaction_mode(mut self, mode: TransactionMode) -> Self {
    self.transaction_mode = mode;
    self
  }

  pub fn transaction_timeout(mut self, timeout: Duration) -> Self {
    self.transaction_timeout = timeout;
    self
  }

  pub fn lock_backoff(mut self, backoff: Backoff) -> Self {
    self.lock_backoff = backoff;
    self
  }

  pub fn build(self) -> std::result::Result<Cache, BuildError> {
    if self.routes.is_empty() {
      return Err(BuildError::NoBackend);
    }
    let mut routes = Vec::with_capacity(self.routes.len());
    for (prefix, backend) in self.routes {
      if routes.iter().any(|route: &Route| route.prefix == prefix) {
        return Err(BuildError::DuplicatePrefix(prefix));
      }
      routes.push(Route { prefix, backend });
    }

    let mut interceptors: Vec<Arc<dyn Interceptor>> = Vec::with_capacity(self.interceptors.len() + 1);
    if self.safe {
      interceptors.push(Arc::new(SafeMode));
    }
    interceptors.extend(self.interceptors);

    let inner = CacheInner {
      id: NEXT_CACHE_ID.fetch_add(1, Ordering::Relaxed),
      router: Arc::new(Router::new(routes, interceptors)),
      codecs: self.codecs,
      clock: self.clock,
      spawner: self
        .spawner
        .unwrap_or_else(|| Arc::new(TokioSpawner::new()) as Arc<dyn TaskSpawner>),
      default_failover: self.default_failover,
      transaction_mode: self.transaction_mode,
      transaction_timeout: self.transaction_timeout,
      lock_backoff: self.lock_backoff,
    };
    Ok(Cache {
      inner: Arc::new(inner),
    })
  }
}
