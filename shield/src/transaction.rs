//! Transactional writes across several keys.
//!
//! A transaction scope writes through to the backends immediately and keeps
//! an undo log. The first time the scope touches a key it captures the key's
//! pre-image (value and absolute deadline, or absence). Leaving the scope
//! normally commits, which simply drops the log and releases any locks.
//! Rolling back restores every pre-image in reverse order of first touch.
//!
//! Isolation depends on the [`TransactionMode`]:
//! - `Fast` takes no locks; rollback skips keys someone else changed since
//!   this transaction last wrote them.
//! - `Locked` locks each key on first touch until the scope ends, so
//!   overlapping transactions serialize.
//! - `Serializable` holds one process-wide lock for the whole scope.

use crate::backend::router::Router;
use crate::backend::{Backend, Exist, Expiry};
use crate::cache::Cache;
use crate::clock;
use crate::error::{Error, Result};
use crate::lock::{LockGuard, LockManager};

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::stream::BoxStream;
use futures_util::{FutureExt, StreamExt};
use serde::Deserialize;

/// Default lock ttl and wait for transactions.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

const LOCK_PREFIX: &str = "_tx_lock:";
const SERIALIZABLE_LOCK: &str = "_tx_lock:serializable";

/// How a transaction isolates itself from concurrent ones.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransactionMode {
  Fast,
  #[default]
  Locked,
  Serializable,
}

type ActiveStack = Vec<(u64, Arc<TxBackend>)>;

tokio::task_local! {
  static ACTIVE: ActiveStack;
}

/// The transaction the current task runs inside for the cache `cache_id`.
pub(crate) fn active(cache_id: u64) -> Option<Arc<TxBackend>> {
  ACTIVE
    .try_with(|stack| {
      stack
        .iter()
        .rev()
        .find(|(id, _)| *id == cache_id)
        .map(|(_, tx)| tx.clone())
    })
    .ok()
    .flatten()
}

/// State of a key before the transaction first touched it.
struct PreImage {
  value: Option<Vec<u8>>,
  /// Monotonic deadline, as a duration since the crate epoch.
  deadline: Option<Duration>,
}

struct Touched {
  key: String,
  /// `None` for keys holding sets or bit arrays, which are not restored.
  before: Option<PreImage>,
  /// What this transaction expects the key to hold now.
  expected: Option<Vec<u8>>,
}

/// The undo log of one transaction.
#[derive(Default)]
struct TransactionLog {
  entries: Vec<Touched>,
  index: HashMap<String, usize>,
  locks: Vec<LockGuard>,
}

impl TransactionLog {
  fn set_expected(&mut self, key: &str, value: Option<Vec<u8>>) {
    if let Some(&position) = self.index.get(key) {
      self.entries[position].expected = value;
    }
  }
}

/// A backend view that logs writes for rollback.
pub(crate) struct TxBackend {
  router: Arc<Router>,
  locks: LockManager,
  mode: TransactionMode,
  timeout: Duration,
  log: tokio::sync::Mutex<TransactionLog>,
  rollback_requested: AtomicBool,
}

impl TxBackend {
  fn new(router: Arc<Router>, locks: LockManager, mode: TransactionMode, timeout: Duration) -> Self {
    Self {
      router,
      locks,
      mode,
      timeout,
      log: tokio::sync::Mutex::new(TransactionLog::default()),
      rollback_requested: AtomicBool::new(false),
    }
  }

  async fn begin(&self) -> Result<()> {
    if self.mode == TransactionMode::Serializable {
      let guard = self
        .locks
        .acquire(SERIALIZABLE_LOCK, self.timeout, self.timeout)
        .await?;
      self.log.lock().await.locks.push(guard);
    }
    Ok(())
  }

  /// Captures pre-images (and locks, in `Locked` mode) for keys touched for
  /// the first time.
  async fn touch(&self, log: &mut TransactionLog, keys: &[&str]) -> Result<()> {
    for &key in keys {
      if log.index.contains_key(key) {
        continue;
      }
      if self.mode == TransactionMode::Locked {
        let lock_key = format!("{}{}", LOCK_PREFIX, key);
        let guard = self.locks.acquire(&lock_key, self.timeout, self.timeout).await?;
        log.locks.push(guard);
      }
      let value = match self.router.get(key).await {
        Ok(value) => value,
        // Sets and bit arrays are not transactional, but stay locked.
        Err(Error::WrongType { .. }) => {
          log.index.insert(key.to_string(), log.entries.len());
          log.entries.push(Touched {
            key: key.to_string(),
            before: None,
            expected: None,
          });
          continue;
        }
        Err(e) => return Err(e),
      };
      let deadline = match self.router.get_expire(key).await? {
        Expiry::In(remaining) => Some(clock::now_duration() + remaining),
        _ => None,
      };
      log.index.insert(key.to_string(), log.entries.len());
      log.entries.push(Touched {
        key: key.to_string(),
        expected: value.clone(),
        before: Some(PreImage { value, deadline }),
      });
    }
    Ok(())
  }

  fn request_rollback(&self) {
    self.rollback_requested.store(true, Ordering::Release);
  }

  fn rollback_requested(&self) -> bool {
    self.rollback_requested.load(Ordering::Acquire)
  }

  async fn commit(&self) {
    let mut log = self.log.lock().await;
    let touched = log.entries.len();
    release_all(std::mem::take(&mut log.locks)).await;
    log.entries.clear();
    log.index.clear();
    tracing::debug!(mode = ?self.mode, touched, "transaction committed");
  }

  async fn rollback(&self) -> Result<()> {
    let mut log = self.log.lock().await;
    let entries = std::mem::take(&mut log.entries);
    log.index.clear();
    let mut outcome = Ok(());
    let mut restored = 0usize;
    for entry in entries.into_iter().rev() {
      match self.restore(entry).await {
        Ok(true) => restored += 1,
        Ok(false) => {}
        Err(e) => {
          tracing::warn!(error = %e, "failed to restore key during rollback");
          if outcome.is_ok() {
            outcome = Err(e);
          }
        }
      }
    }
    release_all(std::mem::take(&mut log.locks)).await;
    tracing::info!(mode = ?self.mode, restored, "transaction rolled back");
    outcome
  }

  async fn restore(&self, entry: Touched) -> Result<bool> {
    let Some(before) = entry.before else {
      return Ok(false);
    };
    if self.mode == TransactionMode::Fast {
      let current = self.router.get(&entry.key).await?;
      if current != entry.expected {
        tracing::debug!(key = %entry.key, "key changed by someone else, not restoring");
        return Ok(false);
      }
    }
    match before.value {
      Some(value) => {
        let ttl = match before.deadline {
          Some(deadline) => match deadline.checked_sub(clock::now_duration()) {
            Some(remaining) if !remaining.is_zero() => Some(remaining),
            _ => {
              self.router.delete(&entry.key).await?;
              return Ok(true);
            }
          },
          None => None,
        };
        self.router.set(&entry.key, value, ttl, Exist::Any).await?;
      }
      None => {
        self.router.delete(&entry.key).await?;
      }
    }
    Ok(true)
  }
}

async fn release_all(locks: Vec<LockGuard>) {
  for guard in locks.into_iter().rev() {
    let _ = guard.release().await;
  }
}

#[async_trait]
impl Backend for TxBackend {
  fn name(&self) -> &str {
    self.router.name()
  }

  async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
    self.router.get(key).await
  }

  async fn get_many(&self, keys: &[String]) -> Result<Vec<Option<Vec<u8>>>> {
    self.router.get_many(keys).await
  }

  async fn set(&self, key: &str, value: Vec<u8>, ttl: Option<Duration>, exist: Exist) -> Result<bool> {
    let mut log = self.log.lock().await;
    self.touch(&mut log, &[key]).await?;
    let written = self.router.set(key, value.clone(), ttl, exist).await?;
    if written {
      log.set_expected(key, Some(value));
    }
    Ok(written)
  }

  async fn set_many(&self, pairs: Vec<(String, Vec<u8>)>, ttl: Option<Duration>) -> Result<()> {
    let mut log = self.log.lock().await;
    let keys: Vec<&str> = pairs.iter().map(|(k, _)| k.as_str()).collect();
    self.touch(&mut log, &keys).await?;
    self.router.set_many(pairs.clone(), ttl).await?;
    for (key, value) in pairs {
      log.set_expected(&key, Some(value));
    }
    Ok(())
  }

  async fn incr(&self, key: &str, by: i64, ttl: Option<Duration>) -> Result<i64> {
    let mut log = self.log.lock().await;
    self.touch(&mut log, &[key]).await?;
    let count = self.router.incr(key, by, ttl).await?;
    log.set_expected(key, Some(count.to_string().into_bytes()));
    Ok(count)
  }

  async fn expire(&self, key: &str, ttl: Duration) -> Result<bool> {
    let mut log = self.log.lock().await;
    self.touch(&mut log, &[key]).await?;
    self.router.expire(key, ttl).await
  }

  async fn get_expire(&self, key: &str) -> Result<Expiry> {
    self.router.get_expire(key).await
  }

  async fn delete(&self, key: &str) -> Result<bool> {
    let mut log = self.log.lock().await;
    self.touch(&mut log, &[key]).await?;
    let removed = self.router.delete(key).await?;
    log.set_expected(key, None);
    Ok(removed)
  }

  async fn delete_many(&self, keys: &[String]) -> Result<u64> {
    let mut log = self.log.lock().await;
    let refs: Vec<&str> = keys.iter().map(String::as_str).collect();
    self.touch(&mut log, &refs).await?;
    let removed = self.router.delete_many(keys).await?;
    for key in keys {
      log.set_expected(key, None);
    }
    Ok(removed)
  }

  async fn delete_match(&self, pattern: &str) -> Result<u64> {
    let keys: Vec<String> = self
      .router
      .scan(pattern)
      .collect::<Vec<_>>()
      .await
      .into_iter()
      .collect::<Result<_>>()?;
    self.delete_many(&keys).await
  }

  fn scan(&self, pattern: &str) -> BoxStream<'static, Result<String>> {
    self.router.scan(pattern)
  }

  async fn exists(&self, key: &str) -> Result<bool> {
    self.router.exists(key).await
  }

  async fn get_keys_count(&self) -> Result<u64> {
    self.router.get_keys_count().await
  }

  async fn ping(&self, message: Option<&str>) -> Result<String> {
    self.router.ping(message).await
  }

  async fn clear(&self) -> Result<()> {
    self.router.clear().await
  }

  async fn close(&self) -> Result<()> {
    self.router.close().await
  }

  async fn delete_if_eq(&self, key: &str, value: &[u8]) -> Result<bool> {
    self.router.delete_if_eq(key, value).await
  }

  async fn set_add(&self, key: &str, members: &[String], ttl: Option<Duration>) -> Result<u64> {
    self.router.set_add(key, members, ttl).await
  }

  async fn set_remove(&self, key: &str, members: &[String]) -> Result<u64> {
    self.router.set_remove(key, members).await
  }

  async fn set_pop(&self, key: &str, count: usize) -> Result<Vec<String>> {
    self.router.set_pop(key, count).await
  }

  async fn get_bits(&self, key: &str, indexes: &[u64]) -> Result<Vec<bool>> {
    self.router.get_bits(key, indexes).await
  }

  async fn set_bits(&self, key: &str, indexes: &[u64], ttl: Option<Duration>) -> Result<()> {
    self.router.set_bits(key, indexes, ttl).await
  }

  async fn get_match(&self, pattern: &str) -> Result<Vec<(String, Vec<u8>)>> {
    self.router.get_match(pattern).await
  }
}

/// A handle to the running transaction, passed into the scope.
#[derive(Clone)]
pub struct Transaction {
  backend: Arc<TxBackend>,
}

impl Transaction {
  /// Marks the transaction to be rolled back when the scope ends, even if
  /// the scope succeeds.
  pub fn rollback(&self) {
    self.backend.request_rollback();
  }

  pub fn mode(&self) -> TransactionMode {
    self.backend.mode
  }

  pub fn is_rollback_requested(&self) -> bool {
    self.backend.rollback_requested()
  }
}

impl fmt::Debug for Transaction {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("Transaction")
      .field("mode", &self.backend.mode)
      .field("timeout", &self.backend.timeout)
      .field("rollback_requested", &self.backend.rollback_requested())
      .finish()
  }
}

/// Configures and runs a transaction scope.
#[derive(Debug)]
pub struct TransactionBuilder {
  cache: Cache,
  mode: TransactionMode,
  timeout: Duration,
}

impl TransactionBuilder {
  pub(crate) fn new(cache: Cache, mode: TransactionMode, timeout: Duration) -> Self {
    Self { cache, mode, timeout }
  }

  pub fn mode(mut self, mode: TransactionMode) -> Self {
    self.mode = mode;
    self
  }

  /// Sets the lock ttl and lock wait of the transaction.
  pub fn timeout(mut self, timeout: Duration) -> Self {
    self.timeout = timeout;
    self
  }

  /// Runs `scope` inside the transaction.
  ///
  /// Every write the scope makes through the cache (directly or through
  /// strategies) on the current task joins the transaction. An `Err`, a
  /// panic, or a call to [`Transaction::rollback`] rolls back; panics resume
  /// after the rollback. Dropping the returned future before it completes
  /// rolls back on the cache's spawner. A scope opened while another transaction of the
  /// same cache is active joins the outer transaction.
  pub async fn run<F, Fut, T, E>(self, scope: F) -> std::result::Result<T, E>
  where
    F: FnOnce(Transaction) -> Fut,
    Fut: Future<Output = std::result::Result<T, E>>,
    E: From<Error>,
  {
    let id = self.cache.id();
    if let Some(outer) = active(id) {
      return scope(Transaction { backend: outer }).await;
    }

    let backend = Arc::new(TxBackend::new(
      self.cache.router(),
      self.cache.locks(),
      self.mode,
      self.timeout,
    ));
    backend.begin().await?;
    let unfinished = Unfinished {
      cache: self.cache.clone(),
      backend: Some(backend.clone()),
    };

    let mut stack = ACTIVE.try_with(Clone::clone).unwrap_or_default();
    stack.push((id, backend.clone()));
    let handle = Transaction {
      backend: backend.clone(),
    };
    let outcome = AssertUnwindSafe(ACTIVE.scope(stack, scope(handle)))
      .catch_unwind()
      .await;
    unfinished.finish();

    match outcome {
      Ok(Ok(value)) if !backend.rollback_requested() => {
        backend.commit().await;
        Ok(value)
      }
      Ok(Ok(value)) => {
        backend.rollback().await?;
        Ok(value)
      }
      Ok(Err(e)) => {
        let _ = backend.rollback().await;
        Err(e)
      }
      Err(panic) => {
        let _ = backend.rollback().await;
        std::panic::resume_unwind(panic)
      }
    }
  }
}

/// Rolls the transaction back in the background if the scope future is
/// dropped before the scope finished, e.g. by a timeout. The transaction's
/// locks stay held until the rollback completes.
struct Unfinished {
  cache: Cache,
  backend: Option<Arc<TxBackend>>,
}

impl Unfinished {
  fn finish(mut self) {
    self.backend = None;
  }
}

impl Drop for Unfinished {
  fn drop(&mut self) {
    if let Some(backend) = self.backend.take() {
      tracing::warn!(mode = ?backend.mode, "transaction scope cancelled, rolling back");
      self.cache.spawn(async move {
        let _ = backend.rollback().await;
      });
    }
  }
}
