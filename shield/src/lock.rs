//! Per-key mutual exclusion built on conditional writes.
//!
//! A lock is a key written with [`Exist::MustNotExist`] holding a random
//! token. Only the holder of the token can release it; everyone else waits
//! with a bounded exponential backoff or gives up.

use crate::backend::{Backend, Exist};
use crate::error::{Error, Result};

use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Poll schedule used while waiting for a lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
  pub initial: Duration,
  pub factor: u32,
  pub max: Duration,
}

impl Default for Backoff {
  fn default() -> Self {
    Self {
      initial: Duration::from_millis(5),
      factor: 2,
      max: Duration::from_millis(250),
    }
  }
}

impl Backoff {
  fn next(&self, current: Duration) -> Duration {
    current.saturating_mul(self.factor.max(1)).min(self.max)
  }
}

fn new_token() -> String {
  hex::encode(rand::random::<u128>().to_be_bytes())
}

/// Issues and releases locks against one backend.
#[derive(Clone)]
pub struct LockManager {
  backend: Arc<dyn Backend>,
  backoff: Backoff,
}

impl fmt::Debug for LockManager {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("LockManager")
      .field("backend", &self.backend.name())
      .field("backoff", &self.backoff)
      .finish()
  }
}

impl LockManager {
  pub fn new(backend: Arc<dyn Backend>) -> Self {
    Self::with_backoff(backend, Backoff::default())
  }

  pub fn with_backoff(backend: Arc<dyn Backend>, backoff: Backoff) -> Self {
    Self { backend, backoff }
  }

  /// Claims `key` for `ttl` without waiting. `Ok(None)` means someone else
  /// holds it.
  pub async fn try_acquire(&self, key: &str, ttl: Duration) -> Result<Option<LockGuard>> {
    let token = new_token();
    let claimed = self
      .backend
      .set(key, token.clone().into_bytes(), Some(ttl), Exist::MustNotExist)
      .await?;
    if claimed {
      tracing::trace!(key, "lock acquired");
      return Ok(Some(LockGuard {
        backend: Some(self.backend.clone()),
        key: key.to_string(),
        token,
      }));
    }
    // A refused write may also be a suppressed failure; only a live backend
    // means the key is really held.
    self.backend.ping(None).await?;
    Ok(None)
  }

  /// Claims `key` for `ttl`, polling for up to `wait`.
  pub async fn acquire(&self, key: &str, ttl: Duration, wait: Duration) -> Result<LockGuard> {
    let started = Instant::now();
    let mut delay = self.backoff.initial;
    loop {
      if let Some(guard) = self.try_acquire(key, ttl).await? {
        return Ok(guard);
      }
      let elapsed = started.elapsed();
      if elapsed >= wait {
        tracing::debug!(key, ?wait, "gave up waiting for lock");
        return Err(Error::LockTimeout {
          key: key.to_string(),
        });
      }
      tracing::trace!(key, ?delay, "lock busy, backing off");
      tokio::time::sleep(delay.min(wait - elapsed)).await;
      delay = self.backoff.next(delay);
    }
  }

  /// Releases `key` if it still holds `token`.
  pub async fn release(&self, key: &str, token: &str) -> Result<()> {
    release_with(&*self.backend, key, token).await
  }

  /// Reports whether `key` is held, waiting up to `wait` for it to be freed.
  /// Never fails: an unreachable backend reads as unlocked.
  pub async fn is_locked(&self, key: &str, wait: Option<Duration>) -> bool {
    let started = Instant::now();
    let mut delay = self.backoff.initial;
    loop {
      let locked = match self.backend.exists(key).await {
        Ok(locked) => locked,
        Err(e) => {
          tracing::debug!(key, error = %e, "lock check failed, treating as unlocked");
          false
        }
      };
      let remaining = wait.and_then(|wait| wait.checked_sub(started.elapsed()));
      match remaining {
        Some(remaining) if locked && !remaining.is_zero() => {
          tokio::time::sleep(delay.min(remaining)).await;
          delay = self.backoff.next(delay);
        }
        _ => return locked,
      }
    }
  }
}

async fn release_with(backend: &dyn Backend, key: &str, token: &str) -> Result<()> {
  if backend.delete_if_eq(key, token.as_bytes()).await? {
    tracing::trace!(key, "lock released");
    Ok(())
  } else {
    tracing::warn!(key, "lock expired or taken over before release");
    Err(Error::LockLost {
      key: key.to_string(),
    })
  }
}

/// A held lock.
///
/// Call [`release`](LockGuard::release) to free it and learn whether it was
/// lost. A guard dropped unreleased (cancellation, panic, early return)
/// schedules the release on the current Tokio runtime.
pub struct LockGuard {
  backend: Option<Arc<dyn Backend>>,
  key: String,
  token: String,
}

impl LockGuard {
  pub fn key(&self) -> &str {
    &self.key
  }

  pub fn token(&self) -> &str {
    &self.token
  }

  /// Gives up ownership without releasing: the lock stays held until its
  /// ttl runs out.
  pub fn hold_until_expiry(mut self) {
    self.backend = None;
  }

  pub async fn release(mut self) -> Result<()> {
    match self.backend.take() {
      Some(backend) => release_with(&*backend, &self.key, &self.token).await,
      None => Ok(()),
    }
  }
}

impl fmt::Debug for LockGuard {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("LockGuard")
      .field("key", &self.key)
      .field("released", &self.backend.is_none())
      .finish()
  }
}

impl Drop for LockGuard {
  fn drop(&mut self) {
    let Some(backend) = self.backend.take() else {
      return;
    };
    let key = std::mem::take(&mut self.key);
    let token = std::mem::take(&mut self.token);
    match tokio::runtime::Handle::try_current() {
      Ok(handle) => {
        handle.spawn(async move {
          let _ = release_with(&*backend, &key, &token).await;
        });
      }
      Err(_) => tracing::warn!(key = %key, "lock guard dropped outside a runtime; lock expires by ttl"),
    }
  }
}
