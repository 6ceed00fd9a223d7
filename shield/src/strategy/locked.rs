//! Serialize concurrent calls with the same key.
//!
//! Nothing is cached here; wrap a `Locked` in a caching strategy (or the
//! other way round) to stop a stampede on a cold key.

use crate::cache::Cache;
use crate::error::{Error, Result};
use crate::key::KeyArgs;
use crate::strategy::{key_options, Call, Options, Settings};
use crate::ttl::IntoTtl;

use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::{BoxFuture, FutureExt};

const STRATEGY: &str = "locked";

#[derive(Debug, Clone, Copy)]
enum Wait {
  /// Wait as long as the lock may be held.
  Ttl,
  For(Duration),
  No,
}

pub struct Locked<A, T, E, C> {
  cache: Cache,
  op: Arc<C>,
  settings: Arc<Settings<A, T, E>>,
  wait: Wait,
}

impl<A, T, E, C> Locked<A, T, E, C>
where
  C: Call<A, T, E>,
{
  pub fn builder(cache: &Cache, op: C) -> LockedBuilder<A, T, E, C> {
    LockedBuilder {
      cache: cache.clone(),
      op,
      options: Options::new("lock"),
      wait: Wait::Ttl,
      _marker: PhantomData,
    }
  }
}

pub struct LockedBuilder<A, T, E, C> {
  cache: Cache,
  op: C,
  options: Options<A, T, E>,
  wait: Wait,
  _marker: PhantomData<fn(A) -> (T, E)>,
}

impl<A, T, E, C> LockedBuilder<A, T, E, C>
where
  C: Call<A, T, E>,
{
  key_options!();

  /// How long a lock may be held before it expires on its own.
  pub fn ttl(mut self, ttl: impl IntoTtl<A>) -> Self {
    self.options.set_ttl(ttl);
    self
  }

  /// Waits at most `wait` for the lock, then fails with `LockTimeout`.
  /// Defaults to the lock ttl.
  pub fn wait(mut self, wait: Duration) -> Self {
    self.wait = Wait::For(wait);
    self
  }

  /// Fails with `LockTimeout` right away when the lock is held.
  pub fn fail_fast(mut self) -> Self {
    self.wait = Wait::No;
    self
  }

  pub fn build(self) -> Result<Locked<A, T, E, C>> {
    if !self.options.has_ttl() {
      return Err(Error::InvalidTtl("locked strategy needs a lock ttl".to_string()));
    }
    Ok(Locked {
      cache: self.cache,
      op: Arc::new(self.op),
      settings: Arc::new(self.options.build(STRATEGY)?),
      wait: self.wait,
    })
  }
}

impl<A, T, E, C> Locked<A, T, E, C>
where
  A: KeyArgs + Send + Sync + 'static,
  T: Send + 'static,
  E: From<Error> + Send + 'static,
  C: Call<A, T, E>,
{
  async fn run(&self, args: A) -> std::result::Result<T, E> {
    let key = self.settings.key_for(&args);
    let ttl = self.settings.ttl_for(&args).unwrap_or_default();
    let locks = self.cache.locks();
    let guard = match self.wait {
      Wait::Ttl => locks.acquire(&key, ttl, ttl).await?,
      Wait::For(wait) => locks.acquire(&key, ttl, wait).await?,
      Wait::No => locks
        .try_acquire(&key, ttl)
        .await?
        .ok_or(Error::LockTimeout { key: key.clone() })?,
    };
    tracing::trace!(strategy = STRATEGY, key = %key, "running under lock");

    let result = self.op.call(args).await;
    // A lost lock is already logged; the result still stands.
    let _ = guard.release().await;
    result
  }
}

impl<A, T, E, C> Call<A, T, E> for Locked<A, T, E, C>
where
  A: KeyArgs + Send + Sync + 'static,
  T: Send + 'static,
  E: From<Error> + Send + 'static,
  C: Call<A, T, E>,
{
  fn call(&self, args: A) -> BoxFuture<'_, std::result::Result<T, E>> {
    self.run(args).boxed()
  }
}
