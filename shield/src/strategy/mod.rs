//! Caching and resilience strategies.
//!
//! Every strategy wraps an operation implementing [`Call`] and itself
//! implements [`Call`], so strategies nest: a `Locked` strategy can wrap the
//! raw operation while an `Early` strategy wraps the `Locked` one.
//!
//! Strategies are generic over the operation's error type `E`, which must be
//! able to carry this crate's [`Error`](crate::Error) so that policy
//! rejections such as `RateLimit` surface in the caller's own error type.

pub mod bloom;
pub mod circuit_breaker;
pub mod dual_bloom;
pub mod early;
pub mod failover;
pub mod hit;
pub mod invalidate;
pub mod locked;
pub mod perf;
pub mod rate_limit;
pub mod simple;
pub mod soft;
pub mod stream;
pub mod thunder;

use crate::backend::{Backend, Exist};
use crate::cache::{Cache, ErrorPredicate};
use crate::clock::elapsed_between;
use crate::codec;
use crate::error::{Error, Result};
use crate::key::{with_prefix, IntoKey, Key, KeyTemplate};
use crate::observe::{self, Observation};
use crate::ttl::{IntoTtl, Ttl};

use std::future::Future;
use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::{BoxFuture, FutureExt};

pub use bloom::{Bloom, BloomBuilder, BloomParams};
pub use circuit_breaker::{CircuitBreaker, CircuitBreakerBuilder, CircuitState};
pub use dual_bloom::{DualBloom, DualBloomBuilder};
pub use early::{Early, EarlyBuilder, RefreshEvent};
pub use failover::{Failover, FailoverBuilder};
pub use hit::{Hit, HitBuilder};
pub use invalidate::{Invalidate, InvalidateBuilder};
pub use locked::{Locked, LockedBuilder};
pub use perf::{Perf, PerfBuilder, PerfCondition};
pub use rate_limit::{
  OnLimit, RateLimit, RateLimitBuilder, SliceRateLimit, SliceRateLimitBuilder,
};
pub use simple::{Simple, SimpleBuilder};
pub use soft::{Soft, SoftBuilder};
pub use stream::{Produce, StreamCache, StreamCacheBuilder};
pub use thunder::{ThunderProtection, ThunderProtectionBuilder};

/// An asynchronous operation taking arguments `A`.
///
/// Implemented for every `Fn(A) -> impl Future<Output = Result<T, E>>` and
/// for every strategy.
pub trait Call<A, T, E>: Send + Sync + 'static {
  fn call(&self, args: A) -> BoxFuture<'_, std::result::Result<T, E>>;
}

impl<A, T, E, F, Fut> Call<A, T, E> for F
where
  F: Fn(A) -> Fut + Send + Sync + 'static,
  Fut: Future<Output = std::result::Result<T, E>> + Send + 'static,
{
  fn call(&self, args: A) -> BoxFuture<'_, std::result::Result<T, E>> {
    self(args).boxed()
  }
}

/// Decides whether a successful result is worth persisting. Errors are
/// never persisted, so the condition only ever sees values.
pub type Condition<A, T> = Arc<dyn Fn(&T, &A, &str) -> bool + Send + Sync>;

/// Options shared by every strategy, collected by the builders.
pub(crate) struct Options<A, T, E> {
  key: Option<Key<A>>,
  prefix: String,
  ttl: Option<Ttl<A>>,
  condition: Option<Condition<A, T>>,
  time_condition: Option<Duration>,
  tags: Vec<KeyTemplate>,
  error: Option<Error>,
  _error: PhantomData<fn() -> E>,
}

impl<A, T, E> Options<A, T, E> {
  pub(crate) fn new(prefix: &str) -> Self {
    Self {
      key: None,
      prefix: prefix.to_string(),
      ttl: None,
      condition: None,
      time_condition: None,
      tags: Vec::new(),
      error: None,
      _error: PhantomData,
    }
  }

  fn defer<V>(&mut self, result: Result<V>) -> Option<V> {
    match result {
      Ok(value) => Some(value),
      Err(e) => {
        self.error.get_or_insert(e);
        None
      }
    }
  }

  pub(crate) fn set_key(&mut self, key: impl IntoKey<A>) {
    let key = key.into_key();
    self.key = self.defer(key);
  }

  pub(crate) fn set_prefix(&mut self, prefix: String) {
    self.prefix = prefix;
  }

  pub(crate) fn set_ttl(&mut self, ttl: impl IntoTtl<A>) {
    let ttl = ttl.into_ttl();
    self.ttl = self.defer(ttl);
  }

  pub(crate) fn set_condition(&mut self, condition: Condition<A, T>) {
    self.condition = Some(condition);
  }

  pub(crate) fn set_time_condition(&mut self, min: Duration) {
    self.time_condition = Some(min);
  }

  pub(crate) fn add_tag(&mut self, tag: &str) {
    let tag = KeyTemplate::parse(tag);
    if let Some(tag) = self.defer(tag) {
      self.tags.push(tag);
    }
  }

  pub(crate) fn has_ttl(&self) -> bool {
    self.ttl.is_some()
  }

  /// Records a configuration error to be reported by `build`.
  pub(crate) fn fail(&mut self, error: Error) {
    self.error.get_or_insert(error);
  }

  pub(crate) fn build(self, strategy: &'static str) -> Result<Settings<A, T, E>> {
    if let Some(e) = self.error {
      return Err(e);
    }
    let key = self.key.ok_or_else(|| Error::InvalidKeyTemplate {
      template: String::new(),
      reason: format!("{} strategy needs a key", strategy),
    })?;
    Ok(Settings {
      strategy,
      key,
      prefix: self.prefix,
      ttl: self.ttl,
      condition: self.condition,
      time_condition: self.time_condition,
      tags: self.tags,
      _error: PhantomData,
    })
  }
}

/// Builder methods for the key of a strategy.
macro_rules! key_options {
  () => {
    /// Sets the key: a template such as `"user:{id}"`, a [`KeyTemplate`]
    /// or a [`Key::computed`] function.
    ///
    /// [`KeyTemplate`]: crate::key::KeyTemplate
    /// [`Key::computed`]: crate::key::Key::computed
    pub fn key(mut self, key: impl $crate::key::IntoKey<A>) -> Self {
      self.options.set_key(key);
      self
    }

    /// Replaces the strategy's default key prefix. An empty prefix is allowed.
    pub fn prefix(mut self, prefix: impl Into<String>) -> Self {
      self.options.set_prefix(prefix.into());
      self
    }
  };
}

/// Builder methods controlling what gets persisted and for how long.
macro_rules! persist_options {
  () => {
    /// Sets the time-to-live of stored results.
    pub fn ttl(mut self, ttl: impl $crate::ttl::IntoTtl<A>) -> Self {
      self.options.set_ttl(ttl);
      self
    }

    /// Persists a successful result only when `condition` returns `true`.
    /// Errors are never persisted.
    pub fn condition(mut self, condition: impl Fn(&T, &A, &str) -> bool + Send + Sync + 'static) -> Self {
      self.options.set_condition(std::sync::Arc::new(condition));
      self
    }

    /// Persists a result only when the operation took at least `min`.
    pub fn time_condition(mut self, min: std::time::Duration) -> Self {
      self.options.set_time_condition(min);
      self
    }

    /// Registers stored keys under the given tag templates.
    pub fn tags(mut self, tags: &[&str]) -> Self {
      for tag in tags {
        self.options.add_tag(tag);
      }
      self
    }
  };
}

pub(crate) use key_options;
pub(crate) use persist_options;

/// Resolved options of a built strategy.
pub(crate) struct Settings<A, T, E> {
  pub(crate) strategy: &'static str,
  key: Key<A>,
  prefix: String,
  ttl: Option<Ttl<A>>,
  condition: Option<Condition<A, T>>,
  time_condition: Option<Duration>,
  tags: Vec<KeyTemplate>,
  _error: PhantomData<fn() -> E>,
}

impl<A, T, E> Settings<A, T, E> {
  pub(crate) fn key(&self) -> &Key<A> {
    &self.key
  }

  pub(crate) fn prefix(&self) -> &str {
    &self.prefix
  }
}

impl<A, T, E> Settings<A, T, E>
where
  A: crate::key::KeyArgs,
{
  pub(crate) fn key_for(&self, args: &A) -> String {
    with_prefix(&self.prefix, &self.key.render(args))
  }

  pub(crate) fn ttl_for(&self, args: &A) -> Option<Duration> {
    self.ttl.as_ref().map(|ttl| ttl.resolve(args))
  }

  /// Returns the value to persist if the result passes every condition.
  pub(crate) fn admit<'r>(
    &self,
    result: &'r std::result::Result<T, E>,
    args: &A,
    key: &str,
    elapsed: Duration,
  ) -> Option<&'r T> {
    let value = result.as_ref().ok()?;
    self.admit_value(value, args, key, elapsed).then_some(value)
  }

  pub(crate) fn admit_value(&self, value: &T, args: &A, key: &str, elapsed: Duration) -> bool {
    if let Some(min) = self.time_condition {
      if elapsed < min {
        tracing::trace!(key, ?elapsed, "result too fast to cache");
        return false;
      }
    }
    match &self.condition {
      Some(condition) => condition(value, args, key),
      None => true,
    }
  }

  /// Writes `bytes` at `key` and registers the key under the rendered tags.
  pub(crate) async fn write(&self, cache: &Cache, key: &str, bytes: Vec<u8>, args: &A) -> Result<()> {
    let ttl = self.ttl_for(args);
    cache.set(key, bytes, ttl, Exist::Any).await?;
    if !self.tags.is_empty() {
      let tags: Vec<String> = self.tags.iter().map(|tag| tag.render(args)).collect();
      cache.tag_key(key, &tags).await?;
    }
    self.observe(cache, key, ttl, None);
    tracing::trace!(strategy = self.strategy, key, ?ttl, "result cached");
    Ok(())
  }

  /// Records a cache interaction in the current observation scope.
  pub(crate) fn observe(&self, cache: &Cache, key: &str, ttl: Option<Duration>, error: Option<String>) {
    if observe::is_observing() {
      observe::record(Observation {
        key: key.to_string(),
        strategy: self.strategy,
        backend: cache.backend_name(key),
        ttl,
        error,
      });
    }
  }
}

/// Decodes a cached value, treating undecodable bytes as a miss.
pub(crate) fn decode_or_miss<T>(cache: &Cache, key: &str, bytes: &[u8]) -> Option<T>
where
  T: serde::de::DeserializeOwned + 'static,
{
  match cache.codecs().decode(bytes) {
    Ok(value) => Some(value),
    Err(e) => {
      tracing::warn!(key, error = %e, "cached value could not be decoded, treating as miss");
      None
    }
  }
}

/// Encodes `value` in an envelope stamped with the cache clock's now.
pub(crate) fn encode_stamped<T>(cache: &Cache, value: &T) -> Result<Vec<u8>>
where
  T: serde::Serialize + 'static,
{
  let payload = cache.codecs().encode(value)?;
  Ok(codec::stamp(cache.clock().now(), payload))
}

/// Decodes a stamped envelope into the value and its age, treating anything
/// malformed as a miss.
pub(crate) fn decode_stamped<T>(cache: &Cache, key: &str, bytes: &[u8]) -> Option<(Duration, T)>
where
  T: serde::de::DeserializeOwned + 'static,
{
  match codec::unstamp(bytes) {
    Ok((at, payload)) => {
      let age = elapsed_between(at, cache.clock().now());
      decode_or_miss(cache, key, payload).map(|value| (age, value))
    }
    Err(e) => {
      tracing::warn!(key, error = %e, "cached envelope could not be read, treating as miss");
      None
    }
  }
}

/// Whether `error` should be answered from cache under `predicate`, falling
/// back to the cache default, then to "every error".
pub(crate) fn error_matches<E>(cache: &Cache, predicate: Option<&ErrorPredicate>, error: &E) -> bool
where
  E: std::error::Error + 'static,
{
  match predicate.or_else(|| cache.default_failover()) {
    Some(predicate) => predicate(error as &(dyn std::error::Error + 'static)),
    None => true,
  }
}
