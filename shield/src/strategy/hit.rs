//! Cache a result for a fixed number of reads.
//!
//! Each call bumps a counter stored next to the entry at `{key}:counter`.
//! While the counter stays within `cache_hits` the cached value is served;
//! past it the operation runs again, the fresh value is stored and the
//! counter starts over.

use crate::backend::Backend;
use crate::cache::Cache;
use crate::error::{Error, Result};
use crate::key::KeyArgs;
use crate::strategy::{decode_or_miss, key_options, persist_options, Call, Options, Settings};

use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Instant;

use futures_util::future::{BoxFuture, FutureExt};
use serde::de::DeserializeOwned;
use serde::Serialize;

const STRATEGY: &str = "hit";

pub struct Hit<A, T, E, C> {
  cache: Cache,
  op: Arc<C>,
  settings: Arc<Settings<A, T, E>>,
  cache_hits: u64,
  update_after: Option<u64>,
  background: bool,
}

impl<A, T, E, C> Hit<A, T, E, C>
where
  C: Call<A, T, E>,
{
  pub fn builder(cache: &Cache, op: C) -> HitBuilder<A, T, E, C> {
    HitBuilder {
      cache: cache.clone(),
      op,
      options: Options::new("hit"),
      cache_hits: None,
      update_after: None,
      background: true,
      _marker: PhantomData,
    }
  }
}

pub struct HitBuilder<A, T, E, C> {
  cache: Cache,
  op: C,
  options: Options<A, T, E>,
  cache_hits: Option<u64>,
  update_after: Option<u64>,
  background: bool,
  _marker: PhantomData<fn(A) -> (T, E)>,
}

impl<A, T, E, C> HitBuilder<A, T, E, C>
where
  C: Call<A, T, E>,
{
  key_options!();
  persist_options!();

  /// Number of reads served from one stored result.
  pub fn cache_hits(mut self, hits: u64) -> Self {
    self.cache_hits = Some(hits);
    self
  }

  /// Refreshes the stored result on the given read while still serving the
  /// cached one.
  pub fn update_after(mut self, hits: u64) -> Self {
    self.update_after = Some(hits);
    self
  }

  /// Whether an `update_after` refresh runs detached (the default) or is
  /// awaited before the cached value is returned.
  pub fn background(mut self, background: bool) -> Self {
    self.background = background;
    self
  }

  pub fn build(self) -> Result<Hit<A, T, E, C>> {
    if !self.options.has_ttl() {
      return Err(Error::InvalidTtl("hit strategy needs a ttl".to_string()));
    }
    let cache_hits = self
      .cache_hits
      .filter(|&hits| hits > 0)
      .ok_or_else(|| Error::InvalidOption("hit strategy needs a positive cache_hits".to_string()))?;
    Ok(Hit {
      cache: self.cache,
      op: Arc::new(self.op),
      settings: Arc::new(self.options.build(STRATEGY)?),
      cache_hits,
      update_after: self.update_after.filter(|&after| after > 0),
      background: self.background,
    })
  }
}

impl<A, T, E, C> Hit<A, T, E, C>
where
  A: KeyArgs + Clone + Send + Sync + 'static,
  T: Serialize + DeserializeOwned + Send + Sync + 'static,
  E: std::error::Error + From<Error> + Send + Sync + 'static,
  C: Call<A, T, E>,
{
  async fn run(&self, args: A) -> std::result::Result<T, E> {
    let key = self.settings.key_for(&args);
    let ttl = self.settings.ttl_for(&args);
    let counter = counter_key(&key);

    let cached = self.cache.get(&key).await?;
    let hits = self.cache.incr(&counter, 1, ttl).await?;
    let cached = cached.and_then(|bytes| decode_or_miss::<T>(&self.cache, &key, &bytes));

    if let Some(value) = cached {
      if hits > 0 && hits as u64 <= self.cache_hits {
        tracing::trace!(strategy = STRATEGY, key = %key, hits, "cache hit");
        self.settings.observe(&self.cache, &key, ttl, None);
        if self.update_after == Some(hits as u64) {
          self.schedule_refresh(args, key).await;
        }
        return Ok(value);
      }
    }

    tracing::trace!(strategy = STRATEGY, key = %key, hits, "cache miss");
    refresh(&self.cache, &*self.op, &self.settings, args, &key).await
  }

  async fn schedule_refresh(&self, args: A, key: String) {
    let cache = self.cache.clone();
    let op = self.op.clone();
    let settings = self.settings.clone();
    let task = async move {
      if let Err(e) = refresh(&cache, &*op, &settings, args, &key).await {
        tracing::warn!(strategy = STRATEGY, key = %key, error = %e, "refresh failed");
      }
    };
    if self.background {
      self.cache.spawn(task);
    } else {
      task.await;
    }
  }
}

/// Calls the operation and, when the result is admitted, stores it and
/// restarts the read counter.
async fn refresh<A, T, E, C>(
  cache: &Cache,
  op: &C,
  settings: &Settings<A, T, E>,
  args: A,
  key: &str,
) -> std::result::Result<T, E>
where
  A: KeyArgs + Clone + Send + Sync + 'static,
  T: Serialize + DeserializeOwned + Send + Sync + 'static,
  E: std::error::Error + From<Error> + Send + Sync + 'static,
  C: Call<A, T, E>,
{
  let started = Instant::now();
  let result = op.call(args.clone()).await;
  if let Some(value) = settings.admit(&result, &args, key, started.elapsed()) {
    let bytes = cache.codecs().encode(value)?;
    settings.write(cache, key, bytes, &args).await?;
    cache.delete(&counter_key(key)).await?;
  }
  result
}

fn counter_key(key: &str) -> String {
  format!("{}:counter", key)
}

impl<A, T, E, C> Call<A, T, E> for Hit<A, T, E, C>
where
  A: KeyArgs + Clone + Send + Sync + 'static,
  T: Serialize + DeserializeOwned + Send + Sync + 'static,
  E: std::error::Error + From<Error> + Send + Sync + 'static,
  C: Call<A, T, E>,
{
  fn call(&self, args: A) -> BoxFuture<'_, std::result::Result<T, E>> {
    self.run(args).boxed()
  }
}
