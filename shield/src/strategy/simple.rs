//! Read-through caching.

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

const STRATEGY: &str = "simple";

/// Returns the cached value when present; otherwise calls the operation and
/// stores its result.
pub struct Simple<A, T, E, C> {
  cache: Cache,
  op: Arc<C>,
  settings: Arc<Settings<A, T, E>>,
}

impl<A, T, E, C> Simple<A, T, E, C>
where
  C: Call<A, T, E>,
{
  pub fn builder(cache: &Cache, op: C) -> SimpleBuilder<A, T, E, C> {
    SimpleBuilder {
      cache: cache.clone(),
      op,
      options: Options::new(""),
      _marker: PhantomData,
    }
  }
}

pub struct SimpleBuilder<A, T, E, C> {
  cache: Cache,
  op: C,
  options: Options<A, T, E>,
  _marker: PhantomData<fn(A) -> (T, E)>,
}

impl<A, T, E, C> SimpleBuilder<A, T, E, C>
where
  C: Call<A, T, E>,
{
  key_options!();
  persist_options!();

  pub fn build(self) -> Result<Simple<A, T, E, C>> {
    if !self.options.has_ttl() {
      return Err(Error::InvalidTtl("simple strategy needs a ttl".to_string()));
    }
    Ok(Simple {
      cache: self.cache,
      op: Arc::new(self.op),
      settings: Arc::new(self.options.build(STRATEGY)?),
    })
  }
}

impl<A, T, E, C> Simple<A, T, E, C>
where
  A: KeyArgs + Clone + Send + Sync + 'static,
  T: Serialize + DeserializeOwned + Send + Sync + 'static,
  E: std::error::Error + From<Error> + Send + Sync + 'static,
  C: Call<A, T, E>,
{
  async fn run(&self, args: A) -> std::result::Result<T, E> {
    let key = self.settings.key_for(&args);
    if let Some(bytes) = self.cache.get(&key).await? {
      if let Some(value) = decode_or_miss(&self.cache, &key, &bytes) {
        tracing::trace!(strategy = STRATEGY, key = %key, "cache hit");
        self
          .settings
          .observe(&self.cache, &key, self.settings.ttl_for(&args), None);
        return Ok(value);
      }
    }

    tracing::trace!(strategy = STRATEGY, key = %key, "cache miss");
    let started = Instant::now();
    let result = self.op.call(args.clone()).await;
    if let Some(value) = self.settings.admit(&result, &args, &key, started.elapsed()) {
      let bytes = self.cache.codecs().encode(value)?;
      self.settings.write(&self.cache, &key, bytes, &args).await?;
    }
    result
  }
}

impl<A, T, E, C> Call<A, T, E> for Simple<A, T, E, C>
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
