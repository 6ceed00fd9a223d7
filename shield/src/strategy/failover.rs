//! Serve the last good result when the operation fails.

use crate::backend::Backend;
use crate::cache::{Cache, ErrorPredicate};
use crate::error::{Error, Result};
use crate::key::KeyArgs;
use crate::strategy::{
  decode_or_miss, error_matches, key_options, persist_options, Call, Options, Settings,
};

use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Instant;

use futures_util::future::{BoxFuture, FutureExt};
use serde::de::DeserializeOwned;
use serde::Serialize;

const STRATEGY: &str = "failover";

/// Always calls the operation. Successful results are stored; a matching
/// error is answered with the stored result instead, when there is one.
pub struct Failover<A, T, E, C> {
  cache: Cache,
  op: Arc<C>,
  settings: Arc<Settings<A, T, E>>,
  exceptions: Option<ErrorPredicate>,
}

impl<A, T, E, C> Failover<A, T, E, C>
where
  C: Call<A, T, E>,
{
  pub fn builder(cache: &Cache, op: C) -> FailoverBuilder<A, T, E, C> {
    FailoverBuilder {
      cache: cache.clone(),
      op,
      options: Options::new("fail"),
      exceptions: None,
      _marker: PhantomData,
    }
  }
}

pub struct FailoverBuilder<A, T, E, C> {
  cache: Cache,
  op: C,
  options: Options<A, T, E>,
  exceptions: Option<ErrorPredicate>,
  _marker: PhantomData<fn(A) -> (T, E)>,
}

impl<A, T, E, C> FailoverBuilder<A, T, E, C>
where
  C: Call<A, T, E>,
{
  key_options!();
  persist_options!();

  /// Selects which errors fall back to the cache. Without it the cache's
  /// default failover predicate applies, and without that every error does.
  pub fn exceptions(
    mut self,
    predicate: impl Fn(&(dyn std::error::Error + 'static)) -> bool + Send + Sync + 'static,
  ) -> Self {
    self.exceptions = Some(Arc::new(predicate));
    self
  }

  pub fn build(self) -> Result<Failover<A, T, E, C>> {
    if !self.options.has_ttl() {
      return Err(Error::InvalidTtl("failover strategy needs a ttl".to_string()));
    }
    Ok(Failover {
      cache: self.cache,
      op: Arc::new(self.op),
      settings: Arc::new(self.options.build(STRATEGY)?),
      exceptions: self.exceptions,
    })
  }
}

impl<A, T, E, C> Failover<A, T, E, C>
where
  A: KeyArgs + Clone + Send + Sync + 'static,
  T: Serialize + DeserializeOwned + Send + Sync + 'static,
  E: std::error::Error + From<Error> + Send + Sync + 'static,
  C: Call<A, T, E>,
{
  async fn run(&self, args: A) -> std::result::Result<T, E> {
    let key = self.settings.key_for(&args);
    let started = Instant::now();
    let result = self.op.call(args.clone()).await;

    let error = match result {
      Ok(value) => {
        self.persist(&key, &value, &args, started).await;
        return Ok(value);
      }
      Err(error) => error,
    };

    if !error_matches(&self.cache, self.exceptions.as_ref(), &error) {
      return Err(error);
    }
    match self.cache.get(&key).await {
      Ok(Some(bytes)) => match decode_or_miss::<T>(&self.cache, &key, &bytes) {
        Some(value) => {
          tracing::debug!(strategy = STRATEGY, key = %key, error = %error, "serving cached result after failure");
          self.settings.observe(
            &self.cache,
            &key,
            self.settings.ttl_for(&args),
            Some(error.to_string()),
          );
          Ok(value)
        }
        None => Err(error),
      },
      Ok(None) => Err(error),
      Err(e) => {
        tracing::debug!(strategy = STRATEGY, key = %key, error = %e, "fallback read failed");
        Err(error)
      }
    }
  }

  /// Stores a fresh result. Failures here never fail the call.
  async fn persist(&self, key: &str, value: &T, args: &A, started: Instant) {
    let admitted = self.settings.admit_value(value, args, key, started.elapsed());
    if !admitted {
      return;
    }
    let written = match self.cache.codecs().encode(value) {
      Ok(bytes) => self.settings.write(&self.cache, key, bytes, args).await,
      Err(e) => Err(e),
    };
    if let Err(e) = written {
      tracing::warn!(strategy = STRATEGY, key, error = %e, "could not store result");
    }
  }
}

impl<A, T, E, C> Call<A, T, E> for Failover<A, T, E, C>
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
