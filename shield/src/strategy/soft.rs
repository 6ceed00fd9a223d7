//! Refresh after a soft ttl, fall back to the old value on failure.

use crate::backend::Backend;
use crate::cache::{Cache, ErrorPredicate};
use crate::error::{Error, Result};
use crate::key::KeyArgs;
use crate::strategy::{
  decode_stamped, encode_stamped, error_matches, key_options, persist_options, Call, Options,
  Settings,
};
use crate::ttl::{IntoTtl, Ttl};

use std::marker::PhantomData;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures_util::future::{BoxFuture, FutureExt};
use serde::de::DeserializeOwned;
use serde::Serialize;

const STRATEGY: &str = "soft";

/// Serves entries younger than `soft_ttl`. Older entries are recomputed in
/// the caller; if that fails with a matching error the old entry is served
/// for as long as it lives.
pub struct Soft<A, T, E, C> {
  cache: Cache,
  op: Arc<C>,
  settings: Arc<Settings<A, T, E>>,
  soft_ttl: Option<Ttl<A>>,
  exceptions: Option<ErrorPredicate>,
}

impl<A, T, E, C> Soft<A, T, E, C>
where
  C: Call<A, T, E>,
{
  pub fn builder(cache: &Cache, op: C) -> SoftBuilder<A, T, E, C> {
    SoftBuilder {
      cache: cache.clone(),
      op,
      options: Options::new("soft"),
      soft_ttl: None,
      exceptions: None,
      _marker: PhantomData,
    }
  }
}

pub struct SoftBuilder<A, T, E, C> {
  cache: Cache,
  op: C,
  options: Options<A, T, E>,
  soft_ttl: Option<Ttl<A>>,
  exceptions: Option<ErrorPredicate>,
  _marker: PhantomData<fn(A) -> (T, E)>,
}

impl<A, T, E, C> SoftBuilder<A, T, E, C>
where
  C: Call<A, T, E>,
{
  key_options!();
  persist_options!();

  /// Age after which an entry is recomputed. Defaults to a third of the ttl.
  pub fn soft_ttl(mut self, soft_ttl: impl IntoTtl<A>) -> Self {
    match soft_ttl.into_ttl() {
      Ok(soft_ttl) => self.soft_ttl = Some(soft_ttl),
      Err(e) => self.options.fail(e),
    }
    self
  }

  /// Selects which recompute errors fall back to the old entry.
  pub fn exceptions(
    mut self,
    predicate: impl Fn(&(dyn std::error::Error + 'static)) -> bool + Send + Sync + 'static,
  ) -> Self {
    self.exceptions = Some(Arc::new(predicate));
    self
  }

  pub fn build(self) -> Result<Soft<A, T, E, C>> {
    if !self.options.has_ttl() {
      return Err(Error::InvalidTtl("soft strategy needs a ttl".to_string()));
    }
    Ok(Soft {
      cache: self.cache,
      op: Arc::new(self.op),
      settings: Arc::new(self.options.build(STRATEGY)?),
      soft_ttl: self.soft_ttl,
      exceptions: self.exceptions,
    })
  }
}

impl<A, T, E, C> Soft<A, T, E, C>
where
  A: KeyArgs + Clone + Send + Sync + 'static,
  T: Serialize + DeserializeOwned + Send + Sync + 'static,
  E: std::error::Error + From<Error> + Send + Sync + 'static,
  C: Call<A, T, E>,
{
  async fn run(&self, args: A) -> std::result::Result<T, E> {
    let key = self.settings.key_for(&args);
    let ttl = self.settings.ttl_for(&args).unwrap_or_default();
    let soft_ttl = match &self.soft_ttl {
      Some(soft_ttl) => soft_ttl.resolve(&args),
      None => ttl / 3,
    };

    let cached = match self.cache.get(&key).await? {
      Some(bytes) => decode_stamped::<T>(&self.cache, &key, &bytes).filter(|(age, _)| *age < ttl),
      None => None,
    };
    let stale = match cached {
      Some((age, value)) if age < soft_ttl => {
        tracing::trace!(strategy = STRATEGY, key = %key, ?age, "cache hit");
        self.settings.observe(&self.cache, &key, Some(ttl), None);
        return Ok(value);
      }
      Some((_, value)) => Some(value),
      None => None,
    };

    let started = Instant::now();
    match self.op.call(args.clone()).await {
      Ok(value) => {
        self.persist(&key, &value, &args, started.elapsed()).await?;
        Ok(value)
      }
      Err(error) => match stale {
        Some(value) if error_matches(&self.cache, self.exceptions.as_ref(), &error) => {
          tracing::debug!(strategy = STRATEGY, key = %key, error = %error, "recompute failed, serving stale value");
          self
            .settings
            .observe(&self.cache, &key, Some(ttl), Some(error.to_string()));
          Ok(value)
        }
        _ => Err(error),
      },
    }
  }

  async fn persist(&self, key: &str, value: &T, args: &A, elapsed: Duration) -> Result<()> {
    if self.settings.admit_value(value, args, key, elapsed) {
      let bytes = encode_stamped(&self.cache, value)?;
      self.settings.write(&self.cache, key, bytes, args).await?;
    }
    Ok(())
  }
}

impl<A, T, E, C> Call<A, T, E> for Soft<A, T, E, C>
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
