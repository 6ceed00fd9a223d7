//! Call-rate limits per key.
//!
//! [`RateLimit`] counts calls in fixed windows of `period`. The call that
//! first exceeds `limit` writes a ban marker at `{key}:ban` living for
//! `ban_ttl`; while it exists calls are rejected without being counted.
//! [`SliceRateLimit`] counts over a sliding window made of `slices`
//! sub-windows instead, so a burst straddling two fixed windows is still
//! seen as one burst.

use crate::backend::{Backend, Exist};
use crate::cache::Cache;
use crate::error::{Error, Result};
use crate::key::KeyArgs;
use crate::strategy::{key_options, Call, Options, Settings};
use crate::ttl::{IntoTtl, Ttl};

use std::marker::PhantomData;
use std::sync::Arc;

use futures_util::future::{BoxFuture, FutureExt};

const DEFAULT_SLICES: u32 = 10;

/// Answers a rejected call in place of the operation.
pub type OnLimit<A, T, E> = Arc<dyn Fn(&A, &str) -> std::result::Result<T, E> + Send + Sync>;

fn reject<A, T, E>(on_limit: Option<&OnLimit<A, T, E>>, args: &A, key: &str) -> std::result::Result<T, E>
where
  E: From<Error>,
{
  match on_limit {
    Some(on_limit) => on_limit(args, key),
    None => Err(
      Error::RateLimit {
        key: key.to_string(),
      }
      .into(),
    ),
  }
}

/// Per-window limits shared by both limiters.
struct Limits<A> {
  limit: u64,
  period: Ttl<A>,
}

fn limits<A>(limit: Option<u64>, period: Option<Ttl<A>>, strategy: &str) -> Result<Limits<A>> {
  let limit = limit
    .filter(|&limit| limit > 0)
    .ok_or_else(|| Error::InvalidOption(format!("{} needs a positive limit", strategy)))?;
  let period = period.ok_or_else(|| Error::InvalidTtl(format!("{} needs a period", strategy)))?;
  Ok(Limits { limit, period })
}

pub struct RateLimit<A, T, E, C> {
  cache: Cache,
  op: Arc<C>,
  settings: Arc<Settings<A, T, E>>,
  limits: Limits<A>,
  ban_ttl: Option<Ttl<A>>,
  on_limit: Option<OnLimit<A, T, E>>,
}

impl<A, T, E, C> RateLimit<A, T, E, C>
where
  C: Call<A, T, E>,
{
  pub fn builder(cache: &Cache, op: C) -> RateLimitBuilder<A, T, E, C> {
    RateLimitBuilder {
      cache: cache.clone(),
      op,
      options: Options::new("rate_limit"),
      limit: None,
      period: None,
      ban_ttl: None,
      on_limit: None,
      _marker: PhantomData,
    }
  }
}

pub struct RateLimitBuilder<A, T, E, C> {
  cache: Cache,
  op: C,
  options: Options<A, T, E>,
  limit: Option<u64>,
  period: Option<Ttl<A>>,
  ban_ttl: Option<Ttl<A>>,
  on_limit: Option<OnLimit<A, T, E>>,
  _marker: PhantomData<fn(A) -> (T, E)>,
}

impl<A, T, E, C> RateLimitBuilder<A, T, E, C>
where
  C: Call<A, T, E>,
{
  key_options!();

  /// Calls allowed per period.
  pub fn limit(mut self, limit: u64) -> Self {
    self.limit = Some(limit);
    self
  }

  pub fn period(mut self, period: impl IntoTtl<A>) -> Self {
    match period.into_ttl() {
      Ok(period) => self.period = Some(period),
      Err(e) => self.options.fail(e),
    }
    self
  }

  /// How long the key stays banned once over the limit. Defaults to the
  /// period.
  pub fn ban_ttl(mut self, ban_ttl: impl IntoTtl<A>) -> Self {
    match ban_ttl.into_ttl() {
      Ok(ban_ttl) => self.ban_ttl = Some(ban_ttl),
      Err(e) => self.options.fail(e),
    }
    self
  }

  /// Answers rejected calls with `on_limit` instead of `Error::RateLimit`.
  pub fn on_limit(
    mut self,
    on_limit: impl Fn(&A, &str) -> std::result::Result<T, E> + Send + Sync + 'static,
  ) -> Self {
    self.on_limit = Some(Arc::new(on_limit));
    self
  }

  pub fn build(self) -> Result<RateLimit<A, T, E, C>> {
    let settings = self.options.build("rate_limit")?;
    let limits = limits(self.limit, self.period, "rate limit")?;
    Ok(RateLimit {
      cache: self.cache,
      op: Arc::new(self.op),
      settings: Arc::new(settings),
      limits,
      ban_ttl: self.ban_ttl,
      on_limit: self.on_limit,
    })
  }
}

impl<A, T, E, C> RateLimit<A, T, E, C>
where
  A: KeyArgs + Send + Sync + 'static,
  T: Send + 'static,
  E: From<Error> + Send + 'static,
  C: Call<A, T, E>,
{
  async fn run(&self, args: A) -> std::result::Result<T, E> {
    let key = self.settings.key_for(&args);
    let ban_key = format!("{}:ban", key);
    let router = self.cache.router();

    if router.exists(&ban_key).await? {
      tracing::debug!(strategy = "rate_limit", key = %key, "key is banned");
      return reject(self.on_limit.as_ref(), &args, &key);
    }

    let period = self.limits.period.resolve(&args);
    let count = self.cache.counters().hit(&key, period).await?;
    if count > self.limits.limit as i64 {
      let ban_ttl = match &self.ban_ttl {
        Some(ban_ttl) => ban_ttl.resolve(&args),
        None => period,
      };
      router
        .set(&ban_key, b"1".to_vec(), Some(ban_ttl), Exist::MustNotExist)
        .await?;
      tracing::info!(strategy = "rate_limit", key = %key, count, ?ban_ttl, "rate limit reached");
      return reject(self.on_limit.as_ref(), &args, &key);
    }
    self.op.call(args).await
  }
}

impl<A, T, E, C> Call<A, T, E> for RateLimit<A, T, E, C>
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

pub struct SliceRateLimit<A, T, E, C> {
  cache: Cache,
  op: Arc<C>,
  settings: Arc<Settings<A, T, E>>,
  limits: Limits<A>,
  slices: u32,
  on_limit: Option<OnLimit<A, T, E>>,
}

impl<A, T, E, C> SliceRateLimit<A, T, E, C>
where
  C: Call<A, T, E>,
{
  pub fn builder(cache: &Cache, op: C) -> SliceRateLimitBuilder<A, T, E, C> {
    SliceRateLimitBuilder {
      cache: cache.clone(),
      op,
      options: Options::new("srate"),
      limit: None,
      period: None,
      slices: DEFAULT_SLICES,
      on_limit: None,
      _marker: PhantomData,
    }
  }
}

pub struct SliceRateLimitBuilder<A, T, E, C> {
  cache: Cache,
  op: C,
  options: Options<A, T, E>,
  limit: Option<u64>,
  period: Option<Ttl<A>>,
  slices: u32,
  on_limit: Option<OnLimit<A, T, E>>,
  _marker: PhantomData<fn(A) -> (T, E)>,
}

impl<A, T, E, C> SliceRateLimitBuilder<A, T, E, C>
where
  C: Call<A, T, E>,
{
  key_options!();

  /// Calls allowed in any trailing period.
  pub fn limit(mut self, limit: u64) -> Self {
    self.limit = Some(limit);
    self
  }

  pub fn period(mut self, period: impl IntoTtl<A>) -> Self {
    match period.into_ttl() {
      Ok(period) => self.period = Some(period),
      Err(e) => self.options.fail(e),
    }
    self
  }

  /// Number of sub-windows the period is split into.
  pub fn slices(mut self, slices: u32) -> Self {
    self.slices = slices;
    self
  }

  /// Answers rejected calls with `on_limit` instead of `Error::RateLimit`.
  pub fn on_limit(
    mut self,
    on_limit: impl Fn(&A, &str) -> std::result::Result<T, E> + Send + Sync + 'static,
  ) -> Self {
    self.on_limit = Some(Arc::new(on_limit));
    self
  }

  pub fn build(self) -> Result<SliceRateLimit<A, T, E, C>> {
    let settings = self.options.build("slice_rate_limit")?;
    let limits = limits(self.limit, self.period, "slice rate limit")?;
    if self.slices == 0 {
      return Err(Error::InvalidOption("slice rate limit needs at least one slice".to_string()));
    }
    Ok(SliceRateLimit {
      cache: self.cache,
      op: Arc::new(self.op),
      settings: Arc::new(settings),
      limits,
      slices: self.slices,
      on_limit: self.on_limit,
    })
  }
}

impl<A, T, E, C> SliceRateLimit<A, T, E, C>
where
  A: KeyArgs + Send + Sync + 'static,
  T: Send + 'static,
  E: From<Error> + Send + 'static,
  C: Call<A, T, E>,
{
  async fn run(&self, args: A) -> std::result::Result<T, E> {
    let key = self.settings.key_for(&args);
    let period = self.limits.period.resolve(&args);
    let limit = self.limits.limit as i64;
    let counters = self.cache.counters();

    // Rejected calls are not counted.
    let count = if counters.sample(&key, period, self.slices).await? >= limit {
      limit + 1
    } else {
      counters.sliding(&key, period, self.slices).await?
    };
    if count > limit {
      tracing::info!(strategy = "slice_rate_limit", key = %key, "rate limit reached");
      return reject(self.on_limit.as_ref(), &args, &key);
    }
    self.op.call(args).await
  }
}

impl<A, T, E, C> Call<A, T, E> for SliceRateLimit<A, T, E, C>
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
