//! Stop calling a dependency that keeps failing.
//!
//! State lives in the cache next to the breaker key `k`:
//!
//! * `k:total` and `k:fails` are sliding counters over `period`.
//! * `k:open` exists while the breaker is OPEN and lives for `ttl`.
//! * `k:half_open` outlives `k:open` by `half_open_ttl`; once `k:open` has
//!   expired it marks the HALF_OPEN window.
//! * `k:trial` is claimed by the single call let through while HALF_OPEN.
//!
//! A HALF_OPEN window that passes without a trial closes the breaker.

use crate::backend::{Backend, Exist};
use crate::cache::{Cache, ErrorPredicate};
use crate::error::{Error, Result};
use crate::key::KeyArgs;
use crate::strategy::{key_options, Call, Options, Settings};
use crate::ttl::{IntoTtl, Ttl};

use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::{BoxFuture, FutureExt};

const STRATEGY: &str = "circuit_breaker";
const SLICES: u32 = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CircuitState {
  Closed,
  Open,
  HalfOpen,
}

impl fmt::Display for CircuitState {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      CircuitState::Closed => write!(f, "closed"),
      CircuitState::Open => write!(f, "open"),
      CircuitState::HalfOpen => write!(f, "half-open"),
    }
  }
}

struct Keys {
  base: String,
  open: String,
  half_open: String,
  trial: String,
  total: String,
  fails: String,
}

impl Keys {
  fn new(base: String) -> Self {
    Self {
      open: format!("{}:open", base),
      half_open: format!("{}:half_open", base),
      trial: format!("{}:trial", base),
      total: format!("{}:total", base),
      fails: format!("{}:fails", base),
      base,
    }
  }
}

pub struct CircuitBreaker<A, T, E, C> {
  cache: Cache,
  op: Arc<C>,
  settings: Arc<Settings<A, T, E>>,
  errors_rate: f64,
  min_calls: u64,
  period: Ttl<A>,
  half_open_ttl: Duration,
  exceptions: Option<ErrorPredicate>,
}

impl<A, T, E, C> CircuitBreaker<A, T, E, C>
where
  C: Call<A, T, E>,
{
  pub fn builder(cache: &Cache, op: C) -> CircuitBreakerBuilder<A, T, E, C> {
    CircuitBreakerBuilder {
      cache: cache.clone(),
      op,
      options: Options::new("circuit_breaker"),
      errors_rate: None,
      min_calls: 1,
      period: None,
      half_open_ttl: None,
      exceptions: None,
      _marker: PhantomData,
    }
  }
}

pub struct CircuitBreakerBuilder<A, T, E, C> {
  cache: Cache,
  op: C,
  options: Options<A, T, E>,
  errors_rate: Option<f64>,
  min_calls: u64,
  period: Option<Ttl<A>>,
  half_open_ttl: Option<Duration>,
  exceptions: Option<ErrorPredicate>,
  _marker: PhantomData<fn(A) -> (T, E)>,
}

impl<A, T, E, C> CircuitBreakerBuilder<A, T, E, C>
where
  C: Call<A, T, E>,
{
  key_options!();

  /// Failure percentage of the trailing period that opens the breaker,
  /// strictly between 0 and 100.
  pub fn errors_rate(mut self, percent: f64) -> Self {
    self.errors_rate = Some(percent);
    self
  }

  /// Calls the trailing period must contain before the breaker may open.
  pub fn min_calls(mut self, min_calls: u64) -> Self {
    self.min_calls = min_calls;
    self
  }

  /// Length of the trailing window failures are measured over.
  pub fn period(mut self, period: impl IntoTtl<A>) -> Self {
    match period.into_ttl() {
      Ok(period) => self.period = Some(period),
      Err(e) => self.options.fail(e),
    }
    self
  }

  /// How long the breaker stays OPEN.
  pub fn ttl(mut self, ttl: impl IntoTtl<A>) -> Self {
    self.options.set_ttl(ttl);
    self
  }

  /// How long the breaker stays HALF_OPEN after OPEN. Defaults to the ttl.
  pub fn half_open_ttl(mut self, half_open_ttl: Duration) -> Self {
    self.half_open_ttl = Some(half_open_ttl);
    self
  }

  /// Selects which errors count as failures. By default every error does.
  pub fn exceptions(
    mut self,
    predicate: impl Fn(&(dyn std::error::Error + 'static)) -> bool + Send + Sync + 'static,
  ) -> Self {
    self.exceptions = Some(Arc::new(predicate));
    self
  }

  pub fn build(self) -> Result<CircuitBreaker<A, T, E, C>> {
    if !self.options.has_ttl() {
      return Err(Error::InvalidTtl("circuit breaker needs a ttl".to_string()));
    }
    let settings = self.options.build(STRATEGY)?;
    let errors_rate = self
      .errors_rate
      .filter(|rate| *rate > 0.0 && *rate < 100.0)
      .ok_or_else(|| Error::InvalidOption("errors_rate must be between 0 and 100".to_string()))?;
    let period = self
      .period
      .ok_or_else(|| Error::InvalidTtl("circuit breaker needs a period".to_string()))?;
    Ok(CircuitBreaker {
      cache: self.cache,
      op: Arc::new(self.op),
      settings: Arc::new(settings),
      errors_rate,
      min_calls: self.min_calls.max(1),
      period,
      half_open_ttl: self.half_open_ttl.unwrap_or_default(),
      exceptions: self.exceptions,
    })
  }
}

impl<A, T, E, C> CircuitBreaker<A, T, E, C>
where
  A: KeyArgs + Send + Sync + 'static,
  T: Send + 'static,
  E: std::error::Error + From<Error> + Send + Sync + 'static,
  C: Call<A, T, E>,
{
  /// Current state of the breaker guarding calls with `args`.
  pub async fn state(&self, args: &A) -> Result<CircuitState> {
    let keys = Keys::new(self.settings.key_for(args));
    let router = self.cache.router();
    if router.exists(&keys.open).await? {
      Ok(CircuitState::Open)
    } else if router.exists(&keys.half_open).await? {
      Ok(CircuitState::HalfOpen)
    } else {
      Ok(CircuitState::Closed)
    }
  }

  fn open_ttl(&self, args: &A) -> Duration {
    self.settings.ttl_for(args).unwrap_or_default()
  }

  fn half_open_ttl(&self, args: &A) -> Duration {
    if self.half_open_ttl.is_zero() {
      self.open_ttl(args)
    } else {
      self.half_open_ttl
    }
  }

  fn is_failure(&self, error: &E) -> bool {
    match &self.exceptions {
      Some(predicate) => predicate(error as &(dyn std::error::Error + 'static)),
      None => true,
    }
  }

  async fn run(&self, args: A) -> std::result::Result<T, E> {
    let keys = Keys::new(self.settings.key_for(&args));
    match self.state(&args).await? {
      CircuitState::Open => Err(open_error(&keys).into()),
      CircuitState::HalfOpen => self.trial(args, &keys).await,
      CircuitState::Closed => self.closed(args, &keys).await,
    }
  }

  async fn closed(&self, args: A, keys: &Keys) -> std::result::Result<T, E> {
    let period = self.period.resolve(&args);
    let open_ttl = self.open_ttl(&args);
    let half_open_ttl = self.half_open_ttl(&args);
    let counters = self.cache.counters();
    let total = counters.sliding(&keys.total, period, SLICES).await?;
    let error = match self.op.call(args).await {
      Ok(value) => return Ok(value),
      Err(error) if self.is_failure(&error) => error,
      Err(error) => return Err(error),
    };

    let fails = counters.sliding(&keys.fails, period, SLICES).await?;
    let total = total.max(fails);
    let rate = fails as f64 * 100.0 / total as f64;
    if total as u64 >= self.min_calls && rate >= self.errors_rate {
      tracing::warn!(
        strategy = STRATEGY,
        key = %keys.base,
        fails,
        total,
        "error rate reached, opening circuit"
      );
      self.trip(keys, open_ttl, half_open_ttl).await?;
    }
    Err(error)
  }

  async fn trial(&self, args: A, keys: &Keys) -> std::result::Result<T, E> {
    let open_ttl = self.open_ttl(&args);
    let half_open_ttl = self.half_open_ttl(&args);
    let router = self.cache.router();
    let claimed = router
      .set(&keys.trial, b"1".to_vec(), Some(half_open_ttl), Exist::MustNotExist)
      .await?;
    if !claimed {
      return Err(open_error(keys).into());
    }

    tracing::debug!(strategy = STRATEGY, key = %keys.base, "half-open trial");
    match self.op.call(args).await {
      Err(error) if self.is_failure(&error) => {
        tracing::warn!(strategy = STRATEGY, key = %keys.base, "trial failed, reopening circuit");
        self.trip(keys, open_ttl, half_open_ttl).await?;
        Err(error)
      }
      result => {
        tracing::info!(strategy = STRATEGY, key = %keys.base, "trial succeeded, closing circuit");
        router
          .delete_many(&[keys.half_open.clone(), keys.trial.clone()])
          .await?;
        result
      }
    }
  }

  /// Moves the breaker to OPEN and forgets the counted window.
  async fn trip(&self, keys: &Keys, open_ttl: Duration, half_open_ttl: Duration) -> Result<()> {
    let router = self.cache.router();
    router
      .set(&keys.open, b"1".to_vec(), Some(open_ttl), Exist::Any)
      .await?;
    router
      .set(
        &keys.half_open,
        b"1".to_vec(),
        Some(open_ttl + half_open_ttl),
        Exist::Any,
      )
      .await?;
    router.delete(&keys.trial).await?;
    let counters = self.cache.counters();
    counters.reset(&keys.total).await?;
    counters.reset(&keys.fails).await?;
    Ok(())
  }
}

fn open_error(keys: &Keys) -> Error {
  Error::CircuitBreakerOpen {
    key: keys.base.clone(),
  }
}

impl<A, T, E, C> Call<A, T, E> for CircuitBreaker<A, T, E, C>
where
  A: KeyArgs + Send + Sync + 'static,
  T: Send + 'static,
  E: std::error::Error + From<Error> + Send + Sync + 'static,
  C: Call<A, T, E>,
{
  fn call(&self, args: A) -> BoxFuture<'_, std::result::Result<T, E>> {
    self.run(args).boxed()
  }
}
