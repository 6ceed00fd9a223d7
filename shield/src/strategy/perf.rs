//! Refuse calls for a while after one runs much slower than usual.
//!
//! The strategy keeps the durations of the last `trace_size` successful
//! calls. When the history is full and a call is judged degraded (by
//! default: slower than twice the mean of the history) a lock is written at
//! `{key}:lock` for the configured ttl, and calls fail with
//! [`Error::PerfDegradation`] until it expires.

use crate::backend::{Backend, Exist};
use crate::cache::Cache;
use crate::error::{Error, Result};
use crate::key::KeyArgs;
use crate::strategy::{key_options, Call, Options, Settings};
use crate::ttl::IntoTtl;

use std::collections::VecDeque;
use std::marker::PhantomData;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures_util::future::{BoxFuture, FutureExt};
use parking_lot::Mutex;

const STRATEGY: &str = "perf";
const DEFAULT_TRACE_SIZE: usize = 10;

/// Decides from the latest duration and the recorded history whether
/// performance has degraded.
pub type PerfCondition = Arc<dyn Fn(Duration, &[Duration]) -> bool + Send + Sync>;

fn twice_the_mean(current: Duration, history: &[Duration]) -> bool {
  if history.is_empty() {
    return false;
  }
  let total: Duration = history.iter().sum();
  let mean = total / history.len() as u32;
  mean * 2 < current
}

pub struct Perf<A, T, E, C> {
  cache: Cache,
  op: Arc<C>,
  settings: Arc<Settings<A, T, E>>,
  trace_size: usize,
  condition: PerfCondition,
  history: Mutex<VecDeque<Duration>>,
}

impl<A, T, E, C> Perf<A, T, E, C>
where
  C: Call<A, T, E>,
{
  pub fn builder(cache: &Cache, op: C) -> PerfBuilder<A, T, E, C> {
    PerfBuilder {
      cache: cache.clone(),
      op,
      options: Options::new("perf"),
      trace_size: DEFAULT_TRACE_SIZE,
      condition: None,
      _marker: PhantomData,
    }
  }
}

pub struct PerfBuilder<A, T, E, C> {
  cache: Cache,
  op: C,
  options: Options<A, T, E>,
  trace_size: usize,
  condition: Option<PerfCondition>,
  _marker: PhantomData<fn(A) -> (T, E)>,
}

impl<A, T, E, C> PerfBuilder<A, T, E, C>
where
  C: Call<A, T, E>,
{
  key_options!();

  /// How long calls are refused once a slow call was seen.
  pub fn ttl(mut self, ttl: impl IntoTtl<A>) -> Self {
    self.options.set_ttl(ttl);
    self
  }

  /// Number of recent call durations compared against. Defaults to 10.
  pub fn trace_size(mut self, trace_size: usize) -> Self {
    self.trace_size = trace_size;
    self
  }

  /// Replaces the degradation test.
  pub fn condition(
    mut self,
    condition: impl Fn(Duration, &[Duration]) -> bool + Send + Sync + 'static,
  ) -> Self {
    self.condition = Some(Arc::new(condition));
    self
  }

  pub fn build(self) -> Result<Perf<A, T, E, C>> {
    let has_ttl = self.options.has_ttl();
    let settings = self.options.build(STRATEGY)?;
    if !has_ttl {
      return Err(Error::InvalidTtl("perf strategy needs a lock ttl".to_string()));
    }
    if self.trace_size == 0 {
      return Err(Error::InvalidOption("trace_size must be at least 1".to_string()));
    }
    Ok(Perf {
      cache: self.cache,
      op: Arc::new(self.op),
      settings: Arc::new(settings),
      trace_size: self.trace_size,
      condition: self.condition.unwrap_or_else(|| Arc::new(twice_the_mean)),
      history: Mutex::new(VecDeque::with_capacity(self.trace_size)),
    })
  }
}

impl<A, T, E, C> Perf<A, T, E, C>
where
  A: KeyArgs + Send + Sync + 'static,
  T: Send + 'static,
  E: From<Error> + Send + 'static,
  C: Call<A, T, E>,
{
  /// Records `took`, returning `true` when it marks a degradation.
  fn record(&self, took: Duration) -> bool {
    let mut history = self.history.lock();
    if history.len() == self.trace_size {
      let recorded: Vec<Duration> = history.iter().copied().collect();
      if (self.condition)(took, &recorded) {
        history.clear();
        return true;
      }
      history.pop_front();
    }
    history.push_back(took);
    false
  }

  async fn run(&self, args: A) -> std::result::Result<T, E> {
    let key = self.settings.key_for(&args);
    let lock_key = format!("{}:lock", key);
    let router = self.cache.router();
    if router.exists(&lock_key).await? {
      return Err(Error::PerfDegradation { key }.into());
    }

    let ttl = self.settings.ttl_for(&args);
    let started = Instant::now();
    let result = self.op.call(args).await;
    let took = started.elapsed();
    if result.is_ok() && self.record(took) {
      tracing::warn!(strategy = STRATEGY, key = %key, ?took, "slow call, refusing calls for a while");
      let millis = took.as_millis().to_string().into_bytes();
      router.set(&lock_key, millis, ttl, Exist::Any).await?;
    }
    result
  }
}

impl<A, T, E, C> Call<A, T, E> for Perf<A, T, E, C>
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

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn default_condition_compares_against_twice_the_mean() {
    let history = [Duration::from_millis(10), Duration::from_millis(30)];
    assert!(!twice_the_mean(Duration::from_millis(40), &history));
    assert!(twice_the_mean(Duration::from_millis(41), &history));
    assert!(!twice_the_mean(Duration::from_secs(1), &[]));
  }
}
