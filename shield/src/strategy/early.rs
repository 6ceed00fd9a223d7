//! Recompute hot entries before they expire.
//!
//! Entries are stored in a stamped envelope recording when they were
//! computed. Once an entry is older than `early_ttl` the next caller still
//! receives it, but also claims the lock at `{key}:lock` and starts one
//! detached recompute. Callers that lose the claim just get the stale value,
//! so at most one recompute per key is in flight no matter how many callers
//! arrive together.
//!
//! Background outcomes are published on [`Early::refresh_events`].

use crate::backend::Backend;
use crate::cache::Cache;
use crate::error::{Error, Result};
use crate::key::KeyArgs;
use crate::lock::LockGuard;
use crate::strategy::{
  decode_stamped, encode_stamped, key_options, persist_options, Call, Options, Settings,
};
use crate::ttl::{IntoTtl, Ttl};

use std::marker::PhantomData;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures_util::future::{BoxFuture, FutureExt};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::broadcast;

const STRATEGY: &str = "early";
const EVENT_CAPACITY: usize = 64;

/// Outcome of one background recompute.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RefreshEvent {
  pub key: String,
  /// The operation or storage error, if the recompute failed.
  pub error: Option<String>,
}

impl RefreshEvent {
  pub fn is_ok(&self) -> bool {
    self.error.is_none()
  }
}

pub struct Early<A, T, E, C> {
  cache: Cache,
  op: Arc<C>,
  settings: Arc<Settings<A, T, E>>,
  early_ttl: Option<Ttl<A>>,
  background: bool,
  events: broadcast::Sender<RefreshEvent>,
}

impl<A, T, E, C> Early<A, T, E, C>
where
  C: Call<A, T, E>,
{
  pub fn builder(cache: &Cache, op: C) -> EarlyBuilder<A, T, E, C> {
    EarlyBuilder {
      cache: cache.clone(),
      op,
      options: Options::new("early"),
      early_ttl: None,
      background: true,
      _marker: PhantomData,
    }
  }

  /// Subscribes to the outcomes of background recomputes started after
  /// this call.
  pub fn refresh_events(&self) -> broadcast::Receiver<RefreshEvent> {
    self.events.subscribe()
  }
}

pub struct EarlyBuilder<A, T, E, C> {
  cache: Cache,
  op: C,
  options: Options<A, T, E>,
  early_ttl: Option<Ttl<A>>,
  background: bool,
  _marker: PhantomData<fn(A) -> (T, E)>,
}

impl<A, T, E, C> EarlyBuilder<A, T, E, C>
where
  C: Call<A, T, E>,
{
  key_options!();
  persist_options!();

  /// Age after which an entry is recomputed in the background. Defaults to
  /// a third of the ttl.
  pub fn early_ttl(mut self, early_ttl: impl IntoTtl<A>) -> Self {
    match early_ttl.into_ttl() {
      Ok(early_ttl) => self.early_ttl = Some(early_ttl),
      Err(e) => self.options.fail(e),
    }
    self
  }

  /// Whether the recompute runs detached (the default) or is awaited before
  /// the stale value is returned.
  pub fn background(mut self, background: bool) -> Self {
    self.background = background;
    self
  }

  pub fn build(self) -> Result<Early<A, T, E, C>> {
    if !self.options.has_ttl() {
      return Err(Error::InvalidTtl("early strategy needs a ttl".to_string()));
    }
    let (events, _) = broadcast::channel(EVENT_CAPACITY);
    Ok(Early {
      cache: self.cache,
      op: Arc::new(self.op),
      settings: Arc::new(self.options.build(STRATEGY)?),
      early_ttl: self.early_ttl,
      background: self.background,
      events,
    })
  }
}

impl<A, T, E, C> Early<A, T, E, C>
where
  A: KeyArgs + Clone + Send + Sync + 'static,
  T: Serialize + DeserializeOwned + Send + Sync + 'static,
  E: std::error::Error + From<Error> + Send + Sync + 'static,
  C: Call<A, T, E>,
{
  fn early_ttl_for(&self, args: &A, ttl: Duration) -> Duration {
    match &self.early_ttl {
      Some(early_ttl) => early_ttl.resolve(args),
      None => ttl / 3,
    }
  }

  async fn run(&self, args: A) -> std::result::Result<T, E> {
    let key = self.settings.key_for(&args);
    let ttl = self.settings.ttl_for(&args).unwrap_or_default();
    let early_ttl = self.early_ttl_for(&args, ttl);

    let cached = match self.cache.get(&key).await? {
      Some(bytes) => decode_stamped::<T>(&self.cache, &key, &bytes),
      None => None,
    };
    let (age, value) = match cached {
      Some((age, value)) if age < ttl => (age, value),
      _ => {
        tracing::trace!(strategy = STRATEGY, key = %key, "cache miss");
        return compute(&self.cache, &*self.op, &self.settings, args, &key).await;
      }
    };

    self.settings.observe(&self.cache, &key, Some(ttl), None);
    if age < early_ttl {
      tracing::trace!(strategy = STRATEGY, key = %key, ?age, "cache hit");
      return Ok(value);
    }

    let lock_key = format!("{}:lock", key);
    match self.cache.locks().try_acquire(&lock_key, early_ttl).await {
      Ok(Some(guard)) => {
        tracing::info!(strategy = STRATEGY, key = %key, ?age, "recomputing early");
        self.schedule_refresh(args, key, guard).await;
      }
      Ok(None) => {
        tracing::trace!(strategy = STRATEGY, key = %key, "recompute already in flight");
      }
      Err(e) => {
        tracing::debug!(strategy = STRATEGY, key = %key, error = %e, "could not claim recompute");
      }
    }
    Ok(value)
  }

  async fn schedule_refresh(&self, args: A, key: String, guard: LockGuard) {
    let cache = self.cache.clone();
    let op = self.op.clone();
    let settings = self.settings.clone();
    let events = self.events.clone();
    let task = async move {
      let error = compute(&cache, &*op, &settings, args, &key)
        .await
        .err()
        .map(|e| e.to_string());
      match &error {
        // The fresh entry is not due again before the lock runs out.
        None => guard.hold_until_expiry(),
        Some(e) => {
          tracing::warn!(strategy = STRATEGY, key = %key, error = %e, "background recompute failed");
          let _ = guard.release().await;
        }
      }
      let _ = events.send(RefreshEvent { key, error });
    };
    if self.background {
      self.cache.spawn(task);
    } else {
      task.await;
    }
  }
}

async fn compute<A, T, E, C>(
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
    let bytes = encode_stamped(cache, value)?;
    settings.write(cache, key, bytes, &args).await?;
  }
  result
}

impl<A, T, E, C> Call<A, T, E> for Early<A, T, E, C>
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
