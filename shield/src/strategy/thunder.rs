//! In-process single flight per key.
//!
//! While a call for a key is running, later calls with the same key await
//! that call instead of starting their own, and all of them receive its
//! result. Nothing is stored in the cache: this only collapses concurrent
//! calls inside one process. Combine it with `Locked` to cover several
//! processes sharing a backend.

use crate::error::Result;
use crate::key::KeyArgs;
use crate::strategy::{key_options, Call, Options, Settings};

use std::collections::HashMap;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use futures_util::future::{BoxFuture, FutureExt, Shared};
use parking_lot::Mutex;

const STRATEGY: &str = "thunder_protection";

type Flight<T, E> = Shared<BoxFuture<'static, Arc<std::result::Result<T, E>>>>;

type InFlight<T, E> = Arc<Mutex<HashMap<String, (u64, Flight<T, E>)>>>;

pub struct ThunderProtection<A, T, E, C> {
  op: Arc<C>,
  settings: Arc<Settings<A, T, E>>,
  in_flight: InFlight<T, E>,
  next_flight: AtomicU64,
}

impl<A, T, E, C> ThunderProtection<A, T, E, C>
where
  C: Call<A, T, E>,
{
  pub fn builder(op: C) -> ThunderProtectionBuilder<A, T, E, C> {
    ThunderProtectionBuilder {
      op,
      options: Options::new(""),
      _marker: PhantomData,
    }
  }

  /// Number of keys with a call currently running.
  pub fn in_flight(&self) -> usize {
    self.in_flight.lock().len()
  }
}

pub struct ThunderProtectionBuilder<A, T, E, C> {
  op: C,
  options: Options<A, T, E>,
  _marker: PhantomData<fn(A) -> (T, E)>,
}

impl<A, T, E, C> ThunderProtectionBuilder<A, T, E, C>
where
  C: Call<A, T, E>,
{
  key_options!();

  pub fn build(self) -> Result<ThunderProtection<A, T, E, C>> {
    Ok(ThunderProtection {
      op: Arc::new(self.op),
      settings: Arc::new(self.options.build(STRATEGY)?),
      in_flight: Arc::new(Mutex::new(HashMap::new())),
      next_flight: AtomicU64::new(0),
    })
  }
}

impl<A, T, E, C> ThunderProtection<A, T, E, C>
where
  A: KeyArgs + Send + Sync + 'static,
  T: Clone + Send + Sync + 'static,
  E: Clone + Send + Sync + 'static,
  C: Call<A, T, E>,
{
  /// Returns the running call for `key`, starting one if there is none.
  fn join_or_start(&self, key: String, args: A) -> Flight<T, E> {
    let mut in_flight = self.in_flight.lock();
    if let Some((_, flight)) = in_flight.get(&key) {
      tracing::trace!(strategy = STRATEGY, key = %key, "joining running call");
      return flight.clone();
    }

    let id = self.next_flight.fetch_add(1, Ordering::Relaxed);
    let op = self.op.clone();
    let registry = self.in_flight.clone();
    let finished_key = key.clone();
    let flight = async move {
      let result = op.call(args).await;
      let mut in_flight = registry.lock();
      if in_flight.get(&finished_key).is_some_and(|(running, _)| *running == id) {
        in_flight.remove(&finished_key);
      }
      Arc::new(result)
    }
    .boxed()
    .shared();
    in_flight.insert(key, (id, flight.clone()));
    flight
  }

  async fn run(&self, args: A) -> std::result::Result<T, E> {
    let key = self.settings.key_for(&args);
    let result = self.join_or_start(key, args).await;
    match &*result {
      Ok(value) => Ok(value.clone()),
      Err(error) => Err(error.clone()),
    }
  }
}

impl<A, T, E, C> Call<A, T, E> for ThunderProtection<A, T, E, C>
where
  A: KeyArgs + Send + Sync + 'static,
  T: Clone + Send + Sync + 'static,
  E: Clone + Send + Sync + 'static,
  C: Call<A, T, E>,
{
  fn call(&self, args: A) -> BoxFuture<'_, std::result::Result<T, E>> {
    self.run(args).boxed()
  }
}
