#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use fibre_shield::{Cache, ManualClock, MemoryBackend};

/// The error type test operations fail with.
#[derive(Debug, Clone, thiserror::Error)]
pub enum AppError {
  #[error("upstream failed: {0}")]
  Upstream(String),
  #[error("bad request")]
  BadRequest,
  #[error(transparent)]
  Cache(#[from] fibre_shield::Error),
}

impl AppError {
  pub fn cache_error(&self) -> Option<&fibre_shield::Error> {
    match self {
      AppError::Cache(e) => Some(e),
      _ => None,
    }
  }
}

pub fn init_tracing() {
  let _ = tracing_subscriber::fmt()
    .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
    .with_test_writer()
    .try_init();
}

// A memory backend without a janitor so tests control expiry themselves.
pub fn memory() -> MemoryBackend {
  MemoryBackend::builder()
    .shards(4)
    .janitor_tick_interval(None)
    .build()
    .unwrap()
}

pub fn build_test_cache() -> Cache {
  init_tracing();
  Cache::builder().backend(memory()).build().unwrap()
}

/// A cache whose strategies read time from the returned clock.
pub fn build_test_cache_with_clock() -> (Cache, Arc<ManualClock>) {
  init_tracing();
  let clock = Arc::new(ManualClock::new());
  let cache = Cache::builder()
    .backend(memory())
    .shared_clock(clock.clone())
    .build()
    .unwrap();
  (cache, clock)
}

/// Counts how often an operation ran.
#[derive(Clone, Default)]
pub struct Calls(Arc<AtomicUsize>);

impl Calls {
  pub fn new() -> Self {
    Self::default()
  }

  /// Records a call and returns its 1-based number.
  pub fn hit(&self) -> usize {
    self.0.fetch_add(1, Ordering::SeqCst) + 1
  }

  pub fn count(&self) -> usize {
    self.0.load(Ordering::SeqCst)
  }
}

pub async fn sleep_ms(ms: u64) {
  tokio::time::sleep(Duration::from_millis(ms)).await;
}
