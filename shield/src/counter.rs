//! Windowed counters for rate limiting and circuit breaking.
//!
//! Counting relies on the backend's atomic `incr`: the increment that creates
//! a counter also sets its expiry, so a window rolls over when its key
//! expires and no read-modify-write race is possible.

use crate::backend::Backend;
use crate::clock::Clock;
use crate::error::{Error, Result};

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// Fixed and sliding window counters over one backend.
#[derive(Clone)]
pub struct CounterEngine {
  backend: Arc<dyn Backend>,
  clock: Arc<dyn Clock>,
}

impl fmt::Debug for CounterEngine {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("CounterEngine")
      .field("backend", &self.backend.name())
      .finish()
  }
}

impl CounterEngine {
  pub fn new(backend: Arc<dyn Backend>, clock: Arc<dyn Clock>) -> Self {
    Self { backend, clock }
  }

  /// Counts one call in the fixed window at `key` and returns the window's
  /// count. The first call of a window starts it with length `period`.
  pub async fn hit(&self, key: &str, period: Duration) -> Result<i64> {
    self.backend.incr(key, 1, Some(period)).await
  }

  /// Counts one call and returns the number of calls in the trailing
  /// `period`, measured over `slices` sub-windows.
  pub async fn sliding(&self, key: &str, period: Duration, slices: u32) -> Result<i64> {
    let (slice, current) = self.current_slice(period, slices);
    let mine = self
      .backend
      .incr(&slice_key(key, current), 1, Some(period + slice))
      .await?;
    let earlier = self.sum(key, current, slices, 1).await?;
    Ok(mine + earlier)
  }

  /// Returns the number of calls in the trailing `period` without counting.
  pub async fn sample(&self, key: &str, period: Duration, slices: u32) -> Result<i64> {
    let (_, current) = self.current_slice(period, slices);
    self.sum(key, current, slices, 0).await
  }

  /// Drops the counter at `key` and all of its sub-windows.
  pub async fn reset(&self, key: &str) -> Result<()> {
    self.backend.delete(key).await?;
    self.backend.delete_match(&format!("{}:*", key)).await?;
    Ok(())
  }

  fn current_slice(&self, period: Duration, slices: u32) -> (Duration, i64) {
    let slices = slices.max(1);
    let slice = (period / slices).max(Duration::from_millis(1));
    let now = self.clock.now().timestamp_millis();
    (slice, now.div_euclid(slice.as_millis() as i64))
  }

  /// Sums sub-windows `current - skip` down to `current - slices + 1`.
  async fn sum(&self, key: &str, current: i64, slices: u32, skip: u32) -> Result<i64> {
    let keys: Vec<String> = (skip..slices.max(1))
      .map(|back| slice_key(key, current - i64::from(back)))
      .collect();
    if keys.is_empty() {
      return Ok(0);
    }
    let values = self.backend.get_many(&keys).await?;
    values
      .into_iter()
      .zip(&keys)
      .map(|(value, key)| parse_count(key, value.as_deref()))
      .sum()
  }
}

fn slice_key(key: &str, index: i64) -> String {
  format!("{}:{}", key, index)
}

/// Reads a stored counter; absent counts as zero.
pub(crate) fn parse_count(key: &str, value: Option<&[u8]>) -> Result<i64> {
  match value {
    None => Ok(0),
    Some(bytes) => std::str::from_utf8(bytes)
      .ok()
      .and_then(|text| text.parse().ok())
      .ok_or_else(|| Error::WrongType {
        key: key.to_string(),
      }),
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::backend::MemoryBackend;
  use crate::clock::ManualClock;

  fn engine(clock: Arc<ManualClock>) -> CounterEngine {
    CounterEngine::new(Arc::new(MemoryBackend::new()), clock)
  }

  #[tokio::test]
  async fn fixed_window_counts_up() {
    let counters = engine(Arc::new(ManualClock::new()));
    for expected in 1..=3 {
      assert_eq!(counters.hit("hits", Duration::from_secs(60)).await.unwrap(), expected);
    }
    counters.reset("hits").await.unwrap();
    assert_eq!(counters.hit("hits", Duration::from_secs(60)).await.unwrap(), 1);
  }

  #[tokio::test]
  async fn sliding_window_forgets_old_slices() {
    let clock = Arc::new(ManualClock::new());
    let counters = engine(clock.clone());
    let period = Duration::from_secs(60);

    assert_eq!(counters.sliding("s", period, 6).await.unwrap(), 1);
    clock.advance(Duration::from_secs(10));
    assert_eq!(counters.sliding("s", period, 6).await.unwrap(), 2);
    clock.advance(Duration::from_secs(30));
    assert_eq!(counters.sample("s", period, 6).await.unwrap(), 2);

    // Both earlier calls have slid out of the window.
    clock.advance(Duration::from_secs(61));
    assert_eq!(counters.sample("s", period, 6).await.unwrap(), 0);
    assert_eq!(counters.sliding("s", period, 6).await.unwrap(), 1);
  }

  #[test]
  fn parses_counts() {
    assert_eq!(parse_count("k", None).unwrap(), 0);
    assert_eq!(parse_count("k", Some(b"42")).unwrap(), 42);
    assert!(matches!(parse_count("k", Some(b"x")), Err(Error::WrongType { .. })));
  }
}
