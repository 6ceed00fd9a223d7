use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::{Duration, Instant};

// The single, static reference point for monotonic expiry calculations.
static SHIELD_EPOCH: Lazy<Instant> = Lazy::new(Instant::now);

/// Converts an `Instant` into a `Duration` since the epoch.
#[inline]
pub(crate) fn instant_to_duration(instant: Instant) -> Duration {
  instant.saturating_duration_since(*SHIELD_EPOCH)
}

/// A helper to get the current monotonic time as a `Duration` since the epoch.
#[inline]
pub(crate) fn now_duration() -> Duration {
  instant_to_duration(Instant::now())
}

/// Source of wall-clock time for values that record when they were computed.
///
/// Backend expiry is always monotonic; the clock only drives entry ages
/// (early and soft strategies) and counter window boundaries.
pub trait Clock: Send + Sync + 'static {
  fn now(&self) -> DateTime<Utc>;
}

/// The real wall clock.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
  fn now(&self) -> DateTime<Utc> {
    Utc::now()
  }
}

/// A clock that only moves when told to. Useful for exercising age-based
/// strategies without waiting.
#[derive(Debug)]
pub struct ManualClock {
  base: DateTime<Utc>,
  offset_millis: AtomicI64,
}

impl ManualClock {
  /// Creates a clock frozen at the current wall-clock time.
  pub fn new() -> Self {
    Self::starting_at(Utc::now())
  }

  pub fn starting_at(base: DateTime<Utc>) -> Self {
    Self {
      base,
      offset_millis: AtomicI64::new(0),
    }
  }

  /// Moves the clock forward by `by`.
  pub fn advance(&self, by: Duration) {
    self
      .offset_millis
      .fetch_add(by.as_millis() as i64, Ordering::SeqCst);
  }
}

impl Default for ManualClock {
  fn default() -> Self {
    Self::new()
  }
}

impl Clock for ManualClock {
  fn now(&self) -> DateTime<Utc> {
    self.base + chrono::Duration::milliseconds(self.offset_millis.load(Ordering::SeqCst))
  }
}

/// Milliseconds elapsed between `earlier` and `later`, clamped at zero.
pub(crate) fn elapsed_between(earlier: DateTime<Utc>, later: DateTime<Utc>) -> Duration {
  (later - earlier).to_std().unwrap_or(Duration::ZERO)
}
