//! Time-to-live values accepted by strategies.
//!
//! A ttl is either fixed or computed from the call's arguments. Fixed values
//! can be given as a `Duration`, a number of seconds, or a duration string:
//! the compact `"1d2h3m"` form, a bare `"90"` (seconds), or any form
//! understood by `humantime` such as `"1h 30m"` or `"250ms"`.

use crate::error::{Error, Result};

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// A fixed or argument-dependent time-to-live.
pub enum Ttl<A> {
  Fixed(Duration),
  Computed(Arc<dyn Fn(&A) -> Duration + Send + Sync>),
}

impl<A> Ttl<A> {
  /// A ttl derived from the call's arguments.
  pub fn computed(f: impl Fn(&A) -> Duration + Send + Sync + 'static) -> Self {
    Ttl::Computed(Arc::new(f))
  }

  /// Resolves the ttl for one call.
  pub fn resolve(&self, args: &A) -> Duration {
    match self {
      Ttl::Fixed(d) => *d,
      Ttl::Computed(f) => f(args),
    }
  }

  /// Returns the duration when the ttl does not depend on arguments.
  pub fn fixed(&self) -> Option<Duration> {
    match self {
      Ttl::Fixed(d) => Some(*d),
      Ttl::Computed(_) => None,
    }
  }
}

impl<A> Clone for Ttl<A> {
  fn clone(&self) -> Self {
    match self {
      Ttl::Fixed(d) => Ttl::Fixed(*d),
      Ttl::Computed(f) => Ttl::Computed(f.clone()),
    }
  }
}

impl<A> fmt::Debug for Ttl<A> {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      Ttl::Fixed(d) => f.debug_tuple("Fixed").field(d).finish(),
      Ttl::Computed(_) => f.write_str("Computed(..)"),
    }
  }
}

/// Conversion into a [`Ttl`], fallible for strings.
pub trait IntoTtl<A> {
  fn into_ttl(self) -> Result<Ttl<A>>;
}

impl<A> IntoTtl<A> for Ttl<A> {
  fn into_ttl(self) -> Result<Ttl<A>> {
    Ok(self)
  }
}

impl<A> IntoTtl<A> for Duration {
  fn into_ttl(self) -> Result<Ttl<A>> {
    Ok(Ttl::Fixed(self))
  }
}

impl<A> IntoTtl<A> for u64 {
  fn into_ttl(self) -> Result<Ttl<A>> {
    Ok(Ttl::Fixed(Duration::from_secs(self)))
  }
}

impl<A> IntoTtl<A> for &str {
  fn into_ttl(self) -> Result<Ttl<A>> {
    parse_duration(self).map(Ttl::Fixed)
  }
}

impl<A> IntoTtl<A> for String {
  fn into_ttl(self) -> Result<Ttl<A>> {
    parse_duration(&self).map(Ttl::Fixed)
  }
}

/// Parses a duration string.
pub fn parse_duration(input: &str) -> Result<Duration> {
  let trimmed = input.trim();
  if trimmed.is_empty() {
    return Err(Error::InvalidTtl(input.to_string()));
  }
  if trimmed.bytes().all(|b| b.is_ascii_digit()) {
    return trimmed
      .parse::<u64>()
      .map(Duration::from_secs)
      .map_err(|_| Error::InvalidTtl(input.to_string()));
  }
  if let Some(duration) = parse_compact(trimmed) {
    return Ok(duration);
  }
  humantime::parse_duration(trimmed).map_err(|_| Error::InvalidTtl(input.to_string()))
}

// "1d2h3m4s": digits followed by a single unit letter, repeated.
fn parse_compact(input: &str) -> Option<Duration> {
  let mut total = 0u64;
  let mut digits = String::new();
  for ch in input.chars() {
    if ch.is_ascii_digit() {
      digits.push(ch);
      continue;
    }
    let unit = match ch.to_ascii_lowercase() {
      'd' => 86_400,
      'h' => 3_600,
      'm' => 60,
      's' => 1,
      _ => return None,
    };
    if digits.is_empty() {
      return None;
    }
    total = total.checked_add(digits.parse::<u64>().ok()?.checked_mul(unit)?)?;
    digits.clear();
  }
  if !digits.is_empty() {
    return None;
  }
  Some(Duration::from_secs(total))
}
