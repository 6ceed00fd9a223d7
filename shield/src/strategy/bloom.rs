//! Bloom-filter guard for membership checks.
//!
//! The wrapped operation answers "does this item exist?". Items are added
//! to a filter with [`Bloom::set`]; a check whose bits are not all set is
//! answered `false` without running the operation. The filter never yields
//! a false negative for an item that was set.

use crate::backend::Backend;
use crate::cache::Cache;
use crate::error::{Error, Result};
use crate::key::{with_prefix, KeyArgs};
use crate::strategy::{key_options, Call, Options, Settings};

use std::marker::PhantomData;
use std::sync::Arc;

use futures_util::future::{BoxFuture, FutureExt};
use sha2::{Digest, Sha256};

const STRATEGY: &str = "bloom";

/// Bit-array size and hash count of a filter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BloomParams {
  pub bits: u64,
  pub hashes: u32,
}

impl BloomParams {
  /// Optimal sizing for `capacity` items at false-positive probability
  /// `rate` (0 < rate < 1).
  pub fn for_capacity(capacity: u64, rate: f64) -> Self {
    let n = capacity.max(1) as f64;
    let ln2 = std::f64::consts::LN_2;
    let bits = (-(n * rate.ln()) / (ln2 * ln2)).ceil().max(1.0);
    let hashes = ((bits / n) * ln2).round().max(1.0);
    Self {
      bits: bits as u64,
      hashes: hashes as u32,
    }
  }

  /// Bit positions of `item`, by double hashing over the first two
  /// big-endian words of its SHA-256 digest. Positions depend only on the
  /// item and the parameters, so filters can be shared between hosts.
  pub fn indexes(&self, item: &str) -> Vec<u64> {
    let digest = Sha256::digest(item.as_bytes());
    let word = |at: usize| {
      let mut bytes = [0u8; 8];
      bytes.copy_from_slice(&digest[at..at + 8]);
      u64::from_be_bytes(bytes)
    };
    let h1 = word(0);
    let h2 = word(8) | 1;
    (0..u64::from(self.hashes))
      .map(|i| h1.wrapping_add(i.wrapping_mul(h2)) % self.bits)
      .collect()
  }
}

pub struct Bloom<A, E, C> {
  cache: Cache,
  op: Arc<C>,
  settings: Arc<Settings<A, bool, E>>,
  params: BloomParams,
  filter_key: String,
  check_false_positive: bool,
}

impl<A, E, C> Bloom<A, E, C>
where
  C: Call<A, bool, E>,
{
  pub fn builder(cache: &Cache, op: C) -> BloomBuilder<A, E, C> {
    BloomBuilder {
      cache: cache.clone(),
      op,
      options: Options::new("bloom"),
      name: None,
      capacity: None,
      false_positives: 1.0,
      check_false_positive: true,
      _marker: PhantomData,
    }
  }

  pub fn params(&self) -> BloomParams {
    self.params
  }
}

pub struct BloomBuilder<A, E, C> {
  cache: Cache,
  op: C,
  options: Options<A, bool, E>,
  name: Option<String>,
  capacity: Option<u64>,
  false_positives: f64,
  check_false_positive: bool,
  _marker: PhantomData<fn(A) -> E>,
}

impl<A, E, C> BloomBuilder<A, E, C>
where
  C: Call<A, bool, E>,
{
  key_options!();

  /// Names the filter. Defaults to the key template; required when the key
  /// is computed.
  pub fn name(mut self, name: impl Into<String>) -> Self {
    self.name = Some(name.into());
    self
  }

  /// Expected number of items.
  pub fn capacity(mut self, capacity: u64) -> Self {
    self.capacity = Some(capacity);
    self
  }

  /// Target false-positive rate in percent. Defaults to 1.
  pub fn false_positives(mut self, percent: f64) -> Self {
    self.false_positives = percent;
    self
  }

  /// Whether a possible member is confirmed by the operation (the default)
  /// or reported `true` straight from the filter.
  pub fn check_false_positive(mut self, check: bool) -> Self {
    self.check_false_positive = check;
    self
  }

  pub fn build(self) -> Result<Bloom<A, E, C>> {
    let settings = self.options.build(STRATEGY)?;
    let capacity = self
      .capacity
      .filter(|&capacity| capacity > 0)
      .ok_or_else(|| Error::InvalidOption("bloom filter needs a positive capacity".to_string()))?;
    if !(self.false_positives > 0.0 && self.false_positives < 100.0) {
      return Err(Error::InvalidOption(
        "false_positives must be between 0 and 100".to_string(),
      ));
    }
    let name = match (self.name, settings.key().template()) {
      (Some(name), _) => name,
      (None, Some(template)) => template.as_str().to_string(),
      (None, None) => {
        return Err(Error::InvalidOption(
          "bloom filter with a computed key needs a name".to_string(),
        ))
      }
    };
    let params = BloomParams::for_capacity(capacity, self.false_positives / 100.0);
    let filter_key = format!("{}:{}", with_prefix(settings.prefix(), &name), params.bits);
    Ok(Bloom {
      cache: self.cache,
      op: Arc::new(self.op),
      settings: Arc::new(settings),
      params,
      filter_key,
      check_false_positive: self.check_false_positive,
    })
  }
}

impl<A, E, C> Bloom<A, E, C>
where
  A: KeyArgs + Send + Sync + 'static,
  E: From<Error> + Send + 'static,
  C: Call<A, bool, E>,
{
  /// Adds the item named by `args` to the filter.
  pub async fn set(&self, args: &A) -> Result<()> {
    let item = self.settings.key().render(args);
    let indexes = self.params.indexes(&item);
    self.cache.set_bits(&self.filter_key, &indexes, None).await?;
    tracing::trace!(strategy = STRATEGY, filter = %self.filter_key, item = %item, "item added");
    Ok(())
  }

  async fn run(&self, args: A) -> std::result::Result<bool, E> {
    let item = self.settings.key().render(&args);
    let indexes = self.params.indexes(&item);
    let bits = self.cache.get_bits(&self.filter_key, &indexes).await?;
    if !bits.iter().all(|&bit| bit) {
      tracing::trace!(strategy = STRATEGY, item = %item, "definitely absent");
      return Ok(false);
    }
    if self.check_false_positive {
      self.op.call(args).await
    } else {
      Ok(true)
    }
  }
}

impl<A, E, C> Call<A, bool, E> for Bloom<A, E, C>
where
  A: KeyArgs + Send + Sync + 'static,
  E: From<Error> + Send + 'static,
  C: Call<A, bool, E>,
{
  fn call(&self, args: A) -> BoxFuture<'_, std::result::Result<bool, E>> {
    self.run(args).boxed()
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn sizing_follows_the_optimal_formulas() {
    let params = BloomParams::for_capacity(10_000, 0.01);
    // m = ceil(-n ln p / ln2^2), k = round(m / n * ln2)
    assert_eq!(params.bits, 95_851);
    assert_eq!(params.hashes, 7);
  }

  #[test]
  fn tiny_filters_keep_one_hash() {
    let params = BloomParams::for_capacity(1, 0.99);
    assert!(params.bits >= 1);
    assert_eq!(params.hashes, 1);
  }

  #[test]
  fn indexes_are_stable_and_in_range() {
    let params = BloomParams::for_capacity(1_000, 0.01);
    let a = params.indexes("alice");
    assert_eq!(a, params.indexes("alice"));
    assert_eq!(a.len(), params.hashes as usize);
    assert!(a.iter().all(|&i| i < params.bits));
    assert_ne!(a, params.indexes("bob"));
  }

  #[test]
  fn indexes_are_pinned_to_the_digest() {
    let params = BloomParams::for_capacity(1_000, 0.01);
    assert_eq!(params, BloomParams { bits: 9_586, hashes: 7 });
    assert_eq!(
      params.indexes("alice"),
      vec![3_681, 6_252, 8_823, 1_808, 4_379, 6_950, 9_521]
    );
  }
}
