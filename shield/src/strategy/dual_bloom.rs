//! Self-filling pair of bloom filters for yes/no operations.
//!
//! One filter remembers items answered `true`, the other items answered
//! `false`. Unlike [`Bloom`](super::Bloom) nothing has to be added up front:
//! an item unknown to both filters runs the operation and records its
//! answer. Answers read from a single filter may be wrong with roughly the
//! configured false rate; an item present in both filters always runs the
//! operation.

use crate::backend::Backend;
use crate::cache::Cache;
use crate::error::{Error, Result};
use crate::key::{with_prefix, KeyArgs};
use crate::strategy::bloom::BloomParams;
use crate::strategy::{key_options, Call, Options, Settings};

use std::marker::PhantomData;
use std::sync::Arc;

use futures_util::future::{try_join, BoxFuture, FutureExt};

const STRATEGY: &str = "dual_bloom";

/// One side of the pair.
struct Side {
  params: BloomParams,
  key: String,
  suffix: &'static str,
}

impl Side {
  fn indexes(&self, item: &str) -> Vec<u64> {
    self.params.indexes(&format!("{}{}", item, self.suffix))
  }
}

pub struct DualBloom<A, E, C> {
  cache: Cache,
  op: Arc<C>,
  settings: Arc<Settings<A, bool, E>>,
  yes: Side,
  no: Side,
  no_collisions: bool,
}

impl<A, E, C> DualBloom<A, E, C>
where
  C: Call<A, bool, E>,
{
  pub fn builder(cache: &Cache, op: C) -> DualBloomBuilder<A, E, C> {
    DualBloomBuilder {
      cache: cache.clone(),
      op,
      options: Options::new("dual_bloom"),
      name: None,
      capacities: None,
      false_rates: (1.0, 1.0),
      no_collisions: false,
      _marker: PhantomData,
    }
  }

  /// Sizing of the filters remembering `true` and `false` answers.
  pub fn params(&self) -> (BloomParams, BloomParams) {
    (self.yes.params, self.no.params)
  }
}

pub struct DualBloomBuilder<A, E, C> {
  cache: Cache,
  op: C,
  options: Options<A, bool, E>,
  name: Option<String>,
  capacities: Option<(u64, u64)>,
  false_rates: (f64, f64),
  no_collisions: bool,
  _marker: PhantomData<fn(A) -> E>,
}

impl<A, E, C> DualBloomBuilder<A, E, C>
where
  C: Call<A, bool, E>,
{
  key_options!();

  /// Names the filters. Defaults to the key template.
  pub fn name(mut self, name: impl Into<String>) -> Self {
    self.name = Some(name.into());
    self
  }

  /// Expected number of items, for both filters.
  pub fn capacity(self, capacity: u64) -> Self {
    self.capacities(capacity, capacity)
  }

  /// Expected number of `true` and `false` items.
  pub fn capacities(mut self, yes: u64, no: u64) -> Self {
    self.capacities = Some((yes, no));
    self
  }

  /// Wrong-answer rate in percent, for both filters. Defaults to 1.
  pub fn false_rate(self, percent: f64) -> Self {
    self.false_rates(percent, percent)
  }

  pub fn false_rates(mut self, yes: f64, no: f64) -> Self {
    self.false_rates = (yes, no);
    self
  }

  /// Only record an answer when none of its bits were already set.
  pub fn no_collisions(mut self, no_collisions: bool) -> Self {
    self.no_collisions = no_collisions;
    self
  }

  pub fn build(self) -> Result<DualBloom<A, E, C>> {
    let settings = self.options.build(STRATEGY)?;
    let (yes_capacity, no_capacity) = self
      .capacities
      .filter(|&(yes, no)| yes > 0 && no > 0)
      .ok_or_else(|| Error::InvalidOption("dual bloom needs positive capacities".to_string()))?;
    let (yes_rate, no_rate) = self.false_rates;
    for rate in [yes_rate, no_rate] {
      if !(rate > 0.0 && rate < 100.0) {
        return Err(Error::InvalidOption(
          "false rate must be between 0 and 100".to_string(),
        ));
      }
    }
    let name = match (self.name, settings.key().template()) {
      (Some(name), _) => name,
      (None, Some(template)) => template.as_str().to_string(),
      (None, None) => {
        return Err(Error::InvalidOption(
          "dual bloom with a computed key needs a name".to_string(),
        ))
      }
    };
    let base = with_prefix(settings.prefix(), &name);
    let yes = Side {
      params: BloomParams::for_capacity(yes_capacity, yes_rate / 100.0),
      key: format!("{}:true", base),
      suffix: "true",
    };
    let no = Side {
      params: BloomParams::for_capacity(no_capacity, no_rate / 100.0),
      key: format!("{}:false", base),
      suffix: "false",
    };
    Ok(DualBloom {
      cache: self.cache,
      op: Arc::new(self.op),
      settings: Arc::new(settings),
      yes,
      no,
      no_collisions: self.no_collisions,
    })
  }
}

impl<A, E, C> DualBloom<A, E, C>
where
  A: KeyArgs + Send + Sync + 'static,
  E: From<Error> + Send + 'static,
  C: Call<A, bool, E>,
{
  async fn run(&self, args: A) -> std::result::Result<bool, E> {
    let item = self.settings.key().render(&args);
    let yes_indexes = self.yes.indexes(&item);
    let no_indexes = self.no.indexes(&item);
    let (yes_bits, no_bits) = try_join(
      self.cache.get_bits(&self.yes.key, &yes_indexes),
      self.cache.get_bits(&self.no.key, &no_indexes),
    )
    .await?;
    let in_yes = yes_bits.iter().all(|&bit| bit);
    let in_no = no_bits.iter().all(|&bit| bit);

    match (in_yes, in_no) {
      (true, false) => Ok(true),
      (false, true) => Ok(false),
      (true, true) => {
        tracing::trace!(strategy = STRATEGY, item = %item, "seen on both sides");
        self.op.call(args).await
      }
      (false, false) => {
        let answer = self.op.call(args).await?;
        let (side, indexes, bits) = if answer {
          (&self.yes, &yes_indexes, &yes_bits)
        } else {
          (&self.no, &no_indexes, &no_bits)
        };
        if !self.no_collisions || bits.iter().all(|&bit| !bit) {
          self.cache.set_bits(&side.key, indexes, None).await?;
          tracing::trace!(strategy = STRATEGY, item = %item, answer, "answer recorded");
        }
        Ok(answer)
      }
    }
  }
}

impl<A, E, C> Call<A, bool, E> for DualBloom<A, E, C>
where
  A: KeyArgs + Send + Sync + 'static,
  E: From<Error> + Send + 'static,
  C: Call<A, bool, E>,
{
  fn call(&self, args: A) -> BoxFuture<'_, std::result::Result<bool, E>> {
    self.run(args).boxed()
  }
}
