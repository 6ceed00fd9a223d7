//! Drop cached entries after a mutating operation succeeds.
//!
//! Targets are templates of stored keys, prefix included (for example
//! `"early:user:{id}"`). A target whose arguments are all supplied by the
//! call is deleted directly; otherwise the missing arguments become `*` and
//! every matching key is deleted.

use crate::backend::Backend;
use crate::cache::Cache;
use crate::error::{Error, Result};
use crate::key::{KeyArgs, KeyTemplate};
use crate::strategy::Call;

use std::marker::PhantomData;
use std::sync::Arc;

use futures_util::future::{BoxFuture, FutureExt};

pub struct Invalidate<A, T, E, C> {
  cache: Cache,
  op: Arc<C>,
  targets: Vec<KeyTemplate>,
  tags: Vec<KeyTemplate>,
  arg_map: Vec<(String, String)>,
  defaults: Vec<(String, String)>,
  _marker: PhantomData<fn(A) -> (T, E)>,
}

impl<A, T, E, C> Invalidate<A, T, E, C>
where
  C: Call<A, T, E>,
{
  pub fn builder(cache: &Cache, op: C) -> InvalidateBuilder<A, T, E, C> {
    InvalidateBuilder {
      cache: cache.clone(),
      op,
      targets: Vec::new(),
      tags: Vec::new(),
      arg_map: Vec::new(),
      defaults: Vec::new(),
      error: None,
      _marker: PhantomData,
    }
  }
}

pub struct InvalidateBuilder<A, T, E, C> {
  cache: Cache,
  op: C,
  targets: Vec<KeyTemplate>,
  tags: Vec<KeyTemplate>,
  arg_map: Vec<(String, String)>,
  defaults: Vec<(String, String)>,
  error: Option<Error>,
  _marker: PhantomData<fn(A) -> (T, E)>,
}

impl<A, T, E, C> InvalidateBuilder<A, T, E, C>
where
  C: Call<A, T, E>,
{
  fn parse_into(&mut self, template: &str, tag: bool) {
    match KeyTemplate::parse(template) {
      Ok(template) if tag => self.tags.push(template),
      Ok(template) => self.targets.push(template),
      Err(e) => {
        self.error.get_or_insert(e);
      }
    }
  }

  /// Adds a stored-key template to delete.
  pub fn target(mut self, template: &str) -> Self {
    self.parse_into(template, false);
    self
  }

  /// Adds tag templates whose members are deleted.
  pub fn tags(mut self, tags: &[&str]) -> Self {
    for tag in tags {
      self.parse_into(tag, true);
    }
    self
  }

  /// Feeds the call argument `from` to targets as `to`.
  pub fn arg_map(mut self, to: impl Into<String>, from: impl Into<String>) -> Self {
    self.arg_map.push((to.into(), from.into()));
    self
  }

  /// Value used for a target argument the call does not supply.
  pub fn default_arg(mut self, name: impl Into<String>, value: impl ToString) -> Self {
    self.defaults.push((name.into(), value.to_string()));
    self
  }

  pub fn build(self) -> Result<Invalidate<A, T, E, C>> {
    if let Some(e) = self.error {
      return Err(e);
    }
    if self.targets.is_empty() && self.tags.is_empty() {
      return Err(Error::InvalidOption(
        "invalidate needs a target or a tag".to_string(),
      ));
    }
    Ok(Invalidate {
      cache: self.cache,
      op: Arc::new(self.op),
      targets: self.targets,
      tags: self.tags,
      arg_map: self.arg_map,
      defaults: self.defaults,
      _marker: PhantomData,
    })
  }
}

/// Call arguments as seen by the targets.
struct TargetArgs<'a> {
  args: &'a (dyn KeyArgs + Sync),
  arg_map: &'a [(String, String)],
  defaults: &'a [(String, String)],
}

impl KeyArgs for TargetArgs<'_> {
  fn key_arg(&self, name: &str) -> Option<String> {
    let source = self
      .arg_map
      .iter()
      .find(|(to, _)| to == name)
      .map_or(name, |(_, from)| from.as_str());
    self.args.key_arg(source).or_else(|| {
      self
        .defaults
        .iter()
        .find(|(n, _)| n == name)
        .map(|(_, v)| v.clone())
    })
  }
}

impl<A, T, E, C> Invalidate<A, T, E, C>
where
  A: KeyArgs + Send + Sync + 'static,
  T: Send + 'static,
  E: From<Error> + Send + 'static,
  C: Call<A, T, E>,
{
  async fn invalidate(&self, args: &(dyn KeyArgs + Sync)) -> Result<()> {
    let view = TargetArgs {
      args,
      arg_map: &self.arg_map,
      defaults: &self.defaults,
    };
    for target in &self.targets {
      if target.is_complete_for(&view) {
        let key = target.render(&view);
        self.cache.delete(&key).await?;
        tracing::debug!(key = %key, "invalidated");
      } else {
        let pattern = target.render_pattern(&view);
        let deleted = self.cache.delete_match(&pattern).await?;
        tracing::debug!(pattern = %pattern, deleted, "invalidated by pattern");
      }
    }
    if !self.tags.is_empty() {
      let tags: Vec<String> = self.tags.iter().map(|tag| tag.render(&view)).collect();
      self.cache.delete_tags(&tags).await?;
    }
    Ok(())
  }

  async fn run(&self, args: A) -> std::result::Result<T, E> {
    let captured = Captured::from_templates(&args, self.targets.iter().chain(&self.tags), &self.arg_map);
    let value = self.op.call(args).await?;
    self.invalidate(&captured).await?;
    Ok(value)
  }
}

/// The argument values targets reference, captured before the call.
struct Captured(Vec<(String, String)>);

impl Captured {
  fn from_templates<'t>(
    args: &dyn KeyArgs,
    templates: impl Iterator<Item = &'t KeyTemplate>,
    arg_map: &[(String, String)],
  ) -> Self {
    let mut values: Vec<(String, String)> = Vec::new();
    let mut capture = |name: &str| {
      if values.iter().all(|(n, _)| n != name) {
        if let Some(value) = args.key_arg(name) {
          values.push((name.to_string(), value));
        }
      }
    };
    for template in templates {
      for name in template.arg_names() {
        capture(name);
      }
    }
    for (_, from) in arg_map {
      capture(from);
    }
    Self(values)
  }
}

impl KeyArgs for Captured {
  fn key_arg(&self, name: &str) -> Option<String> {
    self.0.iter().find(|(n, _)| n == name).map(|(_, v)| v.clone())
  }
}

impl<A, T, E, C> Call<A, T, E> for Invalidate<A, T, E, C>
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
