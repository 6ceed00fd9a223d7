//! Cache key derivation.
//!
//! A key template such as `"user:{id}:{name:lower}"` is parsed once into an
//! ordered list of literal segments and argument references. Arguments are
//! looked up by name through [`KeyArgs`]; an optional transform from a closed
//! [`Transforms`] registry is applied to the argument's text.

use crate::error::{Error, Result};

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;

use sha2::{Digest, Sha256};

/// Named arguments a key template can reference.
pub trait KeyArgs {
  /// Returns the textual value of the argument called `name`.
  fn key_arg(&self, name: &str) -> Option<String>;
}

impl KeyArgs for () {
  fn key_arg(&self, _name: &str) -> Option<String> {
    None
  }
}

impl KeyArgs for HashMap<String, String> {
  fn key_arg(&self, name: &str) -> Option<String> {
    self.get(name).cloned()
  }
}

impl KeyArgs for BTreeMap<String, String> {
  fn key_arg(&self, name: &str) -> Option<String> {
    self.get(name).cloned()
  }
}

impl<T: KeyArgs + ?Sized> KeyArgs for &T {
  fn key_arg(&self, name: &str) -> Option<String> {
    (**self).key_arg(name)
  }
}

impl<T: KeyArgs + ?Sized> KeyArgs for Arc<T> {
  fn key_arg(&self, name: &str) -> Option<String> {
    (**self).key_arg(name)
  }
}

/// An ordered list of named call arguments.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct Args(Vec<(String, String)>);

impl Args {
  pub fn new() -> Self {
    Self::default()
  }

  /// Appends an argument, replacing an earlier one with the same name.
  pub fn with(mut self, name: impl Into<String>, value: impl ToString) -> Self {
    let name = name.into();
    let value = value.to_string();
    match self.0.iter_mut().find(|(n, _)| *n == name) {
      Some(slot) => slot.1 = value,
      None => self.0.push((name, value)),
    }
    self
  }

  /// Returns a copy with arguments renamed according to `map` (from -> to).
  pub fn renamed(&self, map: &[(String, String)]) -> Self {
    let mut renamed = self.clone();
    for (from, to) in map {
      if let Some(slot) = renamed.0.iter_mut().find(|(n, _)| n == from) {
        slot.0 = to.clone();
      }
    }
    renamed
  }

  pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
    self.0.iter().map(|(n, v)| (n.as_str(), v.as_str()))
  }
}

impl KeyArgs for Args {
  fn key_arg(&self, name: &str) -> Option<String> {
    self
      .0
      .iter()
      .find(|(n, _)| n == name)
      .map(|(_, v)| v.clone())
  }
}

/// A pure string-to-string function, optionally parameterised.
pub type TransformFn = Arc<dyn Fn(&str, &[String]) -> String + Send + Sync>;

/// The closed registry of transforms templates may reference.
#[derive(Clone)]
pub struct Transforms {
  fns: HashMap<String, TransformFn>,
}

impl Transforms {
  /// An empty registry.
  pub fn empty() -> Self {
    Self { fns: HashMap::new() }
  }

  /// The built-in transforms: `lower`, `upper`, `trim`, `len` and `hash`
  /// (sha256, hex encoded).
  pub fn standard() -> Self {
    let mut transforms = Self::empty();
    transforms.register("lower", |v, _| v.to_lowercase());
    transforms.register("upper", |v, _| v.to_uppercase());
    transforms.register("trim", |v, _| v.trim().to_string());
    transforms.register("len", |v, _| v.chars().count().to_string());
    transforms.register("hash", |v, _| hex::encode(Sha256::digest(v.as_bytes())));
    transforms
  }

  pub fn register(
    &mut self,
    name: impl Into<String>,
    f: impl Fn(&str, &[String]) -> String + Send + Sync + 'static,
  ) {
    self.fns.insert(name.into(), Arc::new(f));
  }

  fn get(&self, name: &str) -> Option<TransformFn> {
    self.fns.get(name).cloned()
  }
}

impl Default for Transforms {
  fn default() -> Self {
    Self::standard()
  }
}

impl fmt::Debug for Transforms {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let mut names: Vec<_> = self.fns.keys().collect();
    names.sort();
    f.debug_struct("Transforms").field("names", &names).finish()
  }
}

#[derive(Clone)]
enum Segment {
  Literal(String),
  Arg {
    name: String,
    transform: Option<(TransformFn, Vec<String>)>,
  },
}

/// A parsed key template.
#[derive(Clone)]
pub struct KeyTemplate {
  source: String,
  segments: Vec<Segment>,
}

impl KeyTemplate {
  /// Parses `template` against the standard transforms.
  pub fn parse(template: &str) -> Result<Self> {
    Self::parse_with(template, &Transforms::standard())
  }

  /// Parses `template` against a custom transform registry.
  ///
  /// `{{` and `}}` produce literal braces.
  pub fn parse_with(template: &str, transforms: &Transforms) -> Result<Self> {
    let invalid = |reason: &str| Error::InvalidKeyTemplate {
      template: template.to_string(),
      reason: reason.to_string(),
    };

    let mut segments = Vec::new();
    let mut literal = String::new();
    let mut chars = template.chars().peekable();

    while let Some(ch) = chars.next() {
      match ch {
        '{' if chars.peek() == Some(&'{') => {
          chars.next();
          literal.push('{');
        }
        '}' if chars.peek() == Some(&'}') => {
          chars.next();
          literal.push('}');
        }
        '}' => return Err(invalid("unmatched `}`")),
        '{' => {
          let mut field = String::new();
          let mut closed = false;
          for inner in chars.by_ref() {
            if inner == '}' {
              closed = true;
              break;
            }
            field.push(inner);
          }
          if !closed {
            return Err(invalid("unterminated `{`"));
          }
          if !literal.is_empty() {
            segments.push(Segment::Literal(std::mem::take(&mut literal)));
          }
          segments.push(parse_field(&field, transforms).map_err(|e| match e {
            Error::UnknownTransform(_) => e,
            other => invalid(&other.to_string()),
          })?);
        }
        other => literal.push(other),
      }
    }
    if !literal.is_empty() {
      segments.push(Segment::Literal(literal));
    }

    Ok(Self {
      source: template.to_string(),
      segments,
    })
  }

  /// Renders the key; missing arguments render as empty text.
  pub fn render(&self, args: &dyn KeyArgs) -> String {
    self.render_inner(args, "")
  }

  /// Renders a glob pattern; missing arguments render as `*`.
  pub fn render_pattern(&self, args: &dyn KeyArgs) -> String {
    self.render_inner(args, "*")
  }

  /// Returns `true` when every referenced argument is supplied by `args`.
  pub fn is_complete_for(&self, args: &dyn KeyArgs) -> bool {
    self.segments.iter().all(|segment| match segment {
      Segment::Literal(_) => true,
      Segment::Arg { name, .. } => args.key_arg(name).is_some(),
    })
  }

  /// The names of the arguments the template references, in order.
  pub fn arg_names(&self) -> impl Iterator<Item = &str> {
    self.segments.iter().filter_map(|segment| match segment {
      Segment::Arg { name, .. } => Some(name.as_str()),
      Segment::Literal(_) => None,
    })
  }

  pub fn as_str(&self) -> &str {
    &self.source
  }

  fn render_inner(&self, args: &dyn KeyArgs, missing: &str) -> String {
    let mut out = String::with_capacity(self.source.len());
    for segment in &self.segments {
      match segment {
        Segment::Literal(text) => out.push_str(text),
        Segment::Arg { name, transform } => match args.key_arg(name) {
          Some(value) => match transform {
            Some((f, params)) => out.push_str(&f(&value, params)),
            None => out.push_str(&value),
          },
          None => out.push_str(missing),
        },
      }
    }
    out
  }
}

impl fmt::Debug for KeyTemplate {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_tuple("KeyTemplate").field(&self.source).finish()
  }
}

impl fmt::Display for KeyTemplate {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(&self.source)
  }
}

// "name", "name:transform" or "name:transform(a,b)"
fn parse_field(field: &str, transforms: &Transforms) -> Result<Segment> {
  let (name, spec) = match field.split_once(':') {
    Some((name, spec)) => (name.trim(), Some(spec.trim())),
    None => (field.trim(), None),
  };
  if name.is_empty() {
    return Err(Error::UnknownTransform("empty argument name".to_string()));
  }
  if !name
    .chars()
    .all(|c| c.is_alphanumeric() || c == '_' || c == '.' || c == '-')
  {
    return Err(Error::InvalidKeyTemplate {
      template: field.to_string(),
      reason: format!("invalid argument name `{}`", name),
    });
  }

  let transform = match spec {
    None | Some("") => None,
    Some(spec) => {
      let (fname, params) = match spec.split_once('(') {
        Some((fname, rest)) => {
          let rest = rest.strip_suffix(')').ok_or_else(|| Error::InvalidKeyTemplate {
            template: field.to_string(),
            reason: "unterminated transform arguments".to_string(),
          })?;
          let params = rest
            .split(',')
            .map(|p| p.trim().to_string())
            .filter(|p| !p.is_empty())
            .collect();
          (fname.trim(), params)
        }
        None => (spec, Vec::new()),
      };
      let f = transforms
        .get(fname)
        .ok_or_else(|| Error::UnknownTransform(fname.to_string()))?;
      Some((f, params))
    }
  };

  Ok(Segment::Arg {
    name: name.to_string(),
    transform,
  })
}

/// How a strategy derives its key from call arguments.
pub enum Key<A> {
  Template(KeyTemplate),
  Computed(Arc<dyn Fn(&A) -> String + Send + Sync>),
}

impl<A> Key<A> {
  pub fn computed(f: impl Fn(&A) -> String + Send + Sync + 'static) -> Self {
    Key::Computed(Arc::new(f))
  }

  pub fn template(&self) -> Option<&KeyTemplate> {
    match self {
      Key::Template(t) => Some(t),
      Key::Computed(_) => None,
    }
  }
}

impl<A: KeyArgs> Key<A> {
  pub fn render(&self, args: &A) -> String {
    match self {
      Key::Template(t) => t.render(args),
      Key::Computed(f) => f(args),
    }
  }
}

impl<A> Clone for Key<A> {
  fn clone(&self) -> Self {
    match self {
      Key::Template(t) => Key::Template(t.clone()),
      Key::Computed(f) => Key::Computed(f.clone()),
    }
  }
}

impl<A> fmt::Debug for Key<A> {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      Key::Template(t) => t.fmt(f),
      Key::Computed(_) => f.write_str("Computed(..)"),
    }
  }
}

/// Conversion into a [`Key`], fallible for template strings.
pub trait IntoKey<A> {
  fn into_key(self) -> Result<Key<A>>;
}

impl<A> IntoKey<A> for Key<A> {
  fn into_key(self) -> Result<Key<A>> {
    Ok(self)
  }
}

impl<A> IntoKey<A> for KeyTemplate {
  fn into_key(self) -> Result<Key<A>> {
    Ok(Key::Template(self))
  }
}

impl<A> IntoKey<A> for &str {
  fn into_key(self) -> Result<Key<A>> {
    KeyTemplate::parse(self).map(Key::Template)
  }
}

impl<A> IntoKey<A> for String {
  fn into_key(self) -> Result<Key<A>> {
    KeyTemplate::parse(&self).map(Key::Template)
  }
}

/// Joins a strategy prefix and a key with `:`.
pub(crate) fn with_prefix(prefix: &str, key: &str) -> String {
  if prefix.is_empty() {
    key.to_string()
  } else {
    format!("{}:{}", prefix, key)
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn renders_arguments_and_literals() {
    let template = KeyTemplate::parse("user:{id}:{name:lower}").unwrap();
    let args = Args::new().with("id", 42).with("name", "Ada");
    assert_eq!(template.render(&args), "user:42:ada");
    assert_eq!(template.arg_names().collect::<Vec<_>>(), vec!["id", "name"]);
  }

  #[test]
  fn missing_arguments_become_wildcards_in_patterns() {
    let template = KeyTemplate::parse("user:{id}:{name}").unwrap();
    let args = Args::new().with("id", 7);
    assert_eq!(template.render(&args), "user:7:");
    assert_eq!(template.render_pattern(&args), "user:7:*");
    assert!(!template.is_complete_for(&args));
  }

  #[test]
  fn hash_transform_is_sha256_hex() {
    let template = KeyTemplate::parse("t:{token:hash}").unwrap();
    let key = template.render(&Args::new().with("token", "abc"));
    assert_eq!(
      key,
      "t:ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
    );
  }

  #[test]
  fn transforms_accept_parameters() {
    let mut transforms = Transforms::standard();
    transforms.register("take", |v, params| {
      let n = params.first().and_then(|p| p.parse().ok()).unwrap_or(0);
      v.chars().take(n).collect()
    });
    let template = KeyTemplate::parse_with("{name:take(3)}", &transforms).unwrap();
    assert_eq!(template.render(&Args::new().with("name", "abcdef")), "abc");
  }

  #[test]
  fn escaped_braces_are_literal() {
    let template = KeyTemplate::parse("{{raw}}:{id}").unwrap();
    assert_eq!(template.render(&Args::new().with("id", 1)), "{raw}:1");
  }

  #[test]
  fn rejects_bad_templates() {
    assert!(matches!(
      KeyTemplate::parse("user:{id"),
      Err(Error::InvalidKeyTemplate { .. })
    ));
    assert!(matches!(
      KeyTemplate::parse("user:{id:shout}"),
      Err(Error::UnknownTransform(name)) if name == "shout"
    ));
  }

  #[test]
  fn renaming_arguments() {
    let args = Args::new().with("user_id", 3);
    let renamed = args.renamed(&[("user_id".to_string(), "id".to_string())]);
    assert_eq!(renamed.key_arg("id").as_deref(), Some("3"));
    assert_eq!(renamed.key_arg("user_id"), None);
  }
}
