//! Interceptors around backend commands.
//!
//! Every backend call is reified as a [`Request`] and answered by a [`Reply`].
//! Interceptors are composed in order when the cache is built; each one sees
//! the request and a [`Next`] continuation that runs the rest of the chain
//! and finally the backend itself.

use crate::backend::{Backend, Exist, Expiry};
use crate::error::Result;

use std::collections::HashSet;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures_util::future::{self, BoxFuture, FutureExt};
use futures_util::stream::{self, BoxStream, StreamExt};
use parking_lot::RwLock;

/// The kind of a backend command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Command {
  Get,
  GetMany,
  Set,
  SetMany,
  Incr,
  Expire,
  GetExpire,
  Delete,
  DeleteMany,
  DeleteMatch,
  Scan,
  Exists,
  GetKeysCount,
  Ping,
  Clear,
  Close,
  DeleteIfEq,
  SetAdd,
  SetRemove,
  SetPop,
  GetBits,
  SetBits,
  GetMatch,
}

/// A backend command with its arguments.
#[derive(Debug, Clone)]
pub enum Request {
  Get { key: String },
  GetMany { keys: Vec<String> },
  Set { key: String, value: Vec<u8>, ttl: Option<Duration>, exist: Exist },
  SetMany { pairs: Vec<(String, Vec<u8>)>, ttl: Option<Duration> },
  Incr { key: String, by: i64, ttl: Option<Duration> },
  Expire { key: String, ttl: Duration },
  GetExpire { key: String },
  Delete { key: String },
  DeleteMany { keys: Vec<String> },
  DeleteMatch { pattern: String },
  Scan { pattern: String },
  Exists { key: String },
  GetKeysCount,
  Ping { message: Option<String> },
  Clear,
  Close,
  DeleteIfEq { key: String, value: Vec<u8> },
  SetAdd { key: String, members: Vec<String>, ttl: Option<Duration> },
  SetRemove { key: String, members: Vec<String> },
  SetPop { key: String, count: usize },
  GetBits { key: String, indexes: Vec<u64> },
  SetBits { key: String, indexes: Vec<u64>, ttl: Option<Duration> },
  GetMatch { pattern: String },
}

impl Request {
  pub fn command(&self) -> Command {
    match self {
      Request::Get { .. } => Command::Get,
      Request::GetMany { .. } => Command::GetMany,
      Request::Set { .. } => Command::Set,
      Request::SetMany { .. } => Command::SetMany,
      Request::Incr { .. } => Command::Incr,
      Request::Expire { .. } => Command::Expire,
      Request::GetExpire { .. } => Command::GetExpire,
      Request::Delete { .. } => Command::Delete,
      Request::DeleteMany { .. } => Command::DeleteMany,
      Request::DeleteMatch { .. } => Command::DeleteMatch,
      Request::Scan { .. } => Command::Scan,
      Request::Exists { .. } => Command::Exists,
      Request::GetKeysCount => Command::GetKeysCount,
      Request::Ping { .. } => Command::Ping,
      Request::Clear => Command::Clear,
      Request::Close => Command::Close,
      Request::DeleteIfEq { .. } => Command::DeleteIfEq,
      Request::SetAdd { .. } => Command::SetAdd,
      Request::SetRemove { .. } => Command::SetRemove,
      Request::SetPop { .. } => Command::SetPop,
      Request::GetBits { .. } => Command::GetBits,
      Request::SetBits { .. } => Command::SetBits,
      Request::GetMatch { .. } => Command::GetMatch,
    }
  }

  /// The single key or pattern the request addresses, if any.
  pub fn key(&self) -> Option<&str> {
    match self {
      Request::Get { key }
      | Request::Set { key, .. }
      | Request::Incr { key, .. }
      | Request::Expire { key, .. }
      | Request::GetExpire { key }
      | Request::Delete { key }
      | Request::Exists { key }
      | Request::DeleteIfEq { key, .. }
      | Request::SetAdd { key, .. }
      | Request::SetRemove { key, .. }
      | Request::SetPop { key, .. }
      | Request::GetBits { key, .. }
      | Request::SetBits { key, .. } => Some(key),
      Request::DeleteMatch { pattern } | Request::Scan { pattern } | Request::GetMatch { pattern } => {
        Some(pattern)
      }
      _ => None,
    }
  }
}

/// The answer to a [`Request`].
pub enum Reply {
  Value(Option<Vec<u8>>),
  Values(Vec<Option<Vec<u8>>>),
  Bool(bool),
  Int(i64),
  Count(u64),
  Expiry(Expiry),
  Text(String),
  Unit,
  Members(Vec<String>),
  Bits(Vec<bool>),
  Pairs(Vec<(String, Vec<u8>)>),
  Keys(BoxStream<'static, Result<String>>),
}

impl Reply {
  /// The reply a command gives when the backend has nothing to say: a miss,
  /// `false`, zero or empty.
  pub fn absent_for(request: &Request) -> Reply {
    match request {
      Request::Get { .. } => Reply::Value(None),
      Request::GetMany { keys } => Reply::Values(vec![None; keys.len()]),
      Request::Set { .. }
      | Request::Expire { .. }
      | Request::Delete { .. }
      | Request::Exists { .. }
      | Request::DeleteIfEq { .. } => Reply::Bool(false),
      Request::Incr { .. } => Reply::Int(0),
      Request::GetExpire { .. } => Reply::Expiry(Expiry::Missing),
      Request::DeleteMany { .. }
      | Request::DeleteMatch { .. }
      | Request::GetKeysCount
      | Request::SetAdd { .. }
      | Request::SetRemove { .. } => Reply::Count(0),
      Request::Scan { .. } => Reply::Keys(stream::empty().boxed()),
      Request::Ping { message } => Reply::Text(message.clone().unwrap_or_else(|| "PONG".to_string())),
      Request::SetMany { .. } | Request::Clear | Request::Close | Request::SetBits { .. } => Reply::Unit,
      Request::SetPop { .. } => Reply::Members(Vec::new()),
      // Unknown membership must read as "maybe present" so filters never
      // report a false negative.
      Request::GetBits { indexes, .. } => Reply::Bits(vec![true; indexes.len()]),
      Request::GetMatch { .. } => Reply::Pairs(Vec::new()),
    }
  }
}

impl fmt::Debug for Reply {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      Reply::Value(v) => f.debug_tuple("Value").field(&v.as_ref().map(Vec::len)).finish(),
      Reply::Values(v) => f.debug_tuple("Values").field(&v.len()).finish(),
      Reply::Bool(b) => f.debug_tuple("Bool").field(b).finish(),
      Reply::Int(i) => f.debug_tuple("Int").field(i).finish(),
      Reply::Count(c) => f.debug_tuple("Count").field(c).finish(),
      Reply::Expiry(e) => f.debug_tuple("Expiry").field(e).finish(),
      Reply::Text(t) => f.debug_tuple("Text").field(t).finish(),
      Reply::Unit => f.write_str("Unit"),
      Reply::Members(m) => f.debug_tuple("Members").field(m).finish(),
      Reply::Bits(b) => f.debug_tuple("Bits").field(&b.len()).finish(),
      Reply::Pairs(p) => f.debug_tuple("Pairs").field(&p.len()).finish(),
      Reply::Keys(_) => f.write_str("Keys(..)"),
    }
  }
}

/// Extracts the expected variant from a reply.
macro_rules! expect_reply {
  ($reply:expr, $variant:ident, $command:expr) => {
    match $reply {
      $crate::backend::Reply::$variant(inner) => Ok(inner),
      _ => Err($crate::error::Error::UnexpectedReply(format!("{:?}", $command))),
    }
  };
}
pub(crate) use expect_reply;

/// Continuation running the rest of an interceptor chain.
pub type Next<'a> = Box<dyn FnOnce(Request) -> BoxFuture<'a, Result<Reply>> + Send + 'a>;

/// Wraps every command sent to a backend.
pub trait Interceptor: Send + Sync + 'static {
  fn intercept<'a>(&'a self, request: Request, next: Next<'a>) -> BoxFuture<'a, Result<Reply>>;
}

impl<I: Interceptor + ?Sized> Interceptor for Arc<I> {
  fn intercept<'a>(&'a self, request: Request, next: Next<'a>) -> BoxFuture<'a, Result<Reply>> {
    (**self).intercept(request, next)
  }
}

/// Runs `request` through `interceptors` in order, then against `backend`.
pub(crate) fn dispatch<'a>(
  backend: &'a dyn Backend,
  interceptors: &'a [Arc<dyn Interceptor>],
  request: Request,
) -> BoxFuture<'a, Result<Reply>> {
  match interceptors.split_first() {
    Some((first, rest)) => first.intercept(
      request,
      Box::new(move |request| dispatch(backend, rest, request)),
    ),
    None => execute(backend, request),
  }
}

fn execute(backend: &dyn Backend, request: Request) -> BoxFuture<'_, Result<Reply>> {
  async move {
    Ok(match request {
      Request::Get { key } => Reply::Value(backend.get(&key).await?),
      Request::GetMany { keys } => Reply::Values(backend.get_many(&keys).await?),
      Request::Set { key, value, ttl, exist } => Reply::Bool(backend.set(&key, value, ttl, exist).await?),
      Request::SetMany { pairs, ttl } => {
        backend.set_many(pairs, ttl).await?;
        Reply::Unit
      }
      Request::Incr { key, by, ttl } => Reply::Int(backend.incr(&key, by, ttl).await?),
      Request::Expire { key, ttl } => Reply::Bool(backend.expire(&key, ttl).await?),
      Request::GetExpire { key } => Reply::Expiry(backend.get_expire(&key).await?),
      Request::Delete { key } => Reply::Bool(backend.delete(&key).await?),
      Request::DeleteMany { keys } => Reply::Count(backend.delete_many(&keys).await?),
      Request::DeleteMatch { pattern } => Reply::Count(backend.delete_match(&pattern).await?),
      Request::Scan { pattern } => Reply::Keys(backend.scan(&pattern)),
      Request::Exists { key } => Reply::Bool(backend.exists(&key).await?),
      Request::GetKeysCount => Reply::Count(backend.get_keys_count().await?),
      Request::Ping { message } => Reply::Text(backend.ping(message.as_deref()).await?),
      Request::Clear => {
        backend.clear().await?;
        Reply::Unit
      }
      Request::Close => {
        backend.close().await?;
        Reply::Unit
      }
      Request::DeleteIfEq { key, value } => Reply::Bool(backend.delete_if_eq(&key, &value).await?),
      Request::SetAdd { key, members, ttl } => Reply::Count(backend.set_add(&key, &members, ttl).await?),
      Request::SetRemove { key, members } => Reply::Count(backend.set_remove(&key, &members).await?),
      Request::SetPop { key, count } => Reply::Members(backend.set_pop(&key, count).await?),
      Request::GetBits { key, indexes } => Reply::Bits(backend.get_bits(&key, &indexes).await?),
      Request::SetBits { key, indexes, ttl } => {
        backend.set_bits(&key, &indexes, ttl).await?;
        Reply::Unit
      }
      Request::GetMatch { pattern } => Reply::Pairs(backend.get_match(&pattern).await?),
    })
  }
  .boxed()
}

/// Answers commands with their absent reply when the backend is unreachable.
///
/// Opt-in. `ping`, compare-and-delete and `close` are never suppressed, so
/// locks built on them keep failing loudly.
#[derive(Debug, Default, Clone, Copy)]
pub struct SafeMode;

impl Interceptor for SafeMode {
  fn intercept<'a>(&'a self, request: Request, next: Next<'a>) -> BoxFuture<'a, Result<Reply>> {
    let command = request.command();
    if matches!(command, Command::Ping | Command::DeleteIfEq | Command::Close) {
      return next(request);
    }
    let absent = Reply::absent_for(&request);
    async move {
      match next(request).await {
        Ok(Reply::Keys(keys)) => Ok(Reply::Keys(
          keys
            .filter_map(move |item| {
              future::ready(match item {
                Err(e) if e.is_unavailable() => {
                  tracing::error!(?command, error = %e, "backend failure suppressed");
                  None
                }
                other => Some(other),
              })
            })
            .boxed(),
        )),
        Err(e) if e.is_unavailable() => {
          tracing::error!(?command, error = %e, "backend failure suppressed");
          Ok(absent)
        }
        other => other,
      }
    }
    .boxed()
  }
}

/// A runtime switch that turns commands off.
///
/// Disabled reads behave as misses and disabled writes as no-ops; disabled
/// conditional writes and compare-and-delete report success so locks become
/// no-ops too. Share it through an `Arc` to toggle it after the cache is built.
#[derive(Debug, Default)]
pub struct DisableControl {
  all: AtomicBool,
  disabled: RwLock<HashSet<Command>>,
}

impl DisableControl {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn disable(&self, commands: &[Command]) {
    self.disabled.write().extend(commands.iter().copied());
  }

  pub fn disable_all(&self) {
    self.all.store(true, Ordering::Release);
  }

  pub fn enable(&self, commands: &[Command]) {
    let mut disabled = self.disabled.write();
    for command in commands {
      disabled.remove(command);
    }
  }

  /// Re-enables every command.
  pub fn enable_all(&self) {
    self.all.store(false, Ordering::Release);
    self.disabled.write().clear();
  }

  pub fn is_disabled(&self, command: Command) -> bool {
    command != Command::Close
      && (self.all.load(Ordering::Acquire) || self.disabled.read().contains(&command))
  }
}

impl Interceptor for DisableControl {
  fn intercept<'a>(&'a self, request: Request, next: Next<'a>) -> BoxFuture<'a, Result<Reply>> {
    if !self.is_disabled(request.command()) {
      return next(request);
    }
    tracing::trace!(command = ?request.command(), key = ?request.key(), "command disabled");
    let reply = match &request {
      Request::Set { .. } | Request::DeleteIfEq { .. } => Reply::Bool(true),
      other => Reply::absent_for(other),
    };
    future::ready(Ok(reply)).boxed()
  }
}

/// Logs every command with its latency at `trace` level.
#[derive(Debug, Default, Clone, Copy)]
pub struct Tracing;

impl Interceptor for Tracing {
  fn intercept<'a>(&'a self, request: Request, next: Next<'a>) -> BoxFuture<'a, Result<Reply>> {
    let command = request.command();
    let key = request.key().map(str::to_string);
    async move {
      let started = Instant::now();
      let result = next(request).await;
      match &result {
        Ok(_) => tracing::trace!(?command, key = ?key, elapsed = ?started.elapsed(), "backend command"),
        Err(e) => tracing::trace!(?command, key = ?key, elapsed = ?started.elapsed(), error = %e, "backend command failed"),
      }
      result
    }
    .boxed()
  }
}

