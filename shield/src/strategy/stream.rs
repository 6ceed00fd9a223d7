//! Caching for operations that produce a stream of chunks.
//!
//! A live run stores every chunk at `{key}:{n}` as it passes through, then
//! writes a marker at `{key}` once the stream ends. While the marker lives,
//! later calls replay the stored chunks instead of running the producer.
//! The marker expires `ttl` after the run started, never after the chunks.

use crate::backend::{Backend, Exist};
use crate::cache::Cache;
use crate::error::{Error, Result};
use crate::key::KeyArgs;
use crate::strategy::{decode_or_miss, key_options, Options, Settings};
use crate::ttl::IntoTtl;

use std::any::Any;
use std::marker::PhantomData;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures_util::stream::{self, BoxStream, Stream, StreamExt};
use serde::de::DeserializeOwned;
use serde::Serialize;

const STRATEGY: &str = "stream";

/// An operation producing a stream of results.
pub trait Produce<A, T, E>: Send + Sync + 'static {
  fn produce(&self, args: A) -> BoxStream<'static, std::result::Result<T, E>>;
}

impl<A, T, E, F, St> Produce<A, T, E> for F
where
  F: Fn(A) -> St + Send + Sync + 'static,
  St: Stream<Item = std::result::Result<T, E>> + Send + 'static,
{
  fn produce(&self, args: A) -> BoxStream<'static, std::result::Result<T, E>> {
    self(args).boxed()
  }
}

struct Live<A, T, E> {
  key: String,
  args: A,
  chunks: BoxStream<'static, std::result::Result<T, E>>,
  index: u64,
  started: Instant,
  ttl: Option<Duration>,
  complete: bool,
}

enum State<A, T, E> {
  Start(A),
  Replay { key: String, index: u64 },
  Live(Box<Live<A, T, E>>),
  Done,
}

pub struct StreamCache<A, T, E, P> {
  cache: Cache,
  producer: Arc<P>,
  settings: Arc<Settings<A, T, E>>,
}

impl<A, T, E, P> StreamCache<A, T, E, P>
where
  P: Produce<A, T, E>,
{
  pub fn builder(cache: &Cache, producer: P) -> StreamCacheBuilder<A, T, E, P> {
    StreamCacheBuilder {
      cache: cache.clone(),
      producer,
      options: Options::new(""),
      _marker: PhantomData,
    }
  }
}

pub struct StreamCacheBuilder<A, T, E, P> {
  cache: Cache,
  producer: P,
  options: Options<A, T, E>,
  _marker: PhantomData<fn(A) -> (T, E)>,
}

impl<A, T, E, P> StreamCacheBuilder<A, T, E, P>
where
  P: Produce<A, T, E>,
{
  key_options!();

  pub fn ttl(mut self, ttl: impl IntoTtl<A>) -> Self {
    self.options.set_ttl(ttl);
    self
  }

  /// Chunks failing the condition are not stored, and a run with any such
  /// chunk is not replayed.
  pub fn condition(mut self, condition: impl Fn(&T, &A, &str) -> bool + Send + Sync + 'static) -> Self {
    self.options.set_condition(Arc::new(condition));
    self
  }

  pub fn build(self) -> Result<StreamCache<A, T, E, P>> {
    let has_ttl = self.options.has_ttl();
    let settings = self.options.build(STRATEGY)?;
    if !has_ttl {
      return Err(Error::InvalidTtl("stream strategy needs a ttl".to_string()));
    }
    Ok(StreamCache {
      cache: self.cache,
      producer: Arc::new(self.producer),
      settings: Arc::new(settings),
    })
  }
}

impl<A, T, E, P> StreamCache<A, T, E, P>
where
  A: KeyArgs + Clone + Send + Sync + 'static,
  T: Serialize + DeserializeOwned + Any + Send + Sync + 'static,
  E: From<Error> + Send + 'static,
  P: Produce<A, T, E>,
{
  /// Streams the chunks for `args`, from the cache when a complete run is
  /// stored. An error ends the stream and leaves the run unreplayable.
  pub fn stream(&self, args: A) -> BoxStream<'_, std::result::Result<T, E>> {
    stream::unfold(State::Start(args), move |state| self.step(state)).boxed()
  }

  async fn step(&self, mut state: State<A, T, E>) -> Option<(std::result::Result<T, E>, State<A, T, E>)> {
    loop {
      state = match state {
        State::Done => return None,
        State::Start(args) => {
          let key = self.settings.key_for(&args);
          match self.cache.exists(&key).await {
            Ok(true) => {
              tracing::trace!(strategy = STRATEGY, key = %key, "replaying cached stream");
              self
                .settings
                .observe(&self.cache, &key, self.settings.ttl_for(&args), None);
              State::Replay { key, index: 0 }
            }
            Ok(false) => State::Live(Box::new(Live {
              ttl: self.settings.ttl_for(&args),
              chunks: self.producer.produce(args.clone()),
              key,
              args,
              index: 0,
              started: Instant::now(),
              complete: true,
            })),
            Err(e) => return Some((Err(e.into()), State::Done)),
          }
        }
        State::Replay { key, index } => {
          let chunk_key = format!("{}:{}", key, index);
          return match self.cache.get(&chunk_key).await {
            Ok(Some(bytes)) => {
              let chunk = decode_or_miss(&self.cache, &chunk_key, &bytes)?;
              Some((Ok(chunk), State::Replay { key, index: index + 1 }))
            }
            Ok(None) => None,
            Err(e) => Some((Err(e.into()), State::Done)),
          };
        }
        State::Live(mut live) => {
          return match live.chunks.next().await {
            Some(Ok(chunk)) => {
              if let Err(e) = self.store(&mut live, &chunk).await {
                return Some((Err(e.into()), State::Done));
              }
              Some((Ok(chunk), State::Live(live)))
            }
            Some(Err(e)) => {
              tracing::debug!(strategy = STRATEGY, key = %live.key, chunks = live.index, "stream failed, not cached");
              Some((Err(e), State::Done))
            }
            None => match self.finish(*live).await {
              Ok(()) => None,
              Err(e) => Some((Err(e.into()), State::Done)),
            },
          };
        }
      };
    }
  }

  async fn store(&self, live: &mut Live<A, T, E>, chunk: &T) -> Result<()> {
    let index = live.index;
    live.index += 1;
    if !self
      .settings
      .admit_value(chunk, &live.args, &live.key, live.started.elapsed())
    {
      live.complete = false;
      return Ok(());
    }
    let bytes = self.cache.codecs().encode(chunk)?;
    let chunk_key = format!("{}:{}", live.key, index);
    self.cache.set(&chunk_key, bytes, live.ttl, Exist::Any).await?;
    Ok(())
  }

  /// Writes the marker once every chunk of a non-empty run was stored.
  async fn finish(&self, live: Live<A, T, E>) -> Result<()> {
    if !live.complete || live.index == 0 {
      return Ok(());
    }
    let ttl = live.ttl.map(|ttl| ttl.saturating_sub(live.started.elapsed()));
    if ttl == Some(Duration::ZERO) {
      tracing::debug!(strategy = STRATEGY, key = %live.key, "stream outlived its ttl, not cached");
      return Ok(());
    }
    self.cache.set(&live.key, b"1".to_vec(), ttl, Exist::Any).await?;
    self.settings.observe(&self.cache, &live.key, ttl, None);
    tracing::trace!(strategy = STRATEGY, key = %live.key, chunks = live.index, ?ttl, "stream cached");
    Ok(())
  }
}
