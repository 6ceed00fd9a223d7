//! Resilience-oriented caching strategies for async Rust.
//!
//! Wrap any async operation in a strategy that decides when to answer from
//! cache, when to recompute, and when to refuse the call outright.
//!
//! # Features
//! - **Caching strategies**: simple read-through, failover, hit-counted,
//!   early background refresh, soft ttl with stale fallback, cached streams.
//! - **Protection**: per-key locks and in-process single flight against
//!   stampedes, fixed and sliding rate limits, circuit breakers, slow-call
//!   lockouts, bloom-filter guards.
//! - **Interchangeable storage**: every strategy talks to the [`Backend`]
//!   contract; a sharded in-memory backend is included and backends can be
//!   routed by key prefix.
//! - **Interceptors**: every backend command passes through an explicit
//!   chain, e.g. [`SafeMode`] to survive an unreachable backend.
//! - **Transactions**: write-through scopes with rollback and three
//!   isolation modes.
//! - **Observation**: [`observe`] reports which keys and strategies served a
//!   piece of work.
//!
//! ```no_run
//! use fibre_shield::{Args, Cache, MemoryBackend, Simple, Call};
//!
//! # #[derive(Debug, thiserror::Error)]
//! # enum AppError { #[error(transparent)] Cache(#[from] fibre_shield::Error) }
//! # async fn run() -> Result<(), AppError> {
//! let cache = Cache::builder().backend(MemoryBackend::new()).build().unwrap();
//!
//! let user_name = Simple::builder(&cache, |args: Args| async move {
//!   Ok::<_, AppError>(format!("user-{}", args.iter().count()))
//! })
//! .key("user:{id}")
//! .ttl("10m")
//! .build()?;
//!
//! let name = user_name.call(Args::new().with("id", 42)).await?;
//! # Ok(())
//! # }
//! ```

pub mod backend;
pub mod cache;
pub mod clock;
pub mod codec;
pub mod counter;
pub mod error;
pub mod key;
pub mod lock;
pub mod observe;
pub mod runtime;
pub mod settings;
pub mod strategy;
pub mod transaction;
pub mod ttl;

mod task;

pub use backend::{
  Backend, Command, DisableControl, Exist, Expiry, Interceptor, MemoryBackend, MemoryBackendBuilder,
  Next, Reply, Request, SafeMode, Tracing,
};
pub use cache::{default_cache, set_default, Cache, CacheBuilder, ErrorPredicate};
pub use clock::{Clock, ManualClock, SystemClock};
pub use codec::CodecRegistry;
pub use counter::CounterEngine;
pub use error::{BuildError, Error, Result};
pub use key::{Args, Key, KeyArgs, KeyTemplate, Transforms};
pub use lock::{Backoff, LockGuard, LockManager};
pub use observe::{observe, Observation};
pub use runtime::{TaskSpawner, TokioSpawner};
pub use settings::{CacheSettings, SettingsError};
pub use strategy::{
  Bloom, Call, CircuitBreaker, CircuitState, DualBloom, Early, Failover, Hit, Invalidate, Locked,
  Perf, Produce, RateLimit, RefreshEvent, Simple, SliceRateLimit, Soft, StreamCache,
  ThunderProtection,
};
pub use transaction::{Transaction, TransactionMode};
pub use ttl::{parse_duration, Ttl};
