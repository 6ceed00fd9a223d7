mod common;

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use common::*;
use fibre_shield::{
  observe, Args, Backend, Cache, CacheSettings, Call, Command, DisableControl, Early, Error, Exist,
  Interceptor, Next, Reply, Request, Simple, TaskSpawner,
};
use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use pretty_assertions::assert_eq;

/// Records the commands that reach it.
#[derive(Default)]
struct Recorder(parking_lot::Mutex<Vec<Command>>);

impl Interceptor for Recorder {
  fn intercept<'a>(&'a self, request: Request, next: Next<'a>) -> BoxFuture<'a, fibre_shield::Result<Reply>> {
    self.0.lock().push(request.command());
    next(request)
  }
}

fn counting_simple(cache: &Cache, calls: &Calls) -> Simple<Args, usize, AppError, impl Call<Args, usize, AppError>> {
  let counted = calls.clone();
  Simple::builder(cache, move |_args: Args| {
    let calls = counted.clone();
    async move { Ok::<_, AppError>(calls.hit()) }
  })
  .key("k")
  .ttl("1h")
  .build()
  .unwrap()
}

#[tokio::test]
async fn test_interceptors_see_every_command_in_order() {
  init_tracing();
  let recorder = Arc::new(Recorder::default());
  let cache = Cache::builder()
    .backend(memory())
    .interceptor(recorder.clone())
    .interceptor(fibre_shield::Tracing)
    .build()
    .unwrap();

  let calls = Calls::new();
  let simple = counting_simple(&cache, &calls);
  simple.call(Args::new()).await.unwrap();
  simple.call(Args::new()).await.unwrap();

  assert_eq!(
    *recorder.0.lock(),
    vec![Command::Get, Command::Set, Command::Get]
  );
}

#[tokio::test]
async fn test_safe_mode_turns_outages_into_misses() {
  init_tracing();
  let cache = Cache::builder().backend(memory()).safe(true).build().unwrap();
  let calls = Calls::new();
  let simple = counting_simple(&cache, &calls);
  simple.call(Args::new()).await.unwrap();

  cache.close().await.unwrap();

  assert_eq!(cache.get("k").await.unwrap(), None);
  assert!(!cache.set("k", b"x".to_vec(), None, Exist::Any).await.unwrap());
  assert_eq!(cache.incr("c", 1, None).await.unwrap(), 0);
  // Strategies keep serving by calling through.
  assert_eq!(simple.call(Args::new()).await.unwrap(), 2);
  assert_eq!(simple.call(Args::new()).await.unwrap(), 3);

  // Locks still fail loudly.
  let err = cache
    .locks()
    .try_acquire("job", std::time::Duration::from_secs(1))
    .await
    .unwrap_err();
  assert!(err.is_unavailable());
}

#[tokio::test]
async fn test_outages_surface_without_safe_mode() {
  let cache = build_test_cache();
  let calls = Calls::new();
  let simple = counting_simple(&cache, &calls);
  cache.close().await.unwrap();

  let err = simple.call(Args::new()).await.unwrap_err();
  assert!(matches!(err.cache_error(), Some(Error::Closed(_))));
  assert_eq!(calls.count(), 0);
}

#[tokio::test]
async fn test_disable_control_switches_commands_at_runtime() {
  init_tracing();
  let control = Arc::new(DisableControl::new());
  let cache = Cache::builder()
    .backend(memory())
    .interceptor(control.clone())
    .build()
    .unwrap();
  let calls = Calls::new();
  let simple = counting_simple(&cache, &calls);

  control.disable(&[Command::Get]);
  assert!(control.is_disabled(Command::Get));
  assert_eq!(simple.call(Args::new()).await.unwrap(), 1);
  assert_eq!(simple.call(Args::new()).await.unwrap(), 2);

  control.enable(&[Command::Get]);
  assert_eq!(simple.call(Args::new()).await.unwrap(), 2);

  control.disable_all();
  // Disabled deletes are no-ops as well.
  assert!(!cache.delete("k").await.unwrap());
  assert_eq!(simple.call(Args::new()).await.unwrap(), 3);
  // Disabled conditional writes report success, so locks become no-ops.
  assert!(cache
    .locks()
    .try_acquire("job", std::time::Duration::from_secs(1))
    .await
    .unwrap()
    .is_some());

  control.enable_all();
  assert_eq!(simple.call(Args::new()).await.unwrap(), 2);
}

#[tokio::test]
async fn test_observe_reports_keys_strategies_and_backends() {
  let cache = Cache::builder()
    .backend(memory())
    .backend_with_prefix(
      "early:",
      fibre_shield::MemoryBackend::builder().name("hot").build().unwrap(),
    )
    .build()
    .unwrap();
  let simple = Simple::builder(&cache, |_args: Args| async move { Ok::<_, AppError>(1u8) })
    .key("a:{id}")
    .ttl("1h")
    .build()
    .unwrap();
  let early = Early::builder(&cache, |_args: Args| async move { Ok::<_, AppError>(2u8) })
    .key("b:{id}")
    .ttl("1h")
    .build()
    .unwrap();

  let id = || Args::new().with("id", 9);
  let ((), observed) = observe(async {
    simple.call(id()).await.unwrap();
    early.call(id()).await.unwrap();
  })
  .await;

  let seen: Vec<(&str, &str, &str)> = observed
    .iter()
    .map(|o| (o.key.as_str(), o.strategy, o.backend.as_str()))
    .collect();
  assert_eq!(
    seen,
    vec![("a:9", "simple", "memory"), ("early:b:9", "early", "hot")]
  );
  assert!(observed.iter().all(|o| o.ttl == Some(std::time::Duration::from_secs(3600))));

  // Calls outside a scope are not recorded anywhere.
  simple.call(id()).await.unwrap();
}

#[derive(Clone, Default)]
struct CountingSpawner(Calls);

impl TaskSpawner for CountingSpawner {
  fn spawn(&self, future: Pin<Box<dyn Future<Output = ()> + Send>>) {
    self.0.hit();
    tokio::spawn(future);
  }
}

#[tokio::test]
async fn test_background_work_goes_through_the_spawner() {
  let spawner = CountingSpawner::default();
  let clock = Arc::new(fibre_shield::ManualClock::new());
  let cache = Cache::builder()
    .backend(memory())
    .shared_clock(clock.clone())
    .spawner(spawner.clone())
    .build()
    .unwrap();
  let early = Early::builder(&cache, |_args: Args| async move { Ok::<_, AppError>(1u8) })
    .key("k")
    .ttl("10m")
    .early_ttl("1m")
    .build()
    .unwrap();
  let mut events = early.refresh_events();

  early.call(Args::new()).await.unwrap();
  clock.advance(std::time::Duration::from_secs(120));
  early.call(Args::new()).await.unwrap();
  assert!(events.recv().await.unwrap().is_ok());
  assert_eq!(spawner.0.count(), 1);
}

#[tokio::test]
async fn test_settings_build_a_routed_cache() {
  let settings = CacheSettings::from_json(
    r#"{
      "safe": true,
      "trace_commands": true,
      "transaction_mode": "fast",
      "memory": { "name": "main", "janitor_tick": "off" },
      "prefixes": { "sessions:": { "name": "sessions", "capacity": 10 } }
    }"#,
  )
  .unwrap();
  let cache = settings.build().unwrap();

  assert_eq!(cache.backend_name("user:1"), "main");
  assert_eq!(cache.backend_name("sessions:abc"), "sessions");
  cache.set("sessions:abc", b"x".to_vec(), None, Exist::Any).await.unwrap();
  assert!(cache.exists("sessions:abc").await.unwrap());
}

#[tokio::test]
async fn test_default_cache_is_installed_once() {
  assert!(fibre_shield::default_cache().is_none());
  let cache = build_test_cache();
  fibre_shield::set_default(cache.clone()).unwrap();
  assert!(fibre_shield::set_default(build_test_cache()).is_err());

  let installed = fibre_shield::default_cache().unwrap();
  installed.set("shared", b"1".to_vec(), None, Exist::Any).await.unwrap();
  assert_eq!(cache.get("shared").await.unwrap(), Some(b"1".to_vec()));
}

#[tokio::test]
async fn test_custom_interceptors_can_short_circuit() {
  struct ReadOnly;

  impl Interceptor for ReadOnly {
    fn intercept<'a>(&'a self, request: Request, next: Next<'a>) -> BoxFuture<'a, fibre_shield::Result<Reply>> {
      match request.command() {
        Command::Set | Command::Delete => {
          async move {
            Err(Error::BackendUnavailable {
              backend: "memory".to_string(),
              reason: "read only".to_string(),
            })
          }
          .boxed()
        }
        _ => next(request),
      }
    }
  }

  let cache = Cache::builder().backend(memory()).interceptor(ReadOnly).build().unwrap();
  let err = cache.set("k", b"x".to_vec(), None, Exist::Any).await.unwrap_err();
  assert!(err.is_unavailable());
  assert_eq!(cache.get("k").await.unwrap(), None);
}
