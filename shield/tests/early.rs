mod common;

use std::sync::Arc;
use std::time::Duration;

use common::*;
use fibre_shield::{Args, Call, Early};
use futures_util::future::join_all;
use pretty_assertions::assert_eq;

#[tokio::test]
async fn test_fresh_entries_are_served_without_refresh() {
  let (cache, clock) = build_test_cache_with_clock();
  let calls = Calls::new();
  let counted = calls.clone();
  let early = Early::builder(&cache, move |_args: Args| {
    let calls = counted.clone();
    async move { Ok::<_, AppError>(calls.hit()) }
  })
  .key("report")
  .ttl("10m")
  .early_ttl("7m")
  .build()
  .unwrap();

  assert_eq!(early.call(Args::new()).await.unwrap(), 1);
  clock.advance(Duration::from_secs(6 * 60));
  assert_eq!(early.call(Args::new()).await.unwrap(), 1);
  assert_eq!(calls.count(), 1);
}

#[tokio::test]
async fn test_stampede_on_a_stale_entry_refreshes_once() {
  let (cache, clock) = build_test_cache_with_clock();
  let calls = Calls::new();
  let counted = calls.clone();
  let early = Arc::new(
    Early::builder(&cache, move |_args: Args| {
      let calls = counted.clone();
      async move {
        let n = calls.hit();
        if n > 1 {
          // Keeps the refresh in flight while the stampede is answered.
          sleep_ms(50).await;
        }
        Ok::<_, AppError>(format!("v{}", n))
      }
    })
    .key("dashboard:{team}")
    .ttl("10m")
    .early_ttl("7m")
    .build()
    .unwrap(),
  );
  let mut events = early.refresh_events();
  let team = || Args::new().with("team", "core");

  assert_eq!(early.call(team()).await.unwrap(), "v1");
  clock.advance(Duration::from_secs(8 * 60));

  let results = join_all((0..100).map(|_| {
    let early = early.clone();
    async move { early.call(team()).await.unwrap() }
  }))
  .await;
  assert!(results.iter().all(|value| value == "v1"));

  let event = tokio::time::timeout(Duration::from_secs(2), events.recv())
    .await
    .unwrap()
    .unwrap();
  assert!(event.is_ok());
  assert_eq!(event.key, "early:dashboard:core");
  assert_eq!(calls.count(), 2);

  assert_eq!(early.call(team()).await.unwrap(), "v2");
  assert_eq!(calls.count(), 2);
}

#[tokio::test]
async fn test_failed_refresh_keeps_the_old_value_and_reports() {
  let (cache, clock) = build_test_cache_with_clock();
  let calls = Calls::new();
  let counted = calls.clone();
  let early = Early::builder(&cache, move |_args: Args| {
    let calls = counted.clone();
    async move {
      match calls.hit() {
        1 => Ok("good".to_string()),
        2 => Err(AppError::Upstream("refresh failed".into())),
        _ => Ok("better".to_string()),
      }
    }
  })
  .key("k")
  .ttl("10m")
  .early_ttl("1m")
  .background(false)
  .build()
  .unwrap();
  let mut events = early.refresh_events();

  assert_eq!(early.call(Args::new()).await.unwrap(), "good");
  clock.advance(Duration::from_secs(2 * 60));

  assert_eq!(early.call(Args::new()).await.unwrap(), "good");
  let event = events.recv().await.unwrap();
  assert!(!event.is_ok());
  assert!(event.error.unwrap().contains("refresh failed"));

  // The failed refresh released its claim, so the next caller retries.
  assert_eq!(early.call(Args::new()).await.unwrap(), "good");
  assert!(events.recv().await.unwrap().is_ok());
  assert_eq!(early.call(Args::new()).await.unwrap(), "better");
  assert_eq!(calls.count(), 3);
}

#[tokio::test]
async fn test_entries_past_the_ttl_are_recomputed_inline() {
  let (cache, clock) = build_test_cache_with_clock();
  let calls = Calls::new();
  let counted = calls.clone();
  let early = Early::builder(&cache, move |_args: Args| {
    let calls = counted.clone();
    async move { Ok::<_, AppError>(calls.hit()) }
  })
  .key("k")
  .ttl("10m")
  .build()
  .unwrap();

  assert_eq!(early.call(Args::new()).await.unwrap(), 1);
  clock.advance(Duration::from_secs(11 * 60));
  assert_eq!(early.call(Args::new()).await.unwrap(), 2);
}
