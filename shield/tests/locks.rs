mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use common::*;
use fibre_shield::{Args, Backend, Error, Locked};

#[tokio::test]
async fn test_try_acquire_is_exclusive_until_release() {
  let cache = build_test_cache();
  let locks = cache.locks();

  let guard = locks
    .try_acquire("job", Duration::from_secs(10))
    .await
    .unwrap()
    .expect("first claim wins");
  assert!(locks.try_acquire("job", Duration::from_secs(10)).await.unwrap().is_none());
  assert!(locks.is_locked("job", None).await);

  guard.release().await.unwrap();
  assert!(!locks.is_locked("job", None).await);
  assert!(locks.try_acquire("job", Duration::from_secs(10)).await.unwrap().is_some());
}

#[tokio::test]
async fn test_release_with_a_stale_token_is_lock_lost() {
  let cache = build_test_cache();
  let locks = cache.locks();

  let guard = locks
    .try_acquire("job", Duration::from_millis(30))
    .await
    .unwrap()
    .unwrap();
  sleep_ms(50).await;
  // The lock expired and someone else took it.
  let _other = locks
    .try_acquire("job", Duration::from_secs(10))
    .await
    .unwrap()
    .unwrap();

  let err = guard.release().await.unwrap_err();
  assert!(matches!(err, Error::LockLost { .. }));
  assert!(locks.is_locked("job", None).await);
}

#[tokio::test]
async fn test_acquire_times_out_while_held() {
  let cache = build_test_cache();
  let locks = cache.locks();
  let _held = locks.try_acquire("busy", Duration::from_secs(10)).await.unwrap().unwrap();

  let err = locks
    .acquire("busy", Duration::from_secs(10), Duration::from_millis(50))
    .await
    .unwrap_err();
  assert!(matches!(err, Error::LockTimeout { key } if key == "busy"));
}

#[tokio::test]
async fn test_is_locked_waits_for_release() {
  let cache = build_test_cache();
  let locks = cache.locks();
  let guard = locks.try_acquire("k", Duration::from_secs(10)).await.unwrap().unwrap();

  tokio::spawn(async move {
    sleep_ms(30).await;
    guard.release().await.unwrap();
  });

  assert!(!locks.is_locked("k", Some(Duration::from_secs(2))).await);
}

#[tokio::test]
async fn test_dropped_guard_releases_the_lock() {
  let cache = build_test_cache();
  let locks = cache.locks();
  {
    let _guard = locks.try_acquire("k", Duration::from_secs(10)).await.unwrap().unwrap();
  }
  // Dropping releases in the background.
  assert!(!locks.is_locked("k", Some(Duration::from_secs(1))).await);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_locked_strategy_serializes_one_key() {
  let cache = build_test_cache();
  let inside = Arc::new(AtomicUsize::new(0));
  let max_inside = Arc::new(AtomicUsize::new(0));
  let calls = Calls::new();

  let locked = {
    let inside = inside.clone();
    let max_inside = max_inside.clone();
    let calls = calls.clone();
    Arc::new(
      Locked::builder(&cache, move |_args: Args| {
        let inside = inside.clone();
        let max_inside = max_inside.clone();
        let calls = calls.clone();
        async move {
          let now = inside.fetch_add(1, Ordering::SeqCst) + 1;
          max_inside.fetch_max(now, Ordering::SeqCst);
          sleep_ms(10).await;
          inside.fetch_sub(1, Ordering::SeqCst);
          Ok::<_, AppError>(calls.hit())
        }
      })
      .key("report:{id}")
      .ttl("10s")
      .build()
      .unwrap(),
    )
  };

  let mut handles = Vec::new();
  for _ in 0..8 {
    let locked = locked.clone();
    handles.push(tokio::spawn(async move {
      use fibre_shield::Call;
      locked.call(Args::new().with("id", 1)).await
    }));
  }
  for handle in handles {
    handle.await.unwrap().unwrap();
  }

  assert_eq!(calls.count(), 8);
  assert_eq!(max_inside.load(Ordering::SeqCst), 1);
  assert!(!cache.exists("lock:report:1").await.unwrap());
}

#[tokio::test]
async fn test_locked_strategy_releases_on_error() {
  use fibre_shield::Call;

  let cache = build_test_cache();
  let locked = Locked::builder(&cache, |_args: Args| async move {
    Err::<u32, _>(AppError::Upstream("boom".into()))
  })
  .key("k")
  .ttl("10s")
  .fail_fast()
  .build()
  .unwrap();

  assert!(matches!(locked.call(Args::new()).await, Err(AppError::Upstream(_))));
  // A leaked lock would make fail-fast callers time out here.
  assert!(matches!(locked.call(Args::new()).await, Err(AppError::Upstream(_))));
}

#[tokio::test]
async fn test_fail_fast_reports_lock_timeout() {
  use fibre_shield::Call;

  let cache = build_test_cache();
  let _held = cache
    .locks()
    .try_acquire("lock:k", Duration::from_secs(10))
    .await
    .unwrap()
    .unwrap();

  let locked = Locked::builder(&cache, |_args: Args| async move { Ok::<_, AppError>(1u32) })
    .key("k")
    .ttl("10s")
    .fail_fast()
    .build()
    .unwrap();

  let err = locked.call(Args::new()).await.unwrap_err();
  assert!(matches!(err.cache_error(), Some(Error::LockTimeout { .. })));
}

#[tokio::test]
async fn test_locked_without_ttl_fails_to_build() {
  let cache = build_test_cache();
  let result = Locked::builder(&cache, |_args: Args| async move { Ok::<_, AppError>(1u32) })
    .key("k")
    .build();
  assert!(matches!(result, Err(Error::InvalidTtl(_))));
}
