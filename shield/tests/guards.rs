mod common;

use std::sync::Arc;

use common::*;
use fibre_shield::{Args, Backend, Call, DualBloom, Error, Perf, ThunderProtection};
use futures_util::future::join_all;
use pretty_assertions::assert_eq;

fn id(id: u64) -> Args {
  Args::new().with("id", id)
}

#[tokio::test]
async fn test_thunder_protection_shares_one_call_per_key() {
  init_tracing();
  let calls = Calls::new();
  let counted = calls.clone();
  let user = Arc::new(
    ThunderProtection::builder(move |_args: Args| {
      let calls = counted.clone();
      async move {
        let n = calls.hit();
        sleep_ms(50).await;
        Ok::<_, AppError>(n)
      }
    })
    .key("user:{id}")
    .build()
    .unwrap(),
  );

  let results = join_all((0..10).map(|_| {
    let user = user.clone();
    async move { user.call(id(1)).await }
  }))
  .await;
  for result in results {
    assert_eq!(result.unwrap(), 1);
  }
  assert_eq!(calls.count(), 1);
  assert_eq!(user.in_flight(), 0);

  // Finished calls are not remembered.
  assert_eq!(user.call(id(1)).await.unwrap(), 2);
}

#[tokio::test]
async fn test_thunder_protection_shares_errors() {
  init_tracing();
  let calls = Calls::new();
  let counted = calls.clone();
  let user = Arc::new(
    ThunderProtection::builder(move |_args: Args| {
      let calls = counted.clone();
      async move {
        calls.hit();
        sleep_ms(50).await;
        Err::<u64, _>(AppError::Upstream("timeout".into()))
      }
    })
    .key("user:{id}")
    .build()
    .unwrap(),
  );

  let results = join_all((0..5).map(|_| {
    let user = user.clone();
    async move { user.call(id(7)).await }
  }))
  .await;
  assert!(results
    .iter()
    .all(|result| matches!(result, Err(AppError::Upstream(reason)) if reason == "timeout")));
  assert_eq!(calls.count(), 1);
}

#[tokio::test]
async fn test_thunder_protection_runs_different_keys_separately() {
  init_tracing();
  let calls = Calls::new();
  let counted = calls.clone();
  let user = Arc::new(
    ThunderProtection::builder(move |args: Args| {
      let calls = counted.clone();
      async move {
        calls.hit();
        sleep_ms(50).await;
        Ok::<_, AppError>(args.iter().map(|(_, v)| v.to_string()).collect::<String>())
      }
    })
    .key("user:{id}")
    .build()
    .unwrap(),
  );

  let (a, b) = tokio::join!(user.call(id(1)), user.call(id(2)));
  assert_eq!(a.unwrap(), "1");
  assert_eq!(b.unwrap(), "2");
  assert_eq!(calls.count(), 2);
}

#[tokio::test]
async fn test_perf_refuses_calls_after_a_slow_one() {
  let cache = build_test_cache();
  let calls = Calls::new();
  let counted = calls.clone();
  let report = Perf::builder(&cache, move |_args: Args| {
    let calls = counted.clone();
    async move {
      let n = calls.hit();
      sleep_ms(if n == 4 { 400 } else { 30 }).await;
      Ok::<_, AppError>(n)
    }
  })
  .key("report")
  .ttl("1m")
  .trace_size(3)
  .build()
  .unwrap();

  for n in 1..=3 {
    assert_eq!(report.call(Args::new()).await.unwrap(), n);
  }
  assert!(!cache.exists("perf:report:lock").await.unwrap());

  // The slow call still answers, but locks the key.
  assert_eq!(report.call(Args::new()).await.unwrap(), 4);
  assert!(cache.exists("perf:report:lock").await.unwrap());

  let err = report.call(Args::new()).await.unwrap_err();
  assert!(matches!(
    err.cache_error(),
    Some(Error::PerfDegradation { key }) if key == "perf:report"
  ));
  assert_eq!(calls.count(), 4);

  cache.delete("perf:report:lock").await.unwrap();
  assert_eq!(report.call(Args::new()).await.unwrap(), 5);
}

#[tokio::test]
async fn test_perf_only_times_successful_calls() {
  let cache = build_test_cache();
  let calls = Calls::new();
  let counted = calls.clone();
  let report = Perf::builder(&cache, move |_args: Args| {
    let calls = counted.clone();
    async move {
      let n = calls.hit();
      if n % 2 == 0 {
        sleep_ms(200).await;
        return Err(AppError::Upstream("slow failure".into()));
      }
      sleep_ms(30).await;
      Ok::<_, AppError>(n)
    }
  })
  .key("report")
  .ttl("1m")
  .trace_size(2)
  .build()
  .unwrap();

  for _ in 0..6 {
    let _ = report.call(Args::new()).await;
  }
  assert!(!cache.exists("perf:report:lock").await.unwrap());
  assert_eq!(calls.count(), 6);
}

#[tokio::test]
async fn test_perf_custom_condition_decides_degradation() {
  let cache = build_test_cache();
  let report = Perf::builder(&cache, |_args: Args| async move { Ok::<_, AppError>(()) })
    .key("report:{region}")
    .ttl("1m")
    .trace_size(1)
    .condition(|_current, history| history.len() == 1)
    .build()
    .unwrap();

  let eu = Args::new().with("region", "eu");
  report.call(eu.clone()).await.unwrap();
  report.call(eu.clone()).await.unwrap();
  assert!(cache.exists("perf:report:eu:lock").await.unwrap());
  assert!(matches!(
    report.call(eu).await.unwrap_err().cache_error(),
    Some(Error::PerfDegradation { .. })
  ));
}

#[tokio::test]
async fn test_perf_validates_options() {
  let cache = build_test_cache();
  let op = |_args: Args| async move { Ok::<_, AppError>(()) };
  assert!(matches!(
    Perf::builder(&cache, op).key("k").build(),
    Err(Error::InvalidTtl(_))
  ));
  assert!(matches!(
    Perf::builder(&cache, op).key("k").ttl("1m").trace_size(0).build(),
    Err(Error::InvalidOption(_))
  ));
}

#[tokio::test]
async fn test_dual_bloom_learns_answers_without_prefilling() {
  let cache = build_test_cache();
  let calls = Calls::new();
  let counted = calls.clone();
  let is_even = DualBloom::builder(&cache, move |args: Args| {
    let calls = counted.clone();
    async move {
      calls.hit();
      let n: u64 = args
        .iter()
        .next()
        .and_then(|(_, v)| v.parse().ok())
        .unwrap_or_default();
      Ok::<_, AppError>(n % 2 == 0)
    }
  })
  .key("{n}")
  .name("numbers")
  .capacity(1_000)
  .false_rate(1.0)
  .build()
  .unwrap();

  let number = |n: u64| Args::new().with("n", n);
  for n in 0..100 {
    is_even.call(number(n)).await.unwrap();
  }
  let first_round = calls.count();
  assert!(first_round > 90, "op ran {} times", first_round);
  assert!(cache.exists("dual_bloom:numbers:true").await.unwrap());
  assert!(cache.exists("dual_bloom:numbers:false").await.unwrap());

  let mut wrong = 0;
  for n in 0..100 {
    if is_even.call(number(n)).await.unwrap() != (n % 2 == 0) {
      wrong += 1;
    }
  }
  // Remembered answers come straight from the filters.
  assert!(calls.count() - first_round < 10, "op ran {} more times", calls.count() - first_round);
  assert!(wrong < 5, "{} wrong answers", wrong);
}

#[tokio::test]
async fn test_dual_bloom_keeps_filters_apart() {
  let cache = build_test_cache();
  let is_known = DualBloom::builder(&cache, |_args: Args| async move { Ok::<_, AppError>(true) })
    .key("{sku}")
    .capacities(100, 500)
    .false_rates(1.0, 5.0)
    .no_collisions(true)
    .build()
    .unwrap();

  let (yes, no) = is_known.params();
  assert_ne!(yes, no);

  assert!(is_known.call(Args::new().with("sku", "A-1")).await.unwrap());
  assert!(cache.exists("dual_bloom:{sku}:true").await.unwrap());
  assert!(!cache.exists("dual_bloom:{sku}:false").await.unwrap());
}

#[tokio::test]
async fn test_dual_bloom_validates_options() {
  let cache = build_test_cache();
  let op = |_args: Args| async move { Ok::<_, AppError>(true) };
  assert!(matches!(
    DualBloom::builder(&cache, op).key("{x}").build(),
    Err(Error::InvalidOption(_))
  ));
  assert!(matches!(
    DualBloom::builder(&cache, op).key("{x}").capacity(10).false_rate(100.0).build(),
    Err(Error::InvalidOption(_))
  ));
  assert!(matches!(
    DualBloom::builder(&cache, op).key("{x}").capacities(10, 0).build(),
    Err(Error::InvalidOption(_))
  ));
}
