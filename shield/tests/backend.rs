mod common;

use std::time::Duration;

use common::*;
use fibre_shield::{Backend, Cache, Error, Exist, Expiry, MemoryBackend};
use futures_util::StreamExt;
use pretty_assertions::assert_eq;

#[tokio::test]
async fn test_set_get_and_conditional_writes() {
  let backend = memory();

  assert!(backend.set("k", b"v1".to_vec(), None, Exist::Any).await.unwrap());
  assert_eq!(backend.get("k").await.unwrap(), Some(b"v1".to_vec()));

  // Present key refuses MustNotExist.
  assert!(!backend.set("k", b"v2".to_vec(), None, Exist::MustNotExist).await.unwrap());
  assert_eq!(backend.get("k").await.unwrap(), Some(b"v1".to_vec()));

  // Absent key refuses MustExist.
  assert!(!backend.set("other", b"x".to_vec(), None, Exist::MustExist).await.unwrap());
  assert_eq!(backend.get("other").await.unwrap(), None);

  assert!(backend.set("k", b"v3".to_vec(), None, Exist::MustExist).await.unwrap());
  assert_eq!(backend.get("k").await.unwrap(), Some(b"v3".to_vec()));
}

#[tokio::test]
async fn test_entries_expire_after_ttl() {
  let backend = memory();
  backend
    .set("short", b"x".to_vec(), Some(Duration::from_millis(50)), Exist::Any)
    .await
    .unwrap();
  backend.set("forever", b"y".to_vec(), None, Exist::Any).await.unwrap();

  assert!(matches!(backend.get_expire("short").await.unwrap(), Expiry::In(_)));
  assert_eq!(backend.get_expire("forever").await.unwrap(), Expiry::Persistent);
  assert_eq!(backend.get_expire("missing").await.unwrap(), Expiry::Missing);

  sleep_ms(80).await;
  assert_eq!(backend.get("short").await.unwrap(), None);
  assert!(!backend.exists("short").await.unwrap());
  assert_eq!(backend.get("forever").await.unwrap(), Some(b"y".to_vec()));
}

#[tokio::test]
async fn test_expire_extends_a_live_key() {
  let backend = memory();
  backend
    .set("k", b"x".to_vec(), Some(Duration::from_millis(40)), Exist::Any)
    .await
    .unwrap();
  assert!(backend.expire("k", Duration::from_secs(60)).await.unwrap());
  sleep_ms(60).await;
  assert!(backend.exists("k").await.unwrap());
  assert!(!backend.expire("missing", Duration::from_secs(1)).await.unwrap());
}

#[tokio::test]
async fn test_incr_counts_from_zero_and_keeps_first_ttl() {
  let backend = memory();
  assert_eq!(backend.incr("c", 1, Some(Duration::from_secs(60))).await.unwrap(), 1);
  assert_eq!(backend.incr("c", 5, None).await.unwrap(), 6);
  assert_eq!(backend.incr("c", -2, None).await.unwrap(), 4);
  assert_eq!(backend.get("c").await.unwrap(), Some(b"4".to_vec()));
  assert!(matches!(backend.get_expire("c").await.unwrap(), Expiry::In(_)));

  backend.set("text", b"abc".to_vec(), None, Exist::Any).await.unwrap();
  let err = backend.incr("text", 1, None).await.unwrap_err();
  assert!(matches!(err, Error::WrongType { .. }));
}

#[tokio::test]
async fn test_incr_refuses_to_overflow() {
  let backend = memory();
  backend
    .set("big", i64::MAX.to_string().into_bytes(), None, Exist::Any)
    .await
    .unwrap();

  let err = backend.incr("big", 1, None).await.unwrap_err();
  assert_eq!(err, Error::Overflow { key: "big".to_string() });
  assert_eq!(backend.get("big").await.unwrap(), Some(i64::MAX.to_string().into_bytes()));

  backend
    .set("small", i64::MIN.to_string().into_bytes(), None, Exist::Any)
    .await
    .unwrap();
  assert!(matches!(backend.incr("small", -1, None).await, Err(Error::Overflow { .. })));
}

#[tokio::test]
async fn test_many_operations() {
  let backend = memory();
  backend
    .set_many(
      vec![
        ("a".to_string(), b"1".to_vec()),
        ("b".to_string(), b"2".to_vec()),
      ],
      None,
    )
    .await
    .unwrap();

  let values = backend
    .get_many(&["a".to_string(), "missing".to_string(), "b".to_string()])
    .await
    .unwrap();
  assert_eq!(values, vec![Some(b"1".to_vec()), None, Some(b"2".to_vec())]);

  let deleted = backend
    .delete_many(&["a".to_string(), "missing".to_string()])
    .await
    .unwrap();
  assert_eq!(deleted, 1);
  assert_eq!(backend.get_keys_count().await.unwrap(), 1);
}

#[tokio::test]
async fn test_scan_and_delete_match_use_globs() {
  let backend = memory();
  for key in ["user:1", "user:2", "user:10", "order:1"] {
    backend.set(key, b"x".to_vec(), None, Exist::Any).await.unwrap();
  }

  let mut keys: Vec<String> = backend
    .scan("user:*")
    .map(|key| key.unwrap())
    .collect()
    .await;
  keys.sort();
  assert_eq!(keys, vec!["user:1", "user:10", "user:2"]);

  let matched = backend.get_match("user:?").await.unwrap();
  assert_eq!(matched.len(), 2);

  assert_eq!(backend.delete_match("user:*").await.unwrap(), 3);
  assert_eq!(backend.get_keys_count().await.unwrap(), 1);
  assert!(backend.exists("order:1").await.unwrap());
}

#[tokio::test]
async fn test_delete_if_eq_only_removes_matching_value() {
  let backend = memory();
  backend.set("lock", b"token-a".to_vec(), None, Exist::Any).await.unwrap();
  assert!(!backend.delete_if_eq("lock", b"token-b").await.unwrap());
  assert!(backend.exists("lock").await.unwrap());
  assert!(backend.delete_if_eq("lock", b"token-a").await.unwrap());
  assert!(!backend.exists("lock").await.unwrap());
}

#[tokio::test]
async fn test_sets_and_bits() {
  let backend = memory();
  let members = vec!["a".to_string(), "b".to_string(), "c".to_string()];
  assert_eq!(backend.set_add("s", &members, None).await.unwrap(), 3);
  assert_eq!(backend.set_add("s", &["a".to_string()], None).await.unwrap(), 0);
  assert_eq!(backend.set_remove("s", &["a".to_string()]).await.unwrap(), 1);

  let mut popped = backend.set_pop("s", 10).await.unwrap();
  popped.sort();
  assert_eq!(popped, vec!["b", "c"]);
  assert!(backend.set_pop("s", 10).await.unwrap().is_empty());

  backend.set_bits("bits", &[1, 9, 300], None).await.unwrap();
  assert_eq!(
    backend.get_bits("bits", &[0, 1, 9, 300, 5000]).await.unwrap(),
    vec![false, true, true, true, false]
  );
  assert_eq!(backend.get_bits("nothing", &[3]).await.unwrap(), vec![false]);
}

#[tokio::test]
async fn test_capacity_evicts_to_stay_bounded() {
  let backend = MemoryBackend::builder()
    .shards(1)
    .capacity(3)
    .janitor_tick_interval(None)
    .build()
    .unwrap();
  for i in 0..10 {
    backend.set(&format!("k{}", i), b"x".to_vec(), None, Exist::Any).await.unwrap();
  }
  assert_eq!(backend.get_keys_count().await.unwrap(), 3);
  assert!(backend.exists("k9").await.unwrap());
}

#[tokio::test]
async fn test_ping_clear_and_close() {
  let backend = memory();
  assert_eq!(backend.ping(None).await.unwrap(), "PONG");
  assert_eq!(backend.ping(Some("hello")).await.unwrap(), "hello");

  backend.set("k", b"x".to_vec(), None, Exist::Any).await.unwrap();
  backend.clear().await.unwrap();
  assert_eq!(backend.get_keys_count().await.unwrap(), 0);

  backend.close().await.unwrap();
  let err = backend.get("k").await.unwrap_err();
  assert!(matches!(err, Error::Closed(_)));
  assert!(err.is_unavailable());
}

#[tokio::test]
async fn test_router_picks_longest_prefix() {
  let cache = Cache::builder()
    .backend(MemoryBackend::builder().name("default").build().unwrap())
    .backend_with_prefix("sess:", MemoryBackend::builder().name("sessions").build().unwrap())
    .backend_with_prefix("sess:admin:", MemoryBackend::builder().name("admins").build().unwrap())
    .build()
    .unwrap();

  assert_eq!(cache.backend_name("user:1"), "default");
  assert_eq!(cache.backend_name("sess:1"), "sessions");
  assert_eq!(cache.backend_name("sess:admin:1"), "admins");

  cache.set("sess:1", b"x".to_vec(), None, Exist::Any).await.unwrap();
  cache.set("user:1", b"y".to_vec(), None, Exist::Any).await.unwrap();
  assert_eq!(cache.get("sess:1").await.unwrap(), Some(b"x".to_vec()));
  // Pattern commands fan out across every backend.
  assert_eq!(cache.delete_match("*:1").await.unwrap(), 2);
}

#[tokio::test]
async fn test_duplicate_prefixes_are_rejected() {
  let err = Cache::builder()
    .backend(MemoryBackend::new())
    .backend(MemoryBackend::new())
    .build()
    .unwrap_err();
  assert!(matches!(err, fibre_shield::BuildError::DuplicatePrefix(_)));
  assert!(matches!(
    Cache::builder().build().unwrap_err(),
    fibre_shield::BuildError::NoBackend
  ));
}

#[tokio::test]
async fn test_typed_values_round_trip_through_the_codec() {
  let cache = build_test_cache();
  cache
    .set_value("pair", &(7u32, "seven".to_string()), None)
    .await
    .unwrap();
  let pair: Option<(u32, String)> = cache.get_value("pair").await.unwrap();
  assert_eq!(pair, Some((7, "seven".to_string())));
  let missing: Option<u32> = cache.get_value("nope").await.unwrap();
  assert_eq!(missing, None);
}
