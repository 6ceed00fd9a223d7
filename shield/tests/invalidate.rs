mod common;

use common::*;
use fibre_shield::{Args, Backend, Call, Error, Exist, Invalidate, Simple};
use pretty_assertions::assert_eq;

async fn seed(cache: &fibre_shield::Cache, keys: &[&str]) {
  for key in keys {
    cache.set(key, b"1".to_vec(), None, Exist::Any).await.unwrap();
  }
}

#[tokio::test]
async fn test_complete_targets_delete_one_key() {
  let cache = build_test_cache();
  let calls = Calls::new();
  let counted = calls.clone();
  let read = Simple::builder(&cache, move |_args: Args| {
    let calls = counted.clone();
    async move { Ok::<_, AppError>(calls.hit()) }
  })
  .key("user:{id}")
  .ttl("1h")
  .build()
  .unwrap();
  let update = Invalidate::builder(&cache, |_args: Args| async move { Ok::<_, AppError>(()) })
    .target("user:{id}")
    .build()
    .unwrap();

  let one = || Args::new().with("id", 1);
  let two = || Args::new().with("id", 2);
  assert_eq!(read.call(one()).await.unwrap(), 1);
  assert_eq!(read.call(two()).await.unwrap(), 2);

  update.call(one()).await.unwrap();
  assert!(!cache.exists("user:1").await.unwrap());
  assert!(cache.exists("user:2").await.unwrap());
  assert_eq!(read.call(one()).await.unwrap(), 3);
  assert_eq!(read.call(two()).await.unwrap(), 2);
}

#[tokio::test]
async fn test_incomplete_targets_delete_by_pattern() {
  let cache = build_test_cache();
  seed(&cache, &["user:1:name", "user:1:email", "user:2:name"]).await;

  let update = Invalidate::builder(&cache, |_args: Args| async move { Ok::<_, AppError>(()) })
    .target("user:{id}:{field}")
    .build()
    .unwrap();
  update.call(Args::new().with("id", 1)).await.unwrap();

  assert!(!cache.exists("user:1:name").await.unwrap());
  assert!(!cache.exists("user:1:email").await.unwrap());
  assert!(cache.exists("user:2:name").await.unwrap());
}

#[tokio::test]
async fn test_arg_map_and_defaults_fill_target_arguments() {
  let cache = build_test_cache();
  seed(&cache, &["early:user:5:en", "early:user:5:de", "early:user:6:en"]).await;

  let update = Invalidate::builder(&cache, |_args: Args| async move { Ok::<_, AppError>(()) })
    .target("early:user:{id}:{lang}")
    .arg_map("id", "user_id")
    .default_arg("lang", "en")
    .build()
    .unwrap();
  update.call(Args::new().with("user_id", 5)).await.unwrap();

  assert!(!cache.exists("early:user:5:en").await.unwrap());
  assert!(cache.exists("early:user:5:de").await.unwrap());
  assert!(cache.exists("early:user:6:en").await.unwrap());
}

#[tokio::test]
async fn test_failed_operations_invalidate_nothing() {
  let cache = build_test_cache();
  seed(&cache, &["user:1"]).await;

  let update = Invalidate::builder(&cache, |_args: Args| async move {
    Err::<(), _>(AppError::Upstream("write failed".into()))
  })
  .target("user:{id}")
  .build()
  .unwrap();

  assert!(update.call(Args::new().with("id", 1)).await.is_err());
  assert!(cache.exists("user:1").await.unwrap());
}

#[tokio::test]
async fn test_tags_group_keys_across_strategies() {
  let cache = build_test_cache();
  let profile = Simple::builder(&cache, |_args: Args| async move { Ok::<_, AppError>("profile".to_string()) })
    .key("profile:{id}")
    .ttl("1h")
    .tags(&["user:{id}"])
    .build()
    .unwrap();
  let orders = Simple::builder(&cache, |_args: Args| async move { Ok::<_, AppError>(3u32) })
    .key("orders:{id}")
    .ttl("1h")
    .tags(&["user:{id}"])
    .build()
    .unwrap();

  let one = || Args::new().with("id", 1);
  profile.call(one()).await.unwrap();
  orders.call(one()).await.unwrap();
  orders.call(Args::new().with("id", 2)).await.unwrap();

  let update = Invalidate::builder(&cache, |_args: Args| async move { Ok::<_, AppError>(()) })
    .tags(&["user:{id}"])
    .build()
    .unwrap();
  update.call(one()).await.unwrap();

  assert!(!cache.exists("profile:1").await.unwrap());
  assert!(!cache.exists("orders:1").await.unwrap());
  assert!(cache.exists("orders:2").await.unwrap());

  // Deleting the tag directly reports how many keys went.
  assert_eq!(cache.delete_tags(&["user:2".to_string()]).await.unwrap(), 1);
  assert!(!cache.exists("orders:2").await.unwrap());
}

#[tokio::test]
async fn test_invalidate_needs_a_target() {
  let cache = build_test_cache();
  let result = Invalidate::builder(&cache, |_args: Args| async move { Ok::<_, AppError>(()) }).build();
  assert!(matches!(result, Err(Error::InvalidOption(_))));
}
