use std::time::Duration;
use turnstile::{BucketState, Policy, StateStore};
use turnstile_redis::RedisStore;

// Requires Redis running. If TURNSTILE_TEST_REDIS_URL is unset, the tests skip.
fn store() -> Option<RedisStore> {
    let url = match std::env::var("TURNSTILE_TEST_REDIS_URL") {
        Ok(v) => v,
        Err(_) => {
            eprintln!("skipping: set TURNSTILE_TEST_REDIS_URL (e.g. redis://127.0.0.1:6379/)");
            return None;
        }
    };
    let store = RedisStore::open(&url)
        .unwrap_or_else(|e| panic!("invalid redis url '{}': {}", url, e))
        .with_prefix(format!("turnstile-test:{}:", uuid::Uuid::new_v4()));
    Some(store)
}

#[tokio::test]
async fn script_matches_bucket_semantics() {
    let Some(store) = store() else { return };
    store.ping().await.expect("redis reachable");

    let policy = Policy::new("m", 1, 1.0, Duration::from_secs(60)).unwrap();
    let ttl = Duration::from_secs(30);

    let first = store.apply("k", 1000.0, &policy, 1.0, ttl).await.unwrap();
    assert!(first.allowed);
    assert_eq!(first.tokens(), 0.0);

    let second = store.apply("k", 1000.0, &policy, 1.0, ttl).await.unwrap();
    assert!(!second.allowed);
    assert_eq!(second.retry_after, Some(60));

    let third = store.apply("k", 1060.0, &policy, 1.0, ttl).await.unwrap();
    assert!(third.allowed);

    let stored = store.load("k").await.unwrap().unwrap();
    assert_eq!(stored, BucketState { tokens: 0.0, last_refill: 1060.0 });
}

#[tokio::test]
async fn save_then_load() {
    let Some(store) = store() else { return };
    assert_eq!(store.load("fresh").await.unwrap(), None);

    let state = BucketState { tokens: 2.5, last_refill: 1_700_000_000.125 };
    store.save("fresh", state, Duration::from_secs(30)).await.unwrap();
    assert_eq!(store.load("fresh").await.unwrap(), Some(state));
}
