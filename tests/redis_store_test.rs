// Tests against a live Redis instance
// Run with: REDIS_URL=redis://127.0.0.1/ cargo test --features redis-store -- --ignored
#![cfg(feature = "redis-store")]

use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use uuid::Uuid;

use rusty_gate::storage::{BucketRequest, CounterStore, RedisCounterStore, RedisStoreConfig};

async fn store() -> RedisCounterStore {
    let url = std::env::var("REDIS_URL").unwrap_or_else(|_| "redis://127.0.0.1/".to_string());
    RedisCounterStore::connect_with_config(
        &url,
        RedisStoreConfig {
            key_prefix: format!("rusty-gate-test-{}:", Uuid::new_v4()),
        },
    )
    .await
    .expect("Redis must be running for ignored tests")
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap()
        .as_millis() as u64
}

#[tokio::test]
#[ignore]
async fn test_increment_below_stops_at_limit() {
    let store = store().await;

    for expected in 1..=3 {
        let step = store.increment_below("conn:user:1", 3).await.unwrap();
        assert!(step.incremented);
        assert_eq!(step.value, expected);
    }
    let step = store.increment_below("conn:user:1", 3).await.unwrap();
    assert!(!step.incremented);
    assert_eq!(step.value, 3);

    assert_eq!(store.decrement("conn:user:1").await.unwrap(), 2);
}

#[tokio::test]
#[ignore]
async fn test_decrement_never_goes_negative() {
    let store = store().await;
    assert_eq!(store.decrement("conn:ip:10.0.0.1").await.unwrap(), 0);
    assert_eq!(store.get("conn:ip:10.0.0.1").await.unwrap(), 0);
}

#[tokio::test]
#[ignore]
async fn test_bounded_set_across_concurrent_callers() {
    let store = Arc::new(store().await);

    let mut tasks = Vec::new();
    for i in 0..20 {
        let store = store.clone();
        tasks.push(tokio::spawn(async move {
            store
                .set_add_bounded("room:lobby", &format!("conn-{}", i), 10)
                .await
                .unwrap()
                .added
        }));
    }

    let mut added = 0;
    for task in tasks {
        if task.await.unwrap() {
            added += 1;
        }
    }
    assert_eq!(added, 10);
    assert_eq!(store.set_size("room:lobby").await.unwrap(), 10);

    let mut removed = 0;
    for i in 0..20 {
        if store.set_remove("room:lobby", &format!("conn-{}", i)).await.unwrap() {
            removed += 1;
        }
    }
    assert_eq!(removed, 10);
    assert_eq!(store.set_size("room:lobby").await.unwrap(), 0);
}

#[tokio::test]
#[ignore]
async fn test_token_bucket_matches_local_math() {
    let store = store().await;
    let now = now_ms();
    let request = BucketRequest {
        capacity: 3.0,
        refill_per_sec: 2.0,
        cost: 1.0,
        now_ms: now,
        ttl_ms: 6_500,
    };

    for _ in 0..3 {
        assert!(store.token_bucket("bucket:user:1", &request).await.unwrap().allowed);
    }
    let outcome = store.token_bucket("bucket:user:1", &request).await.unwrap();
    assert!(!outcome.allowed);
    assert_eq!(outcome.retry_after_ms, 500);

    let later = BucketRequest {
        now_ms: now + 500,
        ..request
    };
    assert!(store.token_bucket("bucket:user:1", &later).await.unwrap().allowed);
}

#[tokio::test]
#[ignore]
async fn test_health_check() {
    let store = store().await;
    assert!(store.health_check().await.unwrap());
}
