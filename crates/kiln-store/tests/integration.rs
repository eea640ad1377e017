//! Integration tests for the `Dragonfly` backend.
//!
//! These tests require a live Dragonfly (or Redis) instance on
//! `localhost:6379`. Run with:
//!
//! ```bash
//! docker run -d -p 6379:6379 docker.dragonflydb.io/dragonflydb/dragonfly
//! cargo test -p kiln-store -- --ignored
//! ```
//!
//! Every test writes under a unique prefix and cleans up after itself, so
//! they can run against a shared instance.

#![allow(
    clippy::expect_used,
    clippy::unwrap_used,
    clippy::missing_panics_doc,
    clippy::indexing_slicing
)]

use kiln_store::{Store, StoreError};
use serde::{Deserialize, Serialize};

/// Dragonfly connection URL for the local Docker instance.
const DRAGONFLY_URL: &str = "redis://localhost:6379";

async fn connect() -> Store {
    Store::connect(DRAGONFLY_URL)
        .await
        .expect("Failed to connect to Dragonfly")
}

fn prefix(test: &str) -> String {
    format!("kiln-test:{test}:{}:", std::process::id())
}

async fn cleanup(store: &Store, prefix: &str) {
    for key in store.keys(prefix).await.expect("KEYS failed") {
        store.delete(&key).await.expect("DEL failed");
    }
}

#[derive(Debug, PartialEq, Serialize, Deserialize)]
struct Sample {
    name: String,
    count: u32,
}

#[tokio::test]
#[ignore = "requires live Dragonfly instance on localhost:6379"]
async fn strings_json_and_ttl() {
    let store = connect().await;
    let p = prefix("strings");

    let key = format!("{p}sample");
    let sample = Sample {
        name: "alpha".to_owned(),
        count: 3,
    };
    store.set_json(&key, &sample).await.unwrap();
    assert_eq!(store.get_json::<Sample>(&key).await.unwrap(), Some(sample));

    let ttl_key = format!("{p}ttl");
    store.set_ex(&ttl_key, "v", 60).await.unwrap();
    assert!(store.exists(&ttl_key).await.unwrap());

    let counter = format!("{p}counter");
    assert_eq!(store.incr(&counter).await.unwrap(), 1);
    assert_eq!(store.incr(&counter).await.unwrap(), 2);

    cleanup(&store, &p).await;
}

#[tokio::test]
#[ignore = "requires live Dragonfly instance on localhost:6379"]
async fn wrong_type_maps_to_type_mismatch() {
    let store = connect().await;
    let p = prefix("wrongtype");
    let key = format!("{p}set");

    store.sadd(&key, "member").await.unwrap();
    let err = store.get(&key).await.unwrap_err();
    assert!(matches!(err, StoreError::Dragonfly(_)));
    assert_eq!(err.class(), kiln_types::ErrorClass::TypeMismatch);

    cleanup(&store, &p).await;
}

#[tokio::test]
#[ignore = "requires live Dragonfly instance on localhost:6379"]
async fn lists_and_sorted_sets() {
    let store = connect().await;
    let p = prefix("collections");

    let list = format!("{p}list");
    for v in ["a", "b", "c"] {
        store.lpush(&list, v).await.unwrap();
    }
    assert_eq!(store.lrange(&list, 0, -1).await.unwrap(), vec!["c", "b", "a"]);
    assert_eq!(store.lrem(&list, -1, "a").await.unwrap(), 1);
    store.ltrim(&list, 0, 0).await.unwrap();
    assert_eq!(store.llen(&list).await.unwrap(), 1);

    let zset = format!("{p}zset");
    store.zadd(&zset, 2.0, "late").await.unwrap();
    store.zadd(&zset, 1.0, "early").await.unwrap();
    let ranked = store.zrange_with_scores(&zset, 0, -1).await.unwrap();
    assert_eq!(ranked[0].0, "early");
    assert_eq!(ranked.len(), 2);

    cleanup(&store, &p).await;
}
